//! Headless V8 execution backend.
//!
//! Every instantiation gets a fresh isolate on its own thread, running a
//! current-thread tokio runtime. The isolate exposes only the ops in
//! [`crate::ops`]:
//! - console.log/warn/error (logged, bounded)
//! - crypto.randomUUID, crypto.getRandomValues
//! - atob, btoa
//! - parent.postMessage, bound to the instantiation's port
//! - No fs, net, env or module loading
//!
//! The document's inline scripts run in order against a headless window and
//! document. `src` scripts are the pinned libraries; the headless environment
//! provides React and ReactDOM itself and does not transpile JSX.

use crate::document::{COMPONENT_ELEMENT_ID, HARNESS_ELEMENT_ID};
use crate::error::PreviewError;
use crate::host::{ExecutionBackend, Instantiation, LiveContext};
use crate::loader::DenyAllLoader;
use crate::ops::{preview_runtime, ConsoleBudget};
use crate::protocol::{ContextId, ErrorEvent, EventPort, ExecutionEvent};
use anyhow::Error;
use deno_core::error::JsError;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use regex::Regex;
use serde::Serialize;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, LazyLock};
use tracing::{debug, warn};

const HEADLESS_JS: &str = include_str!("js/headless.js");

const MB: usize = 1024 * 1024;

static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").expect("script pattern must compile"));

static ELEMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(div|main|section|span)\b([^>]*)>").expect("element pattern must compile")
});

static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)([a-z][a-z0-9-]*)\s*=\s*"([^"]*)""#).expect("attribute pattern must compile"));

/// Configuration for headless contexts
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * MB),
        }
    }
}

/// An element the headless document starts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestElement {
    pub id: String,
    pub tag: String,
    pub text: String,
}

/// An inline script to execute, named after its role in the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineScript {
    pub name: &'static str,
    pub code: String,
}

/// What the headless context needs from a document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocumentManifest {
    pub elements: Vec<ManifestElement>,
    #[serde(skip)]
    pub scripts: Vec<InlineScript>,
    #[serde(skip)]
    pub libraries: Vec<String>,
}

fn attributes(raw: &str) -> Vec<(String, String)> {
    ATTR_RE
        .captures_iter(raw)
        .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
        .collect()
}

fn attribute<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
}

fn script_name(id: Option<&str>) -> &'static str {
    match id {
        Some(HARNESS_ELEMENT_ID) => "<preview:harness>",
        Some(COMPONENT_ELEMENT_ID) => "<preview:component>",
        _ => "<preview:inline>",
    }
}

/// Extract id'd elements, inline scripts and library URLs from a document.
pub fn parse_document(html: &str) -> DocumentManifest {
    let mut manifest = DocumentManifest::default();

    for caps in ELEMENT_RE.captures_iter(html) {
        let attrs = attributes(&caps[2]);
        if let Some(id) = attribute(&attrs, "id") {
            manifest.elements.push(ManifestElement {
                id: id.to_string(),
                tag: caps[1].to_ascii_lowercase(),
                text: String::new(),
            });
        }
    }

    for caps in SCRIPT_RE.captures_iter(html) {
        let attrs = attributes(&caps[1]);
        let body = &caps[2];
        let id = attribute(&attrs, "id");

        if let Some(src) = attribute(&attrs, "src") {
            manifest.libraries.push(src.to_string());
            continue;
        }
        if let Some(id) = id {
            manifest.elements.push(ManifestElement {
                id: id.to_string(),
                tag: String::from("script"),
                text: body.to_string(),
            });
        }

        let kind = attribute(&attrs, "type").unwrap_or("").to_ascii_lowercase();
        match kind.as_str() {
            "" | "text/javascript" | "application/javascript" | "text/babel" => {
                manifest.scripts.push(InlineScript {
                    name: script_name(id),
                    code: body.to_string(),
                });
            }
            "application/json" => {}
            other => debug!(script_type = other, "skipping non-executable script"),
        }
    }

    manifest
}

/// Error details handed to the document's `error` listeners.
#[derive(Debug, Serialize)]
struct UncaughtError {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack: Option<String>,
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    column: Option<u32>,
    rejection: bool,
}

impl UncaughtError {
    fn from_error(error: &Error, script: &str) -> Self {
        let Some(js) = error.downcast_ref::<JsError>() else {
            return Self {
                message: error.to_string(),
                name: None,
                stack: None,
                source: script.to_string(),
                line: None,
                column: None,
                rejection: false,
            };
        };
        let frame = js.frames.first();
        Self {
            message: js.message.clone().unwrap_or_else(|| js.exception_message.clone()),
            name: js.name.clone(),
            stack: js.stack.clone(),
            source: frame
                .and_then(|f| f.file_name.clone())
                .unwrap_or_else(|| script.to_string()),
            line: frame.and_then(|f| f.line_number).and_then(|n| u32::try_from(n).ok()),
            column: frame.and_then(|f| f.column_number).and_then(|n| u32::try_from(n).ok()),
            rejection: js.exception_message.starts_with("Uncaught (in promise)"),
        }
    }
}

/// Runs previews in headless V8 isolates.
#[derive(Debug, Clone, Default)]
pub struct V8Backend {
    config: IsolateConfig,
}

impl V8Backend {
    pub fn new(config: IsolateConfig) -> Self {
        Self { config }
    }
}

impl ExecutionBackend for V8Backend {
    fn instantiate(&mut self, instantiation: Instantiation) -> Result<Box<dyn LiveContext>, PreviewError> {
        let Instantiation {
            context,
            url,
            store,
            sandbox_flags,
            port,
            ..
        } = instantiation;
        let html = store
            .resolve(&url)
            .ok_or_else(|| PreviewError::Context(format!("document {} is not registered", url)))?;

        let terminated = Arc::new(AtomicBool::new(false));
        let (handle_tx, handle_rx) = mpsc::sync_channel(1);
        let config = self.config.clone();
        let flag = terminated.clone();

        std::thread::Builder::new()
            .name(format!("preview-{}", context))
            .spawn(move || run_context(&html, port, config, flag, handle_tx))
            .map_err(|e| PreviewError::Context(format!("failed to spawn preview thread: {}", e)))?;

        let isolate = handle_rx
            .recv()
            .map_err(|_| PreviewError::Context(String::from("preview isolate failed to start")))?;
        debug!(%context, sandbox_flags, "instantiated headless context");

        Ok(Box::new(V8Context {
            context,
            isolate,
            terminated,
        }))
    }
}

struct V8Context {
    context: ContextId,
    isolate: v8::IsolateHandle,
    terminated: Arc<AtomicBool>,
}

impl LiveContext for V8Context {
    fn id(&self) -> ContextId {
        self.context
    }

    fn terminate(&mut self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            // false when the isolate already finished
            let stopped = self.isolate.terminate_execution();
            debug!(context = %self.context, stopped, "terminated headless context");
        }
    }
}

/// Create a sandboxed JS runtime for one preview
fn create_runtime(config: &IsolateConfig, port: &EventPort, terminated: &Arc<AtomicBool>) -> JsRuntime {
    // Configure V8 heap limits if specified
    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(DenyAllLoader::new())),
        extensions: vec![preview_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if let Some(limit) = config.max_heap_size {
        let handle = runtime.v8_isolate().thread_safe_handle();
        let port = port.clone();
        let flag = terminated.clone();
        runtime.add_near_heap_limit_callback(move |current, initial| {
            warn!(current_mb = current / MB, initial_mb = initial / MB, "preview context near heap limit");
            if !flag.swap(true, Ordering::SeqCst) {
                handle.terminate_execution();
                let message = format!("Preview exceeded the {}MB memory limit", limit / MB);
                port.send(&ExecutionEvent::Error(ErrorEvent::new(message)));
            }
            // Headroom to unwind the terminated script instead of aborting the process
            current * 2
        });
    }

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(port.clone());
        state.put(ConsoleBudget::default());
    }

    runtime
}

fn run_context(
    html: &str,
    port: EventPort,
    config: IsolateConfig,
    terminated: Arc<AtomicBool>,
    handle_tx: mpsc::SyncSender<v8::IsolateHandle>,
) {
    let context = port.context();
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            // handle_tx drops here and instantiate reports the failure
            warn!(%context, error = %e, "failed to build preview runtime");
            return;
        }
    };

    rt.block_on(async {
        let mut runtime = create_runtime(&config, &port, &terminated);
        if handle_tx.send(runtime.v8_isolate().thread_safe_handle()).is_err() {
            return;
        }

        if let Err(e) = execute_document(&mut runtime, html, &terminated).await {
            if !terminated.load(Ordering::SeqCst) {
                warn!(%context, error = %e, "preview environment failed");
                let event = ErrorEvent::new(format!("Preview environment failed: {}", e));
                port.send(&ExecutionEvent::Error(event));
            }
        }
        debug!(%context, "headless context finished");
    });
}

async fn execute_document(runtime: &mut JsRuntime, html: &str, terminated: &AtomicBool) -> Result<(), Error> {
    let manifest = parse_document(html);

    runtime.execute_script("<preview:headless>", HEADLESS_JS.to_string())?;
    let install = format!("globalThis.__previewHeadless.install({});", serde_json::to_string(&manifest)?);
    runtime.execute_script("<preview:install>", install)?;

    for library in &manifest.libraries {
        debug!(library = %library, "library provided by headless environment");
    }

    for script in manifest.scripts {
        if terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(error) = runtime.execute_script(script.name, script.code) {
            if terminated.load(Ordering::SeqCst) {
                return Ok(());
            }
            dispatch_error(runtime, &error, script.name)?;
        }
    }

    if terminated.load(Ordering::SeqCst) {
        return Ok(());
    }
    if let Err(error) = runtime.run_event_loop(PollEventLoopOptions::default()).await {
        if !terminated.load(Ordering::SeqCst) {
            dispatch_error(runtime, &error, "<preview:event-loop>")?;
        }
    }
    Ok(())
}

/// Hand an uncaught error to the document, as a browser fires `error` or
/// `unhandledrejection` on the window.
fn dispatch_error(runtime: &mut JsRuntime, error: &Error, script: &str) -> Result<(), Error> {
    let uncaught = UncaughtError::from_error(error, script);
    debug!(source = %uncaught.source, message = %uncaught.message, rejection = uncaught.rejection, "dispatching uncaught error");
    let call = format!(
        "globalThis.__previewHeadless.dispatchError({});",
        serde_json::to_string(&uncaught)?
    );
    runtime.execute_script("<preview:dispatch>", call)?;
    Ok(())
}
