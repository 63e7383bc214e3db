//! Isolated execution host.
//!
//! Each `load` tears down the current context, registers the document under a
//! fresh blob URL, opens a message channel scoped to a new [`ContextId`] and
//! asks the backend to instantiate it. Events are accepted only from the
//! current context and drive the session state machine:
//!
//! ```text
//! Idle -> Loading -> Ready
//!            |         |
//!            +---------+--> Errored
//! ```
//!
//! `Errored` is terminal until the next `load`.

use crate::blob::{BlobHandle, BlobStore};
use crate::controls::{ExecutionMonitor, DEFAULT_EXECUTION_BUDGET};
use crate::document::{escape_html, RenderDocument};
use crate::error::PreviewError;
use crate::policy::SANDBOX_FLAGS;
use crate::protocol::{self, ContextId, Envelope, ErrorEvent, ErrorKind, EventInbox, EventPort, ExecutionEvent};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Everything a backend needs to start one context.
#[derive(Debug)]
pub struct Instantiation {
    pub context: ContextId,
    /// Blob URL of the document; resolve it through `store`
    pub url: String,
    pub store: BlobStore,
    pub sandbox_flags: &'static str,
    pub viewport: ViewportConfig,
    /// The context's only way to reach the host
    pub port: EventPort,
}

/// Something that can run a preview document in isolation.
pub trait ExecutionBackend {
    fn instantiate(&mut self, instantiation: Instantiation) -> Result<Box<dyn LiveContext>, PreviewError>;
}

/// A running context. Dropping the session that owns it calls `terminate`.
pub trait LiveContext: Send {
    fn id(&self) -> ContextId;

    /// Stop the context. Must be idempotent.
    fn terminate(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Idle,
    Loading,
    Ready,
    Errored,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostState::Ready | HostState::Errored)
    }

    fn as_str(&self) -> &'static str {
        match self {
            HostState::Idle => "idle",
            HostState::Loading => "loading",
            HostState::Ready => "ready",
            HostState::Errored => "errored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

/// Presentation size of the preview frame. Never interpreted by the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewportConfig {
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
}

impl ViewportConfig {
    pub fn mobile() -> Self {
        Self {
            width: 375,
            height: 667,
            orientation: Orientation::Portrait,
        }
    }

    pub fn tablet() -> Self {
        Self {
            width: 768,
            height: 1024,
            orientation: Orientation::Portrait,
        }
    }

    pub fn desktop() -> Self {
        Self {
            width: 1280,
            height: 800,
            orientation: Orientation::Landscape,
        }
    }

    /// Frame size after applying the orientation.
    pub fn frame_size(&self) -> (u32, u32) {
        let (short, long) = if self.width <= self.height {
            (self.width, self.height)
        } else {
            (self.height, self.width)
        };
        match self.orientation {
            Orientation::Portrait => (short, long),
            Orientation::Landscape => (long, short),
        }
    }
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self::desktop()
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Budget for a context to report `ready` or an error
    pub timeout: Duration,
    /// Origin the host listens as; contexts must address it or `*`
    pub embedder_origin: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXECUTION_BUDGET,
            embedder_origin: String::from("null"),
        }
    }
}

/// Something the host observed while waiting.
#[derive(Debug)]
pub enum HostUpdate {
    Event(ExecutionEvent),
    /// The context exceeded its budget. Advisory: it is still running.
    TimeoutWarning(PreviewError),
}

/// The live instantiation, its message inbox and its document URL.
pub struct PreviewSession {
    context: ContextId,
    live: Box<dyn LiveContext>,
    inbox: EventInbox,
    blob: Option<BlobHandle>,
    url: String,
    viewport: ViewportConfig,
    state: HostState,
    ready_seen: bool,
    error: Option<ErrorEvent>,
    monitor: ExecutionMonitor,
}

impl PreviewSession {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn viewport(&self) -> ViewportConfig {
        self.viewport
    }

    /// Whether the document URL is still registered.
    pub fn holds_document(&self) -> bool {
        self.blob.is_some()
    }

    /// Apply one parsed event. Returns it when it changed the state.
    fn apply(&mut self, event: ExecutionEvent) -> Option<ExecutionEvent> {
        match (&event, self.state) {
            (ExecutionEvent::Ready, HostState::Loading) => {
                self.state = HostState::Ready;
                self.ready_seen = true;
                info!(context = %self.context, "preview ready");
                Some(event)
            }
            (ExecutionEvent::Ready, state) => {
                debug!(context = %self.context, state = state.as_str(), "ignoring late or duplicate ready");
                None
            }
            (ExecutionEvent::Error(error), HostState::Loading | HostState::Ready) => {
                let kind = error.resolved_kind(self.ready_seen);
                warn!(context = %self.context, ?kind, message = %error.message, "preview reported an error");
                self.error = Some(error.clone());
                self.state = HostState::Errored;
                Some(event)
            }
            (ExecutionEvent::Error(error), state) => {
                debug!(context = %self.context, state = state.as_str(), message = %error.message, "ignoring error after terminal state");
                None
            }
        }
    }
}

impl Drop for PreviewSession {
    fn drop(&mut self) {
        self.live.terminate();
        debug!(context = %self.context, "preview context torn down");
    }
}

impl std::fmt::Debug for PreviewSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreviewSession")
            .field("context", &self.context)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("holds_document", &self.blob.is_some())
            .finish()
    }
}

/// Hosts at most one preview context at a time.
pub struct PreviewHost<B> {
    backend: B,
    config: HostConfig,
    store: BlobStore,
    session: Option<PreviewSession>,
}

impl<B: ExecutionBackend> PreviewHost<B> {
    pub fn new(backend: B, config: HostConfig) -> Self {
        Self {
            backend,
            config,
            store: BlobStore::new(),
            session: None,
        }
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn session(&self) -> Option<&PreviewSession> {
        self.session.as_ref()
    }

    pub fn state(&self) -> HostState {
        self.session.as_ref().map_or(HostState::Idle, |s| s.state)
    }

    pub fn context(&self) -> Option<ContextId> {
        self.session.as_ref().map(|s| s.context)
    }

    /// The error that moved the current session to `Errored`.
    pub fn last_error(&self) -> Option<&ErrorEvent> {
        self.session.as_ref().and_then(|s| s.error.as_ref())
    }

    /// [`last_error`](Self::last_error) classified into the error taxonomy.
    pub fn error(&self) -> Option<PreviewError> {
        let session = self.session.as_ref()?;
        session.error.as_ref().map(|e| e.to_error(session.ready_seen))
    }

    /// Replace the current context with a fresh one running `document`.
    pub fn load(&mut self, document: RenderDocument, viewport: ViewportConfig) -> Result<ContextId, PreviewError> {
        self.teardown();

        let context = ContextId::new();
        let entry = document.entry_point();
        let blob = self.store.register(document.into_html());
        let url = blob.url().to_string();
        let (port, inbox) = protocol::channel(context, &self.config.embedder_origin);

        // On failure the handle drops here and the URL is revoked
        let live = self.backend.instantiate(Instantiation {
            context,
            url: url.clone(),
            store: self.store.clone(),
            sandbox_flags: SANDBOX_FLAGS,
            viewport,
            port,
        })?;

        let mut monitor = ExecutionMonitor::new(self.config.timeout);
        monitor.start();

        debug!(%context, %url, entry = entry.map(|e| e.name()), "preview context loading");
        self.session = Some(PreviewSession {
            context,
            live,
            inbox,
            blob: Some(blob),
            url,
            viewport,
            state: HostState::Loading,
            ready_seen: false,
            error: None,
            monitor,
        });
        Ok(context)
    }

    /// Validate and apply one message. Returns the event if it was accepted.
    pub fn deliver(&mut self, envelope: Envelope) -> Option<ExecutionEvent> {
        let session = self.session.as_mut()?;
        if envelope.context != session.context {
            debug!(expected = %session.context, got = %envelope.context, "ignoring message from stale context");
            return None;
        }
        let event = ExecutionEvent::parse(&envelope.data)?;

        // The document has loaded once it can talk
        if session.blob.take().is_some() {
            debug!(context = %session.context, "released preview document URL");
        }
        let accepted = session.apply(event);

        // Nothing changes an errored session, so stop buffering for it
        if accepted.is_some() && session.state.is_terminal() {
            let discarded = session.inbox.close();
            debug!(context = %session.context, discarded, "closed message channel");
        }
        accepted
    }

    /// Wait for the next accepted event, or a timeout warning while loading.
    ///
    /// Returns `None` when there is no session or the context has gone away.
    pub async fn next_update(&mut self) -> Option<HostUpdate> {
        loop {
            let session = self.session.as_mut()?;
            let envelope = if session.state == HostState::Loading && !session.monitor.has_warned() {
                let remaining = session.monitor.remaining_at(Instant::now()).unwrap_or_default();
                match tokio::time::timeout(remaining, session.inbox.recv()).await {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        if let Err(warning) = session.monitor.check() {
                            return Some(HostUpdate::TimeoutWarning(warning));
                        }
                        continue;
                    }
                }
            } else {
                session.inbox.recv().await
            };

            let envelope = envelope?;
            if let Some(event) = self.deliver(envelope) {
                return Some(HostUpdate::Event(event));
            }
        }
    }

    /// Wait until the session is `Ready` or `Errored`.
    ///
    /// # Errors
    /// Returns `TimeoutWarning` if the budget runs out first, and `Context` if
    /// the context went away without reporting.
    pub async fn settle(&mut self) -> Result<HostState, PreviewError> {
        loop {
            let state = self.state();
            if state.is_terminal() || state == HostState::Idle {
                return Ok(state);
            }
            match self.next_update().await {
                Some(HostUpdate::Event(_)) => continue,
                Some(HostUpdate::TimeoutWarning(warning)) => return Err(warning),
                None => {
                    return Err(PreviewError::Context(String::from(
                        "preview context exited without reporting",
                    )))
                }
            }
        }
    }

    /// Apply every message already queued, without waiting.
    pub fn drain(&mut self) -> Vec<ExecutionEvent> {
        let mut accepted = Vec::new();
        loop {
            let Some(envelope) = self.session.as_mut().and_then(|s| s.inbox.try_recv()) else {
                break;
            };
            if let Some(event) = self.deliver(envelope) {
                accepted.push(event);
            }
        }
        accepted
    }

    /// Stop the current context and revoke its document URL.
    pub fn teardown(&mut self) {
        // Dropping the session terminates the context and the blob handle
        self.session = None;
    }

    /// HTML fragment for the embedding page: a loading indicator, the
    /// sandboxed frame and an error panel. All context-supplied text is
    /// escaped.
    pub fn render_view(&self) -> String {
        let Some(session) = self.session.as_ref() else {
            return String::from("<div class=\"preview-frame\" data-state=\"idle\"></div>\n");
        };
        let (width, height) = session.viewport.frame_size();
        let orientation = match session.viewport.orientation {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        };

        let mut html = String::new();
        let _ = writeln!(
            html,
            "<div class=\"preview-frame\" data-state=\"{}\" data-orientation=\"{}\" style=\"width:{}px;height:{}px\">",
            session.state.as_str(),
            orientation,
            width,
            height
        );
        if session.state == HostState::Loading {
            html.push_str("<div class=\"preview-loading\" role=\"status\">Loading preview&hellip;</div>\n");
        }
        let _ = writeln!(
            html,
            "<iframe title=\"Component preview\" sandbox=\"{}\" src=\"{}\" width=\"{}\" height=\"{}\"></iframe>",
            SANDBOX_FLAGS,
            escape_html(&session.url),
            width,
            height
        );
        if let Some(error) = session.error.as_ref() {
            let heading = match error.resolved_kind(session.ready_seen) {
                ErrorKind::Synthesis => "No component to render",
                ErrorKind::Mount => "The component failed to mount",
                ErrorKind::Runtime => "The component crashed",
            };
            html.push_str("<div class=\"preview-error\" role=\"alert\">\n");
            let _ = writeln!(html, "<strong>{}</strong>", heading);
            let _ = writeln!(html, "<p>{}</p>", escape_html(&error.message));
            if let (Some(source), Some(line)) = (error.source.as_deref(), error.line) {
                let _ = writeln!(
                    html,
                    "<p class=\"preview-error-location\">{}:{}:{}</p>",
                    escape_html(source),
                    line,
                    error.column.unwrap_or(0)
                );
            }
            if let Some(stack) = error.stack.as_deref() {
                let _ = writeln!(html, "<pre>{}</pre>", escape_html(stack));
            }
            html.push_str("</div>\n");
        }
        html.push_str("</div>\n");
        html
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::synthesize;
    use crate::props::MockData;
    use crate::protocol::MAX_QUEUED_MESSAGES;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Backend whose contexts are driven by the test through their ports.
    #[derive(Default)]
    struct ManualBackend {
        ports: Arc<Mutex<Vec<EventPort>>>,
        documents: Arc<Mutex<Vec<String>>>,
        terminated: Arc<AtomicUsize>,
        fail: bool,
    }

    struct ManualContext {
        context: ContextId,
        terminated: Arc<AtomicUsize>,
        done: bool,
    }

    impl LiveContext for ManualContext {
        fn id(&self) -> ContextId {
            self.context
        }

        fn terminate(&mut self) {
            if !self.done {
                self.done = true;
                self.terminated.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    impl ExecutionBackend for ManualBackend {
        fn instantiate(&mut self, inst: Instantiation) -> Result<Box<dyn LiveContext>, PreviewError> {
            if self.fail {
                return Err(PreviewError::Context("backend unavailable".to_string()));
            }
            assert_eq!(inst.sandbox_flags, "allow-scripts allow-same-origin");
            let html = inst.store.resolve(&inst.url).expect("document registered before instantiation");
            self.documents.lock().unwrap().push(html.to_string());
            self.ports.lock().unwrap().push(inst.port);
            Ok(Box::new(ManualContext {
                context: inst.context,
                terminated: self.terminated.clone(),
                done: false,
            }))
        }
    }

    fn document() -> RenderDocument {
        synthesize("function Component() { return null; }", &MockData::default())
    }

    fn host() -> (PreviewHost<ManualBackend>, Arc<Mutex<Vec<EventPort>>>) {
        let backend = ManualBackend::default();
        let ports = backend.ports.clone();
        let config = HostConfig {
            timeout: Duration::from_millis(200),
            embedder_origin: "https://app.example.com".to_string(),
        };
        (PreviewHost::new(backend, config), ports)
    }

    fn last_port(ports: &Arc<Mutex<Vec<EventPort>>>) -> EventPort {
        ports.lock().unwrap().last().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_ready_transitions_once() {
        let (mut host, ports) = host();
        assert_eq!(host.state(), HostState::Idle);

        host.load(document(), ViewportConfig::mobile()).unwrap();
        assert_eq!(host.state(), HostState::Loading);

        let port = last_port(&ports);
        port.post(r#"{"type":"ready"}"#, "*");
        port.post(r#"{"type":"ready"}"#, "*");

        match host.next_update().await {
            Some(HostUpdate::Event(ExecutionEvent::Ready)) => {}
            other => panic!("expected ready, got {:?}", other),
        }
        assert_eq!(host.state(), HostState::Ready);
        assert!(host.drain().is_empty(), "duplicate ready must be ignored");
        assert_eq!(host.state(), HostState::Ready);
    }

    #[tokio::test]
    async fn test_error_after_ready_is_runtime_and_terminal() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        let port = last_port(&ports);

        port.post(r#"{"type":"ready"}"#, "*");
        port.post(r#"{"type":"error","message":"click handler failed"}"#, "https://app.example.com");
        port.post(r#"{"type":"error","message":"second"}"#, "*");

        assert_eq!(host.settle().await.unwrap(), HostState::Ready);
        let accepted = host.drain();
        assert_eq!(accepted.len(), 1);
        assert_eq!(host.state(), HostState::Errored);
        assert!(matches!(host.error(), Some(PreviewError::Runtime(m)) if m == "click handler failed"));
    }

    #[tokio::test]
    async fn test_error_before_ready_is_mount() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        let port = last_port(&ports);

        port.post(r#"{"type":"error","message":"boom","source":"<preview:component>","line":2,"column":9}"#, "*");
        port.post(r#"{"type":"ready"}"#, "*");

        assert_eq!(host.settle().await.unwrap(), HostState::Errored);
        assert!(host.drain().is_empty(), "ready after an error is ignored");
        assert!(matches!(host.error(), Some(PreviewError::Mount(_))));
        assert_eq!(host.last_error().unwrap().line, Some(2));
    }

    #[tokio::test]
    async fn test_errored_session_stops_buffering() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        let port = last_port(&ports);

        port.post(r#"{"type":"ready"}"#, "*");
        for _ in 0..5 {
            port.post(r#"{"type":"error","message":"flood"}"#, "*");
        }
        assert_eq!(host.settle().await.unwrap(), HostState::Ready);
        assert_eq!(host.drain().len(), 1);
        assert_eq!(host.state(), HostState::Errored);

        assert!(port.is_closed());
        port.post(&format!(r#"{{"type":"ready","pad":"{}"}}"#, "x".repeat(60_000)), "*");
        assert!(host.drain().is_empty());
        assert!(host.next_update().await.is_none());
    }

    #[tokio::test]
    async fn test_ready_session_queue_is_capped() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        let port = last_port(&ports);

        port.post(r#"{"type":"ready"}"#, "*");
        assert_eq!(host.settle().await.unwrap(), HostState::Ready);

        // a ready context keeps posting while nobody reads
        let padded = format!(r#"{{"type":"ready","pad":"{}"}}"#, "x".repeat(60_000));
        for _ in 0..MAX_QUEUED_MESSAGES * 4 {
            port.post(&padded, "*");
        }
        let mut queued = 0;
        while host.session.as_mut().and_then(|s| s.inbox.try_recv()).is_some() {
            queued += 1;
        }
        assert_eq!(queued, MAX_QUEUED_MESSAGES);
    }

    #[tokio::test]
    async fn test_ignores_wrong_origin_malformed_and_stale_messages() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        let port = last_port(&ports);

        port.post(r#"{"type":"ready"}"#, "https://evil.example.com");
        port.post("not json", "*");
        assert!(host.drain().is_empty());

        let stale = Envelope {
            context: ContextId::new(),
            data: r#"{"type":"ready"}"#.to_string(),
        };
        assert_eq!(host.deliver(stale), None);
        assert_eq!(host.state(), HostState::Loading);
        assert!(host.session().unwrap().holds_document(), "only valid events release the document");
    }

    #[tokio::test]
    async fn test_reload_tears_down_previous_context() {
        let (mut host, ports) = host();
        let terminated = host.backend().terminated.clone();

        let first = host.load(document(), ViewportConfig::default()).unwrap();
        let old_port = last_port(&ports);
        assert_eq!(host.store().len(), 1);

        let second = host.load(document(), ViewportConfig::default()).unwrap();
        assert_ne!(first, second);
        assert_eq!(terminated.load(Ordering::SeqCst), 1);
        assert_eq!(host.store().len(), 1, "previous URL revoked");

        // the old channel is closed; a late ready cannot reach the new session
        old_port.post(r#"{"type":"ready"}"#, "*");
        assert!(host.drain().is_empty());
        assert_eq!(host.state(), HostState::Loading);

        host.teardown();
        assert_eq!(terminated.load(Ordering::SeqCst), 2);
        assert!(host.store().is_empty());
        assert_eq!(host.state(), HostState::Idle);
    }

    #[tokio::test]
    async fn test_first_event_releases_document() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();
        assert_eq!(host.store().len(), 1);

        last_port(&ports).post(r#"{"type":"ready"}"#, "*");
        host.settle().await.unwrap();

        assert!(host.store().is_empty());
        assert!(!host.session().unwrap().holds_document());
    }

    #[tokio::test]
    async fn test_timeout_is_advisory() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::default()).unwrap();

        match host.settle().await {
            Err(PreviewError::TimeoutWarning { budget, .. }) => assert_eq!(budget, Duration::from_millis(200)),
            other => panic!("expected timeout warning, got {:?}", other),
        }
        assert_eq!(host.state(), HostState::Loading);

        // a slow context may still report
        last_port(&ports).post(r#"{"type":"ready"}"#, "*");
        assert!(matches!(host.next_update().await, Some(HostUpdate::Event(ExecutionEvent::Ready))));
    }

    #[test]
    fn test_failed_instantiation_revokes_document() {
        let backend = ManualBackend {
            fail: true,
            ..Default::default()
        };
        let mut host = PreviewHost::new(backend, HostConfig::default());

        assert!(matches!(host.load(document(), ViewportConfig::default()), Err(PreviewError::Context(_))));
        assert!(host.store().is_empty());
        assert_eq!(host.state(), HostState::Idle);
    }

    #[tokio::test]
    async fn test_render_view_escapes_error_text() {
        let (mut host, ports) = host();
        host.load(document(), ViewportConfig::mobile()).unwrap();
        assert!(host.render_view().contains("preview-loading"));

        let event = ExecutionEvent::Error(ErrorEvent {
            stack: Some("at <img src=x onerror=alert(1)>".to_string()),
            ..ErrorEvent::new("<script>alert(1)</script>")
        });
        last_port(&ports).send(&event);
        host.settle().await.unwrap();

        let view = host.render_view();
        assert!(view.contains("sandbox=\"allow-scripts allow-same-origin\""));
        assert!(view.contains("width=\"375\" height=\"667\""));
        assert!(view.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(view.contains("&lt;img src=x onerror=alert(1)&gt;"));
        assert!(!view.contains("<script>"));
        assert!(!view.contains("preview-loading"));
    }

    #[test]
    fn test_viewport_orientation() {
        let landscape = ViewportConfig {
            orientation: Orientation::Landscape,
            ..ViewportConfig::mobile()
        };
        assert_eq!(landscape.frame_size(), (667, 375));
        assert_eq!(ViewportConfig::desktop().frame_size(), (1280, 800));
        assert_eq!(ViewportConfig::tablet().frame_size(), (768, 1024));
    }
}
