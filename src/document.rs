//! Self-contained preview documents.
//!
//! A document carries, in order: the pinned library scripts, the mock data as
//! an inert JSON block, the runtime harness, the admitted component source and
//! the mount step. Nothing else is fetched at load time.

use crate::error::PreviewError;
use crate::policy::{default_libraries, ContentPolicy, Delivery, TrustedOrigins, TrustedScript};
use crate::props::{embed_json, MockData};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::debug;

/// Element holding the mock-data JSON block
pub const DATA_ELEMENT_ID: &str = "__preview_data__";

/// Inline script holding the runtime harness
pub const HARNESS_ELEMENT_ID: &str = "__preview_harness__";

/// Inline script holding the component source and mount step
pub const COMPONENT_ELEMENT_ID: &str = "__preview_component__";

/// Mount point for the rendered component
pub const ROOT_ELEMENT_ID: &str = "root";

const HARNESS_JS: &str = include_str!("js/harness.js");

const MOUNT_JS: &str = r#";(function () {
  var entry = typeof Component !== 'undefined' ? Component
    : typeof App !== 'undefined' ? App
    : undefined;
  window.__previewMount(entry, window.__PREVIEW_DATA__);
})();
"#;

const BASE_STYLE: &str = "html,body{margin:0;padding:0}\
body{font-family:system-ui,-apple-system,sans-serif;background:#fff;color:#111}\
.preview-fallback{padding:16px;color:#b42318;font-size:14px}\
.preview-fallback pre{white-space:pre-wrap}";

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:function|class|const|let|var)\s+(Component|App)\b").expect("entry pattern must compile")
});

static SCRIPT_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(script)").expect("script close pattern must compile"));

/// Component the mount step will pick up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Component,
    App,
}

impl EntryPoint {
    pub fn name(&self) -> &'static str {
        match self {
            EntryPoint::Component => "Component",
            EntryPoint::App => "App",
        }
    }
}

/// Best-effort static detection of the entry component.
///
/// The mount step prefers `Component` over `App` at runtime, so the same
/// precedence applies here.
pub fn detect_entry_point(code: &str) -> Option<EntryPoint> {
    let mut found = None;
    for caps in ENTRY_RE.captures_iter(code) {
        match &caps[1] {
            "Component" => return Some(EntryPoint::Component),
            _ => found = Some(EntryPoint::App),
        }
    }
    found
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesizerConfig {
    /// Libraries loaded before the component, in order
    pub libraries: Vec<TrustedScript>,
    /// Origin the harness addresses its messages to (`*` when unset)
    pub parent_origin: Option<String>,
    pub title: String,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            libraries: default_libraries(),
            parent_origin: None,
            title: String::from("Component preview"),
        }
    }
}

/// A synthesized document, ready to be loaded by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderDocument {
    html: String,
    content_security_policy: String,
    entry_point: Option<EntryPoint>,
}

impl RenderDocument {
    pub fn html(&self) -> &str {
        &self.html
    }

    pub fn into_html(self) -> String {
        self.html
    }

    /// Header form of the document's policy.
    pub fn content_security_policy(&self) -> &str {
        &self.content_security_policy
    }

    pub fn entry_point(&self) -> Option<EntryPoint> {
        self.entry_point
    }
}

/// Assembles preview documents. Performs no execution.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    config: SynthesizerConfig,
    target_origin: String,
    meta_policy: String,
    header_policy: String,
}

impl Synthesizer {
    /// # Errors
    /// Returns `Config` if a library is not served over https or the parent
    /// origin is not `*` or a valid origin.
    pub fn new(config: SynthesizerConfig) -> Result<Self, PreviewError> {
        let policy = ContentPolicy::new(TrustedOrigins::from_libraries(&config.libraries)?);
        let target_origin = match config.parent_origin.as_deref() {
            None | Some("*") => String::from("*"),
            Some(origin) => normalize_origin(origin)?,
        };
        Ok(Self {
            meta_policy: policy.render(Delivery::Meta),
            header_policy: policy.render(Delivery::Header),
            target_origin,
            config,
        })
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    /// Build the document for admitted `code` and validated `data`.
    ///
    /// Deterministic: equal inputs give byte-identical output.
    pub fn synthesize(&self, code: &str, data: &MockData) -> RenderDocument {
        let entry_point = detect_entry_point(code);
        if entry_point.is_none() {
            debug!("no entry component detected; mount will report it");
        }

        let mut html = String::with_capacity(HARNESS_JS.len() + code.len() + 2048);
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
        let _ = writeln!(
            html,
            "<meta http-equiv=\"Content-Security-Policy\" content=\"{}\">",
            escape_html(&self.meta_policy)
        );
        html.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
        let _ = writeln!(html, "<title>{}</title>", escape_html(&self.config.title));
        let _ = writeln!(html, "<style>{}</style>", BASE_STYLE);

        for lib in &self.config.libraries {
            html.push_str("<script src=\"");
            html.push_str(&escape_html(lib.url.as_str()));
            html.push('"');
            if let Some(integrity) = &lib.integrity {
                let _ = write!(html, " integrity=\"{}\"", escape_html(integrity));
            }
            html.push_str(" crossorigin=\"anonymous\"></script>\n");
        }
        html.push_str("</head>\n<body>\n");
        let _ = writeln!(html, "<div id=\"{}\"></div>", ROOT_ELEMENT_ID);

        let _ = writeln!(
            html,
            "<script type=\"application/json\" id=\"{}\">{}</script>",
            DATA_ELEMENT_ID,
            data.to_embedded_json()
        );

        let _ = write!(
            html,
            "<script id=\"{}\">\nwindow.__PREVIEW_CONFIG__ = {};\n{}</script>\n",
            HARNESS_ELEMENT_ID,
            self.harness_config(),
            HARNESS_JS
        );

        let _ = write!(
            html,
            "<script type=\"text/babel\" data-presets=\"env,react\" id=\"{}\">\n{}\n{}</script>\n",
            COMPONENT_ELEMENT_ID,
            escape_script_text(code),
            MOUNT_JS
        );
        html.push_str("</body>\n</html>\n");

        RenderDocument {
            html,
            content_security_policy: self.header_policy.clone(),
            entry_point,
        }
    }

    fn harness_config(&self) -> String {
        let config = serde_json::json!({
            "dataElement": DATA_ELEMENT_ID,
            "rootElement": ROOT_ELEMENT_ID,
            "targetOrigin": self.target_origin,
        });
        embed_json(&config.to_string())
    }
}

impl Default for Synthesizer {
    fn default() -> Self {
        let config = SynthesizerConfig::default();
        let policy = ContentPolicy::new(
            // The default libraries are all https
            TrustedOrigins::from_libraries(&config.libraries).unwrap_or_default(),
        );
        Self {
            meta_policy: policy.render(Delivery::Meta),
            header_policy: policy.render(Delivery::Header),
            target_origin: String::from("*"),
            config,
        }
    }
}

/// Synthesize with the default libraries and an unscoped parent origin.
pub fn synthesize(code: &str, data: &MockData) -> RenderDocument {
    Synthesizer::default().synthesize(code, data)
}

fn normalize_origin(origin: &str) -> Result<String, PreviewError> {
    let url = url::Url::parse(origin)
        .map_err(|e| PreviewError::Config(format!("invalid parent origin '{}': {}", origin, e)))?;
    let serialized = url.origin().ascii_serialization();
    if serialized == "null" {
        return Err(PreviewError::Config(format!("parent origin '{}' is opaque", origin)));
    }
    Ok(serialized)
}

/// Escape text for an HTML attribute or element body.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Keep source text from closing its `<script>` element early.
fn escape_script_text(code: &str) -> String {
    SCRIPT_CLOSE_RE.replace_all(code, r"<\/$1").replace("<!--", r"<\!--")
}
