//! End-to-end preview flow: validate, synthesize, instantiate.
//!
//! Source with any security violation never reaches the synthesizer. Bursts
//! of edits pass through a [`RegenerationGate`] so only the latest one is
//! rendered.

use crate::config::PreviewConfig;
use crate::controls::RegenerationGate;
use crate::document::{RenderDocument, Synthesizer};
use crate::error::PreviewError;
use crate::host::{ExecutionBackend, HostConfig, PreviewHost, ViewportConfig};
use crate::props::MockData;
use crate::protocol::ContextId;
use crate::validator::{validate, validate_imports};
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One regeneration: the inputs a preview is rendered from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreviewRequest {
    pub source: String,
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub viewport: ViewportConfig,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl PreviewRequest {
    pub fn new(source: impl Into<String>, data: Value) -> Self {
        Self {
            source: source.into(),
            data,
            viewport: ViewportConfig::default(),
        }
    }
}

/// Validate `source` and `data` and build their document.
///
/// # Errors
/// `SecurityViolation` for any denylisted pattern, `EmptySource` when nothing
/// is left to render, `InvalidMockData` when the data fails validation.
pub fn prepare(synthesizer: &Synthesizer, source: &str, data: Value) -> Result<RenderDocument, PreviewError> {
    let result = validate(source);
    if !result.is_clean() {
        warn!(violations = result.violations.len(), "source rejected");
    }
    let admitted = result.into_admitted()?;

    let imports = validate_imports(source);
    if !imports.is_valid {
        // Advisory: the imports were already stripped
        warn!("{}", PreviewError::BlockedImport(imports.blocked_imports));
    }

    let data = MockData::new(data)?;
    Ok(synthesizer.synthesize(admitted.as_str(), &data))
}

/// Facade over the synthesizer, the host and the regeneration gate.
pub struct Previewer<B> {
    synthesizer: Synthesizer,
    host: PreviewHost<B>,
    gate: RegenerationGate<PreviewRequest>,
}

impl<B: ExecutionBackend> Previewer<B> {
    pub fn new(synthesizer: Synthesizer, backend: B, host: HostConfig, throttle: Duration) -> Self {
        Self {
            synthesizer,
            host: PreviewHost::new(backend, host),
            gate: RegenerationGate::new(throttle),
        }
    }

    pub fn from_config(config: &PreviewConfig, backend: B) -> Result<Self, PreviewError> {
        Ok(Self::new(config.synthesizer()?, backend, config.host_config(), config.throttle()))
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    pub fn host(&self) -> &PreviewHost<B> {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut PreviewHost<B> {
        &mut self.host
    }

    /// Render `request` now, bypassing the gate.
    ///
    /// On a validation error the current preview stays as it is.
    pub fn preview(&mut self, request: PreviewRequest) -> Result<ContextId, PreviewError> {
        let document = prepare(&self.synthesizer, &request.source, request.data).inspect_err(|e| {
            if e.is_fatal_to_synthesis() {
                debug!(error = %e, context = ?self.host.context(), "edit rejected, keeping current preview");
            }
        })?;
        self.host.load(document, request.viewport)
    }

    /// Render `request` now if the rate limit allows it.
    ///
    /// # Errors
    /// `Throttled` when a regeneration happened too recently or one is queued.
    pub fn try_preview(&mut self, request: PreviewRequest, now: Instant) -> Result<ContextId, PreviewError> {
        if !self.gate.admit_now(now) {
            return Err(PreviewError::Throttled);
        }
        self.preview(request)
    }

    /// Queue `request` as the latest edit. Returns the request it superseded.
    pub fn request(&mut self, request: PreviewRequest, now: Instant) -> Option<PreviewRequest> {
        self.gate.offer(request, now)
    }

    /// Render the queued request if the gate releases it.
    pub fn poll(&mut self, now: Instant) -> Option<Result<ContextId, PreviewError>> {
        let request = self.gate.poll(now)?;
        debug!("regeneration released");
        Some(self.preview(request))
    }

    /// When [`poll`](Self::poll) should next be called.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.gate.next_deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.gate.has_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostState, Instantiation, LiveContext};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct RecordingBackend {
        documents: Arc<Mutex<Vec<String>>>,
    }

    struct Idle(ContextId);

    impl LiveContext for Idle {
        fn id(&self) -> ContextId {
            self.0
        }

        fn terminate(&mut self) {}
    }

    impl ExecutionBackend for RecordingBackend {
        fn instantiate(&mut self, inst: Instantiation) -> Result<Box<dyn LiveContext>, PreviewError> {
            let html = inst.store.resolve(&inst.url).unwrap();
            self.documents.lock().unwrap().push(html.to_string());
            Ok(Box::new(Idle(inst.context)))
        }
    }

    fn previewer(throttle: Duration) -> (Previewer<RecordingBackend>, Arc<Mutex<Vec<String>>>) {
        let backend = RecordingBackend::default();
        let documents = backend.documents.clone();
        let previewer = Previewer::new(Synthesizer::default(), backend, HostConfig::default(), throttle);
        (previewer, documents)
    }

    fn edit(n: usize) -> PreviewRequest {
        PreviewRequest::new(
            format!("function Component() {{ return React.createElement('p', null, 'edit {}'); }}", n),
            json!({}),
        )
    }

    #[test]
    fn test_violation_blocks_pipeline() {
        let (mut previewer, documents) = previewer(Duration::from_millis(100));

        let request = PreviewRequest::new("function Component() { eval('1'); return null; }", json!({}));
        match previewer.preview(request) {
            Err(PreviewError::SecurityViolation(violations)) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].pattern_id, "eval");
            }
            other => panic!("expected security violation, got {:?}", other),
        }
        assert!(documents.lock().unwrap().is_empty());
        assert_eq!(previewer.host().state(), HostState::Idle);
    }

    #[test]
    fn test_rejected_edit_keeps_current_preview() {
        let (mut previewer, documents) = previewer(Duration::from_millis(100));
        let context = previewer.preview(edit(1)).unwrap();

        let bad = PreviewRequest::new("function Component() { return null; }", json!({"__proto__": {}}));
        assert!(matches!(previewer.preview(bad), Err(PreviewError::InvalidMockData(_))));
        assert!(matches!(previewer.preview(PreviewRequest::new("  \n", json!({}))), Err(PreviewError::EmptySource)));

        assert_eq!(previewer.host().context(), Some(context));
        assert_eq!(documents.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_blocked_imports_are_stripped_not_fatal() {
        let (mut previewer, documents) = previewer(Duration::from_millis(100));
        let source = "import leftPad from 'left-pad';\nimport React from 'react';\nexport default function App() { return null; }";

        previewer.preview(PreviewRequest::new(source, json!({}))).unwrap();

        let html = documents.lock().unwrap()[0].clone();
        assert!(!html.contains("left-pad"));
        assert!(html.contains("function App()"));
        assert!(!html.contains("export default"));
    }

    #[test]
    fn test_rapid_edits_render_only_the_latest() {
        let t0 = Instant::now();
        let (mut previewer, documents) = previewer(Duration::from_millis(100));

        let mut superseded = 0;
        for n in 0..5 {
            if previewer.request(edit(n), t0 + Duration::from_millis(10 * n as u64)).is_some() {
                superseded += 1;
            }
        }
        assert_eq!(superseded, 4);

        assert!(previewer.poll(t0 + Duration::from_millis(100)).is_none());
        assert_eq!(previewer.next_deadline(), Some(t0 + Duration::from_millis(140)));

        let released = previewer.poll(t0 + Duration::from_millis(140));
        assert!(matches!(released, Some(Ok(_))));
        assert!(!previewer.has_pending());

        let documents = documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        assert!(documents[0].contains("edit 4"));
    }

    #[test]
    fn test_try_preview_is_throttled() {
        let t0 = Instant::now();
        let (mut previewer, documents) = previewer(Duration::from_millis(100));

        assert!(previewer.try_preview(edit(1), t0).is_ok());
        assert!(matches!(previewer.try_preview(edit(2), t0 + Duration::from_millis(30)), Err(PreviewError::Throttled)));
        assert!(previewer.try_preview(edit(3), t0 + Duration::from_millis(100)).is_ok());
        assert_eq!(documents.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_request_json_defaults() {
        let request: PreviewRequest = serde_json::from_str(r#"{"source":"const App = () => null;"}"#).unwrap();
        assert_eq!(request.data, json!({}));
        assert_eq!(request.viewport, ViewportConfig::default());
    }
}
