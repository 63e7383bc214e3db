//! # Preview Sandbox
//!
//! Renders untrusted UI component source live, in an isolated context, without
//! exposing the embedding application.
//!
//! ## Security Guarantees
//!
//! - **Denylisted capabilities never run**: source with any violation is not synthesized
//! - **No module loading**: imports are stripped, and the isolate's loader refuses everything
//! - **No network, filesystem or environment**: the headless context has no such ops
//! - **Scoped messaging**: a context only reaches the host through its own channel
//! - **Inert data**: mock data is validated and embedded as escaped JSON, never as code
//!
//! ## Usage
//!
//! ```rust,ignore
//! use preview_sandbox::{HostConfig, PreviewRequest, Previewer, Synthesizer, V8Backend};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut previewer = Previewer::new(
//!         Synthesizer::default(),
//!         V8Backend::default(),
//!         HostConfig::default(),
//!         Duration::from_millis(300),
//!     );
//!
//!     let source = "function Component({ data }) { return React.createElement('h1', null, data.title); }";
//!     previewer
//!         .preview(PreviewRequest::new(source, serde_json::json!({ "title": "Hello" })))
//!         .unwrap();
//!
//!     let state = previewer.host_mut().settle().await.unwrap();
//!     println!("{:?}", state);
//! }
//! ```

mod blob;
mod config;
mod controls;
mod document;
mod error;
mod host;
mod isolate;
mod loader;
mod ops;
mod pin;
mod pipeline;
mod policy;
mod props;
mod protocol;
mod validator;

pub use blob::{BlobHandle, BlobStore};
pub use config::{ControlsSection, HostSection, PreviewConfig};
pub use controls::{ExecutionMonitor, RateLimiter, RegenerationGate, DEFAULT_EXECUTION_BUDGET, DEFAULT_THROTTLE};
pub use document::{detect_entry_point, synthesize, EntryPoint, RenderDocument, Synthesizer, SynthesizerConfig};
pub use error::PreviewError;
pub use host::{
    ExecutionBackend, HostConfig, HostState, HostUpdate, Instantiation, LiveContext, Orientation, PreviewHost,
    PreviewSession, ViewportConfig,
};
pub use isolate::{IsolateConfig, V8Backend};
pub use loader::DenyAllLoader;
pub use pin::{integrity_of, pin_libraries};
pub use pipeline::{prepare, PreviewRequest, Previewer};
pub use policy::{default_libraries, ContentPolicy, Delivery, TrustedOrigins, TrustedScript, SANDBOX_FLAGS};
pub use props::MockData;
pub use protocol::{
    ContextId, Envelope, ErrorEvent, ErrorKind, EventInbox, EventPort, ExecutionEvent, MAX_MESSAGE_BYTES,
    MAX_QUEUED_MESSAGES,
};
pub use validator::{validate, validate_imports, AdmittedSource, ImportReport, SanitizationResult, Violation};
