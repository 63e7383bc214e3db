//! Messages from an isolated preview context to its host.
//!
//! Wire format (JSON):
//!   {"type":"ready"}
//!   {"type":"error","message":"...","source":"...","line":1,"column":2,"stack":"...","kind":"mount"}
//!
//! Each instantiation gets its own bounded channel. A port only ever carries
//! its own [`ContextId`], and the host drops envelopes whose id does not match
//! the current session. Once the queue is full, further messages are dropped
//! until the host catches up.

use crate::error::PreviewError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;
use uuid::Uuid;

/// Largest raw message accepted from a context
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Messages a context may have queued on the host at once
pub const MAX_QUEUED_MESSAGES: usize = 32;

/// Longest error message kept
const MAX_ERROR_MESSAGE: usize = 4096;

/// Longest stack kept
const MAX_STACK: usize = 16 * 1024;

/// Identity of one document instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which stage of the preview produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// No entry component could be resolved
    Synthesis,
    /// Exception while instantiating the component
    Mount,
    /// Uncaught exception after mount
    Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
            line: None,
            column: None,
            stack: None,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Classify this event. Without an explicit kind, errors before `ready`
    /// are mount failures and errors after it are runtime failures.
    pub fn resolved_kind(&self, after_ready: bool) -> ErrorKind {
        match self.kind {
            Some(kind) => kind,
            None if after_ready => ErrorKind::Runtime,
            None => ErrorKind::Mount,
        }
    }

    pub fn to_error(&self, after_ready: bool) -> PreviewError {
        let message = self.message.clone();
        match self.resolved_kind(after_ready) {
            ErrorKind::Synthesis => PreviewError::Synthesis(message),
            ErrorKind::Mount => PreviewError::Mount(message),
            ErrorKind::Runtime => PreviewError::Runtime(message),
        }
    }

    fn clamp(mut self) -> Self {
        truncate(&mut self.message, MAX_ERROR_MESSAGE);
        if let Some(stack) = self.stack.as_mut() {
            truncate(stack, MAX_STACK);
        }
        if let Some(source) = self.source.as_mut() {
            truncate(source, MAX_ERROR_MESSAGE);
        }
        self
    }
}

/// Status reported by a preview document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecutionEvent {
    Ready,
    Error(ErrorEvent),
}

impl ExecutionEvent {
    /// Parse and bound a raw message. Anything malformed yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() > MAX_MESSAGE_BYTES {
            debug!(bytes = raw.len(), "dropping oversized preview message");
            return None;
        }
        match serde_json::from_str::<ExecutionEvent>(raw) {
            Ok(ExecutionEvent::Error(event)) => Some(ExecutionEvent::Error(event.clamp())),
            Ok(event) => Some(event),
            Err(e) => {
                debug!(error = %e, "dropping malformed preview message");
                None
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"unserializable event"}"#.to_string())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ExecutionEvent::Ready)
    }
}

fn truncate(text: &mut String, max_chars: usize) {
    if let Some((cut, _)) = text.char_indices().nth(max_chars) {
        text.truncate(cut);
    }
}

/// A raw message tagged with the context that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub context: ContextId,
    pub data: String,
}

/// Sending half held by an isolated context.
#[derive(Debug, Clone)]
pub struct EventPort {
    context: ContextId,
    embedder_origin: String,
    tx: mpsc::Sender<Envelope>,
}

impl EventPort {
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// `postMessage` semantics: delivered only when `target_origin` is `*` or
    /// equals the embedder's origin.
    pub fn post(&self, data: &str, target_origin: &str) {
        if target_origin != "*" && target_origin != self.embedder_origin {
            debug!(context = %self.context, target_origin, "dropping message addressed to another origin");
            return;
        }
        if data.len() > MAX_MESSAGE_BYTES {
            debug!(context = %self.context, bytes = data.len(), "dropping oversized message");
            return;
        }
        // Reserve before copying so a full queue costs nothing on the host
        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                debug!(context = %self.context, "message queue full, dropping message");
                return;
            }
            Err(TrySendError::Closed(())) => {
                debug!(context = %self.context, "host no longer listening");
                return;
            }
        };
        permit.send(Envelope {
            context: self.context,
            data: data.to_string(),
        });
    }

    /// Send a typed event from host-side code running for this context.
    pub fn send(&self, event: &ExecutionEvent) {
        self.post(&event.to_json(), "*");
    }

    /// True once the host has stopped listening to this context.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half held by the host session.
#[derive(Debug)]
pub struct EventInbox {
    context: ContextId,
    rx: mpsc::Receiver<Envelope>,
}

impl EventInbox {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting messages and discard whatever is queued.
    pub fn close(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

/// Open a channel scoped to one instantiation.
pub fn channel(context: ContextId, embedder_origin: &str) -> (EventPort, EventInbox) {
    let (tx, rx) = mpsc::channel(MAX_QUEUED_MESSAGES);
    (
        EventPort {
            context,
            embedder_origin: embedder_origin.to_string(),
            tx,
        },
        EventInbox { context, rx },
    )
}
