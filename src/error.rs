//! Error taxonomy for the preview pipeline.
//!
//! Security violations stop a preview before anything is synthesized. Every
//! other kind is either advisory or ends up as an [`ExecutionEvent`] shown to
//! the author.
//!
//! [`ExecutionEvent`]: crate::protocol::ExecutionEvent

use crate::validator::Violation;
use std::time::Duration;

/// Every failure the preview subsystem can report.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    /// Denylisted capability found in the source. Synthesis must not proceed.
    #[error("security violation: {}", summarize(.0))]
    SecurityViolation(Vec<Violation>),

    /// Imports of modules outside the allowlist. Advisory only.
    #[error("blocked imports: {}", .0.join(", "))]
    BlockedImport(Vec<String>),

    /// Nothing left to render after sanitizing.
    #[error("component source is empty")]
    EmptySource,

    /// Mock data failed validation.
    #[error("invalid mock data: {0}")]
    InvalidMockData(String),

    /// The document could not resolve an entry component.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Exception while the component was being instantiated.
    #[error("mount error: {0}")]
    Mount(String),

    /// Uncaught exception after the component mounted.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The execution budget elapsed without a terminal event. The isolated
    /// context keeps running; this only reports the condition.
    #[error("execution exceeded its {}ms budget ({}ms elapsed)", .budget.as_millis(), .elapsed.as_millis())]
    TimeoutWarning { budget: Duration, elapsed: Duration },

    /// The regeneration was rejected by the rate limiter.
    #[error("regeneration throttled")]
    Throttled,

    /// The execution backend failed to create or drive a context.
    #[error("context error: {0}")]
    Context(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A pinned library could not be fetched or did not match its hash.
    #[error("pin error: {0}")]
    Pin(String),
}

impl PreviewError {
    /// True for kinds that must never reach execution.
    pub fn is_fatal_to_synthesis(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation(_) | Self::EmptySource | Self::InvalidMockData(_)
        )
    }

    /// True for kinds that are only surfaced as warnings.
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            Self::BlockedImport(_) | Self::TimeoutWarning { .. } | Self::Throttled
        )
    }
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} (line {})", v.pattern_id, v.line))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_lists_patterns() {
        let err = PreviewError::SecurityViolation(vec![Violation {
            pattern_id: "eval",
            description: "eval() executes arbitrary strings as code",
            line: 3,
            excerpt: "eval(".to_string(),
        }]);

        assert_eq!(err.to_string(), "security violation: eval (line 3)");
        assert!(err.is_fatal_to_synthesis());
        assert!(!err.is_advisory());
    }

    #[test]
    fn test_timeout_is_advisory() {
        let err = PreviewError::TimeoutWarning {
            budget: Duration::from_millis(500),
            elapsed: Duration::from_millis(750),
        };

        assert!(err.is_advisory());
        assert!(err.to_string().contains("500ms budget"));
    }
}
