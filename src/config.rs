//! TOML configuration.
//!
//! ```toml
//! [synthesizer]
//! parent_origin = "https://app.example.com"
//! title = "Component preview"
//!
//! [[synthesizer.libraries]]
//! global = "React"
//! url = "https://unpkg.com/react@18.3.1/umd/react.production.min.js"
//! integrity = "sha384-..."
//!
//! [host]
//! timeout_ms = 5000
//! max_heap_size = 67108864
//!
//! [controls]
//! throttle_ms = 300
//! ```
//!
//! Every key is optional.

use crate::controls::{DEFAULT_EXECUTION_BUDGET, DEFAULT_THROTTLE};
use crate::document::{Synthesizer, SynthesizerConfig};
use crate::error::PreviewError;
use crate::host::HostConfig;
use crate::isolate::IsolateConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub synthesizer: SynthesizerConfig,
    pub host: HostSection,
    pub controls: ControlsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSection {
    /// Budget for a context to report `ready` or an error
    pub timeout_ms: u64,
    /// Maximum isolate heap in bytes (None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Origin the host listens as. Defaults to the synthesizer's parent origin.
    pub embedder_origin: Option<String>,
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_EXECUTION_BUDGET.as_millis() as u64,
            max_heap_size: IsolateConfig::default().max_heap_size,
            embedder_origin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlsSection {
    /// Minimum interval between regenerations
    pub throttle_ms: u64,
}

impl Default for ControlsSection {
    fn default() -> Self {
        Self {
            throttle_ms: DEFAULT_THROTTLE.as_millis() as u64,
        }
    }
}

impl PreviewConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, PreviewError> {
        let config: Self = toml::from_str(text).map_err(|e| PreviewError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, PreviewError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| PreviewError::Config(format!("failed to read '{}': {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), PreviewError> {
        if self.host.timeout_ms == 0 {
            return Err(PreviewError::Config(String::from("host.timeout_ms must be positive")));
        }
        Synthesizer::new(self.synthesizer.clone()).map(|_| ())
    }

    pub fn synthesizer(&self) -> Result<Synthesizer, PreviewError> {
        Synthesizer::new(self.synthesizer.clone())
    }

    pub fn host_config(&self) -> HostConfig {
        let embedder_origin = self
            .host
            .embedder_origin
            .clone()
            .or_else(|| self.synthesizer.parent_origin.clone().filter(|origin| origin != "*"))
            .map(|origin| normalize(&origin))
            .unwrap_or_else(|| String::from("null"));
        HostConfig {
            timeout: Duration::from_millis(self.host.timeout_ms),
            embedder_origin,
        }
    }

    pub fn isolate_config(&self) -> IsolateConfig {
        IsolateConfig {
            max_heap_size: self.host.max_heap_size,
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.controls.throttle_ms)
    }
}

/// Reduce a URL to its origin; anything unparsable is kept as written.
fn normalize(origin: &str) -> String {
    match url::Url::parse(origin) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => origin.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = PreviewConfig::from_toml_str("").unwrap();

        assert_eq!(config.synthesizer.libraries.len(), 3);
        assert_eq!(config.host_config().timeout, Duration::from_secs(5));
        assert_eq!(config.host_config().embedder_origin, "null");
        assert_eq!(config.throttle(), Duration::from_millis(300));
        assert_eq!(config.isolate_config().max_heap_size, Some(64 * 1024 * 1024));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[synthesizer]
parent_origin = "https://app.example.com/editor"

[[synthesizer.libraries]]
global = "React"
url = "https://cdn.example.com/react.js"
integrity = "sha384-abc"

[host]
timeout_ms = 1500

[controls]
throttle_ms = 50
"#
        )
        .unwrap();

        let config = PreviewConfig::load(file.path()).unwrap();
        assert_eq!(config.synthesizer.libraries.len(), 1);
        assert_eq!(config.synthesizer.libraries[0].integrity.as_deref(), Some("sha384-abc"));
        assert_eq!(config.host_config().timeout, Duration::from_millis(1500));
        assert_eq!(config.host_config().embedder_origin, "https://app.example.com");
        assert_eq!(config.throttle(), Duration::from_millis(50));
        assert_eq!(config.synthesizer.title, "Component preview");
    }

    #[test]
    fn test_rejects_insecure_library() {
        let text = r#"
[[synthesizer.libraries]]
global = "React"
url = "http://cdn.example.com/react.js"
"#;
        assert!(matches!(PreviewConfig::from_toml_str(text), Err(PreviewError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_timeout_and_bad_toml() {
        assert!(PreviewConfig::from_toml_str("[host]\ntimeout_ms = 0").is_err());
        assert!(PreviewConfig::from_toml_str("[host\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = PreviewConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
