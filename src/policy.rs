//! Capability policy for preview documents.
//!
//! Security model:
//! - Scripts and styles load only from `self` and the pinned library origins
//! - No network connections, form submissions or `<base>` rewrites
//! - The embedding frame grants script execution and own-origin access only

use crate::error::PreviewError;
use serde::{Deserialize, Serialize};
use url::Url;

/// `sandbox` attribute for the preview frame. Deliberately excludes
/// `allow-top-navigation`, `allow-popups`, `allow-forms` and `allow-modals`.
pub const SANDBOX_FLAGS: &str = "allow-scripts allow-same-origin";

/// A third-party script the preview document may load, pinned to an exact URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedScript {
    /// Global the script defines (`React`, `ReactDOM`, `Babel`)
    pub global: String,
    pub url: Url,
    /// Subresource integrity, e.g. `sha384-...`
    #[serde(default)]
    pub integrity: Option<String>,
}

impl TrustedScript {
    pub fn new(global: &str, url: &str) -> Result<Self, PreviewError> {
        let url = Url::parse(url)
            .map_err(|e| PreviewError::Config(format!("invalid library URL '{}': {}", url, e)))?;
        Ok(Self {
            global: global.to_string(),
            url,
            integrity: None,
        })
    }

    pub fn with_integrity(mut self, integrity: impl Into<String>) -> Self {
        self.integrity = Some(integrity.into());
        self
    }

    pub fn origin(&self) -> String {
        self.url.origin().ascii_serialization()
    }
}

/// The pinned defaults: React 18 UMD builds and the standalone JSX transpiler.
pub fn default_libraries() -> Vec<TrustedScript> {
    [
        ("React", "https://unpkg.com/react@18.3.1/umd/react.production.min.js"),
        ("ReactDOM", "https://unpkg.com/react-dom@18.3.1/umd/react-dom.production.min.js"),
        ("Babel", "https://unpkg.com/@babel/standalone@7.24.7/babel.min.js"),
    ]
    .into_iter()
    .map(|(global, url)| TrustedScript {
        global: global.to_string(),
        // Static URLs above are well-formed
        url: Url::parse(url).expect("default library URL"),
        integrity: None,
    })
    .collect()
}

/// Set of origins allowed to serve scripts and styles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedOrigins {
    /// Origins (scheme + host + port), e.g. "https://unpkg.com"
    origins: Vec<String>,
}

impl TrustedOrigins {
    /// Collect the origins of `libraries`. Only `https` URLs are accepted.
    pub fn from_libraries(libraries: &[TrustedScript]) -> Result<Self, PreviewError> {
        let mut origins: Vec<String> = Vec::new();
        for lib in libraries {
            if lib.url.scheme() != "https" {
                return Err(PreviewError::Config(format!(
                    "library '{}' must be served over https, got {}",
                    lib.global, lib.url
                )));
            }
            let origin = lib.origin();
            if !origins.contains(&origin) {
                origins.push(origin);
            }
        }
        Ok(Self { origins })
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        if self.origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.origins.iter().any(|allowed| origin == *allowed)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.origins
    }
}

/// Where a policy string will be delivered. Browsers ignore
/// `frame-ancestors` in a `<meta>` tag and warn about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Meta,
    Header,
}

/// Content-Security-Policy for a preview document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentPolicy {
    origins: TrustedOrigins,
}

impl ContentPolicy {
    pub fn new(origins: TrustedOrigins) -> Self {
        Self { origins }
    }

    pub fn render(&self, delivery: Delivery) -> String {
        let trusted = self.origins.as_slice().join(" ");
        let with_trusted = |base: &str| {
            if trusted.is_empty() {
                base.to_string()
            } else {
                format!("{} {}", base, trusted)
            }
        };

        // the transpiler evaluates generated code, hence 'unsafe-eval'
        let mut directives = vec![
            "default-src 'none'".to_string(),
            with_trusted("script-src 'self' 'unsafe-inline' 'unsafe-eval'"),
            with_trusted("style-src 'self' 'unsafe-inline'"),
            "img-src 'self' data: blob: https:".to_string(),
            "font-src 'self' data:".to_string(),
            "connect-src 'none'".to_string(),
            "form-action 'none'".to_string(),
            "base-uri 'none'".to_string(),
        ];
        if delivery == Delivery::Header {
            directives.push("frame-ancestors 'self'".to_string());
        }
        directives.join("; ")
    }
}
