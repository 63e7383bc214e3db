//! Subresource-integrity pinning for the trusted libraries.
//!
//! Security model:
//! - Only URLs on the trusted origins are fetched
//! - Redirects are followed only while they stay on the same origin
//! - A configured hash that no longer matches is an error, never overwritten

use crate::error::PreviewError;
use crate::policy::{TrustedOrigins, TrustedScript};
use base64::Engine;
use reqwest::Client;
use sha2::{Digest, Sha384};
use tracing::{debug, info};
use url::Url;

/// Redirect hops followed before giving up
const MAX_REDIRECTS: usize = 5;

/// `sha384-<base64>` integrity value for `bytes`.
pub fn integrity_of(bytes: &[u8]) -> String {
    let digest = Sha384::digest(bytes);
    format!("sha384-{}", base64::engine::general_purpose::STANDARD.encode(digest))
}

/// Fetch every library and return copies carrying their integrity values.
pub async fn pin_libraries(libraries: &[TrustedScript]) -> Result<Vec<TrustedScript>, PreviewError> {
    let origins = TrustedOrigins::from_libraries(libraries)?;
    let client = Client::builder()
        // Don't follow redirects automatically - we'll handle them manually
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| PreviewError::Pin(format!("failed to create HTTP client: {}", e)))?;

    let mut pinned = Vec::with_capacity(libraries.len());
    for library in libraries {
        pinned.push(pin_library(&client, &origins, library).await?);
    }
    Ok(pinned)
}

/// Fetch one library and compute its integrity.
///
/// # Errors
/// Returns `Pin` if the URL is off the trusted origins, the fetch fails or
/// redirects elsewhere, or a configured integrity value does not match.
pub async fn pin_library(
    client: &Client,
    origins: &TrustedOrigins,
    library: &TrustedScript,
) -> Result<TrustedScript, PreviewError> {
    let body = fetch_trusted(client, origins, &library.url).await?;
    let integrity = integrity_of(&body);

    if let Some(expected) = &library.integrity {
        if *expected != integrity {
            return Err(PreviewError::Pin(format!(
                "integrity mismatch for {}: configured {}, fetched {}",
                library.url, expected, integrity
            )));
        }
    }

    info!(library = %library.global, url = %library.url, bytes = body.len(), %integrity, "pinned library");
    Ok(library.clone().with_integrity(integrity))
}

async fn fetch_trusted(client: &Client, origins: &TrustedOrigins, url: &Url) -> Result<Vec<u8>, PreviewError> {
    check_origin(origins, url)?;
    let mut current = url.clone();

    for _ in 0..=MAX_REDIRECTS {
        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|e| PreviewError::Pin(format!("fetch of {} failed: {}", current, e)))?;
        let status = response.status();

        // Handle redirects manually - only allow same-origin
        if status.is_redirection() {
            let location = response
                .headers()
                .get("location")
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| PreviewError::Pin(format!("redirect from {} without a location", current)))?;
            let next = current
                .join(location)
                .map_err(|e| PreviewError::Pin(format!("invalid redirect URL: {}", e)))?;
            check_redirect(origins, &current, &next)?;
            debug!(from = %current, to = %next, "following same-origin redirect");
            current = next;
            continue;
        }

        if !status.is_success() {
            return Err(PreviewError::Pin(format!("fetch of {} returned {}", current, status)));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PreviewError::Pin(format!("failed to read {}: {}", current, e)))?;
        return Ok(bytes.to_vec());
    }

    Err(PreviewError::Pin(format!("too many redirects fetching {}", url)))
}

fn check_origin(origins: &TrustedOrigins, url: &Url) -> Result<(), PreviewError> {
    if origins.is_origin_allowed(url) {
        return Ok(());
    }
    Err(PreviewError::Pin(format!(
        "origin '{}' is not trusted. Allowed: {:?}",
        url.origin().ascii_serialization(),
        origins.as_slice()
    )))
}

fn check_redirect(origins: &TrustedOrigins, from: &Url, to: &Url) -> Result<(), PreviewError> {
    if to.origin() != from.origin() {
        return Err(PreviewError::Pin(format!(
            "redirect to different origin '{}' (original: '{}')",
            to.origin().ascii_serialization(),
            from.origin().ascii_serialization()
        )));
    }
    check_origin(origins, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::default_libraries;

    #[test]
    fn test_integrity_format() {
        // sha384 of the empty string
        assert_eq!(
            integrity_of(b""),
            "sha384-OLBgp1GsljhM2TJ+sbHjaiH9txEUvgdDTAzHv2P24donTt6/529l+9Ua0vFImLlb"
        );
        assert_eq!(integrity_of(b"abc").len(), "sha384-".len() + 64);
    }

    #[test]
    fn test_redirect_rules() {
        let origins = TrustedOrigins::from_libraries(&default_libraries()).unwrap();
        let from = Url::parse("https://unpkg.com/react@18.3.1/umd/react.production.min.js").unwrap();

        let same = Url::parse("https://unpkg.com/react@18.3.1/umd/react.production.min.js?v=1").unwrap();
        assert!(check_redirect(&origins, &from, &same).is_ok());

        let elsewhere = Url::parse("https://evil.example.com/react.js").unwrap();
        assert!(check_redirect(&origins, &from, &elsewhere).unwrap_err().to_string().contains("different origin"));

        let downgraded = Url::parse("http://unpkg.com/react.js").unwrap();
        assert!(check_redirect(&origins, &from, &downgraded).is_err());
    }

    #[tokio::test]
    async fn test_untrusted_origin_is_not_fetched() {
        let origins = TrustedOrigins::from_libraries(&default_libraries()).unwrap();
        let library = TrustedScript::new("Evil", "https://evil.example.com/x.js").unwrap();

        let err = pin_library(&Client::new(), &origins, &library).await.unwrap_err();
        assert!(err.to_string().contains("not trusted"));
    }
}
