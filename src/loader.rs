//! Module loader for preview contexts: every import is refused.
//!
//! Preview documents are classic scripts. Allowlisted imports were turned
//! into comments by the validator and the libraries they name are already
//! globals, so any module request reaching the isolate is an escape attempt.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSpecifier, RequestedModuleType, ResolutionKind,
};
use tracing::warn;

/// A module loader that resolves nothing.
#[derive(Debug, Default)]
pub struct DenyAllLoader;

impl DenyAllLoader {
    pub fn new() -> Self {
        Self
    }

    fn refusal(specifier: &str) -> Error {
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("data:")
            || specifier.starts_with("blob:")
        {
            anyhow!("Remote imports are forbidden in previews: {}", specifier)
        } else {
            anyhow!("Module imports are forbidden in previews: {}", specifier)
        }
    }
}

impl ModuleLoader for DenyAllLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        warn!(specifier, referrer, dynamic = matches!(kind, ResolutionKind::DynamicImport), "refused module import");
        Err(Self::refusal(specifier))
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        // Unreachable through resolve, refused again all the same
        ModuleLoadResponse::Sync(Err(Self::refusal(module_specifier.as_str())))
    }
}
