//! Bridge configuration
//!
//! Where the module artifact comes from when the caller does not pass an
//! explicit source. With no override, the artifact URL is derived from the
//! configured base resource name by swapping its trailing extension for
//! `.wasm`, the companion-artifact convention.

use serde::{Deserialize, Serialize};

/// Configuration for a bridge lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Explicit module artifact URL. Takes precedence over derivation.
    pub module_url: Option<String>,

    /// Base resource name (for example `wasym_bridge.js`) the companion
    /// artifact name is derived from.
    pub artifact_base: Option<String>,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module_url(url: impl Into<String>) -> Self {
        Self {
            module_url: Some(url.into()),
            ..Self::default()
        }
    }

    /// The URL to fetch the module from, if one is configured or derivable.
    pub fn resolve_module_url(&self) -> Option<String> {
        if let Some(url) = &self.module_url {
            return Some(url.clone());
        }
        self.artifact_base.as_deref().map(companion_artifact)
    }
}

/// Derive the companion module artifact name from a resource name by
/// replacing the trailing extension with `.wasm`.
pub fn companion_artifact(resource: &str) -> String {
    match resource.rfind('.') {
        // Keep directory dots intact: only strip an extension after the
        // final path separator.
        Some(dot) if !resource[dot..].contains('/') => format!("{}.wasm", &resource[..dot]),
        _ => format!("{resource}.wasm"),
    }
}
