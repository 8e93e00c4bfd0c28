//! Build and runtime diagnostics

use serde::Serialize;

/// Static metadata reported by `parley --status`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub name: &'static str,
    pub version: &'static str,
    pub runtime: String,
    pub backend_base_url: Option<String>,
}

impl Status {
    pub fn collect(backend_base_url: Option<String>) -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            runtime: format!(
                "rust ({}-{})",
                std::env::consts::ARCH,
                std::env::consts::OS
            ),
            backend_base_url,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
