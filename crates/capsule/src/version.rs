//! Version information for capsule.

/// Capsule version from Cargo.toml
pub const CAPSULE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a worker reports about itself on its admin service.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionInfo {
    /// Capsule version the worker was built against.
    pub capsule: String,
    /// Entry point the worker was started with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            capsule: CAPSULE_VERSION.to_string(),
            entry_point: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }
}
