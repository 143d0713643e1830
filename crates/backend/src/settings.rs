//! Settings store capability.

use multipassd_common::Result;

/// The process-scope settings service.
///
/// Initialized before the daemon and torn down after it; injected into the
/// components that consume it.
pub trait Settings: Send + Sync {
    /// Read a setting. Unknown keys fail with `UnrecognizedSetting`.
    fn get(&self, key: &str) -> Result<String>;

    /// Write a setting. Unknown keys fail with `UnrecognizedSetting`, bad
    /// values with `InvalidSetting`.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// All known settings keys.
    fn keys(&self) -> Vec<String>;

    /// Boolean view of a setting; unreadable or unparsable values read false.
    fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .ok()
            .map(|v| v == "true" || v == "1" || v == "on" || v == "yes")
            .unwrap_or(false)
    }
}
