//! Cache configuration.
//!
//! Controls keying, the cooldown window and in-memory store capacity via the
//! `[cache]` settings section.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_NAMESPACE: &str = "querycache";
const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Global switch. When off every read goes straight to the executor.
    pub enabled: bool,
    /// First segment of every key and tag.
    pub namespace: String,
    /// Optional custom segment inserted after the namespace.
    pub prefix: Option<String>,
    /// Include the database name in keys and tags.
    pub use_database_keying: bool,
    /// Default trust window after a write, in milliseconds.
    pub cooldown_ms: u64,
    /// Capacity of the in-memory store.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            prefix: None,
            use_database_keying: true,
            cooldown_ms: 0,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            namespace: settings.namespace.clone(),
            prefix: settings.prefix.clone(),
            use_database_keying: settings.use_database_keying,
            cooldown_ms: settings.cooldown_ms,
            max_entries: settings.max_entries,
        }
    }
}

impl CacheConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}
