//! Informer tunables, read from `LOOKOUT_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InformerConfig {
    /// Period for re-delivering the cached state as `Synced` deltas. 0 disables resync.
    pub resync_secs: u64,
    pub watch_backoff_initial_ms: u64,
    pub watch_backoff_max_secs: u64,
    /// Page size for paginated lists; 0 lists everything in one call.
    pub list_page_size: u32,
    /// Server-side timeout requested for each watch call.
    pub watch_timeout_secs: u32,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_secs: 0,
            watch_backoff_initial_ms: 200,
            watch_backoff_max_secs: 30,
            list_page_size: 500,
            watch_timeout_secs: 290,
        }
    }
}

impl InformerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary key lookup; unset or unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            resync_secs: lookup("LOOKOUT_RESYNC_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.resync_secs),
            watch_backoff_initial_ms: lookup("LOOKOUT_WATCH_BACKOFF_INITIAL_MS").and_then(|s| s.parse().ok()).unwrap_or(d.watch_backoff_initial_ms),
            watch_backoff_max_secs: lookup("LOOKOUT_WATCH_BACKOFF_MAX_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.watch_backoff_max_secs),
            list_page_size: lookup("LOOKOUT_LIST_PAGE_SIZE").and_then(|s| s.parse().ok()).unwrap_or(d.list_page_size),
            watch_timeout_secs: lookup("LOOKOUT_WATCH_TIMEOUT_SECS").and_then(|s| s.parse().ok()).unwrap_or(d.watch_timeout_secs),
        }
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn backoff_initial(&self) -> Duration { Duration::from_millis(self.watch_backoff_initial_ms.max(1)) }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.watch_backoff_max_secs).max(self.backoff_initial())
    }
}
