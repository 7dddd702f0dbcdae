use std::time::Duration;

use serde::Deserialize;

/// Configuration for a [`FutureRegistry`](crate::FutureRegistry).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How long settled (or directly created) entries are retained before
    /// being evicted from the registry.
    ///
    /// Every time an entry is created via `resolve`/`reject` or an awaited
    /// placeholder is settled, its eviction clock restarts. `None` disables
    /// eviction entirely; entries then live until explicitly deleted.
    #[serde(with = "humantime_serde")]
    pub eviction_timeout: Option<Duration>,
}

impl Config {
    /// Convenience constructor for the common "evict after this long" case.
    pub fn with_eviction_timeout(timeout: Duration) -> Self {
        Self {
            eviction_timeout: Some(timeout),
        }
    }
}
