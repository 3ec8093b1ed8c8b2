//! Router tunables. Protocol limits (hop count, payload cap) are constants, not config.

use serde::Deserialize;

/// Soft cap on queued outbound bytes per connection (20 KiB).
pub const DEFAULT_MAX_WRITEQ_SIZE: usize = 20 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    /// Queued bytes above which a connection logs that it is backed up.
    /// Tracked only; enqueue never rejects.
    #[serde(default = "default_max_writeq_size")]
    pub max_writeq_size: usize,
}

fn default_max_writeq_size() -> usize {
    DEFAULT_MAX_WRITEQ_SIZE
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_writeq_size: default_max_writeq_size(),
        }
    }
}
