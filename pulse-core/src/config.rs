//! Instance configuration.

use serde::{Deserialize, Serialize};

/// When subscriber notification runs after a drain cycle completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyMode {
    /// Signal the host; notification happens on its next turn via
    /// [`Pulse::flush_updates`](crate::Pulse::flush_updates) or the update loop.
    #[default]
    Deferred,

    /// Notify synchronously at the end of every outermost drain.
    Immediate,
}

/// Configuration for a [`Pulse`](crate::Pulse) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// Namespace for persisted keys: `_<prefix>_<name>`.
    pub storage_prefix: String,

    /// Notification scheduling.
    pub notify: NotifyMode,

    /// Emit a `trace!` event for every performed job.
    pub trace_jobs: bool,

    /// Queued tracked changes above this count make a group rebuild from
    /// scratch instead of replaying the diff.
    pub group_full_rebuild_threshold: usize,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            storage_prefix: "pulse".to_string(),
            notify: NotifyMode::Deferred,
            trace_jobs: false,
            group_full_rebuild_threshold: 512,
        }
    }
}

impl PulseConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Build the storage key for a named cell.
    pub fn storage_key(&self, name: &str) -> String {
        format!("_{}_{}", self.storage_prefix, name)
    }
}
