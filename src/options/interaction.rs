use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::protocol::paths;

/// Interactive-dynamics publishing parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(title = "Interaction", inline)]
#[serde(default)]
pub struct InteractionOptions {
    /// Milliseconds between flushes of pending interaction updates.
    #[schemars(title = "Flush Interval (ms)", range(min = 1, max = 1000))]
    pub flush_interval_ms: u64,
    /// How long ending an interaction may wait for its stream to drain.
    #[schemars(title = "End Timeout (ms)", range(min = 10, max = 10000))]
    pub end_timeout_ms: u64,
    /// Method path interactions are published on.
    #[schemars(skip)]
    pub publish_method: String,
}

impl InteractionOptions {
    /// Flush period, never zero.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Stream drain timeout.
    #[must_use]
    pub fn end_timeout(&self) -> Duration {
        Duration::from_millis(self.end_timeout_ms)
    }
}

impl Default for InteractionOptions {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
            end_timeout_ms: 1000,
            publish_method: paths::PUBLISH_INTERACTION.to_owned(),
        }
    }
}
