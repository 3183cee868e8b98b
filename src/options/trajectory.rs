use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::protocol::paths;

/// Frame subscription parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[schemars(title = "Trajectory", inline)]
#[serde(default)]
pub struct TrajectoryOptions {
    /// Minimum seconds between frames requested from the server.
    #[schemars(title = "Frame Interval (s)", range(min = 0.0, max = 1.0), extend("step" = 0.005))]
    pub frame_interval: f32,
    /// Method path of the frame subscription.
    #[schemars(skip)]
    pub subscribe_method: String,
}

impl Default for TrajectoryOptions {
    fn default() -> Self {
        Self {
            frame_interval: 1.0 / 30.0,
            subscribe_method: paths::SUBSCRIBE_LATEST_FRAMES.to_owned(),
        }
    }
}
