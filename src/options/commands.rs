use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::protocol::paths;

/// Command service paths and the names of the playback commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[schemars(title = "Commands", inline)]
#[serde(default)]
pub struct CommandOptions {
    /// Method path that runs one command.
    #[schemars(skip)]
    pub run_method: String,
    /// Method path that lists available commands.
    #[schemars(skip)]
    pub list_method: String,
    /// Resume playback.
    #[schemars(title = "Play")]
    pub play: String,
    /// Pause playback.
    #[schemars(title = "Pause")]
    pub pause: String,
    /// Reset the simulation.
    #[schemars(title = "Reset")]
    pub reset: String,
    /// Advance a single step.
    #[schemars(title = "Step")]
    pub step: String,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            run_method: paths::RUN_COMMAND.to_owned(),
            list_method: paths::GET_COMMANDS.to_owned(),
            play: "playback/play".to_owned(),
            pause: "playback/pause".to_owned(),
            reset: "playback/reset".to_owned(),
            step: "playback/step".to_owned(),
        }
    }
}
