//! Session options with TOML preset support.
//!
//! Connection endpoint, frame subscription, interaction publishing and
//! command names live here. Options serialize to/from TOML so a client
//! setup can be stored as a preset file; every section uses
//! `#[serde(default)]` so partial files work.

mod commands;
mod connection;
mod interaction;
mod trajectory;

use std::path::Path;

pub use commands::CommandOptions;
pub use connection::ConnectionOptions;
pub use interaction::InteractionOptions;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
pub use trajectory::TrajectoryOptions;

use crate::error::SessionError;

/// Top-level options container. All sub-structs use `#[serde(default)]` so
/// partial TOML files (e.g. only overriding `[connection]`) work correctly.
#[derive(
    Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema,
)]
#[serde(default)]
pub struct Options {
    /// Server endpoint and channel parameters.
    pub connection: ConnectionOptions,
    /// Frame subscription parameters.
    pub trajectory: TrajectoryOptions,
    /// Interaction publishing parameters.
    pub interaction: InteractionOptions,
    /// Command paths and playback command names.
    pub commands: CommandOptions,
}

impl Options {
    /// Generate JSON Schema describing the user-facing options.
    #[must_use]
    pub fn json_schema() -> schemars::Schema {
        schemars::schema_for!(Options)
    }

    /// Load options from a TOML file. Missing fields use defaults.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path).map_err(SessionError::Io)?;
        toml::from_str(&content)
            .map_err(|e| SessionError::OptionsParse(e.to_string()))
    }

    /// Save options to a TOML file (pretty-printed).
    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SessionError::OptionsParse(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SessionError::Io)?;
        }
        std::fs::write(path, content).map_err(SessionError::Io)
    }

    /// List available preset names (TOML file stems) in a directory.
    #[must_use]
    pub fn list_presets(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "toml") {
                    if let Some(stem) =
                        path.file_stem().and_then(|s| s.to_str())
                    {
                        names.push(stem.to_owned());
                    }
                }
            }
        }
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let opts = Options::default();
        let toml_str = toml::to_string_pretty(&opts).unwrap();
        let parsed: Options = toml::from_str(&toml_str).unwrap();
        assert_eq!(opts, parsed);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let toml_str = r#"
[connection]
host = "sim.example.org"
"#;
        let opts: Options = toml::from_str(toml_str).unwrap();
        assert_eq!(opts.connection.host, "sim.example.org");
        // Everything else should be default
        assert_eq!(opts.connection.port, 38801);
        assert_eq!(opts.interaction.flush_interval_ms, 16);
        assert_eq!(opts.commands.play, "playback/play");
    }

    #[test]
    fn flush_interval_is_never_zero() {
        let interaction = InteractionOptions {
            flush_interval_ms: 0,
            ..InteractionOptions::default()
        };
        assert_eq!(interaction.flush_interval().as_millis(), 1);
    }

    #[test]
    fn save_load_and_list_presets() {
        let dir = std::env::temp_dir()
            .join(format!("molsync-presets-{}", std::process::id()));
        let mut opts = Options::default();
        opts.trajectory.frame_interval = 0.1;
        opts.save(&dir.join("slow.toml")).unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let loaded = Options::load(&dir.join("slow.toml")).unwrap();
        assert_eq!(loaded, opts);
        assert_eq!(Options::list_presets(&dir), ["slow"]);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn bad_toml_is_an_options_error() {
        let dir = std::env::temp_dir()
            .join(format!("molsync-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.toml");
        std::fs::write(&path, "[connection\nport = ").unwrap();

        assert!(matches!(
            Options::load(&path),
            Err(SessionError::OptionsParse(_))
        ));
        assert!(matches!(
            Options::load(&dir.join("missing.toml")),
            Err(SessionError::Io(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn schema_has_expected_properties() {
        let schema_value =
            serde_json::to_value(Options::json_schema()).unwrap();
        let props = schema_value["properties"].as_object().unwrap();

        assert!(props.contains_key("connection"));
        assert!(props.contains_key("trajectory"));
        assert!(props.contains_key("interaction"));
        assert!(props.contains_key("commands"));

        // Method paths are not user-facing
        let interaction = &props["interaction"]["properties"];
        assert!(interaction.get("flush_interval_ms").is_some());
        assert!(interaction.get("publish_method").is_none());
    }
}
