//! Wire messages exchanged with the simulation server.
//!
//! Field tags follow the trajectory, command and IMD services of the
//! server protocol, so these messages interoperate with servers built from
//! the same `.proto` definitions. Frames carry two maps: `arrays` for
//! per-particle / per-bond data and `values` for scalars. The keys present
//! in a delta are exactly the fields that changed.

// prost messages hold f32 and map fields, so they cannot derive Eq.
#![allow(clippy::derive_partial_eq_without_eq)]

use std::collections::HashMap;

use prost_types::value::Kind;
use prost_types::{ListValue, Struct, Value};

/// Default method paths of the server services.
pub mod paths {
    /// Server-streaming subscription delivering the latest frame deltas.
    pub const SUBSCRIBE_LATEST_FRAMES: &str =
        "/nanover.trajectory.TrajectoryService/SubscribeLatestFrames";
    /// Unary named command.
    pub const RUN_COMMAND: &str = "/nanover.command.Command/RunCommand";
    /// Unary listing of the commands a server accepts.
    pub const GET_COMMANDS: &str = "/nanover.command.Command/GetCommands";
    /// Client-streaming publication of one interaction.
    pub const PUBLISH_INTERACTION: &str =
        "/nanover.imd.InteractiveMolecularDynamics/PublishInteraction";
}

/// Array of 32-bit floats.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FloatArray {
    /// Packed values.
    #[prost(float, repeated, tag = "1")]
    pub values: Vec<f32>,
}

/// Array of unsigned indices.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IndexArray {
    /// Packed values.
    #[prost(uint32, repeated, tag = "1")]
    pub values: Vec<u32>,
}

/// Array of strings.
#[derive(Clone, PartialEq, prost::Message)]
pub struct StringArray {
    /// Values in order.
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

/// One typed array field of a frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ValueArray {
    /// The populated array variant.
    #[prost(oneof = "value_array::Values", tags = "1, 2, 3")]
    pub values: Option<value_array::Values>,
}

/// Variants of [`ValueArray`].
pub mod value_array {
    /// The populated array variant.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Values {
        /// Float data such as positions.
        #[prost(message, tag = "1")]
        FloatValues(super::FloatArray),
        /// Index data such as elements or bond pairs.
        #[prost(message, tag = "2")]
        IndexValues(super::IndexArray),
        /// String data such as names.
        #[prost(message, tag = "3")]
        StringValues(super::StringArray),
    }
}

/// A full or partial frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameData {
    /// Scalar fields.
    #[prost(map = "string, message", tag = "1")]
    pub values: HashMap<String, Value>,
    /// Array fields.
    #[prost(map = "string, message", tag = "2")]
    pub arrays: HashMap<String, ValueArray>,
}

/// Frame subscription request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFrameRequest {
    /// Free-form subscription parameters.
    #[prost(message, optional, tag = "1")]
    pub data: Option<Struct>,
    /// Minimum interval between frames, in seconds.
    #[prost(float, tag = "2")]
    pub frame_interval: f32,
}

/// One frame delta from the server.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetFrameResponse {
    /// Server frame counter. Zero marks a reset of the frame history.
    #[prost(uint32, tag = "1")]
    pub frame_index: u32,
    /// Fields that changed since the previous response.
    #[prost(message, optional, tag = "2")]
    pub frame: Option<FrameData>,
}

/// A named command with arguments.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandMessage {
    /// Command name, e.g. `playback/play`.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Command arguments.
    #[prost(message, optional, tag = "2")]
    pub arguments: Option<Struct>,
}

/// Reply to a [`CommandMessage`].
#[derive(Clone, PartialEq, prost::Message)]
pub struct CommandReply {
    /// Command result.
    #[prost(message, optional, tag = "1")]
    pub result: Option<Struct>,
}

/// Request for the commands a server accepts.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetCommandsRequest {}

/// Commands a server accepts, with their default arguments.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GetCommandsReply {
    /// Available commands.
    #[prost(message, repeated, tag = "1")]
    pub commands: Vec<CommandMessage>,
}

/// One update of a user-applied interaction.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ParticleInteraction {
    /// Client that owns the interaction.
    #[prost(string, tag = "1")]
    pub player_id: String,
    /// Client-chosen interaction key.
    #[prost(string, tag = "2")]
    pub interaction_id: String,
    /// Interaction origin, `[x, y, z]`.
    #[prost(float, repeated, tag = "3")]
    pub position: Vec<f32>,
    /// Target particle indices.
    #[prost(uint32, repeated, tag = "4")]
    pub particles: Vec<u32>,
    /// Force scale, kind and flags.
    #[prost(message, optional, tag = "5")]
    pub properties: Option<Struct>,
}

/// Reply sent when an interaction stream ends.
#[derive(Clone, PartialEq, prost::Message)]
pub struct InteractionEndReply {}

/// Number value.
#[must_use]
pub fn number_value(value: f64) -> Value {
    Value {
        kind: Some(Kind::NumberValue(value)),
    }
}

/// Bool value.
#[must_use]
pub fn bool_value(value: bool) -> Value {
    Value {
        kind: Some(Kind::BoolValue(value)),
    }
}

/// String value.
#[must_use]
pub fn string_value(value: impl Into<String>) -> Value {
    Value {
        kind: Some(Kind::StringValue(value.into())),
    }
}

/// Build a struct from key/value pairs.
#[must_use]
pub fn struct_from_pairs<'a>(
    pairs: impl IntoIterator<Item = (&'a str, Value)>,
) -> Struct {
    Struct {
        fields: pairs
            .into_iter()
            .map(|(key, value)| (key.to_owned(), value))
            .collect(),
    }
}

/// Convert a protobuf value into JSON.
#[must_use]
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match &value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s.clone()),
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(*b),
        Some(Kind::StructValue(s)) => struct_to_json(s),
        Some(Kind::ListValue(list)) => serde_json::Value::Array(
            list.values.iter().map(value_to_json).collect(),
        ),
    }
}

/// Convert a protobuf struct into a JSON object.
#[must_use]
pub fn struct_to_json(value: &Struct) -> serde_json::Value {
    serde_json::Value::Object(
        value
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}

/// Convert JSON into a protobuf value.
#[must_use]
pub fn json_to_value(value: &serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => {
            Kind::NumberValue(n.as_f64().unwrap_or(0.0))
        }
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        }),
    };
    Value { kind: Some(kind) }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn json_values_convert_both_ways() {
        let json = serde_json::json!({
            "scale": 2.5,
            "type": "spring",
            "flags": [true, false],
            "nested": { "n": null },
        });
        let value = json_to_value(&json);
        assert_eq!(value_to_json(&value), json);
    }

    #[test]
    fn frame_response_keeps_only_present_keys() {
        let mut frame = FrameData::default();
        drop(frame.arrays.insert(
            "particle.positions".into(),
            ValueArray {
                values: Some(value_array::Values::FloatValues(FloatArray {
                    values: vec![0.0, 1.0, 2.0],
                })),
            },
        ));
        let response = GetFrameResponse {
            frame_index: 4,
            frame: Some(frame),
        };

        let decoded =
            GetFrameResponse::decode(response.encode_to_vec().as_slice())
                .unwrap();
        let frame = decoded.frame.unwrap();
        assert_eq!(decoded.frame_index, 4);
        assert!(frame.values.is_empty());
        assert_eq!(frame.arrays.len(), 1);
    }
}
