//! Conversion between wire `FrameData` and [`Frame`].

use glam::Vec3;
use prost_types::value::Kind;
use prost_types::Value;

use super::{FieldArray, FieldKind, Frame, FrameChanges, FrameField};
use crate::error::SessionError;
use crate::protocol::value_array::Values;
use crate::protocol::{
    json_to_value, number_value, value_to_json, FloatArray, FrameData,
    IndexArray, StringArray, ValueArray,
};

fn mismatch(field: FrameField, got: &str) -> SessionError {
    SessionError::ArgumentInvalid(format!(
        "{field} expects {:?}, got {got}",
        field.kind()
    ))
}

const fn variant_name(values: &Values) -> &'static str {
    match values {
        Values::FloatValues(_) => "float array",
        Values::IndexValues(_) => "index array",
        Values::StringValues(_) => "string array",
    }
}

fn vec3s(field: FrameField, flat: &[f32]) -> Result<Vec<Vec3>, SessionError> {
    if flat.len() % 3 != 0 {
        return Err(SessionError::ArgumentInvalid(format!(
            "{field} length {} is not a multiple of 3",
            flat.len()
        )));
    }
    Ok(flat
        .chunks_exact(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect())
}

fn pairs(field: FrameField, flat: &[u32]) -> Result<Vec<[u32; 2]>, SessionError> {
    if flat.len() % 2 != 0 {
        return Err(SessionError::ArgumentInvalid(format!(
            "{field} length {} is not a multiple of 2",
            flat.len()
        )));
    }
    Ok(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
}

fn box_vectors(flat: &[f32]) -> Result<[Vec3; 3], SessionError> {
    match vec3s(FrameField::BoxVectors, flat)?.as_slice() {
        [a, b, c] => Ok([*a, *b, *c]),
        other => Err(SessionError::ArgumentInvalid(format!(
            "{} needs 3 vectors, got {}",
            FrameField::BoxVectors,
            other.len()
        ))),
    }
}

fn decode_array(
    frame: &mut Frame,
    field: FrameField,
    values: Values,
) -> Result<(), SessionError> {
    use FrameField as F;
    match (field, values) {
        (F::ParticlePositions, Values::FloatValues(a)) => {
            frame.particle_positions = Some(vec3s(field, &a.values)?);
        }
        (F::BondOrders, Values::FloatValues(a)) => {
            frame.bond_orders = Some(a.values);
        }
        (F::BoxVectors, Values::FloatValues(a)) => {
            frame.box_vectors = Some(box_vectors(&a.values)?);
        }
        (F::ParticleElements, Values::IndexValues(a)) => {
            frame.particle_elements = Some(a.values);
        }
        (F::ParticleResidues, Values::IndexValues(a)) => {
            frame.particle_residues = Some(a.values);
        }
        (F::ResidueChains, Values::IndexValues(a)) => {
            frame.residue_chains = Some(a.values);
        }
        (F::BondPairs, Values::IndexValues(a)) => {
            frame.bond_pairs = Some(pairs(field, &a.values)?);
        }
        (F::ParticleTypes, Values::StringValues(a)) => {
            frame.particle_types = Some(a.values);
        }
        (F::ParticleNames, Values::StringValues(a)) => {
            frame.particle_names = Some(a.values);
        }
        (F::ResidueNames, Values::StringValues(a)) => {
            frame.residue_names = Some(a.values);
        }
        (F::ResidueIds, Values::StringValues(a)) => {
            frame.residue_ids = Some(a.values);
        }
        (F::ChainNames, Values::StringValues(a)) => {
            frame.chain_names = Some(a.values);
        }
        (field, other) => return Err(mismatch(field, variant_name(&other))),
    }
    Ok(())
}

fn count(field: FrameField, n: f64) -> Result<u32, SessionError> {
    if n.is_finite() && n >= 0.0 && n <= f64::from(u32::MAX) {
        Ok(n as u32)
    } else {
        Err(SessionError::ArgumentInvalid(format!(
            "{field} must be a non-negative count, got {n}"
        )))
    }
}

fn decode_value(
    frame: &mut Frame,
    field: FrameField,
    value: &Value,
) -> Result<(), SessionError> {
    use FrameField as F;
    let Some(Kind::NumberValue(n)) = value.kind else {
        return Err(mismatch(field, "non-number value"));
    };
    match field {
        F::ParticleCount => frame.particle_count = Some(count(field, n)?),
        F::ResidueCount => frame.residue_count = Some(count(field, n)?),
        F::ChainCount => frame.chain_count = Some(count(field, n)?),
        F::KineticEnergy => frame.kinetic_energy = Some(n),
        F::PotentialEnergy => frame.potential_energy = Some(n),
        F::SimulationTime => frame.simulation_time = Some(n),
        _ => return Err(mismatch(field, "number value")),
    }
    Ok(())
}

/// Decode a wire frame. The returned change set holds every key present
/// in `data`; an array entry with no payload clears the field.
pub fn decode_frame_data(
    data: FrameData,
) -> Result<(Frame, FrameChanges), SessionError> {
    let mut frame = Frame::default();
    let mut changes = FrameChanges::none();

    for (key, array) in data.arrays {
        changes.insert_key(&key);
        let Some(values) = array.values else {
            continue;
        };
        match FrameField::from_key(&key) {
            Some(field) => decode_array(&mut frame, field, values)?,
            None => {
                let raw = match values {
                    Values::FloatValues(a) => FieldArray::Float(a.values),
                    Values::IndexValues(a) => FieldArray::Index(a.values),
                    Values::StringValues(a) => FieldArray::String(a.values),
                };
                drop(frame.extra_arrays.insert(key, raw));
            }
        }
    }

    for (key, value) in data.values {
        changes.insert_key(&key);
        match FrameField::from_key(&key) {
            Some(field) => decode_value(&mut frame, field, &value)?,
            None => {
                drop(frame.extra_values.insert(key, value_to_json(&value)));
            }
        }
    }

    Ok((frame, changes))
}

fn float_array(values: Vec<f32>) -> ValueArray {
    ValueArray {
        values: Some(Values::FloatValues(FloatArray { values })),
    }
}

fn index_array(values: Vec<u32>) -> ValueArray {
    ValueArray {
        values: Some(Values::IndexValues(IndexArray { values })),
    }
}

fn string_array(values: Vec<String>) -> ValueArray {
    ValueArray {
        values: Some(Values::StringValues(StringArray { values })),
    }
}

fn flatten(vectors: &[Vec3]) -> Vec<f32> {
    vectors.iter().flat_map(|v| v.to_array()).collect()
}

/// Encode every populated field of `frame` into wire form.
#[must_use]
pub fn encode_frame(frame: &Frame) -> FrameData {
    use FrameField as F;

    let mut data = FrameData::default();
    let mut array = |field: FrameField, value: Option<ValueArray>| {
        if let Some(value) = value {
            drop(data.arrays.insert(field.key().to_owned(), value));
        }
    };

    array(
        F::ParticlePositions,
        frame.particle_positions.as_deref().map(flatten).map(float_array),
    );
    array(F::BondOrders, frame.bond_orders.clone().map(float_array));
    array(
        F::BoxVectors,
        frame.box_vectors.as_ref().map(|b| float_array(flatten(b))),
    );
    array(F::ParticleElements, frame.particle_elements.clone().map(index_array));
    array(F::ParticleResidues, frame.particle_residues.clone().map(index_array));
    array(F::ResidueChains, frame.residue_chains.clone().map(index_array));
    array(
        F::BondPairs,
        frame
            .bond_pairs
            .as_ref()
            .map(|p| index_array(p.iter().flatten().copied().collect())),
    );
    array(F::ParticleTypes, frame.particle_types.clone().map(string_array));
    array(F::ParticleNames, frame.particle_names.clone().map(string_array));
    array(F::ResidueNames, frame.residue_names.clone().map(string_array));
    array(F::ResidueIds, frame.residue_ids.clone().map(string_array));
    array(F::ChainNames, frame.chain_names.clone().map(string_array));

    let numbers = [
        (F::ParticleCount, frame.particle_count.map(f64::from)),
        (F::ResidueCount, frame.residue_count.map(f64::from)),
        (F::ChainCount, frame.chain_count.map(f64::from)),
        (F::KineticEnergy, frame.kinetic_energy),
        (F::PotentialEnergy, frame.potential_energy),
        (F::SimulationTime, frame.simulation_time),
    ];
    for (field, value) in numbers {
        debug_assert_eq!(field.kind(), FieldKind::Number);
        if let Some(value) = value {
            drop(data.values.insert(field.key().to_owned(), number_value(value)));
        }
    }

    for (key, raw) in &frame.extra_arrays {
        let value = match raw {
            FieldArray::Float(v) => float_array(v.clone()),
            FieldArray::Index(v) => index_array(v.clone()),
            FieldArray::String(v) => string_array(v.clone()),
        };
        drop(data.arrays.insert(key.clone(), value));
    }
    for (key, value) in &frame.extra_values {
        drop(data.values.insert(key.clone(), json_to_value(value)));
    }

    data
}
