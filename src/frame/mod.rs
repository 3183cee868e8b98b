//! Versioned molecular frames rebuilt from partial updates.
//!
//! Servers stream deltas that carry only the fields that changed since the
//! previous transmission. [`merge_update`] folds a delta into the previous
//! frame: fields in the change set are replaced, everything else carries
//! forward. [`FrameState`] applies successive deltas in arrival order and
//! versions the result; [`FrameReader`] hands the latest frame to a render
//! thread without locking.
//!
//! Fields are resolved through the explicit [`FrameField`] registry. Keys
//! the registry does not know are preserved in the frame's extension maps.

mod changes;
mod convert;
mod field;
mod merge;
mod state;

use glam::Vec3;
use rustc_hash::FxHashMap;

pub use changes::FrameChanges;
pub use convert::{decode_frame_data, encode_frame};
pub use field::{FieldKind, FrameField};
pub use merge::{merge_into, merge_update};
pub use state::{FrameReader, FrameSnapshot, FrameState};

/// Raw array stored under an unregistered key.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldArray {
    /// Float array.
    Float(Vec<f32>),
    /// Index array.
    Index(Vec<u32>),
    /// String array.
    String(Vec<String>),
}

/// A sparse snapshot of simulation state. `None` means the server has not
/// sent the field (or explicitly cleared it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Particle positions in nanometres.
    pub particle_positions: Option<Vec<Vec3>>,
    /// Atomic number per particle.
    pub particle_elements: Option<Vec<u32>>,
    /// Force-field type per particle.
    pub particle_types: Option<Vec<String>>,
    /// Atom name per particle.
    pub particle_names: Option<Vec<String>>,
    /// Residue index per particle.
    pub particle_residues: Option<Vec<u32>>,
    /// Number of particles.
    pub particle_count: Option<u32>,
    /// Bonded particle index pairs.
    pub bond_pairs: Option<Vec<[u32; 2]>>,
    /// Bond order per bond.
    pub bond_orders: Option<Vec<f32>>,
    /// Name per residue.
    pub residue_names: Option<Vec<String>>,
    /// Identifier per residue.
    pub residue_ids: Option<Vec<String>>,
    /// Chain index per residue.
    pub residue_chains: Option<Vec<u32>>,
    /// Number of residues.
    pub residue_count: Option<u32>,
    /// Name per chain.
    pub chain_names: Option<Vec<String>>,
    /// Number of chains.
    pub chain_count: Option<u32>,
    /// Kinetic energy.
    pub kinetic_energy: Option<f64>,
    /// Potential energy.
    pub potential_energy: Option<f64>,
    /// Periodic box vectors.
    pub box_vectors: Option<[Vec3; 3]>,
    /// Simulation time.
    pub simulation_time: Option<f64>,
    /// Arrays under unregistered keys.
    pub extra_arrays: FxHashMap<String, FieldArray>,
    /// Scalars (or structured values) under unregistered keys.
    pub extra_values: FxHashMap<String, serde_json::Value>,
}

impl Frame {
    /// Empty frame.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `field` currently holds a value.
    #[must_use]
    pub fn has_field(&self, field: FrameField) -> bool {
        match field {
            FrameField::ParticlePositions => self.particle_positions.is_some(),
            FrameField::ParticleElements => self.particle_elements.is_some(),
            FrameField::ParticleTypes => self.particle_types.is_some(),
            FrameField::ParticleNames => self.particle_names.is_some(),
            FrameField::ParticleResidues => self.particle_residues.is_some(),
            FrameField::ParticleCount => self.particle_count.is_some(),
            FrameField::BondPairs => self.bond_pairs.is_some(),
            FrameField::BondOrders => self.bond_orders.is_some(),
            FrameField::ResidueNames => self.residue_names.is_some(),
            FrameField::ResidueIds => self.residue_ids.is_some(),
            FrameField::ResidueChains => self.residue_chains.is_some(),
            FrameField::ResidueCount => self.residue_count.is_some(),
            FrameField::ChainNames => self.chain_names.is_some(),
            FrameField::ChainCount => self.chain_count.is_some(),
            FrameField::KineticEnergy => self.kinetic_energy.is_some(),
            FrameField::PotentialEnergy => self.potential_energy.is_some(),
            FrameField::BoxVectors => self.box_vectors.is_some(),
            FrameField::SimulationTime => self.simulation_time.is_some(),
        }
    }

    /// The set of fields this frame populates.
    #[must_use]
    pub fn present_fields(&self) -> FrameChanges {
        let mut present: FrameChanges = FrameField::ALL
            .into_iter()
            .filter(|field| self.has_field(*field))
            .collect();
        for key in self.extra_arrays.keys().chain(self.extra_values.keys()) {
            present.insert_key(key);
        }
        present
    }

    /// Whether no field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.present_fields().has_anything_changed()
    }

    /// Number of particles, from the explicit count or the positions.
    #[must_use]
    pub fn particle_count(&self) -> usize {
        self.particle_count.map_or_else(
            || self.particle_positions.as_ref().map_or(0, Vec::len),
            |count| count as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_fields_includes_extensions() {
        let mut frame = Frame::new();
        frame.particle_positions = Some(vec![Vec3::ZERO]);
        drop(
            frame
                .extra_values
                .insert("custom.score".into(), serde_json::json!(1.5)),
        );

        let present = frame.present_fields();
        assert!(present.has_changed(FrameField::ParticlePositions));
        assert!(present.has_changed_key("custom.score"));
        assert!(!present.has_changed(FrameField::BondPairs));
    }

    #[test]
    fn particle_count_falls_back_to_positions() {
        let mut frame = Frame::new();
        assert_eq!(frame.particle_count(), 0);
        assert!(frame.is_empty());

        frame.particle_positions = Some(vec![Vec3::ZERO, Vec3::X]);
        assert_eq!(frame.particle_count(), 2);

        frame.particle_count = Some(5);
        assert_eq!(frame.particle_count(), 5);
    }
}
