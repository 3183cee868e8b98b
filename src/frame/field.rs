//! Enumerated registry of the frame fields the client understands.

use std::fmt;

/// How a field is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// `arrays` map, float variant.
    FloatArray,
    /// `arrays` map, index variant.
    IndexArray,
    /// `arrays` map, string variant.
    StringArray,
    /// `values` map, number.
    Number,
}

/// A known frame field. Anything else a server sends is kept in the
/// frame's extension maps under its raw key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameField {
    /// Particle positions, three floats per particle.
    ParticlePositions,
    /// Atomic number per particle.
    ParticleElements,
    /// Force-field type per particle.
    ParticleTypes,
    /// Atom name per particle.
    ParticleNames,
    /// Residue index per particle.
    ParticleResidues,
    /// Number of particles.
    ParticleCount,
    /// Bonded particle index pairs.
    BondPairs,
    /// Bond order per bond.
    BondOrders,
    /// Name per residue.
    ResidueNames,
    /// Identifier per residue.
    ResidueIds,
    /// Chain index per residue.
    ResidueChains,
    /// Number of residues.
    ResidueCount,
    /// Name per chain.
    ChainNames,
    /// Number of chains.
    ChainCount,
    /// Kinetic energy of the system.
    KineticEnergy,
    /// Potential energy of the system.
    PotentialEnergy,
    /// Periodic box vectors, nine floats.
    BoxVectors,
    /// Simulation time.
    SimulationTime,
}

impl FrameField {
    /// Every known field, in bit order.
    pub const ALL: [Self; 18] = [
        Self::ParticlePositions,
        Self::ParticleElements,
        Self::ParticleTypes,
        Self::ParticleNames,
        Self::ParticleResidues,
        Self::ParticleCount,
        Self::BondPairs,
        Self::BondOrders,
        Self::ResidueNames,
        Self::ResidueIds,
        Self::ResidueChains,
        Self::ResidueCount,
        Self::ChainNames,
        Self::ChainCount,
        Self::KineticEnergy,
        Self::PotentialEnergy,
        Self::BoxVectors,
        Self::SimulationTime,
    ];

    /// Wire key of this field.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::ParticlePositions => "particle.positions",
            Self::ParticleElements => "particle.elements",
            Self::ParticleTypes => "particle.types",
            Self::ParticleNames => "particle.names",
            Self::ParticleResidues => "particle.residues",
            Self::ParticleCount => "particle.count",
            Self::BondPairs => "bond.pairs",
            Self::BondOrders => "bond.orders",
            Self::ResidueNames => "residue.names",
            Self::ResidueIds => "residue.ids",
            Self::ResidueChains => "residue.chains",
            Self::ResidueCount => "residue.count",
            Self::ChainNames => "chain.names",
            Self::ChainCount => "chain.count",
            Self::KineticEnergy => "energy.kinetic",
            Self::PotentialEnergy => "energy.potential",
            Self::BoxVectors => "system.box.vectors",
            Self::SimulationTime => "system.simulation.time",
        }
    }

    /// Wire representation of this field.
    #[must_use]
    pub const fn kind(self) -> FieldKind {
        match self {
            Self::ParticlePositions
            | Self::BondOrders
            | Self::BoxVectors => FieldKind::FloatArray,
            Self::ParticleElements
            | Self::ParticleResidues
            | Self::BondPairs
            | Self::ResidueChains => FieldKind::IndexArray,
            Self::ParticleTypes
            | Self::ParticleNames
            | Self::ResidueNames
            | Self::ResidueIds
            | Self::ChainNames => FieldKind::StringArray,
            Self::ParticleCount
            | Self::ResidueCount
            | Self::ChainCount
            | Self::KineticEnergy
            | Self::PotentialEnergy
            | Self::SimulationTime => FieldKind::Number,
        }
    }

    /// Look a wire key up in the registry.
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    pub(crate) const fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for FrameField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_resolve() {
        for field in FrameField::ALL {
            assert_eq!(FrameField::from_key(field.key()), Some(field));
        }
        assert_eq!(FrameField::from_key("particle.velocities"), None);
    }

    #[test]
    fn bits_fit_in_mask() {
        let mask = FrameField::ALL
            .into_iter()
            .fold(0u32, |acc, field| acc | field.bit());
        assert_eq!(mask.count_ones() as usize, FrameField::ALL.len());
    }
}
