//! User-applied forces and their wire form.

use glam::Vec3;
use prost_types::Value;
use rustc_hash::FxHashMap;

use crate::host::ParticleLocator;
use crate::protocol::{
    bool_value, json_to_value, number_value, string_value, ParticleInteraction,
};
use crate::stream::OutboundMessage;

/// Shape of the force an interaction applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionKind {
    /// Gaussian well centred on the interaction position.
    #[default]
    Gaussian,
    /// Harmonic spring towards the interaction position.
    Spring,
}

impl InteractionKind {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gaussian => "gaussian",
            Self::Spring => "spring",
        }
    }
}

/// A force applied to a set of particles towards a point.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    /// Point the particles are pulled towards.
    pub position: Vec3,
    /// Target particle indices.
    pub particles: Vec<u32>,
    /// Force multiplier.
    pub scale: f32,
    /// Force shape.
    pub kind: InteractionKind,
    /// Scale the force by particle mass.
    pub mass_weighted: bool,
    /// Reset particle velocities when the interaction ends.
    pub reset_velocities: bool,
    /// Upper bound on the applied force.
    pub max_force: Option<f32>,
    /// Additional server-specific properties.
    pub properties: FxHashMap<String, serde_json::Value>,
}

impl Default for Interaction {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            particles: Vec::new(),
            scale: 1.0,
            kind: InteractionKind::Gaussian,
            mass_weighted: true,
            reset_velocities: false,
            max_force: None,
            properties: FxHashMap::default(),
        }
    }
}

impl Interaction {
    /// Default gaussian interaction on `particles`.
    #[must_use]
    pub fn new(position: Vec3, particles: Vec<u32>) -> Self {
        Self {
            position,
            particles,
            ..Self::default()
        }
    }

    /// Grab the particle nearest to `point`, if one lies within
    /// `max_distance`.
    #[must_use]
    pub fn grab(
        locator: &impl ParticleLocator,
        point: Vec3,
        max_distance: f32,
    ) -> Option<Self> {
        locator
            .nearest_particle(point, max_distance)
            .map(|index| Self::new(point, vec![index]))
    }

    /// Wire message for this interaction under `key`, owned by
    /// `player_id`.
    #[must_use]
    pub fn to_wire(&self, key: &str, player_id: &str) -> ParticleInteraction {
        let mut fields: std::collections::BTreeMap<String, Value> = self
            .properties
            .iter()
            .map(|(name, value)| (name.clone(), json_to_value(value)))
            .collect();
        let mut set = |name: &str, value: Value| {
            drop(fields.insert(name.to_owned(), value));
        };
        set("type", string_value(self.kind.as_str()));
        set("scale", number_value(f64::from(self.scale)));
        set("mass_weighted", bool_value(self.mass_weighted));
        set("reset_velocities", bool_value(self.reset_velocities));
        if let Some(max_force) = self.max_force {
            set("max_force", number_value(f64::from(max_force)));
        }

        ParticleInteraction {
            player_id: player_id.to_owned(),
            interaction_id: key.to_owned(),
            position: self.position.to_array().to_vec(),
            particles: self.particles.clone(),
            properties: Some(prost_types::Struct { fields }),
        }
    }
}

impl OutboundMessage for ParticleInteraction {
    fn validate(&self) -> Result<(), String> {
        if self.interaction_id.is_empty() {
            return Err("interaction id is empty".into());
        }
        if self.position.len() != 3
            || !self.position.iter().all(|c| c.is_finite())
        {
            return Err(format!(
                "interaction position must be 3 finite components, got {:?}",
                self.position
            ));
        }
        if self.particles.is_empty() {
            return Err("interaction targets no particles".into());
        }
        Ok(())
    }
}
