//! Interfaces the embedding application implements for the session layer.

use glam::Vec3;

use crate::frame::Frame;

/// Resolves a point in simulation space to the particle under it.
///
/// Visualisation layers usually answer this from their own spatial index;
/// [`Frame`] implements it by brute force over its positions.
pub trait ParticleLocator {
    /// Index of the particle closest to `point` within `max_distance`.
    fn nearest_particle(&self, point: Vec3, max_distance: f32) -> Option<u32>;

    /// Position of particle `index`, if known.
    fn particle_position(&self, index: u32) -> Option<Vec3>;
}

impl ParticleLocator for Frame {
    fn nearest_particle(&self, point: Vec3, max_distance: f32) -> Option<u32> {
        let positions = self.particle_positions.as_ref()?;
        let limit = max_distance * max_distance;
        positions
            .iter()
            .enumerate()
            .map(|(index, position)| (index, position.distance_squared(point)))
            .filter(|(_, distance)| *distance <= limit)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, _)| index as u32)
    }

    fn particle_position(&self, index: u32) -> Option<Vec3> {
        self.particle_positions
            .as_ref()?
            .get(index as usize)
            .copied()
    }
}

/// Lifecycle callbacks for UI surfaces. Both default to doing nothing.
pub trait ConnectionObserver: Send + Sync {
    /// A session opened a client against `target`.
    fn connected(&self, target: &str) {
        let _ = target;
    }

    /// A session closed its client against `target`.
    fn disconnected(&self, target: &str) {
        let _ = target;
    }
}
