//! Folding partial frame updates into the previous frame.

use super::{Frame, FrameChanges, FrameField};

fn replace<T>(
    changes: &FrameChanges,
    field: FrameField,
    target: &mut Option<T>,
    value: Option<T>,
) {
    if changes.has_changed(field) {
        *target = value;
    }
}

/// Apply `delta` to `target` in place: every field marked in `changes` is
/// replaced with the delta's value (possibly clearing it), every other
/// field is left untouched.
pub fn merge_into(target: &mut Frame, delta: Frame, changes: &FrameChanges) {
    use FrameField as F;

    // Exhaustive destructuring: a new field must be merged here too.
    let Frame {
        particle_positions,
        particle_elements,
        particle_types,
        particle_names,
        particle_residues,
        particle_count,
        bond_pairs,
        bond_orders,
        residue_names,
        residue_ids,
        residue_chains,
        residue_count,
        chain_names,
        chain_count,
        kinetic_energy,
        potential_energy,
        box_vectors,
        simulation_time,
        mut extra_arrays,
        mut extra_values,
    } = delta;

    let c = changes;
    replace(c, F::ParticlePositions, &mut target.particle_positions, particle_positions);
    replace(c, F::ParticleElements, &mut target.particle_elements, particle_elements);
    replace(c, F::ParticleTypes, &mut target.particle_types, particle_types);
    replace(c, F::ParticleNames, &mut target.particle_names, particle_names);
    replace(c, F::ParticleResidues, &mut target.particle_residues, particle_residues);
    replace(c, F::ParticleCount, &mut target.particle_count, particle_count);
    replace(c, F::BondPairs, &mut target.bond_pairs, bond_pairs);
    replace(c, F::BondOrders, &mut target.bond_orders, bond_orders);
    replace(c, F::ResidueNames, &mut target.residue_names, residue_names);
    replace(c, F::ResidueIds, &mut target.residue_ids, residue_ids);
    replace(c, F::ResidueChains, &mut target.residue_chains, residue_chains);
    replace(c, F::ResidueCount, &mut target.residue_count, residue_count);
    replace(c, F::ChainNames, &mut target.chain_names, chain_names);
    replace(c, F::ChainCount, &mut target.chain_count, chain_count);
    replace(c, F::KineticEnergy, &mut target.kinetic_energy, kinetic_energy);
    replace(c, F::PotentialEnergy, &mut target.potential_energy, potential_energy);
    replace(c, F::BoxVectors, &mut target.box_vectors, box_vectors);
    replace(c, F::SimulationTime, &mut target.simulation_time, simulation_time);

    for key in changes.extra_keys() {
        let array = extra_arrays.remove(key);
        let value = extra_values.remove(key);
        drop(target.extra_arrays.remove(key));
        drop(target.extra_values.remove(key));
        if let Some(array) = array {
            drop(target.extra_arrays.insert(key.to_owned(), array));
        }
        if let Some(value) = value {
            drop(target.extra_values.insert(key.to_owned(), value));
        }
    }
}

/// Merge `delta` against `previous`, producing the next frame and the
/// change set that describes it.
///
/// With no previous frame every field present in the delta counts as
/// changed and absent fields stay unset.
#[must_use]
pub fn merge_update(
    previous: Option<&Frame>,
    delta: Frame,
    changes: &FrameChanges,
) -> (Frame, FrameChanges) {
    let Some(previous) = previous else {
        let changes = delta.present_fields().union(changes);
        return (delta, changes);
    };
    let mut next = previous.clone();
    merge_into(&mut next, delta, changes);
    (next, changes.clone())
}
