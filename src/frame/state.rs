//! The client's current frame, rebuilt delta by delta.

use std::fmt;
use std::sync::Arc;

use super::{decode_frame_data, merge_into, merge_update, Frame, FrameChanges};
use crate::error::SessionError;
use crate::protocol::GetFrameResponse;

/// An immutable view of one frame version.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// The merged frame.
    pub frame: Arc<Frame>,
    /// Local version counter, bumped by every applied delta.
    pub version: u64,
    /// Server frame index of the last applied delta.
    pub frame_index: Option<u32>,
}

/// Current frame plus the bookkeeping needed to merge the next delta.
///
/// Deltas must be applied in the order they arrived on the wire. The frame
/// is held in an `Arc` and merged copy-on-write: snapshots handed out
/// earlier keep their version.
pub struct FrameState {
    frame: Arc<Frame>,
    has_frame: bool,
    version: u64,
    frame_index: Option<u32>,
    pending: FrameChanges,
    /// Fields that were populated before the last reset; they count as
    /// changed (cleared) in the first frame after it.
    reset_changes: FrameChanges,
    publishers: Vec<triple_buffer::Input<Option<FrameSnapshot>>>,
}

impl FrameState {
    /// Empty state; the first delta applied is treated as a full frame.
    #[must_use]
    pub fn new() -> Self {
        Self {
            frame: Arc::new(Frame::default()),
            has_frame: false,
            version: 0,
            frame_index: None,
            pending: FrameChanges::none(),
            reset_changes: FrameChanges::none(),
            publishers: Vec::new(),
        }
    }

    /// Current frame.
    #[must_use]
    pub fn frame(&self) -> Arc<Frame> {
        Arc::clone(&self.frame)
    }

    /// Number of deltas applied since creation.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Server frame index of the last applied delta.
    #[must_use]
    pub fn frame_index(&self) -> Option<u32> {
        self.frame_index
    }

    /// Current frame with its version.
    #[must_use]
    pub fn snapshot(&self) -> FrameSnapshot {
        FrameSnapshot {
            frame: self.frame(),
            version: self.version,
            frame_index: self.frame_index,
        }
    }

    /// Forget the frame history. The next delta is treated as a first
    /// frame. Readers keep their last snapshot until then.
    pub fn reset(&mut self) {
        let previous = self.frame.present_fields();
        self.reset_changes.merge_from(&previous);
        self.frame = Arc::new(Frame::default());
        self.has_frame = false;
        self.frame_index = None;
    }

    /// Merge one decoded delta and return the changes it made.
    pub fn apply_delta(
        &mut self,
        frame_index: Option<u32>,
        delta: Frame,
        changes: FrameChanges,
    ) -> FrameChanges {
        let changes = if self.has_frame {
            merge_into(Arc::make_mut(&mut self.frame), delta, &changes);
            changes
        } else {
            let (frame, changes) = merge_update(None, delta, &changes);
            self.frame = Arc::new(frame);
            self.has_frame = true;
            changes.union(&std::mem::take(&mut self.reset_changes))
        };

        self.version += 1;
        if frame_index.is_some() {
            self.frame_index = frame_index;
        }
        self.pending.merge_from(&changes);
        self.publish();
        changes
    }

    /// Decode and merge one wire response.
    ///
    /// A frame index of zero after a non-zero one means the server started
    /// a new frame history; the state is reset before merging. A response
    /// that fails to decode leaves the state untouched.
    pub fn apply_response(
        &mut self,
        response: GetFrameResponse,
    ) -> Result<FrameChanges, SessionError> {
        let (delta, changes) = match response.frame {
            Some(data) => decode_frame_data(data)?,
            None => (Frame::default(), FrameChanges::none()),
        };
        if response.frame_index == 0
            && self.frame_index.is_some_and(|index| index > 0)
        {
            log::debug!("server restarted frame history, resetting");
            self.reset();
        }
        Ok(self.apply_delta(Some(response.frame_index), delta, changes))
    }

    /// Changes accumulated since the last call.
    pub fn take_changes(&mut self) -> FrameChanges {
        std::mem::take(&mut self.pending)
    }

    /// Create a lock-free reader that always sees the latest frame.
    pub fn reader(&mut self) -> FrameReader {
        let (input, output) = triple_buffer::triple_buffer(&Some(self.snapshot()));
        self.publishers.push(input);
        FrameReader { output }
    }

    fn publish(&mut self) {
        if self.publishers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for publisher in &mut self.publishers {
            publisher.write(Some(snapshot.clone()));
        }
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameState")
            .field("version", &self.version)
            .field("frame_index", &self.frame_index)
            .field("readers", &self.publishers.len())
            .finish_non_exhaustive()
    }
}

/// Render-thread handle onto the latest frame of a [`FrameState`].
pub struct FrameReader {
    output: triple_buffer::Output<Option<FrameSnapshot>>,
}

impl FrameReader {
    /// Latest snapshot, whether or not it changed since the last read.
    pub fn latest(&mut self) -> Option<FrameSnapshot> {
        let _ = self.output.update();
        self.output.output_buffer_mut().clone()
    }

    /// The latest snapshot if a new one arrived since the last read.
    pub fn poll(&mut self) -> Option<FrameSnapshot> {
        if self.output.update() {
            self.output.output_buffer_mut().clone()
        } else {
            None
        }
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;
    use crate::frame::{encode_frame, FrameField};
    use crate::protocol::{value_array, FrameData, StringArray, ValueArray};

    fn response(index: u32, frame: &Frame) -> GetFrameResponse {
        GetFrameResponse {
            frame_index: index,
            frame: Some(encode_frame(frame)),
        }
    }

    fn positions(points: &[Vec3]) -> Frame {
        Frame {
            particle_positions: Some(points.to_vec()),
            ..Frame::default()
        }
    }

    #[test]
    fn deltas_apply_in_order_and_bump_version() {
        let mut state = FrameState::new();
        let topology = Frame {
            particle_elements: Some(vec![6, 8]),
            ..positions(&[Vec3::ZERO, Vec3::X])
        };

        let first = state.apply_response(response(0, &topology)).unwrap();
        assert!(first.has_changed(FrameField::ParticleElements));

        let moved = positions(&[Vec3::Y, Vec3::Z]);
        let second = state.apply_response(response(1, &moved)).unwrap();

        assert!(second.has_changed(FrameField::ParticlePositions));
        assert!(!second.has_changed(FrameField::ParticleElements));
        let frame = state.frame();
        assert_eq!(frame.particle_positions, Some(vec![Vec3::Y, Vec3::Z]));
        assert_eq!(frame.particle_elements, Some(vec![6, 8]));
        assert_eq!(state.version(), 2);
        assert_eq!(state.frame_index(), Some(1));
    }

    #[test]
    fn index_zero_after_progress_resets_history() {
        let mut state = FrameState::new();
        let topology = Frame {
            particle_elements: Some(vec![6]),
            ..positions(&[Vec3::ZERO])
        };
        let _ = state.apply_response(response(0, &topology)).unwrap();
        let _ = state.apply_response(response(1, &positions(&[Vec3::X]))).unwrap();

        let changes = state
            .apply_response(response(0, &positions(&[Vec3::Y])))
            .unwrap();

        let frame = state.frame();
        assert_eq!(frame.particle_elements, None);
        assert_eq!(frame.particle_positions, Some(vec![Vec3::Y]));
        assert!(changes.has_changed(FrameField::ParticleElements));
    }

    #[test]
    fn malformed_reset_keeps_previous_frame() {
        let mut state = FrameState::new();
        let _ = state.apply_response(response(0, &positions(&[Vec3::ZERO]))).unwrap();
        let _ = state.apply_response(response(5, &positions(&[Vec3::X]))).unwrap();
        let mut bad = FrameData::default();
        drop(bad.arrays.insert(
            FrameField::ParticlePositions.key().into(),
            ValueArray {
                values: Some(value_array::Values::StringValues(StringArray {
                    values: vec!["oops".into()],
                })),
            },
        ));

        let result = state.apply_response(GetFrameResponse {
            frame_index: 0,
            frame: Some(bad),
        });

        assert!(matches!(result, Err(SessionError::ArgumentInvalid(_))));
        assert_eq!(state.frame().particle_positions, Some(vec![Vec3::X]));
        assert_eq!(state.frame_index(), Some(5));
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn repeated_zero_index_keeps_merging() {
        let mut state = FrameState::new();
        let topology = Frame {
            particle_elements: Some(vec![6]),
            ..positions(&[Vec3::ZERO])
        };
        let _ = state.apply_response(response(0, &topology)).unwrap();
        let _ = state.apply_response(response(0, &positions(&[Vec3::X]))).unwrap();

        assert_eq!(state.frame().particle_elements, Some(vec![6]));
    }

    #[test]
    fn snapshots_are_not_mutated_by_later_merges() {
        let mut state = FrameState::new();
        let _ = state.apply_delta(None, positions(&[Vec3::ZERO]), FrameChanges::none());
        let before = state.frame();

        let changes: FrameChanges =
            [FrameField::ParticlePositions].into_iter().collect();
        let _ = state.apply_delta(None, positions(&[Vec3::ONE]), changes);

        assert_eq!(before.particle_positions, Some(vec![Vec3::ZERO]));
        assert_eq!(state.frame().particle_positions, Some(vec![Vec3::ONE]));
    }

    #[test]
    fn take_changes_accumulates_between_reads() {
        let mut state = FrameState::new();
        let _ = state.apply_delta(None, positions(&[Vec3::ZERO]), FrameChanges::none());
        let bonds = Frame {
            bond_pairs: Some(vec![[0, 0]]),
            ..Frame::default()
        };
        let _ = state.apply_delta(
            None,
            bonds,
            [FrameField::BondPairs].into_iter().collect(),
        );

        let pending = state.take_changes();
        assert!(pending.has_changed(FrameField::ParticlePositions));
        assert!(pending.has_changed(FrameField::BondPairs));
        assert!(!state.take_changes().has_anything_changed());
    }

    #[test]
    fn reader_sees_latest_version() {
        let mut state = FrameState::new();
        let mut reader = state.reader();
        assert_eq!(reader.latest().map(|s| s.version), Some(0));
        assert!(reader.poll().is_none());

        let _ = state.apply_delta(Some(3), positions(&[Vec3::X]), FrameChanges::none());
        let _ = state.apply_delta(
            Some(4),
            positions(&[Vec3::Y]),
            [FrameField::ParticlePositions].into_iter().collect(),
        );

        let snapshot = reader.poll().unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.frame_index, Some(4));
        assert_eq!(snapshot.frame.particle_positions, Some(vec![Vec3::Y]));
    }
}
