//! Tracking ↔ mapping thread handoff.
//!
//! A FIFO of tracked frames guarded by one mutex and two condition
//! variables: the tracker signals `tracked_cv` after enqueuing, the
//! mapper signals `mapped_cv` after each mapped frame so the tracker can
//! wait for a valid coarse-tracking reference.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::FrameId;

/// A frame handed from the tracking to the mapping thread.
pub struct TrackedFrame {
    pub frame: FrameId,
    pub pyramid: Arc<FramePyramid>,
    pub need_kf: bool,
}

/// Queue depth beyond which the mapper enters catch-up mode.
pub const CATCH_UP_QUEUE_DEPTH: usize = 3;

pub struct QueueState {
    pub unmapped: VecDeque<TrackedFrame>,
    pub run_mapping: bool,
    /// Keyframe trigger watermark: in inertial mode the prepared frame
    /// id, otherwise the tracking-reference frame id of the flagged
    /// frame.
    pub need_new_kf_after: i64,
    pub catch_up: bool,
}

/// The shared handoff point between the two pipeline threads.
pub struct Pipeline {
    pub state: Mutex<QueueState>,
    pub tracked_cv: Condvar,
    pub mapped_cv: Condvar,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                unmapped: VecDeque::new(),
                run_mapping: true,
                need_new_kf_after: -1,
                catch_up: false,
            }),
            tracked_cv: Condvar::new(),
            mapped_cv: Condvar::new(),
        }
    }

    /// Ask the mapping thread to exit and wake it.
    pub fn request_stop(&self) {
        let mut state = self.state.lock();
        state.run_mapping = false;
        self.tracked_cv.notify_all();
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// What the mapper should do with the frame it just popped, given the
/// queue state at pop time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAction {
    /// Map as a keyframe.
    KeyFrame,
    /// Map as a non-keyframe (trace only).
    NonKeyFrame,
    /// Map as non-keyframe, then drain one more frame without mapping.
    NonKeyFrameAndDrain,
}

/// Catch-up policy: frames behind in the queue are demoted, and once the
/// backlog clears the keyframe watermark decides.
pub fn decide_map_action(
    keyframes_so_far: usize,
    queue_len_after_pop: usize,
    catch_up: bool,
    frame_creates_kf: bool,
    real_time_max_kf: bool,
) -> MapAction {
    // The first two tracked frames always become keyframes.
    if keyframes_so_far <= 2 {
        return MapAction::KeyFrame;
    }

    if queue_len_after_pop > 0 {
        if catch_up {
            return MapAction::NonKeyFrameAndDrain;
        }
        return MapAction::NonKeyFrame;
    }

    if real_time_max_kf || frame_creates_kf {
        MapAction::KeyFrame
    } else {
        MapAction::NonKeyFrame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_two_frames_are_keyframes_regardless() {
        assert_eq!(
            decide_map_action(1, 5, true, false, false),
            MapAction::KeyFrame
        );
        assert_eq!(
            decide_map_action(2, 0, false, false, false),
            MapAction::KeyFrame
        );
    }

    #[test]
    fn backlog_demotes_to_non_keyframe() {
        assert_eq!(
            decide_map_action(5, 2, false, true, false),
            MapAction::NonKeyFrame
        );
    }

    #[test]
    fn catch_up_drains_an_extra_frame() {
        assert_eq!(
            decide_map_action(5, 2, true, true, false),
            MapAction::NonKeyFrameAndDrain
        );
    }

    #[test]
    fn empty_queue_respects_the_kf_flag() {
        assert_eq!(
            decide_map_action(5, 0, false, true, false),
            MapAction::KeyFrame
        );
        assert_eq!(
            decide_map_action(5, 0, false, false, false),
            MapAction::NonKeyFrame
        );
    }

    #[test]
    fn real_time_mode_forces_keyframes() {
        assert_eq!(
            decide_map_action(5, 0, false, false, true),
            MapAction::KeyFrame
        );
    }

    #[test]
    fn stop_request_clears_run_flag() {
        let pipeline = Pipeline::new();
        assert!(pipeline.state.lock().run_mapping);
        pipeline.request_stop();
        assert!(!pipeline.state.lock().run_mapping);
    }
}
