//! Coarse tracking: hypothesis generation, kernel contract and the
//! keyframe decision.

pub mod coarse;
pub mod hypotheses;
pub mod kernel;
pub mod keyframe_decision;

pub use coarse::{track_new_coarse, CoarseTracker, TrackResult, TrackerKernel};
pub use kernel::PyramidKernel;
pub use keyframe_decision::{KeyframeCues, KeyframeDecision};
