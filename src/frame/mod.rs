//! Frame store: per-frame metadata, pixel pyramids and keyframe records.

pub mod keyframe;
pub mod pyramid;
pub mod shell;

pub use keyframe::{Keyframe, KeyframeId};
pub use pyramid::FramePyramid;
pub use shell::{AffLight, FrameId, FrameShell, FrameStore};
