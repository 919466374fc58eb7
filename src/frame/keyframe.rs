//! Keyframes: frames promoted into the sliding window.
//!
//! A keyframe owns its point sequences outright; everything else refers to
//! points through (keyframe, index) handles. The per-target precalc cache
//! is recomputed by the window whenever membership or poses change.

use std::sync::Arc;

use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::{AffLight, FrameId};
use crate::geometry::SE3;
use crate::point::active::ActivePoint;
use crate::point::immature::ImmaturePoint;
use crate::window::precalc::FramePrecalc;

/// Monotonic id assigned when a frame is promoted to a keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyframeId(pub usize);

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// A frame promoted into the optimisation window, with its owned points.
pub struct Keyframe {
    /// Back-link to the frame shell.
    pub frame: FrameId,
    pub keyframe_id: KeyframeId,
    pub pyramid: Arc<FramePyramid>,
    pub exposure: f32,

    /// Window-local pose and photometric estimate; written by the mapper
    /// after optimisation and mirrored into the shell.
    pub cam_to_world: SE3,
    pub aff_g2l: AffLight,

    /// Candidate points still refining their inverse-depth interval.
    pub immature_points: Vec<ImmaturePoint>,
    /// Points participating in the window optimisation.
    pub active_points: Vec<ActivePoint>,
    /// Points folded into the marginalisation prior; kept for output.
    pub marginalized_points: Vec<ActivePoint>,
    /// Points dropped as outliers; kept for statistics.
    pub outlier_points: Vec<ActivePoint>,

    /// One precalc entry per keyframe currently in the window (self
    /// included), refreshed by `SlidingWindow::set_precalc_values`.
    pub target_precalc: Vec<FramePrecalc>,

    pub flagged_for_marginalization: bool,
    /// Energy threshold inherited from the previous newest keyframe.
    pub frame_energy_th: f32,
}

impl Keyframe {
    pub fn new(
        frame: FrameId,
        keyframe_id: KeyframeId,
        pyramid: Arc<FramePyramid>,
        exposure: f32,
        cam_to_world: SE3,
        aff_g2l: AffLight,
    ) -> Self {
        Self {
            frame,
            keyframe_id,
            pyramid,
            exposure,
            cam_to_world,
            aff_g2l,
            immature_points: Vec::new(),
            active_points: Vec::new(),
            marginalized_points: Vec::new(),
            outlier_points: Vec::new(),
            target_precalc: Vec::new(),
            flagged_for_marginalization: false,
            frame_energy_th: 8.0 * 8.0 * crate::point::pattern::PATTERN_COUNT as f32,
        }
    }

    /// Precalc entry for a given target keyframe.
    pub fn precalc_for(&self, target: KeyframeId) -> Option<&FramePrecalc> {
        self.target_precalc.iter().find(|p| p.target == target)
    }
}
