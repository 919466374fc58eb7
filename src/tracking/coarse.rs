//! Coarse tracker adaptor: hypothesis retries around the tracker kernel.
//!
//! Two tracker instances exist system-wide: one serving the tracking
//! thread and one being prepared against the newest keyframe by the
//! mapper; they are swapped under a dedicated mutex once the prepared one
//! is ahead.

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::{AffLight, FrameId, FrameStore};
use crate::frame::KeyframeId;
use crate::geometry::SE3;
use crate::settings::Settings;
use crate::tracking::hypotheses::motion_seeds;
use crate::window::SlidingWindow;

/// Contract to the Gauss-Newton image-alignment inner loop.
///
/// The kernel owns its per-level reference data and exposes the residual
/// and flow side channels of the last `track_newest_coarse` call.
pub trait TrackerKernel: Send {
    /// Refresh intrinsics-derived state.
    fn make_k(&mut self, calib: &Calibration);
    /// Rebuild the reference point cloud from the window, referenced to
    /// the newest keyframe.
    fn set_tracking_ref(&mut self, window: &SlidingWindow);
    /// Align `frame` against the reference, refining `ref_to_frame` and
    /// `aff` in place from `start_level` down. `achieved_floor` is the
    /// per-level rejection floor: a level whose initial residual is far
    /// above it aborts the attempt.
    fn track_newest_coarse(
        &mut self,
        frame: &FramePyramid,
        exposure: f32,
        ref_to_frame: &mut SE3,
        aff: &mut AffLight,
        start_level: usize,
        achieved_floor: &[f64; 5],
    ) -> bool;
    /// Per-level RMSE of the last call, NaN for untouched levels.
    fn last_residuals(&self) -> [f64; 5];
    /// Flow indicators of the last call: translation-only, rotation-only,
    /// full warp.
    fn last_flow_indicators(&self) -> [f64; 3];
}

/// One tracker instance: a kernel plus its reference bookkeeping.
pub struct CoarseTracker {
    pub kernel: Box<dyn TrackerKernel>,
    /// Frame id of the reference keyframe; `None` until a reference is
    /// set.
    pub ref_frame: Option<FrameId>,
    pub ref_keyframe: Option<KeyframeId>,
    pub ref_aff: AffLight,
    pub ref_exposure: f32,
    /// RMSE of the first tracked frame against this reference; negative
    /// until set.
    pub first_coarse_rmse: f64,
}

impl CoarseTracker {
    pub fn new(kernel: Box<dyn TrackerKernel>) -> Self {
        Self {
            kernel,
            ref_frame: None,
            ref_keyframe: None,
            ref_aff: AffLight::zero(),
            ref_exposure: 1.0,
            first_coarse_rmse: -1.0,
        }
    }

    pub fn make_k(&mut self, calib: &Calibration) {
        self.kernel.make_k(calib);
    }

    /// Point the tracker at the newest window keyframe.
    pub fn set_ref(&mut self, window: &SlidingWindow) {
        self.kernel.set_tracking_ref(window);
        if let Some(newest) = window.newest() {
            self.ref_frame = Some(newest.frame);
            self.ref_keyframe = Some(newest.keyframe_id);
            self.ref_aff = newest.aff_g2l;
            self.ref_exposure = newest.exposure;
            self.first_coarse_rmse = -1.0;
        }
    }

}

/// Outcome of coarse-tracking one frame.
#[derive(Debug, Clone)]
pub struct TrackResult {
    /// Level-0 residual RMSE; NaN when every hypothesis failed.
    pub rmse: f64,
    /// Flow indicators (translation, rotation, combined).
    pub flow: [f64; 3],
    /// Whether the kernel itself reported a good alignment.
    pub tracking_good: bool,
}

/// Track a new frame against the serving tracker's reference, retrying
/// over motion hypotheses until one beats the residual floor.
///
/// The frame's shell receives the committed pose, affine state and
/// tracking verdict. Irrecoverable divergence (non-finite pose or an
/// exploded translation) is a hard error.
#[allow(clippy::too_many_arguments)]
pub fn track_new_coarse(
    tracker: &mut CoarseTracker,
    frames: &mut FrameStore,
    frame_id: FrameId,
    pyramid: &FramePyramid,
    hint: Option<&SE3>,
    last_coarse_rmse: &mut [f64; 5],
    calib: &Calibration,
    settings: &Settings,
) -> Result<TrackResult> {
    let last_f = tracker
        .ref_frame
        .expect("coarse tracker has a reference keyframe");
    let exposure = frames.get(frame_id).exposure;

    let mut aff_last = AffLight::zero();
    let seeds: Vec<SE3> = if let Some(hint) = hint {
        // Affine seed from the most recent well-tracked frame sharing the
        // current reference.
        for i in (0..frames.len().saturating_sub(1)).rev() {
            let shell = frames.get(FrameId(i));
            if shell.tracking_was_good {
                aff_last = shell.aff_g2l;
                break;
            }
            if shell.tracking_ref != Some(last_f) {
                warn!("no well-tracked frame with the current reference; using the reference's affine state");
                aff_last = tracker.ref_aff;
                break;
            }
        }
        vec![hint.clone()]
    } else {
        if frames.len() >= 3 {
            aff_last = frames.get(FrameId(frames.len() - 2)).aff_g2l;
        }
        motion_seeds(frames, last_f)
    };

    let start_level = calib.levels() - 1;
    let mut achieved = [f64::NAN; 5];
    let mut have_one_good = false;
    let mut tracking_good = false;

    let mut best_pose = seeds[0].clone();
    let mut best_aff = aff_last;
    let mut best_flow = [100.0f64; 3];

    for (i, seed) in seeds.iter().enumerate() {
        let mut pose_this = seed.clone();
        let mut aff_this = aff_last;
        let mut good = tracker.kernel.track_newest_coarse(
            pyramid,
            exposure,
            &mut pose_this,
            &mut aff_this,
            start_level,
            &achieved,
        );
        if good {
            tracking_good = true;
        }
        if !good && settings.use_imu {
            // With inertial support a visually weak frame is still usable.
            warn!("coarse tracker reports bad alignment; continuing on inertial support");
            good = true;
        }

        let res = tracker.kernel.last_residuals();
        if i != 0 {
            debug!(
                attempt = i,
                res0 = res[0],
                achieved0 = achieved[0],
                "re-track attempt"
            );
        }

        // A new winner must strictly improve the level-0 residual.
        if good && res[0].is_finite() && !(res[0] >= achieved[0]) {
            best_flow = tracker.kernel.last_flow_indicators();
            best_aff = aff_this;
            best_pose = pose_this;
            have_one_good = true;
        }

        if have_one_good {
            for (a, r) in achieved.iter_mut().zip(res.iter()) {
                if !a.is_finite() || *a > *r {
                    *a = *r;
                }
            }
        }

        if have_one_good && achieved[0] < last_coarse_rmse[0] * settings.re_track_threshold {
            break;
        }
    }

    if !have_one_good {
        warn!("tracking failed entirely; taking the predicted pose and hoping to recover");
        best_flow = [0.0; 3];
        best_aff = aff_last;
        best_pose = seeds[0].clone();
        if best_pose.translation.norm() > 1e5 || !best_pose.is_finite() {
            bail!("tracking diverged irrecoverably");
        }
    }

    *last_coarse_rmse = achieved;

    // Commit to the shell. The frame is not visible to the mapper yet, so
    // no further locking is needed beyond the store lock we hold.
    let ref_cam_to_world = frames.get(last_f).cam_to_world.clone();
    let shell = frames.get_mut(frame_id);
    shell.cam_to_tracking_ref = best_pose.inverse();
    shell.tracking_ref = Some(last_f);
    shell.aff_g2l = best_aff;
    shell.cam_to_world = &ref_cam_to_world * &shell.cam_to_tracking_ref;
    shell.tracking_was_good = tracking_good;

    if tracker.first_coarse_rmse < 0.0 {
        tracker.first_coarse_rmse = achieved[0];
    }

    debug!(
        a = best_aff.a,
        b = best_aff.b,
        rmse = achieved[0],
        "coarse tracking finished"
    );

    Ok(TrackResult {
        rmse: achieved[0],
        flow: best_flow,
        tracking_good,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted kernel: returns a fixed residual per call index.
    struct ScriptedKernel {
        calls: Arc<AtomicUsize>,
        residuals: Vec<f64>,
        good: bool,
    }

    impl TrackerKernel for ScriptedKernel {
        fn make_k(&mut self, _calib: &Calibration) {}
        fn set_tracking_ref(&mut self, _window: &SlidingWindow) {}
        fn track_newest_coarse(
            &mut self,
            _frame: &FramePyramid,
            _exposure: f32,
            _ref_to_frame: &mut SE3,
            _aff: &mut AffLight,
            _start_level: usize,
            _achieved_floor: &[f64; 5],
        ) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.good
        }
        fn last_residuals(&self) -> [f64; 5] {
            let i = self.calls.load(Ordering::SeqCst).saturating_sub(1);
            let r = *self
                .residuals
                .get(i)
                .or(self.residuals.last())
                .unwrap_or(&f64::NAN);
            [r; 5]
        }
        fn last_flow_indicators(&self) -> [f64; 3] {
            [1.0, 0.0, 1.0]
        }
    }

    fn setup(
        residuals: Vec<f64>,
        good: bool,
    ) -> (CoarseTracker, FrameStore, FramePyramid, Calibration, Arc<AtomicUsize>) {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let calls = Arc::new(AtomicUsize::new(0));
        let kernel = ScriptedKernel {
            calls: calls.clone(),
            residuals,
            good,
        };
        let mut tracker = CoarseTracker::new(Box::new(kernel));
        let mut frames = FrameStore::new();
        for i in 0..4 {
            frames.push(i, 0.1 * i as f64, 1.0);
        }
        frames.get_mut(FrameId(0)).tracking_was_good = true;
        tracker.ref_frame = Some(FrameId(0));
        tracker.ref_keyframe = Some(KeyframeId(0));
        let pyr = FramePyramid::build(&vec![0.0f32; 64 * 48], &calib);
        (tracker, frames, pyr, calib, calls)
    }

    #[test]
    fn imu_hint_tries_exactly_one_seed() {
        let (mut tracker, mut frames, pyr, calib, calls) = setup(vec![1.0], true);
        let mut last_rmse = [10.0f64; 5];
        let hint = SE3::identity();
        let result = track_new_coarse(
            &mut tracker,
            &mut frames,
            FrameId(3),
            &pyr,
            Some(&hint),
            &mut last_rmse,
            &calib,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.tracking_good);
        assert!((result.rmse - 1.0).abs() < 1e-12);
    }

    #[test]
    fn early_exit_once_below_re_track_threshold() {
        // First seed already beats last_rmse * threshold → one call.
        let (mut tracker, mut frames, pyr, calib, calls) = setup(vec![1.0], true);
        let mut last_rmse = [10.0f64; 5];
        track_new_coarse(
            &mut tracker,
            &mut frames,
            FrameId(3),
            &pyr,
            None,
            &mut last_rmse,
            &calib,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(last_rmse[0], 1.0);
    }

    #[test]
    fn all_seeds_tried_when_residual_stays_high() {
        // Residual never beats the floor → every seed is attempted.
        let (mut tracker, mut frames, pyr, calib, calls) = setup(vec![100.0], true);
        let mut last_rmse = [1.0f64; 5];
        let result = track_new_coarse(
            &mut tracker,
            &mut frames,
            FrameId(3),
            &pyr,
            None,
            &mut last_rmse,
            &calib,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 31);
        assert!(result.tracking_good);
    }

    #[test]
    fn total_failure_keeps_predicted_pose_and_reports_nan() {
        let (mut tracker, mut frames, pyr, calib, _) = setup(vec![f64::NAN], false);
        let mut last_rmse = [10.0f64; 5];
        let result = track_new_coarse(
            &mut tracker,
            &mut frames,
            FrameId(3),
            &pyr,
            None,
            &mut last_rmse,
            &calib,
            &Settings::default(),
        )
        .unwrap();
        assert!(!result.tracking_good);
        assert!(result.rmse.is_nan());
        assert!(!frames.get(FrameId(3)).tracking_was_good);
    }

    #[test]
    fn first_coarse_rmse_is_recorded_once() {
        let (mut tracker, mut frames, pyr, calib, _) = setup(vec![2.0], true);
        let mut last_rmse = [10.0f64; 5];
        track_new_coarse(
            &mut tracker,
            &mut frames,
            FrameId(3),
            &pyr,
            None,
            &mut last_rmse,
            &calib,
            &Settings::default(),
        )
        .unwrap();
        assert!((tracker.first_coarse_rmse - 2.0).abs() < 1e-12);
    }
}
