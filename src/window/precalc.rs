//! Per-pair precomputed projection and photometric transforms.
//!
//! The cache is refreshed whenever window membership or poses change and
//! is the only source the projection hot paths read from.

use nalgebra::{Matrix3, Vector3};

use crate::calib::Calibration;
use crate::frame::keyframe::{Keyframe, KeyframeId};
use crate::frame::shell::AffLight;

/// Cached host→target transforms for one ordered keyframe pair.
#[derive(Debug, Clone)]
pub struct FramePrecalc {
    pub target: KeyframeId,
    /// Generation stamp of the refresh that produced this entry.
    pub generation: u64,

    /// Rotation host→target (camera frame).
    pub pre_rt: Matrix3<f32>,
    /// Translation host→target (camera frame).
    pub pre_t: Vector3<f32>,
    /// `K · R · K⁻¹` at level 0.
    pub pre_krki: Matrix3<f32>,
    /// `K · t` at level 0.
    pub pre_kt: Vector3<f32>,
    /// Photometric transfer host→target (exposure folded in).
    pub pre_aff: (f32, f32),
    /// Metric distance between the two camera centers.
    pub distance: f32,
}

impl FramePrecalc {
    /// Compute the entry for `host` → `target` from their current window
    /// poses.
    pub fn compute(host: &Keyframe, target: &Keyframe, calib: &Calibration, generation: u64) -> Self {
        let host_to_target = &target.cam_to_world.inverse() * &host.cam_to_world;
        let r = host_to_target.rotation_matrix();
        let t = host_to_target.translation;

        let k = calib.k(0);
        let ki = calib.k_inv(0);
        let krki = k * r * ki;
        let kt = k * t;

        let aff = AffLight::from_to_vec_exposure(
            host.exposure,
            target.exposure,
            host.aff_g2l,
            target.aff_g2l,
        );

        Self {
            target: target.keyframe_id,
            generation,
            pre_rt: r.cast::<f32>(),
            pre_t: t.cast::<f32>(),
            pre_krki: krki.cast::<f32>(),
            pre_kt: kt.cast::<f32>(),
            pre_aff: (aff.0 as f32, aff.1 as f32),
            distance: t.norm() as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::shell::FrameId;
    use crate::frame::FramePyramid;
    use crate::geometry::SE3;
    use nalgebra::Vector3 as V3;
    use std::sync::Arc;

    fn make_kf(id: usize, tx: f64) -> Keyframe {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let pyr = Arc::new(FramePyramid::build(&vec![0.0f32; 64 * 48], &calib));
        let mut pose = SE3::identity();
        pose.translation = V3::new(tx, 0.0, 0.0);
        Keyframe::new(FrameId(id), KeyframeId(id), pyr, 1.0, pose, AffLight::zero())
    }

    #[test]
    fn identity_pair_has_identity_transforms() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let a = make_kf(0, 0.0);
        let pc = FramePrecalc::compute(&a, &a, &calib, 1);
        assert!((pc.pre_krki - Matrix3::identity()).norm() < 1e-5);
        assert!(pc.pre_kt.norm() < 1e-6);
        assert!((pc.pre_aff.0 - 1.0).abs() < 1e-6);
        assert_eq!(pc.distance, 0.0);
    }

    #[test]
    fn translation_pair_projects_with_baseline() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let host = make_kf(0, 0.0);
        let target = make_kf(1, 0.1);
        let pc = FramePrecalc::compute(&host, &target, &calib, 1);
        // host→target translation is -0.1 along x; K·t scales by fx.
        assert!((pc.pre_t.x + 0.1).abs() < 1e-6);
        assert!((pc.pre_kt.x + 6.0).abs() < 1e-4);
        assert!((pc.distance - 0.1).abs() < 1e-6);
    }
}
