//! Motion-model seed generation for coarse tracking.
//!
//! Without an inertial hint the tracker retries from a battery of motion
//! hypotheses: the constant-velocity prediction, doubled and halved
//! variants, two zero-motion fallbacks, and a halo of small rotations
//! around the constant-velocity seed. If tracking rails here the run is
//! lost, so the halo is deliberately generous; rejected seeds die on the
//! coarsest pyramid level and cost little.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};

use crate::frame::shell::{FrameId, FrameStore};
use crate::geometry::SE3;

/// Rotation halo sweep: start value and exclusive bound, stepped by 1.0
/// so a single delta is tried in practice.
const ROT_DELTA_START: f64 = 0.02;
const ROT_DELTA_END: f64 = 0.05;

/// Generate reference-to-frame seed poses for the frame about to be
/// tracked. `last_ref` is the current tracking reference keyframe.
///
/// The caller must have pushed the new frame's shell already, so the two
/// preceding shells are at `len-2` and `len-3`.
pub fn motion_seeds(frames: &FrameStore, last_ref: FrameId) -> Vec<SE3> {
    if frames.len() < 3 {
        return vec![SE3::identity()];
    }

    let slast = frames.get(FrameId(frames.len() - 2));
    let sprelast = frames.get(FrameId(frames.len() - 3));
    let last_f = frames.get(last_ref);

    if !slast.pose_valid || !sprelast.pose_valid || !last_f.pose_valid {
        return vec![SE3::identity()];
    }

    let slast_2_sprelast = &sprelast.cam_to_world.inverse() * &slast.cam_to_world;
    let last_f_2_slast = &slast.cam_to_world.inverse() * &last_f.cam_to_world;
    // The new frame is assumed to move like the last one did.
    let fh_2_slast = slast_2_sprelast;

    let const_motion = &fh_2_slast.inverse() * &last_f_2_slast;
    let mut seeds = vec![
        const_motion.clone(),
        &(&fh_2_slast.inverse() * &fh_2_slast.inverse()) * &last_f_2_slast,
        &SE3::exp(&(fh_2_slast.log() * 0.5)).inverse() * &last_f_2_slast,
        last_f_2_slast,
        SE3::identity(),
    ];

    let mut rot_delta = ROT_DELTA_START;
    while rot_delta < ROT_DELTA_END {
        for axes in rotation_halo(rot_delta) {
            let rot = UnitQuaternion::from_quaternion(Quaternion::new(
                1.0, axes.x, axes.y, axes.z,
            ));
            seeds.push(&const_motion * &SE3::from_rotation(rot));
        }
        rot_delta += 1.0;
    }

    seeds
}

/// The 26 sign/axis combinations of a small rotation delta: six single
/// axes, twelve pairs, eight triples.
fn rotation_halo(d: f64) -> Vec<Vector3<f64>> {
    let mut halo = vec![
        Vector3::new(d, 0.0, 0.0),
        Vector3::new(0.0, d, 0.0),
        Vector3::new(0.0, 0.0, d),
        Vector3::new(-d, 0.0, 0.0),
        Vector3::new(0.0, -d, 0.0),
        Vector3::new(0.0, 0.0, -d),
    ];
    for &sx in &[d, -d] {
        for &sy in &[d, -d] {
            halo.push(Vector3::new(sx, sy, 0.0));
            halo.push(Vector3::new(0.0, sx, sy));
            halo.push(Vector3::new(sx, 0.0, sy));
        }
    }
    for &sx in &[d, -d] {
        for &sy in &[d, -d] {
            for &sz in &[d, -d] {
                halo.push(Vector3::new(sx, sy, sz));
            }
        }
    }
    halo
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3 as V3;

    fn store_with_motion() -> FrameStore {
        let mut frames = FrameStore::new();
        for i in 0..4 {
            let id = frames.push(i, 0.1 * i as f64, 1.0);
            frames.get_mut(id).cam_to_world.translation = V3::new(0.1 * i as f64, 0.0, 0.0);
        }
        frames
    }

    #[test]
    fn short_history_yields_identity_seed() {
        let mut frames = FrameStore::new();
        frames.push(0, 0.0, 1.0);
        frames.push(1, 0.1, 1.0);
        let seeds = motion_seeds(&frames, FrameId(0));
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0], SE3::identity());
    }

    #[test]
    fn full_seed_battery_has_expected_size() {
        let frames = store_with_motion();
        let seeds = motion_seeds(&frames, FrameId(0));
        // 5 motion models + 26 rotation perturbations.
        assert_eq!(seeds.len(), 31);
    }

    #[test]
    fn constant_motion_seed_extrapolates_translation() {
        let frames = store_with_motion();
        // Reference is frame 0; frames move +0.1 x per frame, so the new
        // frame (id 3) should sit at 0.3 → ref-to-frame x = -0.3.
        let seeds = motion_seeds(&frames, FrameId(0));
        assert!((seeds[0].translation.x + 0.3).abs() < 1e-9);
    }

    #[test]
    fn invalid_pose_collapses_to_identity() {
        let mut frames = store_with_motion();
        let id = FrameId(2);
        frames.get_mut(id).pose_valid = false;
        let seeds = motion_seeds(&frames, FrameId(0));
        assert_eq!(seeds.len(), 1);
    }

    #[test]
    fn halo_rotations_are_small() {
        for v in rotation_halo(0.02) {
            assert!(v.norm() < 0.05);
        }
        assert_eq!(rotation_halo(0.02).len(), 26);
    }
}
