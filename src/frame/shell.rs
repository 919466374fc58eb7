//! Lightweight per-frame records kept for the whole run.
//!
//! A [`FrameShell`] exists for every image ever received and outlives the
//! heavy pixel data, which is dropped once a frame leaves the mapping
//! pipeline. Shells carry the pose estimate and are what the trajectory
//! writer traverses.

use crate::geometry::SE3;

/// Index of a frame in arrival order.
///
/// Frame ids are assigned sequentially on arrival and double as indices
/// into the frame store. They are plain handles so that keyframes, points
/// and residuals can cross-reference frames without owning them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Affine brightness transfer parameters `(a, b)` mapping a frame's
/// irradiance to a canonical exposure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffLight {
    pub a: f64,
    pub b: f64,
}

impl AffLight {
    pub fn zero() -> Self {
        Self { a: 0.0, b: 0.0 }
    }

    /// Photometric transfer from a host frame to a target frame, folding
    /// in both exposures: the returned `(a, b)` satisfy
    /// `I_target ≈ a · I_host + b`.
    pub fn from_to_vec_exposure(
        exposure_host: f32,
        exposure_target: f32,
        g2_host: AffLight,
        g2_target: AffLight,
    ) -> (f64, f64) {
        let (exposure_host, exposure_target) = if exposure_host == 0.0 || exposure_target == 0.0 {
            (1.0, 1.0)
        } else {
            (exposure_host as f64, exposure_target as f64)
        };
        let a = (g2_target.a - g2_host.a).exp() * exposure_target / exposure_host;
        let b = g2_target.b - a * g2_host.b;
        (a, b)
    }
}

impl Default for AffLight {
    fn default() -> Self {
        Self::zero()
    }
}

/// Per-frame metadata record.
#[derive(Debug, Clone)]
pub struct FrameShell {
    /// Monotonic arrival id; equals the index in the frame store.
    pub id: FrameId,
    /// Caller-supplied id of the source image.
    pub incoming_id: usize,
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Exposure time in milliseconds.
    pub exposure: f32,

    /// World pose of the camera; meaningful only while `pose_valid`.
    pub cam_to_world: SE3,
    /// Reference keyframe this frame was tracked against.
    pub tracking_ref: Option<FrameId>,
    /// Relative pose w.r.t. the tracking reference.
    pub cam_to_tracking_ref: SE3,
    /// Photometric affine state estimated during tracking.
    pub aff_g2l: AffLight,

    pub pose_valid: bool,
    pub tracking_was_good: bool,
    /// Keyframe id at which this frame's pose became final.
    pub marginalized_at: usize,
    /// Set once the frame is promoted into the window.
    pub keyframe_id: Option<usize>,
}

impl FrameShell {
    pub fn new(id: FrameId, incoming_id: usize, timestamp: f64, exposure: f32) -> Self {
        Self {
            id,
            incoming_id,
            timestamp,
            exposure,
            cam_to_world: SE3::identity(),
            tracking_ref: None,
            cam_to_tracking_ref: SE3::identity(),
            aff_g2l: AffLight::zero(),
            pose_valid: true,
            tracking_was_good: false,
            marginalized_at: id.0,
            keyframe_id: None,
        }
    }
}

/// Append-only store of every frame shell, in arrival order.
///
/// The store is shared between the tracking and mapping threads behind the
/// shell-pose mutex; all pose reads and writes go through it.
#[derive(Debug, Default)]
pub struct FrameStore {
    shells: Vec<FrameShell>,
}

impl FrameStore {
    pub fn new() -> Self {
        Self { shells: Vec::new() }
    }

    /// Create the shell for a newly arrived image and return its id.
    pub fn push(&mut self, incoming_id: usize, timestamp: f64, exposure: f32) -> FrameId {
        let id = FrameId(self.shells.len());
        self.shells.push(FrameShell::new(id, incoming_id, timestamp, exposure));
        id
    }

    pub fn len(&self) -> usize {
        self.shells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shells.is_empty()
    }

    pub fn get(&self, id: FrameId) -> &FrameShell {
        &self.shells[id.0]
    }

    pub fn get_mut(&mut self, id: FrameId) -> &mut FrameShell {
        &mut self.shells[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &FrameShell> {
        self.shells.iter()
    }

    /// Recompose a frame's world pose from its tracking-reference chain.
    pub fn compose_from_ref(&mut self, id: FrameId) {
        let shell = self.get(id);
        let tracking_ref = shell.tracking_ref.expect("frame has a tracking reference");
        let composed = &self.get(tracking_ref).cam_to_world * &shell.cam_to_tracking_ref;
        self.get_mut(id).cam_to_world = composed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn ids_are_monotonic_by_arrival() {
        let mut store = FrameStore::new();
        let a = store.push(10, 0.0, 1.0);
        let b = store.push(11, 0.1, 1.0);
        assert!(a < b);
        assert_eq!(store.get(b).incoming_id, 11);
    }

    #[test]
    fn affine_transfer_identity_when_equal() {
        let (a, b) = AffLight::from_to_vec_exposure(5.0, 5.0, AffLight::zero(), AffLight::zero());
        assert!((a - 1.0).abs() < 1e-12);
        assert!(b.abs() < 1e-12);
    }

    #[test]
    fn affine_transfer_scales_with_exposure() {
        let (a, _) = AffLight::from_to_vec_exposure(5.0, 10.0, AffLight::zero(), AffLight::zero());
        assert!((a - 2.0).abs() < 1e-12);
    }

    #[test]
    fn affine_transfer_zero_exposure_falls_back() {
        let (a, _) = AffLight::from_to_vec_exposure(0.0, 10.0, AffLight::zero(), AffLight::zero());
        assert!((a - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compose_from_ref_chains_poses() {
        let mut store = FrameStore::new();
        let r = store.push(0, 0.0, 1.0);
        let f = store.push(1, 0.1, 1.0);
        store.get_mut(r).cam_to_world.translation = Vector3::new(1.0, 0.0, 0.0);
        store.get_mut(f).tracking_ref = Some(r);
        store.get_mut(f).cam_to_tracking_ref.translation = Vector3::new(0.0, 2.0, 0.0);
        store.compose_from_ref(f);
        assert_eq!(
            store.get(f).cam_to_world.translation,
            Vector3::new(1.0, 2.0, 0.0)
        );
    }
}
