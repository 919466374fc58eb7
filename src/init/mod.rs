//! Visual bootstrap: the coarse-initialiser contract and a two-frame
//! reference implementation.
//!
//! The driver in the system module owns the initialisation protocol
//! (anchor frame, timeout, rescaling, keyframe promotion); the geometry
//! of tracking the second frame lives behind [`CoarseInit`].

use std::sync::Arc;

use nalgebra::{Matrix6, Vector3, Vector6};

use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::FrameId;
use crate::geometry::{so3, SE3};
use crate::select::{GradientGridSelector, PixelSelector};
use crate::settings::Settings;

/// One sparse depth candidate produced by the initialiser.
#[derive(Debug, Clone)]
pub struct InitCandidate {
    pub u: f32,
    pub v: f32,
    /// Estimated inverse depth (relative scale).
    pub i_r: f32,
    /// Selector potential tier.
    pub point_type: f32,
}

/// Contract to the coarse two-frame initialiser.
pub trait CoarseInit: Send {
    /// Install the anchor frame and select its candidates.
    fn set_first(&mut self, calib: &Calibration, frame: FrameId, pyramid: &Arc<FramePyramid>);
    /// Track a subsequent frame against the anchor; returns true once the
    /// relative pose has snapped into place.
    fn track_frame(&mut self, pyramid: &FramePyramid) -> bool;
    /// The anchor frame, if one is set.
    fn first_frame(&self) -> Option<(FrameId, Arc<FramePyramid>)>;
    /// Anchor-to-current relative pose.
    fn this_to_next(&self) -> SE3;
    /// Sparse depth candidates on the anchor frame.
    fn candidates(&self) -> &[InitCandidate];
    /// Forget everything; the next `set_first` starts a new attempt.
    fn reset(&mut self);
}

/// Alignment residual below which the pose is considered settled.
const SETTLED_RESIDUAL: f64 = 12.0;

/// Pixel flow above which two frames carry usable parallax.
const SNAP_FLOW: f64 = 2.0;

/// Reference initialiser: gradient-selected candidates at unit inverse
/// depth, aligned with a short coarse-to-fine Gauss-Newton.
pub struct TwoFrameInit {
    selector: GradientGridSelector,
    first: Option<(FrameId, Arc<FramePyramid>)>,
    calib: Option<Calibration>,
    candidates: Vec<InitCandidate>,
    this_to_next: SE3,
    huber_th: f64,
}

impl TwoFrameInit {
    pub fn new(settings: &Settings) -> Self {
        Self {
            selector: GradientGridSelector::new(),
            first: None,
            calib: None,
            candidates: Vec::new(),
            this_to_next: SE3::identity(),
            huber_th: settings.huber_th as f64,
        }
    }

    /// Gauss-Newton alignment of the candidates into `target` at one
    /// level; refines the pose in place and returns the final RMSE.
    fn align_level(
        &self,
        target: &FramePyramid,
        pose: &mut SE3,
        level: usize,
        first: &FramePyramid,
        calib: &Calibration,
    ) -> Option<f64> {
        let fx = calib.fx(level);
        let fy = calib.fy(level);
        let cx = calib.cx(level);
        let cy = calib.cy(level);
        let lvl = target.level(level);
        let ref_lvl = first.level(level);
        let scale = (1usize << level) as f32;

        let mut last_res = f64::INFINITY;
        for _ in 0..10 {
            let mut h_mat = Matrix6::<f64>::zeros();
            let mut b_vec = Vector6::<f64>::zeros();
            let mut energy = 0.0f64;
            let mut count = 0usize;

            let r = pose.rotation_matrix();
            let t = pose.translation;
            for c in &self.candidates {
                let u = (c.u + 0.5) / scale - 0.5;
                let v = (c.v + 0.5) / scale - 0.5;
                if u < 2.0 || v < 2.0 || u > ref_lvl.w as f32 - 3.0 || v > ref_lvl.h as f32 - 3.0
                {
                    continue;
                }
                let ref_color = ref_lvl.interp_intensity(u, v) as f64;

                let xr = Vector3::new((u as f64 - cx) / fx, (v as f64 - cy) / fy, 1.0)
                    / c.i_r as f64;
                let xt = r * xr + t;
                if xt.z <= 0.0 {
                    continue;
                }
                let ku = fx * xt.x / xt.z + cx;
                let kv = fy * xt.y / xt.z + cy;
                if ku < 2.0
                    || kv < 2.0
                    || ku > lvl.w as f64 - 3.0
                    || kv > lvl.h as f64 - 3.0
                {
                    continue;
                }
                let hit = lvl.interp(ku as f32, kv as f32);
                if !hit[0].is_finite() {
                    continue;
                }

                let residual = hit[0] as f64 - ref_color;
                let hw = if residual.abs() < self.huber_th {
                    1.0
                } else {
                    self.huber_th / residual.abs()
                };
                energy += hw * residual * residual * (2.0 - hw);
                count += 1;

                let iz = 1.0 / xt.z;
                let gx = hit[1] as f64 * fx;
                let gy = hit[2] as f64 * fy;
                let d_img = gx * Vector3::new(iz, 0.0, -xt.x * iz * iz)
                    + gy * Vector3::new(0.0, iz, -xt.y * iz * iz);
                let mut jac = Vector6::<f64>::zeros();
                jac.fixed_rows_mut::<3>(0).copy_from(&d_img);
                jac.fixed_rows_mut::<3>(3)
                    .copy_from(&(so3::hat(&xt) * d_img));

                h_mat += hw * jac * jac.transpose();
                b_vec += hw * residual * jac;
            }

            if count < 10 {
                return None;
            }
            last_res = (energy / count as f64).sqrt();

            let step = (h_mat + Matrix6::identity() * 1e-4).try_inverse()? * -b_vec;
            *pose = &SE3::exp(&step) * pose;
            if step.norm() < 1e-6 {
                break;
            }
        }
        Some(last_res)
    }

    /// RMS pixel displacement of the candidates under a pose.
    fn flow(&self, pose: &SE3, calib: &Calibration) -> f64 {
        let fx = calib.fx(0);
        let fy = calib.fy(0);
        let cx = calib.cx(0);
        let cy = calib.cy(0);
        let r = pose.rotation_matrix();
        let t = pose.translation;
        let mut sum = 0.0f64;
        let mut n = 0.0f64;
        for c in &self.candidates {
            let xr = Vector3::new((c.u as f64 - cx) / fx, (c.v as f64 - cy) / fy, 1.0)
                / c.i_r as f64;
            let xt = r * xr + t;
            if xt.z <= 0.0 {
                continue;
            }
            let ku = fx * xt.x / xt.z + cx;
            let kv = fy * xt.y / xt.z + cy;
            sum += (ku - c.u as f64).powi(2) + (kv - c.v as f64).powi(2);
            n += 1.0;
        }
        if n == 0.0 {
            0.0
        } else {
            (sum / n).sqrt()
        }
    }
}

impl CoarseInit for TwoFrameInit {
    fn set_first(&mut self, calib: &Calibration, frame: FrameId, pyramid: &Arc<FramePyramid>) {
        self.calib = Some(calib.clone());
        let lvl = pyramid.level(0);
        let mut map = vec![0.0f32; lvl.w * lvl.h];
        self.selector.make_maps(pyramid, 1000.0, &mut map);

        self.candidates.clear();
        for y in 0..lvl.h {
            for x in 0..lvl.w {
                let score = map[x + y * lvl.w];
                if score > 0.0 {
                    self.candidates.push(InitCandidate {
                        u: x as f32,
                        v: y as f32,
                        i_r: 1.0,
                        point_type: score,
                    });
                }
            }
        }
        self.first = Some((frame, pyramid.clone()));
        self.this_to_next = SE3::identity();
    }

    fn track_frame(&mut self, pyramid: &FramePyramid) -> bool {
        let Some((_, first_pyr)) = self.first.clone() else {
            return false;
        };
        let Some(calib) = self.calib.clone() else {
            return false;
        };

        let mut pose = self.this_to_next.clone();
        let mut res = None;
        let top = calib.levels() - 1;
        for level in (0..=top).rev() {
            res = self.align_level(pyramid, &mut pose, level, &first_pyr, &calib);
            if res.is_none() {
                return false;
            }
        }
        self.this_to_next = pose;

        let res = res.unwrap_or(f64::INFINITY);
        let flow = self.flow(&self.this_to_next, &calib);
        res < SETTLED_RESIDUAL || flow > SNAP_FLOW
    }

    fn first_frame(&self) -> Option<(FrameId, Arc<FramePyramid>)> {
        self.first.clone()
    }

    fn this_to_next(&self) -> SE3 {
        self.this_to_next.clone()
    }

    fn candidates(&self) -> &[InitCandidate] {
        &self.candidates
    }

    fn reset(&mut self) {
        self.first = None;
        self.candidates.clear();
        self.this_to_next = SE3::identity();
    }
}
