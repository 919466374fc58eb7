//! Reference tracker kernel: coarse-to-fine direct image alignment.
//!
//! Aligns the incoming frame against the newest keyframe's sparse
//! inverse-depth point cloud by Gauss-Newton on the 6-DoF pose, one
//! pyramid level at a time. This is the built-in stand-in for a full
//! coarse tracker; anything implementing [`TrackerKernel`] can replace
//! it.

use nalgebra::{Matrix6, Vector3, Vector6};

use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::AffLight;
use crate::geometry::{so3, SE3};
use crate::settings::Settings;
use crate::tracking::coarse::TrackerKernel;
use crate::window::SlidingWindow;

/// Gauss-Newton iterations per pyramid level.
const MAX_ITERATIONS: usize = 10;

/// A level whose initial residual exceeds the floor by this factor aborts
/// the attempt.
const ABORT_FACTOR: f64 = 1.5;

/// Minimum fraction of reference points that must project into the frame.
const MIN_VISIBLE_FRACTION: f64 = 0.3;

/// One reference point at one pyramid level.
struct RefPoint {
    u: f32,
    v: f32,
    idepth: f32,
    color: f32,
}

/// Direct photometric alignment kernel over the image pyramid.
pub struct PyramidKernel {
    calib: Option<Calibration>,
    huber_th: f32,
    /// Reference points per pyramid level.
    points: Vec<Vec<RefPoint>>,
    ref_exposure: f32,
    ref_aff: AffLight,
    last_residuals: [f64; 5],
    last_flow: [f64; 3],
}

impl PyramidKernel {
    pub fn new(settings: &Settings) -> Self {
        Self {
            calib: None,
            huber_th: settings.huber_th,
            points: Vec::new(),
            ref_exposure: 1.0,
            ref_aff: AffLight::zero(),
            last_residuals: [f64::NAN; 5],
            last_flow: [0.0; 3],
        }
    }

    /// Residual and normal equations at one level for the current pose.
    /// Returns `(energy, count, h, b)`; `None` when too few points
    /// project.
    fn accumulate(
        &self,
        level: usize,
        frame: &FramePyramid,
        pose: &SE3,
        aff: (f32, f32),
        calib: &Calibration,
    ) -> Option<(f64, usize, Matrix6<f64>, Vector6<f64>)> {
        let pts = &self.points[level];
        if pts.is_empty() {
            return None;
        }
        let fx = calib.fx(level);
        let fy = calib.fy(level);
        let cx = calib.cx(level);
        let cy = calib.cy(level);
        let lvl = frame.level(level);
        let (w, h) = (lvl.w as f64, lvl.h as f64);

        let r = pose.rotation_matrix();
        let t = pose.translation;

        let mut energy = 0.0f64;
        let mut count = 0usize;
        let mut h_mat = Matrix6::<f64>::zeros();
        let mut b_vec = Vector6::<f64>::zeros();

        for p in pts {
            // Back-project into the reference camera, transform, project.
            let xr = Vector3::new(
                (p.u as f64 - cx) / fx,
                (p.v as f64 - cy) / fy,
                1.0,
            ) / p.idepth as f64;
            let xt = r * xr + t;
            if xt.z <= 0.0 {
                continue;
            }
            let ku = fx * xt.x / xt.z + cx;
            let kv = fy * xt.y / xt.z + cy;
            if ku < 2.0 || kv < 2.0 || ku > w - 3.0 || kv > h - 3.0 {
                continue;
            }

            let hit = lvl.interp(ku as f32, kv as f32);
            if !hit[0].is_finite() {
                continue;
            }
            let residual = (hit[0] - (aff.0 * p.color + aff.1)) as f64;
            let hw = if residual.abs() < self.huber_th as f64 {
                1.0
            } else {
                self.huber_th as f64 / residual.abs()
            };
            energy += hw * residual * residual * (2.0 - hw);
            count += 1;

            // Pixel jacobian w.r.t. the 3D point in the target frame.
            let iz = 1.0 / xt.z;
            let gx = hit[1] as f64 * fx;
            let gy = hit[2] as f64 * fy;
            let du = Vector3::new(iz, 0.0, -xt.x * iz * iz);
            let dv = Vector3::new(0.0, iz, -xt.y * iz * iz);
            let d_img = gx * du + gy * dv;

            // Left-multiplied increment: dX/dv = I, dX/dω = -[X]×.
            let mut jac = Vector6::<f64>::zeros();
            jac.fixed_rows_mut::<3>(0).copy_from(&d_img);
            jac.fixed_rows_mut::<3>(3)
                .copy_from(&(-so3::hat(&xt).transpose() * d_img));

            h_mat += hw * jac * jac.transpose();
            b_vec += hw * residual * jac;
        }

        if (count as f64) < MIN_VISIBLE_FRACTION * pts.len() as f64 {
            return None;
        }
        Some((energy, count, h_mat, b_vec))
    }

    /// Flow indicators at level 0: RMS pixel displacement under a
    /// translation-only warp, a rotation-only warp, and the full warp.
    fn flow_indicators(&self, pose: &SE3, calib: &Calibration) -> [f64; 3] {
        let pts = &self.points[0];
        if pts.is_empty() {
            return [0.0; 3];
        }
        let fx = calib.fx(0);
        let fy = calib.fy(0);
        let cx = calib.cx(0);
        let cy = calib.cy(0);
        let r = pose.rotation_matrix();
        let t = pose.translation;

        let mut sum_t = 0.0f64;
        let mut sum_r = 0.0f64;
        let mut sum_rt = 0.0f64;
        let mut n = 0.0f64;
        for p in pts {
            let xr = Vector3::new((p.u as f64 - cx) / fx, (p.v as f64 - cy) / fy, 1.0)
                / p.idepth as f64;
            for (warped, sum) in [
                (xr + t, &mut sum_t),
                (r * xr, &mut sum_r),
                (r * xr + t, &mut sum_rt),
            ] {
                if warped.z <= 0.0 {
                    continue;
                }
                let ku = fx * warped.x / warped.z + cx;
                let kv = fy * warped.y / warped.z + cy;
                *sum += (ku - p.u as f64).powi(2) + (kv - p.v as f64).powi(2);
            }
            n += 1.0;
        }
        // Mean squared displacements; the keyframe decision applies the
        // square root.
        [sum_t / n, sum_r / n, sum_rt / n]
    }
}

impl TrackerKernel for PyramidKernel {
    fn make_k(&mut self, calib: &Calibration) {
        self.calib = Some(calib.clone());
    }

    fn set_tracking_ref(&mut self, window: &SlidingWindow) {
        let Some(calib) = &self.calib else {
            return;
        };
        let Some(newest) = window.newest() else {
            return;
        };
        self.ref_exposure = newest.exposure;
        self.ref_aff = newest.aff_g2l;

        // Project every active point of the window into the newest
        // keyframe to form the level-0 reference cloud.
        let mut level0: Vec<RefPoint> = Vec::new();
        for host in window.keyframes() {
            let Some(pc) = host.precalc_for(newest.keyframe_id) else {
                continue;
            };
            for p in &host.active_points {
                let ptp = pc.pre_krki * Vector3::new(p.u, p.v, 1.0) + pc.pre_kt * p.idepth;
                if ptp.z <= 0.0 {
                    continue;
                }
                let ku = ptp.x / ptp.z;
                let kv = ptp.y / ptp.z;
                let w = calib.width(0) as f32;
                let h = calib.height(0) as f32;
                if ku < 2.0 || kv < 2.0 || ku > w - 3.0 || kv > h - 3.0 {
                    continue;
                }
                let color = newest.pyramid.level(0).interp_intensity(ku, kv);
                if !color.is_finite() {
                    continue;
                }
                let new_idepth = p.idepth / ptp.z;
                level0.push(RefPoint {
                    u: ku,
                    v: kv,
                    idepth: new_idepth,
                    color,
                });
            }
        }

        // Downsample the cloud level by level.
        self.points = Vec::with_capacity(calib.levels());
        for l in 0..calib.levels() {
            if l == 0 {
                self.points.push(level0.drain(..).collect());
                continue;
            }
            let lvl_pyr = newest.pyramid.level(l);
            let coarser: Vec<RefPoint> = self.points[l - 1]
                .iter()
                .filter_map(|p| {
                    let u = (p.u + 0.5) / 2.0 - 0.5;
                    let v = (p.v + 0.5) / 2.0 - 0.5;
                    if u < 2.0
                        || v < 2.0
                        || u > lvl_pyr.w as f32 - 3.0
                        || v > lvl_pyr.h as f32 - 3.0
                    {
                        return None;
                    }
                    let color = lvl_pyr.interp_intensity(u, v);
                    color.is_finite().then_some(RefPoint {
                        u,
                        v,
                        idepth: p.idepth,
                        color,
                    })
                })
                .collect();
            self.points.push(coarser);
        }
    }

    fn track_newest_coarse(
        &mut self,
        frame: &FramePyramid,
        exposure: f32,
        ref_to_frame: &mut SE3,
        aff: &mut AffLight,
        start_level: usize,
        achieved_floor: &[f64; 5],
    ) -> bool {
        let Some(calib) = self.calib.clone() else {
            return false;
        };
        if self.points.len() < calib.levels() {
            return false;
        }
        self.last_residuals = [f64::NAN; 5];

        let mut pose = ref_to_frame.clone();
        let mut ok = true;

        for level in (0..=start_level.min(calib.levels() - 1)).rev() {
            let aff_ft = AffLight::from_to_vec_exposure(
                self.ref_exposure,
                exposure,
                self.ref_aff,
                *aff,
            );
            let aff_ft = (aff_ft.0 as f32, aff_ft.1 as f32);

            let Some((energy, count, _, _)) =
                self.accumulate(level, frame, &pose, aff_ft, &calib)
            else {
                ok = false;
                break;
            };
            let mut res = (energy / count as f64).sqrt();

            // Hopeless against what another hypothesis already achieved.
            if level < 5
                && achieved_floor[level].is_finite()
                && res > achieved_floor[level] * ABORT_FACTOR
            {
                ok = false;
                break;
            }

            for _ in 0..MAX_ITERATIONS {
                let Some((_, _, h, b)) = self.accumulate(level, frame, &pose, aff_ft, &calib)
                else {
                    ok = false;
                    break;
                };
                let Some(step) = (h + Matrix6::identity() * 1e-4).try_inverse().map(|hi| hi * -b)
                else {
                    break;
                };
                let candidate = &SE3::exp(&step) * &pose;
                let Some((new_energy, new_count, _, _)) =
                    self.accumulate(level, frame, &candidate, aff_ft, &calib)
                else {
                    break;
                };
                let new_res = (new_energy / new_count as f64).sqrt();
                if new_res < res {
                    pose = candidate;
                    res = new_res;
                } else {
                    break;
                }
                if step.norm() < 1e-6 {
                    break;
                }
            }

            if level < 5 {
                self.last_residuals[level] = res;
            }
            if !res.is_finite() {
                ok = false;
                break;
            }
        }

        if ok {
            *ref_to_frame = pose.clone();
            self.last_flow = self.flow_indicators(&pose, &calib);
        } else {
            self.last_flow = [0.0; 3];
        }
        ok
    }

    fn last_residuals(&self) -> [f64; 5] {
        self.last_residuals
    }

    fn last_flow_indicators(&self) -> [f64; 3] {
        self.last_flow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::shell::{AffLight, FrameStore};
    use crate::frame::KeyframeId;
    use crate::point::immature::DepthInterval;
    use crate::point::{ActivePoint, ImmaturePoint};
    use std::sync::Arc;

    /// Smooth 2-D texture with structure in both axes.
    fn texture(shift_x: f32) -> Vec<f32> {
        let mut img = vec![0.0f32; 64 * 48];
        for y in 0..48 {
            for x in 0..64 {
                let xf = x as f32 - shift_x;
                let yf = y as f32;
                img[x + y * 64] =
                    100.0 + 40.0 * (0.2 * xf).sin() + 30.0 * (0.15 * yf).cos() + 0.5 * xf;
            }
        }
        img
    }

    fn build_window(calib: &Calibration) -> SlidingWindow {
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        let id = frames.push(0, 0.0, 1.0);
        let pyr = Arc::new(FramePyramid::build(&texture(0.0), calib));
        window.push_keyframe(id, pyr, 1.0, SE3::identity(), AffLight::zero());
        window.set_precalc_values(calib);

        // Populate a grid of active points at depth 1.
        let host_pyr = window.keyframes()[0].pyramid.clone();
        let settings = Settings::default();
        for y in (8..40).step_by(4) {
            for x in (8..56).step_by(4) {
                let mut imm = ImmaturePoint::new(
                    x as f32,
                    y as f32,
                    KeyframeId(0),
                    &host_pyr,
                    1.0,
                    &settings,
                )
                .unwrap();
                imm.interval = DepthInterval::Bounded { min: 1.0, max: 1.0 };
                let p = ActivePoint::from_immature(&imm, 1.0);
                window.keyframes_mut()[0].active_points.push(p);
            }
        }
        window.set_precalc_values(calib);
        window
    }

    #[test]
    fn identity_alignment_has_near_zero_residual() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let settings = Settings::default();
        let mut kernel = PyramidKernel::new(&settings);
        kernel.make_k(&calib);
        let window = build_window(&calib);
        kernel.set_tracking_ref(&window);

        let frame = FramePyramid::build(&texture(0.0), &calib);
        let mut pose = SE3::identity();
        let mut aff = AffLight::zero();
        let ok = kernel.track_newest_coarse(
            &frame,
            1.0,
            &mut pose,
            &mut aff,
            calib.levels() - 1,
            &[f64::NAN; 5],
        );
        assert!(ok);
        assert!(kernel.last_residuals()[0] < 1.0);
        assert!(pose.translation.norm() < 1e-2);
    }

    #[test]
    fn recovers_small_camera_translation() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let settings = Settings::default();
        let mut kernel = PyramidKernel::new(&settings);
        kernel.make_k(&calib);
        let window = build_window(&calib);
        kernel.set_tracking_ref(&window);

        // The target image content sits 1.2 px to the right; with the
        // scene at depth 1 and fx = 60 that matches a ref-to-frame
        // translation of ≈ (+0.02, 0, 0).
        let frame = FramePyramid::build(&texture(1.2), &calib);
        let mut pose = SE3::identity();
        let mut aff = AffLight::zero();
        let ok = kernel.track_newest_coarse(
            &frame,
            1.0,
            &mut pose,
            &mut aff,
            calib.levels() - 1,
            &[f64::NAN; 5],
        );
        assert!(ok);
        assert!(
            (pose.translation.x - 0.02).abs() < 0.01,
            "estimated t_x = {}",
            pose.translation.x
        );
        let res = kernel.last_residuals()[0];
        assert!(res.is_finite() && res < 5.0);
    }

    #[test]
    fn flow_indicators_zero_for_identity() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let settings = Settings::default();
        let mut kernel = PyramidKernel::new(&settings);
        kernel.make_k(&calib);
        let window = build_window(&calib);
        kernel.set_tracking_ref(&window);
        let flow = kernel.flow_indicators(&SE3::identity(), &calib);
        assert!(flow[0] < 1e-9 && flow[2] < 1e-9);
    }
}
