//! Immature points: depth candidates refined by epipolar line search.
//!
//! Every candidate carries an inverse-depth interval. Each frame the point
//! is traced against, the interval's projection defines an epipolar
//! segment; a discrete search plus a short Gauss-Newton refinement finds
//! the best photometric match and the interval is re-lifted around it.

use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};

use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::KeyframeId;
use crate::point::pattern::{PATTERN, PATTERN_COUNT};
use crate::point::projection::{derive_idepth, project_pattern};
use crate::point::residual::ResState;
use crate::settings::Settings;
use crate::window::precalc::FramePrecalc;

/// Energy charged for a sample that reads non-finite image data.
const BAD_SAMPLE_ENERGY: f32 = 1e5;

/// Hard cap on the number of discrete search steps.
const MAX_SEARCH_STEPS: usize = 99;

/// Inverse-depth interval of a candidate point.
///
/// A fresh candidate knows only a lower bound (depth may be anything up to
/// infinity); the first successful trace bounds it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthInterval {
    Bounded { min: f32, max: f32 },
    Unbounded { min: f32 },
}

impl DepthInterval {
    pub fn min(&self) -> f32 {
        match *self {
            DepthInterval::Bounded { min, .. } | DepthInterval::Unbounded { min } => min,
        }
    }

    pub fn max(&self) -> Option<f32> {
        match *self {
            DepthInterval::Bounded { max, .. } => Some(max),
            DepthInterval::Unbounded { .. } => None,
        }
    }

    pub fn is_bounded(&self) -> bool {
        matches!(self, DepthInterval::Bounded { .. })
    }

    /// Midpoint of a bounded interval.
    pub fn center(&self) -> Option<f32> {
        match *self {
            DepthInterval::Bounded { min, max } => Some(0.5 * (min + max)),
            DepthInterval::Unbounded { .. } => None,
        }
    }
}

/// Result classification of the last epipolar trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    /// Never traced successfully.
    Uninitialized,
    /// Interval narrowed around a good match.
    Good,
    /// One of the endpoints (or a refinement sample) left the image, or
    /// the apparent scale changed too much. Terminal.
    OutOfBounds,
    /// Best energy above the outlier threshold.
    Outlier,
    /// Interval already narrower than the slack; nothing to do.
    Skipped,
    /// The search geometry cannot improve the interval.
    BadCondition,
}

/// A candidate feature with an inverse-depth interval, owned by its host
/// keyframe.
#[derive(Debug, Clone)]
pub struct ImmaturePoint {
    pub u: f32,
    pub v: f32,
    pub host: KeyframeId,
    /// Selector score class; scales the activation coverage radius.
    pub point_type: f32,

    /// Reference colours of the pattern in the host frame.
    pub color: [f32; PATTERN_COUNT],
    /// Gradient-dependent per-pixel weights.
    pub weights: [f32; PATTERN_COUNT],
    /// Sum of outer products of the pattern image gradients.
    pub grad_h: Matrix2<f32>,

    pub interval: DepthInterval,
    /// Ratio of second-best to best energy along the last line search.
    pub quality: f32,
    pub energy_th: f32,

    pub status: TraceStatus,
    pub last_trace_pixel_interval: f32,
    pub last_trace_uv: (f32, f32),
}

/// Scratch residual used while optimising a candidate's depth against one
/// window keyframe.
#[derive(Debug, Clone)]
pub struct TempResidual {
    pub target: KeyframeId,
    pub state: ResState,
    pub new_state: ResState,
    pub energy: f32,
    pub new_energy: f32,
}

impl TempResidual {
    pub fn new(target: KeyframeId) -> Self {
        Self {
            target,
            state: ResState::In,
            new_state: ResState::Outlier,
            energy: 0.0,
            new_energy: 0.0,
        }
    }
}

impl ImmaturePoint {
    /// Sample the pattern at `(u, v)` in the host frame. Returns `None`
    /// when any pattern pixel reads non-finite data, which excludes the
    /// candidate entirely.
    pub fn new(
        u: f32,
        v: f32,
        host: KeyframeId,
        host_pyramid: &FramePyramid,
        point_type: f32,
        settings: &Settings,
    ) -> Option<Self> {
        let level = host_pyramid.level(0);
        let mut color = [0.0f32; PATTERN_COUNT];
        let mut weights = [0.0f32; PATTERN_COUNT];
        let mut grad_h = Matrix2::zeros();

        for (idx, p) in PATTERN.iter().enumerate() {
            let ptc = level.interp(u + p[0] as f32, v + p[1] as f32);
            if !ptc[0].is_finite() {
                return None;
            }
            color[idx] = ptc[0];
            let grad = Vector2::new(ptc[1], ptc[2]);
            grad_h += grad * grad.transpose();
            weights[idx] = (settings.outlier_th_sum_component
                / (settings.outlier_th_sum_component + grad.norm_squared()))
            .sqrt();
        }

        let energy_th = PATTERN_COUNT as f32
            * settings.outlier_th
            * settings.overall_energy_th_weight
            * settings.overall_energy_th_weight;

        Some(Self {
            u,
            v,
            host,
            point_type,
            color,
            weights,
            grad_h,
            interval: DepthInterval::Unbounded { min: 0.0 },
            quality: 10000.0,
            energy_th,
            status: TraceStatus::Uninitialized,
            last_trace_pixel_interval: 0.0,
            last_trace_uv: (-1.0, -1.0),
        })
    }

    /// Trace the point's epipolar segment in a new frame and narrow the
    /// inverse-depth interval.
    ///
    /// `krki` and `kt` are the K-composed host-to-target rotation and
    /// translation; `aff` maps host colours into the target's brightness.
    pub fn trace(
        &mut self,
        target: &FramePyramid,
        krki: &Matrix3<f32>,
        kt: &Vector3<f32>,
        aff: (f32, f32),
        settings: &Settings,
    ) -> TraceStatus {
        if self.status == TraceStatus::OutOfBounds {
            return self.status;
        }

        let level = target.level(0);
        let (w, h) = (level.w as f32, level.h as f32);
        let max_pix_search = (w + h) * settings.max_pix_search;

        // Project the interval endpoints.
        let pr = krki * Vector3::new(self.u, self.v, 1.0);
        let ptp_min = pr + kt * self.interval.min();
        let u_min = ptp_min.x / ptp_min.z;
        let v_min = ptp_min.y / ptp_min.z;

        // The admissible border grows with the rotated pattern extent.
        let rplane = krki.fixed_view::<2, 2>(0, 0).into_owned();
        let mut rotated = [Vector2::zeros(); PATTERN_COUNT];
        let mut max_rot_x = 0i32;
        let mut max_rot_y = 0i32;
        for (idx, p) in PATTERN.iter().enumerate() {
            rotated[idx] = rplane * Vector2::new(p[0] as f32, p[1] as f32);
            max_rot_x = max_rot_x.max(rotated[idx].x.abs() as i32);
            max_rot_y = max_rot_y.max(rotated[idx].y.abs() as i32);
        }
        let bound_u = (max_rot_x + 2).max(4) as f32;
        let bound_v = (max_rot_y + 2).max(4) as f32;

        let in_bounds =
            |x: f32, y: f32| x > bound_u && y > bound_v && x < w - bound_u - 1.0 && y < h - bound_v - 1.0;

        if !in_bounds(u_min, v_min) {
            return self.fail_trace(TraceStatus::OutOfBounds);
        }

        let mut dist;
        let mut u_max;
        let mut v_max;
        match self.interval {
            DepthInterval::Bounded { max, .. } => {
                let ptp_max = pr + kt * max;
                u_max = ptp_max.x / ptp_max.z;
                v_max = ptp_max.y / ptp_max.z;
                if !in_bounds(u_max, v_max) {
                    return self.fail_trace(TraceStatus::OutOfBounds);
                }

                // Everything below the slack interval is certain enough.
                dist = ((u_min - u_max) * (u_min - u_max) + (v_min - v_max) * (v_min - v_max))
                    .sqrt();
                if dist < settings.trace_slack_interval {
                    self.last_trace_uv = (0.5 * (u_max + u_min), 0.5 * (v_max + v_min));
                    self.last_trace_pixel_interval = dist;
                    self.status = TraceStatus::Skipped;
                    return self.status;
                }
            }
            DepthInterval::Unbounded { .. } => {
                // Unknown upper bound: search a fixed length along the
                // direction towards a far-depth projection.
                dist = max_pix_search;
                let ptp_far = pr + kt * 0.01;
                u_max = ptp_far.x / ptp_far.z;
                v_max = ptp_far.y / ptp_far.z;
                let dx = u_max - u_min;
                let dy = v_max - v_min;
                let d = 1.0 / (dx * dx + dy * dy).sqrt();
                u_max = u_min + dist * dx * d;
                v_max = v_min + dist * dy * d;
                if !in_bounds(u_max, v_max) {
                    return self.fail_trace(TraceStatus::OutOfBounds);
                }
            }
        }

        // Apparent scale changed too much for the pattern to compare.
        if !(self.interval.min() < 0.0 || (ptp_min.z > 0.75 && ptp_min.z < 1.5)) {
            return self.fail_trace(TraceStatus::OutOfBounds);
        }

        // Error bound on the result, anisotropic in the gradient.
        let mut dx = settings.trace_step_size * (u_max - u_min);
        let mut dy = settings.trace_step_size * (v_max - v_min);
        let delta = Vector2::new(dx, dy);
        let delta_orth = Vector2::new(dy, -dx);
        let a = (delta.transpose() * self.grad_h * delta)[0];
        let b = (delta_orth.transpose() * self.grad_h * delta_orth)[0];
        let mut error_in_pixel = 0.2 + 0.2 * (a + b) / a;

        if error_in_pixel * settings.trace_min_improvement_factor > dist
            && self.interval.is_bounded()
        {
            self.last_trace_uv = (0.5 * (u_max + u_min), 0.5 * (v_max + v_min));
            self.last_trace_pixel_interval = dist;
            self.status = TraceStatus::BadCondition;
            return self.status;
        }
        if error_in_pixel > 10.0 {
            error_in_pixel = 10.0;
        }

        // Discrete search along the segment.
        dx /= dist;
        dy /= dist;
        if !dx.is_finite() || !dy.is_finite() {
            return self.fail_trace(TraceStatus::OutOfBounds);
        }

        if dist > max_pix_search {
            u_max = u_min + max_pix_search * dx;
            v_max = v_min + max_pix_search * dy;
            dist = max_pix_search;
        }

        let num_steps = discrete_steps(dist, settings.trace_step_size);

        // Deterministic sub-pixel jitter to decorrelate sampling from the
        // pixel grid.
        let rand_shift = u_min * 1000.0 - (u_min * 1000.0).floor();
        let mut ptx = u_min - rand_shift * dx;
        let mut pty = v_min - rand_shift * dy;

        let mut errors = [0.0f32; MAX_SEARCH_STEPS + 1];
        let mut best_u = 0.0f32;
        let mut best_v = 0.0f32;
        let mut best_energy = 1e10f32;
        let mut best_idx = usize::MAX;

        for (i, err) in errors.iter_mut().enumerate().take(num_steps) {
            let mut energy = 0.0f32;
            for (idx, rp) in rotated.iter().enumerate() {
                match sample_intensity(level, ptx + rp.x, pty + rp.y) {
                    Some(hit) => {
                        let residual = hit - (aff.0 * self.color[idx] + aff.1);
                        let hw = if residual.abs() < settings.huber_th {
                            1.0
                        } else {
                            settings.huber_th / residual.abs()
                        };
                        energy += hw * residual * residual * (2.0 - hw);
                    }
                    None => energy += BAD_SAMPLE_ENERGY,
                }
            }

            *err = energy;
            if energy < best_energy {
                best_u = ptx;
                best_v = pty;
                best_energy = energy;
                best_idx = i;
            }
            ptx += dx;
            pty += dy;
        }

        // Quality: margin between best and anything well away from it.
        let mut second_best = 1e10f32;
        for (i, err) in errors.iter().enumerate().take(num_steps) {
            let far = i + settings.min_trace_test_radius < best_idx
                || i > best_idx + settings.min_trace_test_radius;
            if far && *err < second_best {
                second_best = *err;
            }
        }
        self.update_quality(second_best / best_energy, num_steps);

        // Gauss-Newton refinement of the sub-pixel location.
        let mut u_bak = best_u;
        let mut v_bak = best_v;
        let mut step_back = 0.0f32;
        if settings.trace_gn_iterations > 0 {
            best_energy = BAD_SAMPLE_ENERGY;
        }
        for _ in 0..settings.trace_gn_iterations {
            let mut hess = 1.0f32;
            let mut bg = 0.0f32;
            let mut energy = 0.0f32;
            for (idx, rp) in rotated.iter().enumerate() {
                let pos_u = best_u + rp.x;
                let pos_v = best_v + rp.y;
                if pos_u < 0.0 || pos_v < 0.0 || pos_u >= w - 1.0 || pos_v >= h - 1.0 {
                    return self.fail_trace(TraceStatus::OutOfBounds);
                }
                let hit = level.interp(pos_u, pos_v);
                if !hit[0].is_finite() {
                    energy += BAD_SAMPLE_ENERGY;
                    continue;
                }
                let residual = hit[0] - (aff.0 * self.color[idx] + aff.1);
                let d_res_d_dist = dx * hit[1] + dy * hit[2];
                let hw = if residual.abs() < settings.huber_th {
                    1.0
                } else {
                    settings.huber_th / residual.abs()
                };
                hess += hw * d_res_d_dist * d_res_d_dist;
                bg += hw * residual * d_res_d_dist;
                energy += self.weights[idx]
                    * self.weights[idx]
                    * hw
                    * residual
                    * residual
                    * (2.0 - hw);
            }

            if energy > best_energy {
                // Overshot: back off half the previous step.
                step_back *= 0.5;
                best_u = u_bak + step_back * dx;
                best_v = v_bak + step_back * dy;
            } else {
                let step = clamp_gn_step(-bg / hess);
                u_bak = best_u;
                v_bak = best_v;
                step_back = step;
                best_u += step * dx;
                best_v += step * dy;
                best_energy = energy;
            }

            if step_back.abs() < settings.trace_gn_threshold {
                break;
            }
        }

        // Energy-based outlier detection with the two-strike escalation.
        if !(best_energy < self.energy_th * settings.trace_extra_slack_on_th) {
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_uv = (-1.0, -1.0);
            self.status = if self.status == TraceStatus::Outlier {
                TraceStatus::OutOfBounds
            } else {
                TraceStatus::Outlier
            };
            return self.status;
        }

        // Re-lift the matched pixel (± the error bound) along the dominant
        // axis to a new inverse-depth interval.
        let (new_min, new_max) = if dx * dx > dy * dy {
            (
                (pr.z * (best_u - error_in_pixel * dx) - pr.x)
                    / (kt.x - kt.z * (best_u - error_in_pixel * dx)),
                (pr.z * (best_u + error_in_pixel * dx) - pr.x)
                    / (kt.x - kt.z * (best_u + error_in_pixel * dx)),
            )
        } else {
            (
                (pr.z * (best_v - error_in_pixel * dy) - pr.y)
                    / (kt.y - kt.z * (best_v - error_in_pixel * dy)),
                (pr.z * (best_v + error_in_pixel * dy) - pr.y)
                    / (kt.y - kt.z * (best_v + error_in_pixel * dy)),
            )
        };
        let (new_min, new_max) = if new_min > new_max {
            (new_max, new_min)
        } else {
            (new_min, new_max)
        };

        if !new_min.is_finite() || !new_max.is_finite() || new_max < 0.0 {
            self.last_trace_pixel_interval = 0.0;
            self.last_trace_uv = (-1.0, -1.0);
            self.status = TraceStatus::Outlier;
            return self.status;
        }

        self.interval = DepthInterval::Bounded {
            min: new_min,
            max: new_max,
        };
        self.last_trace_pixel_interval = 2.0 * error_in_pixel;
        self.last_trace_uv = (best_u, best_v);
        self.status = TraceStatus::Good;
        self.status
    }

    /// Pattern energy at a fixed inverse depth against a precalc target,
    /// capped at the outlier threshold.
    pub fn calc_residual(
        &self,
        calib: &Calibration,
        outlier_slack: f32,
        target: &FramePyramid,
        precalc: &FramePrecalc,
        idepth: f32,
        settings: &Settings,
    ) -> f32 {
        let level = target.level(0);
        let aff = precalc.pre_aff;
        let mut energy = 0.0f32;

        for (idx, p) in PATTERN.iter().enumerate() {
            let Some((ku, kv)) = crate::point::projection::project_composed(
                self.u + p[0] as f32,
                self.v + p[1] as f32,
                idepth,
                &precalc.pre_krki,
                &precalc.pre_kt,
                calib.width(0),
                calib.height(0),
            ) else {
                return 1e10;
            };
            let hit = level.interp_intensity(ku, kv);
            if !hit.is_finite() {
                return 1e10;
            }
            let residual = hit - (aff.0 * self.color[idx] + aff.1);
            let hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy += self.weights[idx] * self.weights[idx] * hw * residual * residual * (2.0 - hw);
        }

        energy.min(self.energy_th * outlier_slack)
    }

    /// Linearise the photometric residual of this candidate against one
    /// target at a trial inverse depth, accumulating the 1-D normal
    /// equations `(h_dd, b_d)` and updating the scratch residual state.
    pub fn linearize_residual(
        &self,
        calib: &Calibration,
        outlier_slack: f32,
        tmp: &mut TempResidual,
        h_dd: &mut f32,
        b_d: &mut f32,
        idepth: f32,
        target: &FramePyramid,
        precalc: &FramePrecalc,
        settings: &Settings,
    ) -> f32 {
        if tmp.state == ResState::Oob {
            tmp.new_state = ResState::Oob;
            return tmp.energy;
        }

        let level = target.level(0);
        let aff = precalc.pre_aff;
        let fx = calib.fx(0) as f32;
        let fy = calib.fy(0) as f32;
        let mut energy = 0.0f32;

        for (idx, p) in PATTERN.iter().enumerate() {
            let Some(proj) = project_pattern(
                self.u,
                self.v,
                idepth,
                p[0],
                p[1],
                calib,
                &precalc.pre_rt,
                &precalc.pre_t,
            ) else {
                tmp.new_state = ResState::Oob;
                return tmp.energy;
            };

            let hit = level.interp(proj.ku, proj.kv);
            if !hit[0].is_finite() {
                tmp.new_state = ResState::Oob;
                return tmp.energy;
            }
            let residual = hit[0] - (aff.0 * self.color[idx] + aff.1);
            let mut hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy += self.weights[idx] * self.weights[idx] * hw * residual * residual * (2.0 - hw);

            let dx_interp = hit[1] * fx;
            let dy_interp = hit[2] * fy;
            let d_idepth = derive_idepth(
                &precalc.pre_t,
                proj.u,
                proj.v,
                dx_interp,
                dy_interp,
                proj.drescale,
            );
            hw *= self.weights[idx] * self.weights[idx];
            *h_dd += hw * d_idepth * d_idepth;
            *b_d += hw * residual * d_idepth;
        }

        tmp.new_state = if energy > self.energy_th * outlier_slack {
            ResState::Outlier
        } else {
            ResState::In
        };
        tmp.new_energy = if tmp.new_state == ResState::Outlier {
            self.energy_th * outlier_slack
        } else {
            energy
        };
        tmp.new_energy
    }

    fn fail_trace(&mut self, status: TraceStatus) -> TraceStatus {
        self.last_trace_uv = (-1.0, -1.0);
        self.last_trace_pixel_interval = 0.0;
        self.status = status;
        status
    }

    /// Keep the stored quality monotone except when the search was long
    /// enough to be trustworthy on its own.
    fn update_quality(&mut self, new_quality: f32, num_steps: usize) {
        if new_quality < self.quality || num_steps > 10 {
            self.quality = new_quality;
        }
    }
}

/// Number of discrete search steps for a segment length, saturating at
/// [`MAX_SEARCH_STEPS`].
#[inline]
pub fn discrete_steps(dist: f32, step_size: f32) -> usize {
    let n = (1.9999f32 + dist / step_size) as usize;
    n.min(MAX_SEARCH_STEPS)
}

/// Clamp a Gauss-Newton step to ±0.5 px; non-finite steps collapse to 0.
#[inline]
pub fn clamp_gn_step(step: f32) -> f32 {
    if !step.is_finite() {
        0.0
    } else {
        step.clamp(-0.5, 0.5)
    }
}

/// Sample the intensity channel, mapping out-of-image or non-finite reads
/// to `None`.
#[inline]
fn sample_intensity(level: &crate::frame::pyramid::PyrLevel, x: f32, y: f32) -> Option<f32> {
    if x < 0.0 || y < 0.0 || x >= (level.w - 1) as f32 || y >= (level.h - 1) as f32 {
        return None;
    }
    let v = level.interp_intensity(x, y);
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::Calibration;

    fn test_calib() -> Calibration {
        Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5)
    }

    fn ramp_pyramid() -> FramePyramid {
        let calib = test_calib();
        let mut img = vec![0.0f32; 64 * 48];
        for y in 0..48 {
            for x in 0..64 {
                img[x + y * 64] = 2.0 * x as f32;
            }
        }
        FramePyramid::build(&img, &calib)
    }

    fn flat_pyramid(value: f32) -> FramePyramid {
        let calib = test_calib();
        FramePyramid::build(&vec![value; 64 * 48], &calib)
    }

    fn ramp_point() -> ImmaturePoint {
        let pyr = ramp_pyramid();
        ImmaturePoint::new(20.0, 20.0, KeyframeId(0), &pyr, 1.0, &Settings::default()).unwrap()
    }

    /// `K·t` for a pure x-translation of 0.1 m with fx = 60.
    fn kt_x() -> Vector3<f32> {
        Vector3::new(6.0, 0.0, 0.0)
    }

    #[test]
    fn creation_fails_on_non_finite_colors() {
        let calib = test_calib();
        let mut img = vec![1.0f32; 64 * 48];
        img[20 + 20 * 64] = f32::NAN;
        let pyr = FramePyramid::build(&img, &calib);
        assert!(
            ImmaturePoint::new(20.0, 20.0, KeyframeId(0), &pyr, 1.0, &Settings::default())
                .is_none()
        );
    }

    #[test]
    fn pinned_interval_with_zero_baseline_skips() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 1.0, max: 1.0 };
        let target = ramp_pyramid();
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &Vector3::zeros(),
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::Skipped);
        assert_eq!(pt.interval, DepthInterval::Bounded { min: 1.0, max: 1.0 });
    }

    #[test]
    fn good_trace_narrows_interval_around_truth() {
        // Ramp scene, pure x-translation: the photometric match is at
        // inverse depth 0, so the interval must contract towards it.
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 0.0, max: 1.0 };
        let target = ramp_pyramid();
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &kt_x(),
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::Good);
        let (min, max) = match pt.interval {
            DepthInterval::Bounded { min, max } => (min, max),
            _ => panic!("interval must be bounded after a good trace"),
        };
        assert!(min < 0.05, "min = {}", min);
        assert!(max < 0.2, "max = {}", max);
        assert!(min <= max);
        // errorInPixel for a pure-x gradient is 0.4.
        assert!((pt.last_trace_pixel_interval - 0.8).abs() < 1e-5);
    }

    #[test]
    fn unbounded_interval_becomes_bounded_by_capped_search() {
        let mut pt = ramp_point();
        assert!(!pt.interval.is_bounded());
        let target = ramp_pyramid();
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &kt_x(),
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::Good);
        assert!(pt.interval.is_bounded());
    }

    #[test]
    fn outlier_escalates_to_oob_on_second_strike() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 0.5, max: 2.0 };
        let target = flat_pyramid(0.0);
        let settings = Settings::default();

        let first = pt.trace(&target, &Matrix3::identity(), &kt_x(), (1.0, 0.0), &settings);
        assert_eq!(first, TraceStatus::Outlier);

        let second = pt.trace(&target, &Matrix3::identity(), &kt_x(), (1.0, 0.0), &settings);
        assert_eq!(second, TraceStatus::OutOfBounds);

        // OutOfBounds is terminal: further traces short-circuit.
        let third = pt.trace(&target, &Matrix3::identity(), &kt_x(), (1.0, 0.0), &settings);
        assert_eq!(third, TraceStatus::OutOfBounds);
    }

    #[test]
    fn never_two_consecutive_outliers() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 0.5, max: 2.0 };
        let target = flat_pyramid(0.0);
        let settings = Settings::default();
        let mut prev = pt.trace(&target, &Matrix3::identity(), &kt_x(), (1.0, 0.0), &settings);
        for _ in 0..5 {
            let status = pt.trace(&target, &Matrix3::identity(), &kt_x(), (1.0, 0.0), &settings);
            assert!(
                !(prev == TraceStatus::Outlier && status == TraceStatus::Outlier),
                "two consecutive outlier results"
            );
            prev = status;
        }
    }

    #[test]
    fn nan_target_is_rejected_by_energy_gate() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 0.5, max: 2.0 };
        let target = flat_pyramid(f32::NAN);
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &kt_x(),
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::Outlier);
    }

    #[test]
    fn endpoint_outside_image_is_oob() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 0.0, max: 10.0 };
        // A large baseline pushes the max-idepth endpoint out of bounds.
        let kt = Vector3::new(600.0, 0.0, 0.0);
        let target = ramp_pyramid();
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &kt,
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::OutOfBounds);
    }

    #[test]
    fn scale_change_is_oob() {
        let mut pt = ramp_point();
        pt.interval = DepthInterval::Bounded { min: 1.0, max: 2.0 };
        // Forward motion: K·t with t_z = 0.5 rescales p_min.z past 1.5.
        let kt = Vector3::new(0.0, 0.0, 0.6);
        let target = ramp_pyramid();
        let status = pt.trace(
            &target,
            &Matrix3::identity(),
            &kt,
            (1.0, 0.0),
            &Settings::default(),
        );
        assert_eq!(status, TraceStatus::OutOfBounds);
    }

    #[test]
    fn discrete_steps_saturate() {
        assert_eq!(discrete_steps(0.0, 1.0), 1);
        assert_eq!(discrete_steps(3.0, 1.0), 4);
        assert_eq!(discrete_steps(1000.0, 1.0), 99);
    }

    #[test]
    fn gn_step_is_clamped() {
        assert_eq!(clamp_gn_step(3.0), 0.5);
        assert_eq!(clamp_gn_step(-3.0), -0.5);
        assert_eq!(clamp_gn_step(0.2), 0.2);
        assert_eq!(clamp_gn_step(f32::NAN), 0.0);
    }

    #[test]
    fn quality_is_monotone_unless_long_search() {
        let mut pt = ramp_point();
        pt.quality = 5.0;
        pt.update_quality(7.0, 5);
        assert_eq!(pt.quality, 5.0);
        pt.update_quality(3.0, 5);
        assert_eq!(pt.quality, 3.0);
        pt.update_quality(8.0, 11);
        assert_eq!(pt.quality, 8.0);
    }
}
