//! Coverage-driven promotion of immature points to active points.
//!
//! Runs on every keyframe creation. A half-resolution distance map keeps
//! activation spread out; a scalar coverage radius is servoed so the
//! number of active points tracks the configured density.

use nalgebra::Vector3;
use tracing::debug;

use crate::backend::{Activation, SlidingWindowBackend};
use crate::calib::Calibration;
use crate::point::TraceStatus;
use crate::settings::Settings;
use crate::system::reduce::ReducePool;
use crate::window::distance_map::CoarseDistanceMap;
use crate::window::SlidingWindow;

/// Activation controller; owns the adaptive coverage radius.
pub struct PointActivator {
    current_min_act_dist: f32,
}

impl PointActivator {
    pub fn new() -> Self {
        Self {
            current_min_act_dist: 2.0,
        }
    }

    pub fn current_min_act_dist(&self) -> f32 {
        self.current_min_act_dist
    }

    /// Servo the coverage radius towards the desired point density.
    /// Saturates at [0, 4].
    pub fn adjust_density(&mut self, n_points: usize, desired: f32) {
        let n = n_points as f32;
        if n < desired * 0.66 {
            self.current_min_act_dist -= 0.8;
        }
        if n < desired * 0.8 {
            self.current_min_act_dist -= 0.5;
        } else if n < desired * 0.9 {
            self.current_min_act_dist -= 0.2;
        } else if n < desired {
            self.current_min_act_dist -= 0.1;
        }

        if n > desired * 1.5 {
            self.current_min_act_dist += 0.8;
        }
        if n > desired * 1.3 {
            self.current_min_act_dist += 0.5;
        }
        if n > desired * 1.15 {
            self.current_min_act_dist += 0.2;
        }
        if n > desired {
            self.current_min_act_dist += 0.1;
        }

        self.current_min_act_dist = self.current_min_act_dist.clamp(0.0, 4.0);
    }

    /// Activate eligible immature points of all window keyframes against
    /// the newest keyframe.
    pub fn activate_points(
        &mut self,
        window: &mut SlidingWindow,
        backend: &mut dyn SlidingWindowBackend,
        dmap: &mut CoarseDistanceMap,
        calib: &Calibration,
        settings: &Settings,
        pool: &ReducePool,
    ) {
        self.adjust_density(backend.num_points(), settings.desired_point_density);
        debug!(
            min_act_dist = self.current_min_act_dist,
            points = backend.num_points(),
            "activation sparsity"
        );

        dmap.make_distance_map(window, calib);

        let Some(newest) = window.keyframes().last() else {
            return;
        };
        let newest_id = newest.keyframe_id;
        let newest_pose = newest.cam_to_world.clone();
        let k1 = calib.k(1);
        let ki0 = calib.k_inv(0);
        let (w1, h1) = (dmap.width(), dmap.height());

        // Collect candidates host by host, deleting hopeless points along
        // the way.
        let mut to_optimize: Vec<(usize, usize)> = Vec::new();
        let num_kfs = window.len();
        for host_idx in 0..num_kfs {
            let host = &window.keyframes()[host_idx];
            if host.keyframe_id == newest_id {
                continue;
            }
            let host_to_new = &newest_pose.inverse() * &host.cam_to_world;
            let krki = (k1 * host_to_new.rotation_matrix() * ki0).cast::<f32>();
            let kt = (k1 * host_to_new.translation).cast::<f32>();
            let host_flagged = host.flagged_for_marginalization;

            let mut keep = vec![true; host.immature_points.len()];
            for (i, imm) in host.immature_points.iter().enumerate() {
                // Never traced into a bound, or an outlier on the last
                // trace: remove.
                if !imm.interval.is_bounded() || imm.status == TraceStatus::Outlier {
                    keep[i] = false;
                    continue;
                }

                let can_activate = matches!(
                    imm.status,
                    TraceStatus::Good
                        | TraceStatus::Skipped
                        | TraceStatus::BadCondition
                        | TraceStatus::OutOfBounds
                ) && imm.last_trace_pixel_interval < 8.0
                    && imm.quality > settings.min_trace_quality
                    && imm.interval.min() + imm.interval.max().unwrap_or(f32::NAN) > 0.0;

                if !can_activate {
                    if host_flagged || imm.status == TraceStatus::OutOfBounds {
                        keep[i] = false;
                    }
                    continue;
                }

                let center = imm.interval.center().unwrap_or(f32::NAN);
                let ptp = krki * Vector3::new(imm.u, imm.v, 1.0) + kt * center;
                let u = (ptp.x / ptp.z + 0.5) as i64;
                let v = (ptp.y / ptp.z + 0.5) as i64;
                if u > 0 && v > 0 && (u as usize) < w1 && (v as usize) < h1 {
                    let dist =
                        dmap.at(u as usize, v as usize) + (ptp.x - ptp.x.floor());
                    if dist >= self.current_min_act_dist * imm.point_type {
                        dmap.add_into_dist_final(u as usize, v as usize);
                        to_optimize.push((host_idx, i));
                    }
                } else {
                    keep[i] = false;
                }
            }
            apply_keep_mask(&mut window.keyframes_mut()[host_idx].immature_points, &keep, &mut to_optimize, host_idx);
        }

        // Optimise candidates in parallel; results applied sequentially.
        let results: Vec<Activation> = {
            let window_ref: &SlidingWindow = window;
            let backend_ref: &dyn SlidingWindowBackend = backend;
            pool.map_indexed(to_optimize.len(), |k| {
                let (host_idx, imm_idx) = to_optimize[k];
                backend_ref.optimize_immature_point(window_ref, host_idx, imm_idx, calib, settings)
            })
        };

        let mut activated = 0usize;
        let mut deleted = 0usize;
        let mut remove: Vec<(usize, usize)> = Vec::new();
        for ((host_idx, imm_idx), result) in to_optimize.iter().zip(results) {
            match result {
                Activation::Point(p) => {
                    let point = *p;
                    for r in &point.residuals {
                        backend.insert_residual(r.host, r.target);
                    }
                    backend.insert_point(point.host);
                    window.keyframes_mut()[*host_idx].active_points.push(point);
                    remove.push((*host_idx, *imm_idx));
                    activated += 1;
                }
                Activation::OutOfBounds => {
                    remove.push((*host_idx, *imm_idx));
                    deleted += 1;
                }
                Activation::Skip => {
                    let imm =
                        &window.keyframes()[*host_idx].immature_points[*imm_idx];
                    if imm.status == TraceStatus::OutOfBounds {
                        remove.push((*host_idx, *imm_idx));
                        deleted += 1;
                    }
                }
            }
        }

        // Remove consumed immature points, highest index first so the
        // remaining indices stay valid.
        remove.sort_unstable_by(|a, b| b.cmp(a));
        for (host_idx, imm_idx) in remove {
            window.keyframes_mut()[host_idx]
                .immature_points
                .swap_remove(imm_idx);
        }

        debug!(activated, deleted, "point activation");
    }
}

impl Default for PointActivator {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop immature points whose keep flag cleared, patching the candidate
/// indices that pointed past removed entries.
fn apply_keep_mask(
    points: &mut Vec<crate::point::ImmaturePoint>,
    keep: &[bool],
    candidates: &mut [(usize, usize)],
    host_idx: usize,
) {
    let mut new_index = vec![usize::MAX; keep.len()];
    let mut next = 0usize;
    for (i, &k) in keep.iter().enumerate() {
        if k {
            new_index[i] = next;
            next += 1;
        }
    }
    let mut i = 0usize;
    points.retain(|_| {
        let kept = keep[i];
        i += 1;
        kept
    });
    for c in candidates.iter_mut() {
        if c.0 == host_idx {
            c.1 = new_index[c.1];
        }
    }
}
