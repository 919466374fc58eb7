//! Contract to the sliding-window optimiser, plus a compact reference
//! implementation.
//!
//! The front-end drives the backend through this narrow trait; a full
//! nonlinear solver with frame/point marginalisation algebra can be
//! plugged in without touching the pipeline. [`EnergyBackend`] is the
//! built-in collaborator: it evaluates photometric residual energies,
//! refines point inverse depths one dimension at a time, and implements
//! the drop/marginalise stages as window bookkeeping.

use tracing::debug;

use crate::calib::Calibration;
use crate::frame::KeyframeId;
use crate::point::immature::TempResidual;
use crate::point::residual::ResState;
use crate::point::{ActivePoint, PointStatus};
use crate::settings::Settings;
use crate::window::SlidingWindow;

/// Outcome of optimising a single immature point for activation.
pub enum Activation {
    /// Successfully optimised; ready to join the window.
    Point(Box<ActivePoint>),
    /// The candidate projects out of every target; delete it.
    OutOfBounds,
    /// Not enough constraint yet; keep the immature point as is.
    Skip,
}

/// Narrow contract to the window optimiser.
pub trait SlidingWindowBackend: Send + Sync {
    /// Register a new keyframe with the optimiser.
    fn insert_frame(&mut self, kf: KeyframeId);
    /// Register an activated point.
    fn insert_point(&mut self, host: KeyframeId);
    /// Register a point→keyframe residual.
    fn insert_residual(&mut self, host: KeyframeId, target: KeyframeId);
    /// Number of points currently registered; drives activation density.
    fn num_points(&self) -> usize;

    /// Rebuild internal indices after structural changes.
    fn make_index(&mut self, window: &SlidingWindow);
    /// Refresh linearisation deltas after calibration changes.
    fn set_delta(&mut self, calib: &Calibration);

    /// Optimise the window and return the energy RMSE.
    fn optimize(
        &mut self,
        max_iterations: usize,
        window: &mut SlidingWindow,
        calib: &Calibration,
        settings: &Settings,
    ) -> f32;

    /// Optimise one immature point's inverse depth against the window.
    fn optimize_immature_point(
        &self,
        window: &SlidingWindow,
        host_index: usize,
        immature_index: usize,
        calib: &Calibration,
        settings: &Settings,
    ) -> Activation;

    /// Purge points flagged `Drop`/`Outlier` from the active sequences.
    fn drop_points(&mut self, window: &mut SlidingWindow);
    /// Fold points flagged `Marginalized` into the prior and move them to
    /// their host's marginalised sequence.
    fn marginalize_points(&mut self, window: &mut SlidingWindow);
    /// Remove a keyframe from the optimiser state.
    fn marginalize_frame(&mut self, kf: KeyframeId);
}

/// Reference backend: photometric energy evaluation with depth-only
/// Gauss-Newton updates and bookkeeping marginalisation stages.
pub struct EnergyBackend {
    n_points: usize,
    n_frames: usize,
}

impl EnergyBackend {
    pub fn new() -> Self {
        Self {
            n_points: 0,
            n_frames: 0,
        }
    }
}

impl Default for EnergyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SlidingWindowBackend for EnergyBackend {
    fn insert_frame(&mut self, _kf: KeyframeId) {
        self.n_frames += 1;
    }

    fn insert_point(&mut self, _host: KeyframeId) {
        self.n_points += 1;
    }

    fn insert_residual(&mut self, _host: KeyframeId, _target: KeyframeId) {}

    fn num_points(&self) -> usize {
        self.n_points
    }

    fn make_index(&mut self, _window: &SlidingWindow) {}

    fn set_delta(&mut self, _calib: &Calibration) {}

    fn optimize(
        &mut self,
        max_iterations: usize,
        window: &mut SlidingWindow,
        calib: &Calibration,
        settings: &Settings,
    ) -> f32 {
        let mut rmse = 0.0f32;
        for _ in 0..max_iterations.min(3) {
            rmse = depth_only_pass(window, calib, settings);
        }
        rmse
    }

    fn optimize_immature_point(
        &self,
        window: &SlidingWindow,
        host_index: usize,
        immature_index: usize,
        calib: &Calibration,
        settings: &Settings,
    ) -> Activation {
        let host = &window.keyframes()[host_index];
        let imm = &host.immature_points[immature_index];
        let Some(mut idepth) = imm.interval.center() else {
            return Activation::Skip;
        };
        idepth = idepth.max(imm.interval.min().max(0.0));

        let targets: Vec<&crate::frame::Keyframe> = window
            .keyframes()
            .iter()
            .filter(|k| k.keyframe_id != imm.host)
            .collect();
        if targets.is_empty() {
            return Activation::Skip;
        }

        let mut tmps: Vec<TempResidual> = targets
            .iter()
            .map(|k| TempResidual::new(k.keyframe_id))
            .collect();

        let mut last_h = 0.0f32;
        let mut last_energy = 0.0f32;
        for _ in 0..3 {
            let mut h_dd = 0.0f32;
            let mut b_d = 0.0f32;
            let mut energy = 0.0f32;
            for (tmp, target) in tmps.iter_mut().zip(&targets) {
                let Some(pc) = host.precalc_for(target.keyframe_id) else {
                    continue;
                };
                energy += imm.linearize_residual(
                    calib,
                    1.0,
                    tmp,
                    &mut h_dd,
                    &mut b_d,
                    idepth,
                    &target.pyramid,
                    pc,
                    settings,
                );
                tmp.state = tmp.new_state;
                tmp.energy = tmp.new_energy;
            }
            last_h = h_dd;
            last_energy = energy;
            if h_dd > 0.0 {
                let step = (-b_d / h_dd).clamp(-idepth.abs().max(0.1), idepth.abs().max(0.1));
                idepth += step;
                if step.abs() < 1e-4 {
                    break;
                }
            } else {
                break;
            }
        }

        if tmps.iter().all(|t| t.state == ResState::Oob) {
            return Activation::OutOfBounds;
        }
        if !last_energy.is_finite() || !idepth.is_finite() || last_h < settings.min_idepth_h_act {
            return Activation::Skip;
        }
        let good: Vec<&TempResidual> =
            tmps.iter().filter(|t| t.state == ResState::In).collect();
        if good.is_empty() {
            return Activation::Skip;
        }

        // Re-evaluate the capped residual at the converged depth; a
        // candidate whose energy saturates everywhere is not worth
        // activating.
        let slack = settings.trace_extra_slack_on_th;
        let all_saturated = good.iter().all(|t| {
            let Some(target) = window.get(t.target) else {
                return true;
            };
            let Some(pc) = host.precalc_for(t.target) else {
                return true;
            };
            imm.calc_residual(calib, slack, &target.pyramid, pc, idepth, settings)
                >= imm.energy_th * slack
        });
        if all_saturated {
            return Activation::Skip;
        }

        let mut point = ActivePoint::from_immature(imm, idepth);
        point.idepth_hessian = last_h;
        for tmp in &good {
            point
                .residuals
                .push(crate::point::PointResidual::new(imm.host, tmp.target));
        }
        // Seed the recency tracking with the two newest window keyframes.
        let newest_ids: Vec<KeyframeId> = window
            .keyframes()
            .iter()
            .rev()
            .take(2)
            .map(|k| k.keyframe_id)
            .collect();
        for id in newest_ids.iter().rev() {
            if good.iter().any(|t| t.target == *id) {
                point.push_last_residual(*id, ResState::In);
            }
        }

        Activation::Point(Box::new(point))
    }

    fn drop_points(&mut self, window: &mut SlidingWindow) {
        let mut dropped = 0usize;
        for kf in window.keyframes_mut() {
            let mut i = 0;
            while i < kf.active_points.len() {
                match kf.active_points[i].status {
                    PointStatus::Drop | PointStatus::Outlier => {
                        let mut p = kf.active_points.swap_remove(i);
                        p.status = PointStatus::Outlier;
                        kf.outlier_points.push(p);
                        dropped += 1;
                    }
                    _ => i += 1,
                }
            }
        }
        self.n_points = self.n_points.saturating_sub(dropped);
        if dropped > 0 {
            debug!(dropped, "dropped points");
        }
    }

    fn marginalize_points(&mut self, window: &mut SlidingWindow) {
        let mut marginalized = 0usize;
        for kf in window.keyframes_mut() {
            let mut i = 0;
            while i < kf.active_points.len() {
                if kf.active_points[i].status == PointStatus::Marginalized {
                    let p = kf.active_points.swap_remove(i);
                    kf.marginalized_points.push(p);
                    marginalized += 1;
                } else {
                    i += 1;
                }
            }
        }
        self.n_points = self.n_points.saturating_sub(marginalized);
        if marginalized > 0 {
            debug!(marginalized, "marginalized points");
        }
    }

    fn marginalize_frame(&mut self, _kf: KeyframeId) {
        self.n_frames = self.n_frames.saturating_sub(1);
    }
}

/// One depth-only Gauss-Newton sweep over all active points. Returns the
/// pattern-normalised energy RMSE.
fn depth_only_pass(window: &mut SlidingWindow, calib: &Calibration, settings: &Settings) -> f32 {
    struct PointUpdate {
        res_updates: Vec<(usize, ResState, f32)>,
        new_idepth: f32,
        new_hessian: f32,
        energy: f32,
        n_res: usize,
    }

    let newest = window.keyframes().last().map(|k| k.keyframe_id);

    // Pass 1: linearise everything against the current state.
    let mut updates: Vec<Vec<PointUpdate>> = Vec::with_capacity(window.len());
    for host in window.keyframes() {
        let mut host_updates = Vec::with_capacity(host.active_points.len());
        for p in &host.active_points {
            let mut u = PointUpdate {
                res_updates: Vec::with_capacity(p.residuals.len()),
                new_idepth: p.idepth,
                new_hessian: p.idepth_hessian,
                energy: 0.0,
                n_res: 0,
            };
            let mut h_dd = 0.0f32;
            let mut b_d = 0.0f32;
            for (ri, r) in p.residuals.iter().enumerate() {
                if r.state == ResState::Oob {
                    continue;
                }
                let Some(target) = window.get(r.target) else {
                    continue;
                };
                let Some(pc) = host.precalc_for(r.target) else {
                    continue;
                };
                let mut fresh = r.clone();
                let (e, h, b) =
                    p.linearize_residual(calib, &mut fresh, &target.pyramid, pc, settings);
                u.res_updates.push((ri, fresh.new_state, fresh.new_energy));
                if fresh.new_state == ResState::In {
                    u.energy += e;
                    u.n_res += 1;
                    h_dd += h;
                    b_d += b;
                }
            }
            if h_dd > settings.min_idepth_h_act.min(1.0) {
                let prior = if p.has_depth_prior { 1e3 } else { 0.0 };
                let step = -b_d / (h_dd + prior);
                let limit = 0.5 * p.idepth.abs().max(0.1);
                u.new_idepth = p.idepth + step.clamp(-limit, limit);
                u.new_hessian = h_dd;
            }
            host_updates.push(u);
        }
        updates.push(host_updates);
    }

    // Pass 2: apply.
    let mut total_energy = 0.0f64;
    let mut total_res = 0usize;
    for (kf, host_updates) in window.keyframes_mut().iter_mut().zip(updates) {
        for (p, u) in kf.active_points.iter_mut().zip(host_updates) {
            for (ri, state, energy) in u.res_updates {
                p.residuals[ri].new_state = state;
                p.residuals[ri].new_energy = energy;
                p.residuals[ri].apply();
                let target = p.residuals[ri].target;
                if Some(target) == newest {
                    p.note_residual_state(target, state);
                } else {
                    for slot in p.last_residuals.iter_mut().flatten() {
                        if slot.0 == target {
                            slot.1 = state;
                        }
                    }
                }
            }
            if u.new_idepth.is_finite() && u.new_idepth > 0.0 {
                p.set_idepth(u.new_idepth);
            }
            p.idepth_hessian = u.new_hessian;
            total_energy += u.energy as f64;
            total_res += u.n_res;
        }
    }

    if total_res == 0 {
        0.0
    } else {
        ((total_energy / (total_res * crate::point::pattern::PATTERN_COUNT) as f64).sqrt()) as f32
    }
}
