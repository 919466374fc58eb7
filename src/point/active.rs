//! Active points: optimised landmarks with a single scalar inverse depth.

use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::KeyframeId;
use crate::point::immature::ImmaturePoint;
use crate::point::pattern::{PATTERN, PATTERN_COUNT};
use crate::point::projection::{derive_idepth, project_pattern};
use crate::point::residual::{PointResidual, ResState};
use crate::settings::Settings;
use crate::window::precalc::FramePrecalc;

/// Lifecycle flag of an active point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStatus {
    /// In the window optimisation.
    Active,
    /// Folded into the marginalisation prior.
    Marginalized,
    /// Flagged as an outlier.
    Outlier,
    /// To be removed without a prior contribution.
    Drop,
}

/// A promoted landmark owned by its host keyframe.
#[derive(Debug, Clone)]
pub struct ActivePoint {
    pub u: f32,
    pub v: f32,
    pub host: KeyframeId,
    pub point_type: f32,

    pub color: [f32; PATTERN_COUNT],
    pub weights: [f32; PATTERN_COUNT],
    pub energy_th: f32,

    pub idepth: f32,
    /// Linearisation point of the inverse depth.
    pub idepth_zero: f32,
    pub idepth_hessian: f32,
    pub has_depth_prior: bool,

    pub status: PointStatus,
    pub residuals: Vec<PointResidual>,
    /// States of the residuals towards the two most recent keyframes,
    /// newest first. Drives the out-of-bounds heuristics.
    pub last_residuals: [Option<(KeyframeId, ResState)>; 2],
    /// Number of residuals that were ever good, across their lifetime.
    pub num_good_residuals: usize,
}

impl ActivePoint {
    /// Promote an immature point at a fixed inverse depth.
    pub fn from_immature(imm: &ImmaturePoint, idepth: f32) -> Self {
        Self {
            u: imm.u,
            v: imm.v,
            host: imm.host,
            point_type: imm.point_type,
            color: imm.color,
            weights: imm.weights,
            energy_th: imm.energy_th,
            idepth,
            idepth_zero: idepth,
            idepth_hessian: 0.0,
            has_depth_prior: false,
            status: PointStatus::Active,
            residuals: Vec::new(),
            last_residuals: [None, None],
            num_good_residuals: 0,
        }
    }

    pub fn set_idepth(&mut self, idepth: f32) {
        self.idepth = idepth;
    }

    pub fn idepth_scaled(&self) -> f32 {
        self.idepth
    }

    /// Record the state of the residual towards the newest keyframe,
    /// shifting the previous entry back.
    pub fn push_last_residual(&mut self, target: KeyframeId, state: ResState) {
        self.last_residuals[1] = self.last_residuals[0];
        self.last_residuals[0] = Some((target, state));
    }

    /// Update the stored state of a tracked last-residual entry.
    pub fn note_residual_state(&mut self, target: KeyframeId, state: ResState) {
        for entry in self.last_residuals.iter_mut().flatten() {
            if entry.0 == target {
                entry.1 = state;
            }
        }
        if state == ResState::In {
            self.num_good_residuals += 1;
        }
    }

    /// Enough residual support to marginalise rather than drop.
    pub fn is_inlier_new(&self, settings: &Settings) -> bool {
        self.residuals.len() >= settings.min_good_active_res_for_marg
            && self.num_good_residuals >= settings.min_good_res_for_marg
    }

    /// Heuristic for points that will not survive the forward window:
    /// their recent residuals died, or marginalising their supporting
    /// frames leaves too few observations.
    pub fn is_oob(&self, frames_to_marg: &[KeyframeId], settings: &Settings) -> bool {
        let mut vis_in_to_marg = 0;
        for r in &self.residuals {
            if r.state != ResState::In {
                continue;
            }
            if frames_to_marg.contains(&r.target) {
                vis_in_to_marg += 1;
            }
        }
        if self.residuals.len() >= settings.min_good_active_res_for_marg
            && self.num_good_residuals >= settings.min_good_res_for_marg + 10
            && self.residuals.len() - vis_in_to_marg < settings.min_good_active_res_for_marg
        {
            return true;
        }

        if matches!(self.last_residuals[0], Some((_, ResState::Oob))) {
            return true;
        }
        if self.residuals.len() < 2 {
            return false;
        }
        if matches!(self.last_residuals[0], Some((_, ResState::Outlier)))
            && matches!(self.last_residuals[1], Some((_, ResState::Outlier)))
        {
            return true;
        }
        false
    }

    /// Linearise the photometric residual towards one target keyframe at
    /// the current inverse depth. Updates the residual's `new_*` fields
    /// and returns the 1-D normal-equation contribution.
    pub fn linearize_residual(
        &self,
        calib: &Calibration,
        res: &mut PointResidual,
        target: &FramePyramid,
        precalc: &FramePrecalc,
        settings: &Settings,
    ) -> (f32, f32, f32) {
        let level = target.level(0);
        let aff = precalc.pre_aff;
        let fx = calib.fx(0) as f32;
        let fy = calib.fy(0) as f32;

        let mut energy = 0.0f32;
        let mut h_dd = 0.0f32;
        let mut b_d = 0.0f32;

        for (idx, p) in PATTERN.iter().enumerate() {
            let Some(proj) = project_pattern(
                self.u,
                self.v,
                self.idepth,
                p[0],
                p[1],
                calib,
                &precalc.pre_rt,
                &precalc.pre_t,
            ) else {
                res.new_state = ResState::Oob;
                res.new_energy = res.energy;
                return (res.energy, 0.0, 0.0);
            };

            let hit = level.interp(proj.ku, proj.kv);
            if !hit[0].is_finite() {
                res.new_state = ResState::Oob;
                res.new_energy = res.energy;
                return (res.energy, 0.0, 0.0);
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
            h_dd += hw * d_idepth * d_idepth;
            b_d += hw * residual * d_idepth;
        }

        if energy > self.energy_th * settings.trace_extra_slack_on_th {
            res.new_state = ResState::Outlier;
            res.new_energy = self.energy_th * settings.trace_extra_slack_on_th;
        } else {
            res.new_state = ResState::In;
            res.new_energy = energy;
        }
        (res.new_energy, h_dd, b_d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::immature::DepthInterval;
    use crate::settings::Settings;

    fn dummy_point() -> ActivePoint {
        let calib = crate::calib::Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let img = vec![10.0f32; 64 * 48];
        let pyr = crate::frame::FramePyramid::build(&img, &calib);
        let mut imm =
            ImmaturePoint::new(20.0, 20.0, KeyframeId(0), &pyr, 1.0, &Settings::default())
                .unwrap();
        imm.interval = DepthInterval::Bounded { min: 0.4, max: 0.6 };
        ActivePoint::from_immature(&imm, 0.5)
    }

    #[test]
    fn promotion_copies_pattern_data() {
        let p = dummy_point();
        assert_eq!(p.idepth, 0.5);
        assert_eq!(p.idepth_zero, 0.5);
        assert_eq!(p.status, PointStatus::Active);
        assert!((p.color[0] - 10.0).abs() < 1e-5);
    }

    #[test]
    fn oob_when_newest_residual_died() {
        let mut p = dummy_point();
        let s = Settings::default();
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(1)));
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(2)));
        p.push_last_residual(KeyframeId(2), ResState::In);
        assert!(!p.is_oob(&[], &s));
        p.last_residuals[0] = Some((KeyframeId(2), ResState::Oob));
        assert!(p.is_oob(&[], &s));
    }

    #[test]
    fn oob_after_two_outlier_residuals() {
        let mut p = dummy_point();
        let s = Settings::default();
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(1)));
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(2)));
        p.push_last_residual(KeyframeId(1), ResState::Outlier);
        p.push_last_residual(KeyframeId(2), ResState::Outlier);
        assert!(p.is_oob(&[], &s));
    }

    #[test]
    fn inlier_requires_lifetime_support() {
        let mut p = dummy_point();
        let s = Settings::default();
        for t in 1..4 {
            p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(t)));
        }
        assert!(!p.is_inlier_new(&s));
        p.num_good_residuals = s.min_good_res_for_marg;
        assert!(p.is_inlier_new(&s));
    }
}
