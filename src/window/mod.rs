//! The sliding keyframe window and its bookkeeping.
//!
//! The window owns the keyframes (and through them all points). All
//! mutation happens on the mapping thread; the tracking thread only sees
//! window state through the coarse-tracker reference it is handed.

pub mod activation;
pub mod distance_map;
pub mod precalc;

use std::sync::Arc;

use tracing::debug;

use crate::backend::SlidingWindowBackend;
use crate::calib::Calibration;
use crate::frame::keyframe::{Keyframe, KeyframeId};
use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::{AffLight, FrameId, FrameStore};
use crate::geometry::SE3;
use crate::point::residual::{PointResidual, ResState};
use crate::point::PointStatus;
use crate::settings::Settings;
use precalc::FramePrecalc;

/// Ordered sequence of keyframes under optimisation, newest last.
pub struct SlidingWindow {
    keyframes: Vec<Keyframe>,
    next_keyframe_id: usize,
    generation: u64,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self {
            keyframes: Vec::new(),
            next_keyframe_id: 0,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn keyframes_mut(&mut self) -> &mut [Keyframe] {
        &mut self.keyframes
    }

    pub fn newest(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }

    pub fn get(&self, id: KeyframeId) -> Option<&Keyframe> {
        self.keyframes.iter().find(|k| k.keyframe_id == id)
    }

    pub fn get_mut(&mut self, id: KeyframeId) -> Option<&mut Keyframe> {
        self.keyframes.iter_mut().find(|k| k.keyframe_id == id)
    }

    pub fn index_of(&self, id: KeyframeId) -> Option<usize> {
        self.keyframes.iter().position(|k| k.keyframe_id == id)
    }

    /// Precalc generation stamp of the latest refresh.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Promote a frame into the window and assign its keyframe id.
    /// The new keyframe inherits the previous newest frame's energy
    /// threshold.
    pub fn push_keyframe(
        &mut self,
        frame: FrameId,
        pyramid: Arc<FramePyramid>,
        exposure: f32,
        cam_to_world: SE3,
        aff_g2l: AffLight,
    ) -> KeyframeId {
        let id = KeyframeId(self.next_keyframe_id);
        self.next_keyframe_id += 1;

        let mut kf = Keyframe::new(frame, id, pyramid, exposure, cam_to_world, aff_g2l);
        if let Some(prev) = self.keyframes.last() {
            kf.frame_energy_th = prev.frame_energy_th;
        }
        self.keyframes.push(kf);
        id
    }

    /// Refresh the full |window|² precalc cache from current keyframe
    /// poses.
    pub fn set_precalc_values(&mut self, calib: &Calibration) {
        self.generation += 1;
        let generation = self.generation;

        let mut all: Vec<Vec<FramePrecalc>> = Vec::with_capacity(self.keyframes.len());
        for host in &self.keyframes {
            let row = self
                .keyframes
                .iter()
                .map(|target| FramePrecalc::compute(host, target, calib, generation))
                .collect();
            all.push(row);
        }
        for (kf, row) in self.keyframes.iter_mut().zip(all) {
            kf.target_precalc = row;
        }
    }

    /// Wire every existing active point to the newest keyframe with a
    /// fresh residual.
    pub fn add_residuals_for_new_keyframe(&mut self, backend: &mut dyn SlidingWindowBackend) {
        let Some(newest) = self.keyframes.last() else {
            return;
        };
        let newest_id = newest.keyframe_id;
        let mut added = 0usize;

        for kf in &mut self.keyframes {
            if kf.keyframe_id == newest_id {
                continue;
            }
            for p in &mut kf.active_points {
                let r = PointResidual::new(p.host, newest_id);
                p.residuals.push(r);
                p.push_last_residual(newest_id, ResState::In);
                backend.insert_residual(p.host, newest_id);
                added += 1;
            }
        }
        debug!(residuals = added, keyframe = %newest_id, "wired forward residuals");
    }

    /// Flag active points for removal: starved points are dropped, points
    /// that will not survive the forward window are marginalised when
    /// their depth is well constrained and dropped otherwise.
    pub fn flag_points_for_removal(&mut self, calib: &Calibration, settings: &Settings) {
        let frames_to_marg: Vec<KeyframeId> = self
            .keyframes
            .iter()
            .filter(|k| k.flagged_for_marginalization)
            .map(|k| k.keyframe_id)
            .collect();
        // The original also built a forward-keep list here, with a bound
        // that leaves it empty on every path; only the marginalisation
        // list participates in the decision.

        enum Decision {
            Keep,
            Drop,
            Marginalize(Vec<(usize, ResState, f32)>),
        }

        let mut decisions: Vec<Vec<Decision>> = Vec::with_capacity(self.keyframes.len());
        for host in &self.keyframes {
            let mut host_decisions = Vec::with_capacity(host.active_points.len());
            for p in &host.active_points {
                if p.status != PointStatus::Active {
                    host_decisions.push(Decision::Keep);
                    continue;
                }
                if p.idepth_scaled() < settings.min_idepth || p.residuals.is_empty() {
                    host_decisions.push(Decision::Drop);
                    continue;
                }
                if !(p.is_oob(&frames_to_marg, settings) || host.flagged_for_marginalization) {
                    host_decisions.push(Decision::Keep);
                    continue;
                }

                if !p.is_inlier_new(settings) {
                    host_decisions.push(Decision::Drop);
                    continue;
                }

                // Relinearise the residuals so the marginalisation prior
                // sees fresh states.
                let mut updates = Vec::with_capacity(p.residuals.len());
                for (ri, r) in p.residuals.iter().enumerate() {
                    let Some(target) = self.get(r.target) else {
                        continue;
                    };
                    let Some(pc) = host.precalc_for(r.target) else {
                        continue;
                    };
                    let mut fresh = r.clone();
                    fresh.reset_oob();
                    p.linearize_residual(calib, &mut fresh, &target.pyramid, pc, settings);
                    updates.push((ri, fresh.new_state, fresh.new_energy));
                }

                if p.idepth_hessian > settings.min_idepth_h_marg {
                    host_decisions.push(Decision::Marginalize(updates));
                } else {
                    host_decisions.push(Decision::Drop);
                }
            }
            decisions.push(host_decisions);
        }

        let mut dropped = 0usize;
        let mut marginalized = 0usize;
        for (kf, host_decisions) in self.keyframes.iter_mut().zip(decisions) {
            for (p, decision) in kf.active_points.iter_mut().zip(host_decisions) {
                match decision {
                    Decision::Keep => {}
                    Decision::Drop => {
                        p.status = PointStatus::Drop;
                        dropped += 1;
                    }
                    Decision::Marginalize(updates) => {
                        for (ri, state, energy) in updates {
                            p.residuals[ri].new_state = state;
                            p.residuals[ri].new_energy = energy;
                            p.residuals[ri].apply();
                        }
                        p.status = PointStatus::Marginalized;
                        marginalized += 1;
                    }
                }
            }
        }
        debug!(dropped, marginalized, "flagged points for removal");
    }

    /// Flag whole keyframes for marginalisation: starved or brightness-
    /// divergent frames first, then the lowest distance score when the
    /// window is still over capacity.
    pub fn flag_keyframes_for_marginalization(&mut self, settings: &Settings) {
        let Some(newest) = self.keyframes.last() else {
            return;
        };
        let newest_exposure = newest.exposure;
        let newest_aff = newest.aff_g2l;
        let newest_kf_id = newest.keyframe_id.0 as i64;

        let mut flagged = 0usize;
        let len = self.keyframes.len();
        for kf in &mut self.keyframes {
            let in_pts = kf.active_points.len() + kf.immature_points.len();
            let out_pts = kf.marginalized_points.len() + kf.outlier_points.len();
            let (a, _) = AffLight::from_to_vec_exposure(
                newest_exposure,
                kf.exposure,
                newest_aff,
                kf.aff_g2l,
            );
            let starved = (in_pts as f32) < settings.min_points_remaining * (in_pts + out_pts) as f32;
            let brightness_diverged = a.ln().abs() > settings.max_log_aff_fac_in_window;

            if (starved || brightness_diverged) && len - flagged > settings.min_frames {
                kf.flagged_for_marginalization = true;
                flagged += 1;
            }
        }

        // Still over capacity: drop the keyframe that is close to its
        // neighbours but far from the newest one.
        if len - flagged >= settings.max_frames {
            let mut smallest_score = f64::INFINITY;
            let mut to_marg: Option<usize> = None;
            for (i, kf) in self.keyframes.iter().enumerate() {
                let kf_id = kf.keyframe_id.0 as i64;
                if kf_id > newest_kf_id - settings.min_frame_age as i64 || kf_id == 0 {
                    continue;
                }
                let mut dist_score = 0.0f64;
                for pc in &kf.target_precalc {
                    let t_id = pc.target.0 as i64;
                    if t_id > newest_kf_id - settings.min_frame_age as i64 + 1
                        || pc.target == kf.keyframe_id
                    {
                        continue;
                    }
                    dist_score += 1.0 / (1e-5 + pc.distance as f64);
                }
                if let Some(last) = kf.target_precalc.last() {
                    dist_score *= -(last.distance as f64).sqrt();
                }
                if dist_score < smallest_score {
                    smallest_score = dist_score;
                    to_marg = Some(i);
                }
            }
            if let Some(i) = to_marg {
                self.keyframes[i].flagged_for_marginalization = true;
            }
        }
    }

    /// Any keyframe currently flagged for marginalisation?
    pub fn any_flagged(&self) -> Option<KeyframeId> {
        self.keyframes
            .iter()
            .find(|k| k.flagged_for_marginalization)
            .map(|k| k.keyframe_id)
    }

    /// Evict a keyframe from the window. Residuals targeting it are
    /// removed everywhere, its shell records the point at which its pose
    /// became final, and the precalc cache is rebuilt without it.
    pub fn marginalize_frame(
        &mut self,
        kf_id: KeyframeId,
        frames: &mut FrameStore,
        calib: &Calibration,
        backend: &mut dyn SlidingWindowBackend,
    ) {
        for kf in &mut self.keyframes {
            for p in &mut kf.active_points {
                p.residuals.retain(|r| r.target != kf_id);
                for slot in &mut p.last_residuals {
                    if matches!(slot, Some((t, _)) if *t == kf_id) {
                        *slot = None;
                    }
                }
            }
        }

        backend.marginalize_frame(kf_id);

        let idx = self
            .index_of(kf_id)
            .expect("marginalized keyframe is in the window");
        let kf = self.keyframes.remove(idx);

        let final_at = self
            .keyframes
            .last()
            .map(|k| k.frame.0)
            .unwrap_or(kf.frame.0);
        let shell = frames.get_mut(kf.frame);
        shell.marginalized_at = final_at;

        self.set_precalc_values(calib);
        debug!(keyframe = %kf_id, window = self.keyframes.len(), "marginalized keyframe");
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EnergyBackend;
    use nalgebra::Vector3;

    fn test_calib() -> Calibration {
        Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5)
    }

    fn push_kf(window: &mut SlidingWindow, frames: &mut FrameStore, calib: &Calibration, tx: f64) {
        let id = frames.push(0, 0.1 * window.len() as f64, 1.0);
        let pyr = Arc::new(FramePyramid::build(&vec![50.0f32; 64 * 48], calib));
        let mut pose = SE3::identity();
        pose.translation = Vector3::new(tx, 0.0, 0.0);
        window.push_keyframe(id, pyr, 1.0, pose, AffLight::zero());
        window.set_precalc_values(calib);
    }

    #[test]
    fn keyframe_ids_are_monotonic() {
        let calib = test_calib();
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        push_kf(&mut window, &mut frames, &calib, 0.0);
        push_kf(&mut window, &mut frames, &calib, 0.1);
        push_kf(&mut window, &mut frames, &calib, 0.2);
        let ids: Vec<usize> = window.keyframes().iter().map(|k| k.keyframe_id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn precalc_cache_is_full_and_fresh() {
        let calib = test_calib();
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        for i in 0..3 {
            push_kf(&mut window, &mut frames, &calib, 0.1 * i as f64);
        }
        let generation = window.generation();
        for kf in window.keyframes() {
            assert_eq!(kf.target_precalc.len(), window.len());
            for pc in &kf.target_precalc {
                assert_eq!(pc.generation, generation);
                assert!(window.get(pc.target).is_some());
            }
        }
    }

    #[test]
    fn marginalization_purges_all_references() {
        let calib = test_calib();
        let settings = Settings::default();
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        let mut backend = EnergyBackend::new();
        for i in 0..3 {
            push_kf(&mut window, &mut frames, &calib, 0.1 * i as f64);
        }

        // Give the first keyframe a point with residuals to both others.
        let imm = crate::point::ImmaturePoint::new(
            20.0,
            20.0,
            KeyframeId(0),
            &window.keyframes()[0].pyramid.clone(),
            1.0,
            &settings,
        )
        .unwrap();
        let mut p = crate::point::ActivePoint::from_immature(&imm, 0.5);
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(1)));
        p.residuals.push(PointResidual::new(KeyframeId(0), KeyframeId(2)));
        p.push_last_residual(KeyframeId(1), ResState::In);
        p.push_last_residual(KeyframeId(2), ResState::In);
        window.keyframes_mut()[0].active_points.push(p);

        let victim = KeyframeId(1);
        window.marginalize_frame(victim, &mut frames, &calib, &mut backend);

        assert!(window.get(victim).is_none());
        for kf in window.keyframes() {
            for pc in &kf.target_precalc {
                assert_ne!(pc.target, victim);
            }
            for p in &kf.active_points {
                assert!(p.residuals.iter().all(|r| r.target != victim));
                for slot in p.last_residuals.iter().flatten() {
                    assert_ne!(slot.0, victim);
                }
            }
        }
        // Shell survives in history with its finalisation point recorded.
        assert_eq!(frames.len(), 3);
    }

    #[test]
    fn overfull_window_flags_a_candidate() {
        let calib = test_calib();
        let mut settings = Settings::default();
        settings.max_frames = 3;
        settings.min_frames = 2;
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        for i in 0..4 {
            push_kf(&mut window, &mut frames, &calib, 0.1 * i as f64);
        }
        window.flag_keyframes_for_marginalization(&settings);
        assert!(window.any_flagged().is_some());
        // The newest keyframe is never the victim.
        assert!(!window.keyframes().last().unwrap().flagged_for_marginalization);
    }

    #[test]
    fn forward_residuals_target_the_newest_keyframe() {
        let calib = test_calib();
        let settings = Settings::default();
        let mut frames = FrameStore::new();
        let mut window = SlidingWindow::new();
        let mut backend = EnergyBackend::new();
        push_kf(&mut window, &mut frames, &calib, 0.0);

        let imm = crate::point::ImmaturePoint::new(
            20.0,
            20.0,
            KeyframeId(0),
            &window.keyframes()[0].pyramid.clone(),
            1.0,
            &settings,
        )
        .unwrap();
        let p = crate::point::ActivePoint::from_immature(&imm, 0.5);
        window.keyframes_mut()[0].active_points.push(p);

        push_kf(&mut window, &mut frames, &calib, 0.1);
        window.add_residuals_for_new_keyframe(&mut backend);

        let p = &window.keyframes()[0].active_points[0];
        assert_eq!(p.residuals.len(), 1);
        assert_eq!(p.residuals[0].target, KeyframeId(1));
        assert!(matches!(p.last_residuals[0], Some((KeyframeId(1), ResState::In))));
    }
}
