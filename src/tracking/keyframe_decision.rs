//! Keyframe decision criteria.
//!
//! A new keyframe is promoted when the optical flow, brightness change or
//! tracking quality says the reference keyframe no longer explains the
//! current view, subject to rate limits and inertial overrides.

use crate::settings::Settings;

/// Per-frame inputs to the keyframe decision.
#[derive(Debug, Clone)]
pub struct KeyframeCues {
    /// Frames in the history so far (the current one included).
    pub history_len: usize,
    /// Timestamp of the current frame (seconds).
    pub timestamp: f64,
    /// Timestamp of the newest keyframe.
    pub last_kf_timestamp: f64,
    /// Flow indicators from coarse tracking (t, r, rt).
    pub flow: [f64; 3],
    /// Level-0 tracking RMSE.
    pub rmse: f64,
    /// Multiplicative affine transfer from the reference to this frame.
    pub aff_transfer_a: f64,
    /// First RMSE ever achieved against the current reference.
    pub first_coarse_rmse: f64,
    /// Image width + height, the flow normaliser.
    pub dimension_sum: f64,
    /// Forced keyframe (inertial recovery from non-finite cues).
    pub force_kf: bool,
    /// Forced non-keyframe (bad coarse tracking).
    pub force_no_kf: bool,
    /// Baseline in metric units when the inertial scale is known.
    pub scaled_baseline: Option<f64>,
    /// Frames between this one and the previous keyframe, exclusive.
    pub frames_since_kf: usize,
}

/// Keyframe decision state: carries the fractional-rate accumulator
/// across frames.
pub struct KeyframeDecision {
    frames_between_kfs_rest: f64,
}

impl KeyframeDecision {
    pub fn new() -> Self {
        Self {
            frames_between_kfs_rest: 0.0,
        }
    }

    /// Decide whether the current frame becomes a keyframe.
    pub fn decide(&mut self, cues: &KeyframeCues, settings: &Settings) -> bool {
        let time_since_kf = cues.timestamp - cues.last_kf_timestamp;

        let mut need = if settings.keyframes_per_second > 0.0 {
            cues.history_len == 1 || time_since_kf > 0.95 / settings.keyframes_per_second
        } else {
            let w = settings.kf_global_weight;
            let flow_score = w * settings.max_shift_weight_t * cues.flow[0].sqrt()
                / cues.dimension_sum
                + w * settings.max_shift_weight_r * cues.flow[1].sqrt() / cues.dimension_sum
                + w * settings.max_shift_weight_rt * cues.flow[2].sqrt() / cues.dimension_sum
                + w * settings.max_affine_weight * cues.aff_transfer_a.ln().abs();

            cues.history_len == 1
                || flow_score > 1.0
                || 2.0 * cues.first_coarse_rmse < cues.rmse
                || (settings.max_time_between_keyframes > 0.0
                    && time_since_kf > settings.max_time_between_keyframes)
                || cues.force_kf
        };

        let mut force_no_kf = cues.force_no_kf;
        if let Some(baseline) = cues.scaled_baseline {
            // Small-baseline suppression when the metric scale is known.
            if baseline < settings.force_no_kf_translation_thresh {
                force_no_kf = true;
            }
        }
        if force_no_kf {
            need = false;
        }

        if need {
            let min_int = settings.min_frames_between_keyframes as usize;
            if cues.frames_since_kf < min_int {
                need = false;
            } else if (cues.frames_since_kf as f64) < settings.min_frames_between_keyframes {
                // Fractional minimum: skip one extra keyframe every time
                // the accumulated remainder reaches a whole frame.
                let fractional =
                    settings.min_frames_between_keyframes - min_int as f64;
                self.frames_between_kfs_rest += fractional;
                if self.frames_between_kfs_rest >= 1.0 {
                    need = false;
                    self.frames_between_kfs_rest -= 1.0;
                }
            }
        }

        need
    }
}

impl Default for KeyframeDecision {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_cues() -> KeyframeCues {
        KeyframeCues {
            history_len: 10,
            timestamp: 1.0,
            last_kf_timestamp: 0.9,
            flow: [0.0; 3],
            rmse: 1.0,
            aff_transfer_a: 1.0,
            first_coarse_rmse: 1.0,
            dimension_sum: 112.0,
            force_kf: false,
            force_no_kf: false,
            scaled_baseline: None,
            frames_since_kf: 10,
        }
    }

    #[test]
    fn second_frame_is_always_a_keyframe() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.history_len = 1;
        assert!(decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn still_camera_makes_no_keyframes() {
        let mut decision = KeyframeDecision::new();
        assert!(!decision.decide(&quiet_cues(), &Settings::default()));
    }

    #[test]
    fn large_flow_triggers_a_keyframe() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        // At 44.8 weight and a 112-pixel normaliser, a mean squared
        // displacement above (112/44.8)² = 6.25 px² crosses the score.
        cues.flow[0] = 7.0;
        assert!(decision.decide(&cues, &Settings::default()));
        let mut cues = quiet_cues();
        cues.flow[0] = 4.0;
        assert!(!decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn rmse_regression_triggers_a_keyframe() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.first_coarse_rmse = 1.0;
        cues.rmse = 2.5;
        assert!(decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn brightness_change_triggers_a_keyframe() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.aff_transfer_a = 2.0;
        assert!(decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn force_no_kf_wins_over_everything() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.force_kf = true;
        cues.force_no_kf = true;
        assert!(!decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn small_scaled_baseline_suppresses_keyframes() {
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.force_kf = true;
        cues.scaled_baseline = Some(0.001);
        assert!(!decision.decide(&cues, &Settings::default()));
    }

    #[test]
    fn fixed_rate_mode_uses_time_only() {
        let mut settings = Settings::default();
        settings.keyframes_per_second = 2.0;
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.timestamp = cues.last_kf_timestamp + 0.3;
        assert!(!decision.decide(&cues, &settings));
        cues.timestamp = cues.last_kf_timestamp + 0.5;
        assert!(decision.decide(&cues, &settings));
    }

    #[test]
    fn integer_minimum_frames_between_keyframes() {
        let mut settings = Settings::default();
        settings.min_frames_between_keyframes = 3.0;
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.force_kf = true;
        cues.frames_since_kf = 2;
        assert!(!decision.decide(&cues, &settings));
        cues.frames_since_kf = 3;
        assert!(decision.decide(&cues, &settings));
    }

    #[test]
    fn fractional_minimum_accumulates_and_skips() {
        let mut settings = Settings::default();
        settings.min_frames_between_keyframes = 1.5;
        let mut decision = KeyframeDecision::new();
        let mut cues = quiet_cues();
        cues.force_kf = true;
        cues.frames_since_kf = 1;

        // Remainder 0.5 per decision: every second eligible frame skips.
        assert!(decision.decide(&cues, &settings));
        assert!(!decision.decide(&cues, &settings));
        assert!(decision.decide(&cues, &settings));
        assert!(!decision.decide(&cues, &settings));
    }
}
