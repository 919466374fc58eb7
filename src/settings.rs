//! Tunable parameters for the odometry front-end.
//!
//! All thresholds live in one deserialisable struct passed by reference
//! through the system, so two instances with different settings can coexist
//! in one process.

use serde::Deserialize;

/// Front-end configuration. [`Settings::default`] reproduces the tuning the
/// system was developed with; individual fields can be overridden from a
/// config file via serde.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Target number of active points kept in the optimisation window.
    pub desired_point_density: f32,
    /// Target number of immature candidate points per keyframe.
    pub desired_immature_density: f32,
    /// Maximum number of keyframes in the sliding window.
    pub max_frames: usize,
    /// Minimum number of keyframes kept when flagging for marginalisation.
    pub min_frames: usize,
    /// Newest keyframes protected from distance-score marginalisation.
    pub min_frame_age: usize,
    /// Marginalise a keyframe once fewer than this fraction of its points
    /// remain active.
    pub min_points_remaining: f32,
    /// Marginalise a keyframe once its brightness differs from the newest
    /// by more than this log-affine factor.
    pub max_log_aff_fac_in_window: f64,
    /// Maximum iterations for the windowed backend optimisation.
    pub max_opt_iterations: usize,

    /// Huber threshold for photometric residuals.
    pub huber_th: f32,
    /// Per-pattern-pixel outlier energy threshold (squared intensity).
    pub outlier_th: f32,
    /// Gradient-dependent weighting constant for pattern pixels.
    pub outlier_th_sum_component: f32,
    /// Global scale on the per-point energy threshold.
    pub overall_energy_th_weight: f32,

    /// Epipolar search length as a fraction of (width + height).
    pub max_pix_search: f32,
    /// Skip the trace when the projected interval is below this (pixels).
    pub trace_slack_interval: f32,
    /// Stride of the discrete epipolar search (pixels).
    pub trace_step_size: f32,
    /// Trace only when the interval can shrink by at least this factor.
    pub trace_min_improvement_factor: f32,
    /// Gauss-Newton iterations refining the discrete search result.
    pub trace_gn_iterations: usize,
    /// Stop the Gauss-Newton refinement below this step size (pixels).
    pub trace_gn_threshold: f32,
    /// Slack factor on the energy threshold for the trace outlier gate.
    pub trace_extra_slack_on_th: f32,
    /// Radius (in search steps) excluded around the best energy when
    /// computing the second-best for the quality score.
    pub min_trace_test_radius: usize,
    /// Minimum quality (second-best / best energy) to activate a point.
    pub min_trace_quality: f32,

    /// Minimum scaled inverse depth for an active point to survive.
    pub min_idepth: f32,
    /// Minimum inverse-depth Hessian to activate an immature point.
    pub min_idepth_h_act: f32,
    /// Minimum inverse-depth Hessian to marginalise (rather than drop).
    pub min_idepth_h_marg: f32,
    /// Residual count thresholds for marginalisation eligibility.
    pub min_good_active_res_for_marg: usize,
    pub min_good_res_for_marg: usize,

    /// Keyframe decision weights (flow, rotation flow, combined, affine).
    pub kf_global_weight: f64,
    pub max_shift_weight_t: f64,
    pub max_shift_weight_r: f64,
    pub max_shift_weight_rt: f64,
    pub max_affine_weight: f64,
    /// Fixed keyframe rate; 0 disables the rate rule in favour of the
    /// flow-based decision.
    pub keyframes_per_second: f64,
    /// Hard cap on time between keyframes in seconds; 0 disables.
    pub max_time_between_keyframes: f64,
    /// Minimum (possibly fractional) frames between keyframes.
    pub min_frames_between_keyframes: f64,
    /// Suppress keyframes below this metric baseline when the inertial
    /// scale is known.
    pub force_no_kf_translation_thresh: f64,
    /// In real-time mode, make every delivered frame a keyframe.
    pub real_time_max_kf: bool,

    /// Accept a re-tracking hypothesis once its residual is below this
    /// factor of the previous frame's RMSE.
    pub re_track_threshold: f64,

    /// Use inertial data (hints, forced keyframes, prepared-KF protocol).
    pub use_imu: bool,
    /// Restart initialisation when the first two candidate frames are
    /// further apart than this (seconds).
    pub max_time_between_init_frames: f64,
    /// Slack factor on the tiered initialisation-failure RMSE thresholds.
    pub benchmark_initializer_slack_factor: f32,

    /// Map synchronously on the tracking thread (deterministic runs).
    pub linearize_operation: bool,
    /// Worker threads for the activation reduce pool.
    pub num_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            desired_point_density: 2000.0,
            desired_immature_density: 1500.0,
            max_frames: 7,
            min_frames: 5,
            min_frame_age: 1,
            min_points_remaining: 0.05,
            max_log_aff_fac_in_window: 0.7,
            max_opt_iterations: 6,

            huber_th: 9.0,
            outlier_th: 12.0 * 12.0,
            outlier_th_sum_component: 50.0 * 50.0,
            overall_energy_th_weight: 1.0,

            max_pix_search: 0.027,
            trace_slack_interval: 1.5,
            trace_step_size: 1.0,
            trace_min_improvement_factor: 2.0,
            trace_gn_iterations: 3,
            trace_gn_threshold: 0.1,
            trace_extra_slack_on_th: 1.2,
            min_trace_test_radius: 2,
            min_trace_quality: 3.0,

            min_idepth: 0.02,
            min_idepth_h_act: 100.0,
            min_idepth_h_marg: 50.0,
            min_good_active_res_for_marg: 3,
            min_good_res_for_marg: 4,

            // Shift weights are pre-scaled by a nominal 640+480 image so
            // the flow score stays resolution independent.
            kf_global_weight: 1.0,
            max_shift_weight_t: 0.04 * 1120.0,
            max_shift_weight_r: 0.0 * 1120.0,
            max_shift_weight_rt: 0.02 * 1120.0,
            max_affine_weight: 2.0,
            keyframes_per_second: 0.0,
            max_time_between_keyframes: 0.0,
            min_frames_between_keyframes: 0.0,
            force_no_kf_translation_thresh: 0.01,
            real_time_max_kf: false,

            re_track_threshold: 1.5,

            use_imu: false,
            max_time_between_init_frames: 2.0,
            benchmark_initializer_slack_factor: 1.0,

            linearize_operation: false,
            num_threads: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let s = Settings::default();
        assert!(s.desired_immature_density < s.desired_point_density);
        assert!(s.max_frames >= 2);
        assert!(s.trace_extra_slack_on_th >= 1.0);
    }

    #[test]
    fn partial_override_from_file() {
        let s: Settings =
            serde_json::from_str(r#"{"max_frames": 5, "use_imu": true}"#).unwrap();
        assert_eq!(s.max_frames, 5);
        assert!(s.use_imu);
        assert_eq!(s.huber_th, Settings::default().huber_th);
    }
}
