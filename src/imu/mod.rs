//! Inertial integration contract.
//!
//! The front-end consumes inertial information through this narrow trait:
//! pose hints for coarse tracking, the prepared-keyframe protocol that
//! keeps preintegration aligned with keyframe creation, and the gravity
//! estimate used to fix the world frame. The heavy preintegration and
//! bundle-adjustment coupling live behind the trait; [`NoImu`] is the
//! vision-only implementation.

use nalgebra::Vector3;

use crate::frame::shell::{FrameId, FrameShell};
use crate::geometry::SE3;

/// One inertial sample: angular velocity and linear acceleration in the
/// body frame.
#[derive(Debug, Clone, Copy)]
pub struct ImuSample {
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Gyroscope reading (rad/s).
    pub gyro: Vector3<f64>,
    /// Accelerometer reading (m/s²).
    pub accel: Vector3<f64>,
}

/// Contract to the inertial subsystem.
pub trait ImuIntegration: Send {
    /// Feed the samples between the previous and current frame into the
    /// bundle-adjustment preintegration.
    fn add_imu_data_to_ba(&mut self, samples: &[ImuSample]);

    /// Feed samples for coarse tracking; returns a reference-to-frame
    /// pose hint once the coarse inertial graph is initialised.
    fn add_imu_data(
        &mut self,
        samples: &[ImuSample],
        frame: FrameId,
        timestamp: f64,
        ref_changed: bool,
        last_ref: Option<FrameId>,
    ) -> Option<SE3>;

    /// Announce that a frame will become a keyframe.
    fn prepare_keyframe(&mut self, frame: FrameId);
    /// The currently prepared keyframe, if any.
    fn prepared_keyframe(&self) -> Option<FrameId>;
    /// Whether the prepared keyframe has been created by the mapper.
    fn prepared_keyframe_created(&self) -> bool;
    /// The prepared keyframe was skipped by the catch-up policy.
    fn skip_prepared_keyframe(&mut self);
    /// A keyframe was created for the given frame.
    fn keyframe_created(&mut self, frame: FrameId);

    /// Coarse tracking for a frame finished.
    fn finish_coarse_tracking(&mut self, shell: &FrameShell, makes_keyframe: bool);
    /// Keyframe optimisation finished; returns whether the inertial state
    /// is ready (scale observable).
    fn finish_keyframe_optimization(&mut self, frame: FrameId) -> bool;
    /// Rebase the coarse inertial graph onto a new reference keyframe.
    fn init_coarse_graph(&mut self) -> SE3;

    fn coarse_initialized(&self) -> bool;
    /// Metric scale estimate of the coarse graph.
    fn coarse_scale(&self) -> f64;

    /// Feed samples to the gravity initialiser during visual
    /// initialisation; returns the current imu-to-world estimate.
    fn gravity_measure(&mut self, samples: &[ImuSample]) -> SE3;
}

/// Vision-only stand-in: produces no hints and never initialises.
pub struct NoImu {
    prepared: Option<FrameId>,
    prepared_created: bool,
}

impl NoImu {
    pub fn new() -> Self {
        Self {
            prepared: None,
            prepared_created: true,
        }
    }
}

impl Default for NoImu {
    fn default() -> Self {
        Self::new()
    }
}

impl ImuIntegration for NoImu {
    fn add_imu_data_to_ba(&mut self, _samples: &[ImuSample]) {}

    fn add_imu_data(
        &mut self,
        _samples: &[ImuSample],
        _frame: FrameId,
        _timestamp: f64,
        _ref_changed: bool,
        _last_ref: Option<FrameId>,
    ) -> Option<SE3> {
        None
    }

    fn prepare_keyframe(&mut self, frame: FrameId) {
        self.prepared = Some(frame);
        self.prepared_created = false;
    }

    fn prepared_keyframe(&self) -> Option<FrameId> {
        self.prepared
    }

    fn prepared_keyframe_created(&self) -> bool {
        self.prepared_created
    }

    fn skip_prepared_keyframe(&mut self) {
        self.prepared = None;
        self.prepared_created = true;
    }

    fn keyframe_created(&mut self, frame: FrameId) {
        if self.prepared == Some(frame) {
            self.prepared_created = true;
        }
    }

    fn finish_coarse_tracking(&mut self, _shell: &FrameShell, _makes_keyframe: bool) {}

    fn finish_keyframe_optimization(&mut self, _frame: FrameId) -> bool {
        false
    }

    fn init_coarse_graph(&mut self) -> SE3 {
        SE3::identity()
    }

    fn coarse_initialized(&self) -> bool {
        false
    }

    fn coarse_scale(&self) -> f64 {
        1.0
    }

    fn gravity_measure(&mut self, _samples: &[ImuSample]) -> SE3 {
        SE3::identity()
    }
}
