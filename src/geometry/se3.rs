//! Rigid body transforms and their Lie algebra.
//!
//! Poses are stored as a rotation quaternion plus a translation vector.
//! The exponential and logarithm maps are needed by the motion-model
//! hypothesis generation (half-motion seeds interpolate in the tangent
//! space) and follow Ethan Eade's closed forms.

use nalgebra::{Matrix3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// A rigid body transform (element of SE(3)).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation and a translation.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Pure rotation transform.
    pub fn from_rotation(rotation: UnitQuaternion<f64>) -> Self {
        Self {
            rotation,
            translation: Vector3::zeros(),
        }
    }

    /// The inverse transform.
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation part as a 3×3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// True when every entry of the transform is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|x| x.is_finite())
            && self.rotation.as_vector().iter().all(|x| x.is_finite())
    }

    /// Exponential map from a twist `(v, ω)` to a transform.
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let v = Vector3::new(xi[0], xi[1], xi[2]);
        let w = Vector3::new(xi[3], xi[4], xi[5]);
        let theta_2 = w.norm_squared();
        let (omega, omega_2) = (so3::hat(&w), so3::hat_2(&w));

        let (coef_omega, coef_omega_2) = if theta_2 < so3::SMALL_ANGLE_THRESHOLD {
            (0.5 - theta_2 / 24.0, 1.0 / 6.0 - theta_2 / 120.0)
        } else {
            let theta = theta_2.sqrt();
            (
                (1.0 - theta.cos()) / theta_2,
                (theta - theta.sin()) / (theta * theta_2),
            )
        };
        let v_mat = Matrix3::identity() + coef_omega * omega + coef_omega_2 * omega_2;

        Self {
            rotation: UnitQuaternion::from_scaled_axis(w),
            translation: v_mat * v,
        }
    }

    /// Logarithm map, the inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let w = self.rotation.scaled_axis();
        let theta_2 = w.norm_squared();
        let (omega, omega_2) = (so3::hat(&w), so3::hat_2(&w));

        let coef_omega_2 = if theta_2 < so3::SMALL_ANGLE_THRESHOLD {
            1.0 / 12.0 + theta_2 / 720.0
        } else {
            let theta = theta_2.sqrt();
            let half = 0.5 * theta;
            (1.0 - half * half.cos() / half.sin()) / theta_2
        };
        let v_inv = Matrix3::identity() - 0.5 * omega + coef_omega_2 * omega_2;
        let v = v_inv * self.translation;

        Vector6::new(v[0], v[1], v[2], w[0], w[1], w[2])
    }
}

impl std::ops::Mul<&SE3> for &SE3 {
    type Output = SE3;

    fn mul(self, rhs: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * rhs.rotation,
            translation: self.rotation * rhs.translation + self.translation,
        }
    }
}

impl std::ops::Mul<SE3> for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        &self * &rhs
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(0.5, -1.0, 2.0),
        )
    }

    #[test]
    fn identity_log_is_zero() {
        assert_eq!(SE3::identity().log(), Vector6::zeros());
    }

    #[test]
    fn exp_log_round_trip() {
        let xi = Vector6::new(0.1, -0.3, 0.7, 0.02, -0.05, 0.04);
        let back = SE3::exp(&xi).log();
        assert_relative_eq!(xi, back, epsilon = 1e-10);
    }

    #[test]
    fn log_exp_round_trip() {
        let pose = sample_pose();
        let back = SE3::exp(&pose.log());
        assert_relative_eq!(pose.translation, back.translation, epsilon = 1e-10);
        assert!(pose.rotation.angle_to(&back.rotation) < 1e-10);
    }

    #[test]
    fn inverse_composes_to_identity() {
        let pose = sample_pose();
        let id = &pose * &pose.inverse();
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert!(id.rotation.angle() < 1e-12);
    }

    #[test]
    fn transform_point_matches_matrix_form() {
        let pose = sample_pose();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let expected = pose.rotation_matrix() * p + pose.translation;
        assert_relative_eq!(pose.transform_point(&p), expected, epsilon = 1e-12);
    }
}
