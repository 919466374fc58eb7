//! SO(3) helpers shared by the SE(3) exponential and logarithm maps.

use nalgebra::{Matrix3, Vector3};

/// Small angle threshold for switching to Taylor expansions.
pub const SMALL_ANGLE_THRESHOLD: f64 = 1e-6;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Squared skew matrix [v]×², written out directly to avoid a matrix product.
#[inline]
#[rustfmt::skip]
pub fn hat_2(v: &Vector3<f64>) -> Matrix3<f64> {
    let (x, y, z) = (v.x, v.y, v.z);
    Matrix3::new(
        -y * y - z * z, x * y,          x * z,
        x * y,          -x * x - z * z, y * z,
        x * z,          y * z,          -x * x - y * y,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hat_is_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-0.5, 4.0, 0.25);
        let cross = v.cross(&u);
        assert!((hat(&v) * u - cross).norm() < 1e-12);
    }

    #[test]
    fn hat_2_matches_squared_hat() {
        let v = Vector3::new(0.3, -0.7, 1.1);
        let direct = hat(&v) * hat(&v);
        assert!((hat_2(&v) - direct).norm() < 1e-12);
    }
}
