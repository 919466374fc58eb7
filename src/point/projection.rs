//! Shared projection helpers for the photometric hot paths.

use nalgebra::{Matrix3, Vector3};

use crate::calib::Calibration;

/// Margin kept to the image border so bilinear pattern lookups stay valid.
const BORDER: f32 = 1.1;

/// Project a host pixel at a given inverse depth with precomposed
/// `K·R·K⁻¹` and `K·t`. Returns the target pixel if it lands safely inside
/// the image.
#[inline]
pub fn project_composed(
    u: f32,
    v: f32,
    idepth: f32,
    krki: &Matrix3<f32>,
    kt: &Vector3<f32>,
    w: usize,
    h: usize,
) -> Option<(f32, f32)> {
    let ptp = krki * Vector3::new(u, v, 1.0) + kt * idepth;
    let ku = ptp.x / ptp.z;
    let kv = ptp.y / ptp.z;
    (ku > BORDER && kv > BORDER && ku < w as f32 - 3.0 && kv < h as f32 - 3.0).then_some((ku, kv))
}

/// Full projection of a pattern pixel, returning the normalised target
/// coordinates and the depth rescaling needed for derivatives.
pub struct Projected {
    /// `1 / z_target`; positive for points in front of the camera.
    pub drescale: f32,
    /// Normalised image coordinates in the target frame.
    pub u: f32,
    pub v: f32,
    /// Pixel coordinates in the target frame.
    pub ku: f32,
    pub kv: f32,
    /// Inverse depth as seen from the target frame.
    pub new_idepth: f32,
}

/// Project host pixel `(u+dx, v+dy)` at `idepth` through rotation `rt` and
/// translation `t` (camera frame, not K-composed).
#[inline]
pub fn project_pattern(
    u: f32,
    v: f32,
    idepth: f32,
    dx: i32,
    dy: i32,
    calib: &Calibration,
    rt: &Matrix3<f32>,
    t: &Vector3<f32>,
) -> Option<Projected> {
    let fx = calib.fx(0) as f32;
    let fy = calib.fy(0) as f32;
    let cx = calib.cx(0) as f32;
    let cy = calib.cy(0) as f32;

    let klip = Vector3::new(
        (u + dx as f32 - cx) / fx,
        (v + dy as f32 - cy) / fy,
        1.0,
    );
    let ptp = rt * klip + t * idepth;
    let drescale = 1.0 / ptp.z;
    if drescale <= 0.0 {
        return None;
    }

    let un = ptp.x * drescale;
    let vn = ptp.y * drescale;
    let ku = un * fx + cx;
    let kv = vn * fy + cy;
    let w = calib.width(0) as f32;
    let h = calib.height(0) as f32;
    if !(ku > BORDER && kv > BORDER && ku < w - 3.0 && kv < h - 3.0) {
        return None;
    }

    Some(Projected {
        drescale,
        u: un,
        v: vn,
        ku,
        kv,
        new_idepth: idepth * drescale,
    })
}

/// Derivative of the projected pixel w.r.t. the host inverse depth,
/// contracted with the image gradient `(dx_interp, dy_interp)` (gradient
/// already scaled by the focal lengths).
#[inline]
pub fn derive_idepth(
    t: &Vector3<f32>,
    u: f32,
    v: f32,
    dx_interp: f32,
    dy_interp: f32,
    drescale: f32,
) -> f32 {
    (dx_interp * (t.x - t.z * u) + dy_interp * (t.y - t.z * v)) * drescale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_projection_round_trips_pixels() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let krki = Matrix3::identity();
        let kt = Vector3::zeros();
        for &(u, v) in &[(10.0f32, 10.0f32), (31.5, 23.5), (50.2, 40.9)] {
            for idepth in [0.1f32, 1.0, 5.0] {
                let (ku, kv) = project_composed(u, v, idepth, &krki, &kt, 64, 48).unwrap();
                assert!((ku - u).abs() < 1e-4, "u: {} vs {}", ku, u);
                assert!((kv - v).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn pattern_projection_identity_preserves_idepth() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let p = project_pattern(
            20.0,
            20.0,
            0.5,
            1,
            -1,
            &calib,
            &Matrix3::identity(),
            &Vector3::zeros(),
        )
        .unwrap();
        assert!((p.new_idepth - 0.5).abs() < 1e-6);
        assert!((p.ku - 21.0).abs() < 1e-4);
        assert!((p.kv - 19.0).abs() < 1e-4);
    }

    #[test]
    fn joint_rescale_of_depth_and_baseline_is_invariant() {
        // Scaling all inverse depths by s and the translation by 1/s
        // leaves every projection (and with it the frame residuals)
        // unchanged.
        let krki = Matrix3::identity();
        let kt = Vector3::new(6.0, -2.0, 0.1);
        let s = 3.7f32;
        for &(u, v, idepth) in &[(20.0f32, 20.0f32, 0.5f32), (40.0, 30.0, 1.2)] {
            let (ku, kv) = project_composed(u, v, idepth, &krki, &kt, 64, 48).unwrap();
            let (ku_s, kv_s) =
                project_composed(u, v, idepth * s, &krki, &(kt / s), 64, 48).unwrap();
            assert!((ku - ku_s).abs() < 1e-4);
            assert!((kv - kv_s).abs() < 1e-4);
        }
    }

    #[test]
    fn projection_behind_camera_is_rejected() {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let t = Vector3::new(0.0, 0.0, -3.0);
        assert!(project_pattern(20.0, 20.0, 1.0, 0, 0, &calib, &Matrix3::identity(), &t).is_none());
    }
}
