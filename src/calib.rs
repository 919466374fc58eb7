//! Camera calibration: pinhole intrinsics per pyramid level and the
//! photometric gamma response.

use nalgebra::Matrix3;

/// Maximum number of pyramid levels the system will build.
pub const PYR_LEVELS: usize = 6;

/// Pinhole intrinsics for every pyramid level plus the gamma response.
///
/// Level 0 is full resolution; each level halves the image. The forward
/// gamma `g` is inferred from the caller-supplied inverse response `g_inv`
/// by piecewise-linear inversion.
#[derive(Debug, Clone)]
pub struct Calibration {
    levels: usize,
    w: [usize; PYR_LEVELS],
    h: [usize; PYR_LEVELS],
    fx: [f64; PYR_LEVELS],
    fy: [f64; PYR_LEVELS],
    cx: [f64; PYR_LEVELS],
    cy: [f64; PYR_LEVELS],
    g_inv: [f32; 256],
    g: [f32; 256],
}

impl Calibration {
    /// Build per-level intrinsics from the level-0 camera parameters.
    ///
    /// The number of levels is capped by [`PYR_LEVELS`] and by the first
    /// level whose dimensions would no longer halve evenly down to a
    /// sensible minimum size.
    pub fn new(width: usize, height: usize, fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        let mut levels = 1;
        let (mut lw, mut lh) = (width, height);
        while levels < PYR_LEVELS && lw % 2 == 0 && lh % 2 == 0 && lw / 2 >= 16 && lh / 2 >= 16 {
            lw /= 2;
            lh /= 2;
            levels += 1;
        }

        let mut calib = Self {
            levels,
            w: [0; PYR_LEVELS],
            h: [0; PYR_LEVELS],
            fx: [0.0; PYR_LEVELS],
            fy: [0.0; PYR_LEVELS],
            cx: [0.0; PYR_LEVELS],
            cy: [0.0; PYR_LEVELS],
            g_inv: identity_response(),
            g: identity_response(),
        };
        for l in 0..levels {
            let s = 1 << l;
            calib.w[l] = width / s;
            calib.h[l] = height / s;
            calib.fx[l] = fx / s as f64;
            calib.fy[l] = fy / s as f64;
            // The +0.5/-0.5 keeps pixel centers aligned across levels.
            calib.cx[l] = (cx + 0.5) / s as f64 - 0.5;
            calib.cy[l] = (cy + 0.5) / s as f64 - 0.5;
        }
        calib
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    pub fn width(&self, level: usize) -> usize {
        self.w[level]
    }

    pub fn height(&self, level: usize) -> usize {
        self.h[level]
    }

    pub fn fx(&self, level: usize) -> f64 {
        self.fx[level]
    }

    pub fn fy(&self, level: usize) -> f64 {
        self.fy[level]
    }

    pub fn cx(&self, level: usize) -> f64 {
        self.cx[level]
    }

    pub fn cy(&self, level: usize) -> f64 {
        self.cy[level]
    }

    /// The 3×3 intrinsic matrix at a level.
    pub fn k(&self, level: usize) -> Matrix3<f64> {
        Matrix3::new(
            self.fx[level],
            0.0,
            self.cx[level],
            0.0,
            self.fy[level],
            self.cy[level],
            0.0,
            0.0,
            1.0,
        )
    }

    /// Inverse of the intrinsic matrix at a level.
    pub fn k_inv(&self, level: usize) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx[level],
            0.0,
            -self.cx[level] / self.fx[level],
            0.0,
            1.0 / self.fy[level],
            -self.cy[level] / self.fy[level],
            0.0,
            0.0,
            1.0,
        )
    }

    /// Install the inverse gamma response and infer the forward response.
    ///
    /// The forward response is found per output intensity by scanning for
    /// the bracketing pair in `g_inv` and interpolating linearly, with the
    /// endpoints pinned to 0 and 255.
    pub fn set_gamma(&mut self, g_inv: &[f32; 256]) {
        self.g_inv = *g_inv;

        for i in 1..255usize {
            for s in 1..255usize {
                if g_inv[s] <= i as f32 && g_inv[s + 1] >= i as f32 {
                    self.g[i] = s as f32 + (i as f32 - g_inv[s]) / (g_inv[s + 1] - g_inv[s]);
                    break;
                }
            }
        }
        self.g[0] = 0.0;
        self.g[255] = 255.0;
    }

    /// Historical entry point for the pre-rectification calibration; the
    /// original front-end never implemented a body for it.
    pub fn set_original_calib(&mut self, _calib: &[f32], _width: usize, _height: usize) {}

    pub fn g_inv(&self) -> &[f32; 256] {
        &self.g_inv
    }

    pub fn g(&self) -> &[f32; 256] {
        &self.g
    }
}

fn identity_response() -> [f32; 256] {
    let mut r = [0.0f32; 256];
    for (i, v) in r.iter_mut().enumerate() {
        *v = i as f32;
    }
    r
}
