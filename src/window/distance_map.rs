//! Half-resolution coverage map used by point activation.
//!
//! Every active point of the window is forward-warped into the newest
//! keyframe; a breadth-first flood then labels each half-res pixel with
//! its distance to the nearest projected point. Activation prefers
//! candidates far from existing coverage.

use nalgebra::{Matrix3, Vector3};

use crate::calib::Calibration;
use crate::window::SlidingWindow;

/// Flood-fill horizon; pixels further than this keep the cap value.
const MAX_BFS_DIST: u32 = 40;

/// Distance-to-coverage map at pyramid level 1.
pub struct CoarseDistanceMap {
    w: usize,
    h: usize,
    dist: Vec<f32>,
    frontier: Vec<usize>,
}

impl CoarseDistanceMap {
    pub fn new(calib: &Calibration) -> Self {
        let w = calib.width(1);
        let h = calib.height(1);
        Self {
            w,
            h,
            dist: vec![MAX_BFS_DIST as f32; w * h],
            frontier: Vec::new(),
        }
    }

    pub fn width(&self) -> usize {
        self.w
    }

    pub fn height(&self) -> usize {
        self.h
    }

    /// Distance value at a half-res pixel.
    pub fn at(&self, u: usize, v: usize) -> f32 {
        self.dist[u + v * self.w]
    }

    /// Rebuild the map by projecting all active points of all window
    /// keyframes except the newest into the newest keyframe.
    pub fn make_distance_map(&mut self, window: &SlidingWindow, calib: &Calibration) {
        self.dist.fill(MAX_BFS_DIST as f32);
        self.frontier.clear();

        let Some(newest) = window.keyframes().last() else {
            return;
        };

        let k1 = level1_k(calib);
        let ki0 = calib.k_inv(0);

        for host in window.keyframes() {
            if host.keyframe_id == newest.keyframe_id {
                continue;
            }
            let host_to_new = &newest.cam_to_world.inverse() * &host.cam_to_world;
            let krki = (k1 * host_to_new.rotation_matrix() * ki0).cast::<f32>();
            let kt = (k1 * host_to_new.translation).cast::<f32>();

            for p in host.active_points.iter() {
                let ptp = krki * Vector3::new(p.u, p.v, 1.0) + kt * p.idepth;
                let u = (ptp.x / ptp.z + 0.5) as i64;
                let v = (ptp.y / ptp.z + 0.5) as i64;
                if u <= 0 || v <= 0 || u >= self.w as i64 - 1 || v >= self.h as i64 - 1 {
                    continue;
                }
                let idx = u as usize + v as usize * self.w;
                if self.dist[idx] > 0.0 {
                    self.dist[idx] = 0.0;
                    self.frontier.push(idx);
                }
            }
        }

        self.grow();
    }

    /// Add a freshly activated point into the map and relax around it.
    pub fn add_into_dist_final(&mut self, u: usize, v: usize) {
        let idx = u + v * self.w;
        self.dist[idx] = 0.0;
        self.frontier.clear();
        self.frontier.push(idx);
        self.grow();
    }

    /// Level-by-level flood from the current frontier: the 4-neighbourhood
    /// every ring, diagonals on even rings.
    fn grow(&mut self) {
        let mut current = std::mem::take(&mut self.frontier);
        let mut next = Vec::new();
        let width = self.w;
        let w = self.w as i64;
        let h = self.h as i64;
        let dist = &mut self.dist;

        for k in 1..MAX_BFS_DIST {
            for &idx in &current {
                let x = (idx % width) as i64;
                let y = (idx / width) as i64;
                let mut push = |nx: i64, ny: i64, next: &mut Vec<usize>| {
                    if nx < 0 || ny < 0 || nx >= w || ny >= h {
                        return;
                    }
                    let nidx = nx as usize + ny as usize * width;
                    if dist[nidx] > k as f32 {
                        dist[nidx] = k as f32;
                        next.push(nidx);
                    }
                };
                push(x + 1, y, &mut next);
                push(x - 1, y, &mut next);
                push(x, y + 1, &mut next);
                push(x, y - 1, &mut next);
                if k % 2 == 0 {
                    push(x + 1, y + 1, &mut next);
                    push(x - 1, y + 1, &mut next);
                    push(x + 1, y - 1, &mut next);
                    push(x - 1, y - 1, &mut next);
                }
            }
            if next.is_empty() {
                break;
            }
            current = std::mem::take(&mut next);
        }
    }
}

/// Level-1 intrinsics as a matrix.
fn level1_k(calib: &Calibration) -> Matrix3<f64> {
    calib.k(1)
}
