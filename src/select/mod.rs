//! Pixel selection contract and the built-in gradient-grid selector.
//!
//! The selector marks pixels worth turning into immature points. The
//! returned map holds 0 for unselected pixels and a positive point-type
//! score otherwise; the score scales the activation coverage radius, so
//! pixels picked at coarser potentials count as "rarer" selections.

use crate::frame::pyramid::FramePyramid;

/// Contract for pixel selection on a new keyframe.
pub trait PixelSelector: Send {
    /// Fill `map` (full resolution, row major) with selection scores,
    /// aiming for roughly `density` selected pixels. Returns the number
    /// selected.
    fn make_maps(&mut self, frame: &FramePyramid, density: f32, map: &mut [f32]) -> usize;
}

/// Block-wise maximum-gradient selection with three potential tiers.
///
/// The image is scanned in blocks; the strongest gradient in each block
/// is selected if it clears a threshold. The block size adapts between
/// calls so the yield tracks the requested density.
pub struct GradientGridSelector {
    block: usize,
    gradient_th: f32,
}

impl GradientGridSelector {
    pub fn new() -> Self {
        Self {
            block: 4,
            gradient_th: 7.0,
        }
    }

    fn select_at_potential(
        &self,
        frame: &FramePyramid,
        potential: usize,
        score: f32,
        map: &mut [f32],
    ) -> usize {
        let lvl = frame.level(0);
        let block = self.block * potential;
        let th2 = self.gradient_th * self.gradient_th * potential as f32;
        let mut selected = 0usize;

        let mut by = 2;
        while by + block < lvl.h - 2 {
            let mut bx = 2;
            while bx + block < lvl.w - 2 {
                let mut best = 0.0f32;
                let mut best_idx = None;
                for y in by..by + block {
                    for x in bx..bx + block {
                        let idx = x + y * lvl.w;
                        if map[idx] != 0.0 {
                            continue;
                        }
                        let g = &lvl.idg[idx];
                        let mag = g[1] * g[1] + g[2] * g[2];
                        if mag > th2 && mag > best {
                            best = mag;
                            best_idx = Some(idx);
                        }
                    }
                }
                if let Some(idx) = best_idx {
                    map[idx] = score;
                    selected += 1;
                }
                bx += block;
            }
            by += block;
        }
        selected
    }
}

impl Default for GradientGridSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl PixelSelector for GradientGridSelector {
    fn make_maps(&mut self, frame: &FramePyramid, density: f32, map: &mut [f32]) -> usize {
        map.fill(0.0);
        let mut n = self.select_at_potential(frame, 1, 1.0, map);
        // Sweep coarser potentials to pick up weak-texture regions.
        n += self.select_at_potential(frame, 2, 2.0, map);
        n += self.select_at_potential(frame, 4, 4.0, map);

        // Adapt the block size towards the requested density.
        if (n as f32) < density * 0.7 && self.block > 2 {
            self.block -= 1;
        } else if (n as f32) > density * 1.3 && self.block < 16 {
            self.block += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calib::Calibration;

    fn textured_pyramid() -> FramePyramid {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        let mut img = vec![0.0f32; 64 * 48];
        for y in 0..48 {
            for x in 0..64 {
                img[x + y * 64] = 60.0 * (0.7 * x as f32).sin() + 60.0 * (0.5 * y as f32).cos();
            }
        }
        FramePyramid::build(&img, &calib)
    }

    fn flat_pyramid() -> FramePyramid {
        let calib = Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5);
        FramePyramid::build(&vec![42.0f32; 64 * 48], &calib)
    }

    #[test]
    fn textured_image_yields_selections() {
        let mut sel = GradientGridSelector::new();
        let pyr = textured_pyramid();
        let mut map = vec![0.0f32; 64 * 48];
        let n = sel.make_maps(&pyr, 100.0, &mut map);
        assert!(n > 20, "selected only {}", n);
        assert_eq!(map.iter().filter(|&&s| s > 0.0).count(), n);
    }

    #[test]
    fn flat_image_yields_nothing() {
        let mut sel = GradientGridSelector::new();
        let pyr = flat_pyramid();
        let mut map = vec![0.0f32; 64 * 48];
        assert_eq!(sel.make_maps(&pyr, 100.0, &mut map), 0);
    }

    #[test]
    fn scores_are_potential_tiers() {
        let mut sel = GradientGridSelector::new();
        let pyr = textured_pyramid();
        let mut map = vec![0.0f32; 64 * 48];
        sel.make_maps(&pyr, 100.0, &mut map);
        for &s in map.iter().filter(|&&s| s > 0.0) {
            assert!(s == 1.0 || s == 2.0 || s == 4.0);
        }
    }
}
