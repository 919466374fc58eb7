//! Monocular sequence reader.
//!
//! Expects a dataset directory with:
//! - `images/` — grayscale frames named so lexicographic order is
//!   temporal order,
//! - `times.txt` — per frame `id timestamp [exposure]`,
//! - `camera.txt` — `fx fy cx cy width height` (plain, one line),
//! - `pcalib.txt` — optional 256-entry inverse photometric response.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::warn;

use crate::calib::Calibration;

#[derive(Debug, Deserialize)]
struct TimesRecord {
    _id: String,
    timestamp: f64,
    exposure: Option<f32>,
}

/// One frame's metadata.
#[derive(Debug, Clone)]
pub struct FrameEntry {
    pub path: PathBuf,
    pub timestamp: f64,
    pub exposure: f32,
}

/// A monocular image sequence with calibration.
pub struct MonoDataset {
    pub frames: Vec<FrameEntry>,
    pub calibration: Calibration,
    /// Inverse photometric response, if provided.
    pub gamma_inv: Option<[f32; 256]>,
}

impl MonoDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();

        let calibration = load_camera(&root.join("camera.txt"))?;
        let mut calibration = calibration;

        let gamma_inv = match load_pcalib(&root.join("pcalib.txt")) {
            Ok(g) => Some(g),
            Err(e) => {
                warn!("no photometric calibration: {e}. Continuing without it.");
                None
            }
        };
        if let Some(g) = &gamma_inv {
            calibration.set_gamma(g);
        }

        let mut image_paths: Vec<PathBuf> = std::fs::read_dir(root.join("images"))
            .with_context(|| format!("listing images in {}", root.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        image_paths.sort();

        let times = load_times(&root.join("times.txt"))?;
        if times.len() != image_paths.len() {
            bail!(
                "times.txt has {} entries but {} images were found",
                times.len(),
                image_paths.len()
            );
        }

        let frames = image_paths
            .into_iter()
            .zip(times)
            .map(|(path, rec)| FrameEntry {
                path,
                timestamp: rec.timestamp,
                exposure: rec.exposure.unwrap_or(1.0),
            })
            .collect();

        Ok(Self {
            frames,
            calibration,
            gamma_inv,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Load one frame as grayscale float intensities (0..255 range).
    pub fn load_frame(&self, idx: usize) -> Result<Vec<f32>> {
        let entry = self
            .frames
            .get(idx)
            .with_context(|| format!("no frame at index {idx}"))?;
        let img = image::open(&entry.path)
            .with_context(|| format!("decoding {}", entry.path.display()))?
            .into_luma8();

        let w = self.calibration.width(0) as u32;
        let h = self.calibration.height(0) as u32;
        if img.width() != w || img.height() != h {
            bail!(
                "image {} is {}x{} but calibration says {}x{}",
                entry.path.display(),
                img.width(),
                img.height(),
                w,
                h
            );
        }

        Ok(img.pixels().map(|p| p.0[0] as f32).collect())
    }
}

fn load_times(path: &Path) -> Result<Vec<TimesRecord>> {
    let file =
        File::open(path).with_context(|| format!("opening times file {}", path.display()))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b' ')
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(file);

    let mut records = Vec::new();
    for record in reader.deserialize() {
        let record: TimesRecord = record.context("parsing times.txt record")?;
        records.push(record);
    }
    Ok(records)
}

fn load_camera(path: &Path) -> Result<Calibration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("opening camera file {}", path.display()))?;
    let values: Vec<f64> = content
        .split_whitespace()
        .take(6)
        .map(|v| v.parse().context("parsing camera.txt value"))
        .collect::<Result<_>>()?;
    if values.len() != 6 {
        bail!("camera.txt needs `fx fy cx cy width height`");
    }
    Ok(Calibration::new(
        values[4] as usize,
        values[5] as usize,
        values[0],
        values[1],
        values[2],
        values[3],
    ))
}

fn load_pcalib(path: &Path) -> Result<[f32; 256]> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("opening photometric calibration {}", path.display()))?;
    let values: Vec<f32> = content
        .split_whitespace()
        .map(|v| v.parse().context("parsing pcalib.txt value"))
        .collect::<Result<_>>()?;
    if values.len() != 256 {
        bail!("pcalib.txt needs exactly 256 values, got {}", values.len());
    }
    let mut gamma = [0.0f32; 256];
    gamma.copy_from_slice(&values);
    Ok(gamma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, content: &str) {
        let mut f = File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn camera_file_round_trips() {
        let dir = std::env::temp_dir().join("dvio_dataset_cam");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("camera.txt");
        write_file(&path, "500.0 510.0 320.0 240.0 640 480\n");
        let calib = load_camera(&path).unwrap();
        assert_eq!(calib.width(0), 640);
        assert!((calib.fx(0) - 500.0).abs() < 1e-9);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn times_file_parses_with_and_without_exposure() {
        let dir = std::env::temp_dir().join("dvio_dataset_times");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("times.txt");
        write_file(&path, "000001 0.0 5.0\n000002 0.05\n");
        let times = load_times(&path).unwrap();
        assert_eq!(times.len(), 2);
        assert_eq!(times[0].exposure, Some(5.0));
        assert_eq!(times[1].exposure, None);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn pcalib_requires_256_values() {
        let dir = std::env::temp_dir().join("dvio_dataset_pcalib");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pcalib.txt");
        write_file(&path, "0.0 1.0 2.0\n");
        assert!(load_pcalib(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
