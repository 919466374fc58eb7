//! Dataset input and trajectory output.

pub mod dataset;
pub mod trajectory;

pub use dataset::MonoDataset;
pub use trajectory::{write_trajectory, TrajectoryOptions};
