//! Point types: immature candidates, active landmarks and their residuals.

pub mod active;
pub mod immature;
pub mod pattern;
pub mod projection;
pub mod residual;

pub use active::{ActivePoint, PointStatus};
pub use immature::{DepthInterval, ImmaturePoint, TempResidual, TraceStatus};
pub use residual::{PointResidual, ResState};
