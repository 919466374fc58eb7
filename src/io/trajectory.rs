//! Trajectory export in TUM format.
//!
//! One line per frame: `timestamp tx ty tz qx qy qz qw`, poses expressed
//! in the world frame fixed by the first keyframe.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

use crate::frame::shell::FrameStore;
use crate::geometry::SE3;

/// Output options for [`write_trajectory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TrajectoryOptions {
    /// Only emit keyframe poses.
    pub only_keyframes: bool,
    /// For non-keyframes, recompose the pose through the tracking
    /// reference chain instead of using the stored world pose.
    pub use_tracking_ref: bool,
}

/// Write the pose history to `path`.
///
/// The caller must hold whatever lock guards the frame store; frames with
/// invalid poses are skipped.
pub fn write_trajectory(
    frames: &FrameStore,
    first_pose: &SE3,
    path: &Path,
    options: TrajectoryOptions,
) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating trajectory file {}", path.display()))?;
    let first_inv = first_pose.inverse();

    for shell in frames.iter() {
        if !shell.pose_valid {
            continue;
        }
        if options.only_keyframes && shell.marginalized_at == shell.id.0 {
            continue;
        }

        let cam_to_world = if options.use_tracking_ref && shell.keyframe_id.is_none() {
            match shell.tracking_ref {
                Some(r) => &frames.get(r).cam_to_world * &shell.cam_to_tracking_ref,
                None => shell.cam_to_world.clone(),
            }
        } else {
            shell.cam_to_world.clone()
        };

        let cam_to_first = &first_inv * &cam_to_world;
        let t = cam_to_first.translation;
        let q = cam_to_first.rotation;
        writeln!(
            file,
            "{:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9} {:.9}",
            shell.timestamp, t.x, t.y, t.z, q.i, q.j, q.k, q.w
        )
        .context("writing trajectory line")?;
    }
    Ok(())
}
