use anyhow::Result;
use tracing::{info, warn};

use dvio::io::{write_trajectory, MonoDataset, TrajectoryOptions};
use dvio::settings::Settings;
use dvio::system::{ImageInput, OdometrySystem};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let dataset_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/sequence_01".to_string());
    let output_path = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "trajectory.txt".to_string());

    let dataset = MonoDataset::new(&dataset_path)?;
    info!(
        frames = dataset.len(),
        gamma = dataset.gamma_inv.is_some(),
        "loaded dataset from {dataset_path}"
    );

    let settings = Settings::default();
    let mut system = OdometrySystem::new(dataset.calibration.clone(), settings.clone());

    for i in 0..dataset.len() {
        let entry = dataset.frames[i].clone();
        let pixels = dataset.load_frame(i)?;

        system.process_frame(&ImageInput {
            pixels: &pixels,
            exposure: entry.exposure,
            timestamp: entry.timestamp,
            incoming_id: i,
            imu_samples: &[],
        })?;

        if system.is_lost() {
            warn!(frame = i, "tracking lost; stopping");
            break;
        }
        if system.full_reset_requested() || system.init_failed() {
            warn!(frame = i, "restarting the system");
            system.shutdown();
            system = OdometrySystem::new(dataset.calibration.clone(), settings.clone());
        }
    }

    system.shutdown();

    let shared = system.shared();
    let frames = shared.frames.lock();
    let first_pose = shared.first_pose.lock().clone();
    write_trajectory(
        &frames,
        &first_pose,
        std::path::Path::new(&output_path),
        TrajectoryOptions::default(),
    )?;
    info!(
        frames = frames.len(),
        "wrote trajectory to {output_path}"
    );

    Ok(())
}
