//! Sequence runner for the odometry engine.
//!
//! Reads a recorded sequence directory:
//!
//! ```text
//! <data_dir>/lidar/<microseconds>.bin     one sweep per file
//! <data_dir>/applanix/imu.csv             IMU samples
//! <data_dir>/applanix/lidar_pose_meas.csv optional pose measurements
//! ```
//!
//! drives the engine frame by frame, and writes the trajectory dump plus
//! the per-frame pose exports.
//!
//! ```bash
//! # With default config
//! cargo run --release -- --data-dir /data/sequence01
//!
//! # With a config file and custom output directory
//! cargo run --release -- --data-dir /data/sequence01 \
//!     --config gati-lio.toml --output-dir out
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::Parser;

use gati_lio::io::TRAJECTORY_RATE_HZ;
use gati_lio::{
    DataFrame, ImuSample, LioOdometry, OdometryConfig, OdometryError, PoseSample, read_imu_csv,
    read_point_bin, read_pose_csv, write_lidar_poses_csv, write_lidar_poses_tum,
    write_trajectory,
};

#[derive(Debug, Parser)]
#[command(name = "gati-lio", about = "Continuous-time LiDAR-inertial odometry")]
struct Args {
    /// Sequence directory containing lidar/ and applanix/.
    #[arg(long)]
    data_dir: PathBuf,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory (overrides the config's output_dir).
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Process at most this many sweeps.
    #[arg(long)]
    max_frames: Option<usize>,
}

fn load_config(path: Option<&Path>) -> Result<OdometryConfig> {
    match path {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: OdometryConfig = basic_toml::from_str(&contents)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        }
        None => Ok(OdometryConfig::default()),
    }
}

/// Sweep files sorted by their microsecond stems.
fn sweep_files(lidar_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(lidar_dir)
        .with_context(|| format!("listing {}", lidar_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "bin"))
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no .bin sweeps under {}", lidar_dir.display());
    }
    Ok(files)
}

/// Samples with timestamps inside `[begin, end]`, assuming `samples` is
/// time-sorted.
fn samples_in_window<T: Copy>(
    samples: &[T],
    timestamp: impl Fn(&T) -> f64,
    begin: f64,
    end: f64,
) -> Vec<T> {
    let start = samples.partition_point(|s| timestamp(s) < begin);
    let stop = samples.partition_point(|s| timestamp(s) <= end);
    samples[start..stop].to_vec()
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.display().to_string();
    }
    let output_dir = PathBuf::from(&config.output_dir);
    fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let files = sweep_files(&args.data_dir.join("lidar"))?;
    let imu_path = args.data_dir.join("applanix").join("imu.csv");
    let imu_samples: Vec<ImuSample> = if config.use_imu {
        read_imu_csv(&imu_path).with_context(|| format!("reading {}", imu_path.display()))?
    } else {
        Vec::new()
    };
    let pose_path = args.data_dir.join("applanix").join("lidar_pose_meas.csv");
    let pose_samples: Vec<PoseSample> = if pose_path.exists() {
        read_pose_csv(&pose_path).with_context(|| format!("reading {}", pose_path.display()))?
    } else {
        Vec::new()
    };

    let mut odometry = LioOdometry::new(config)?;

    let num_frames = args.max_frames.unwrap_or(files.len()).min(files.len());
    log::info!("processing {num_frames} sweeps from {}", args.data_dir.display());

    let mut failed_frames = 0usize;
    for (index, file) in files.iter().take(num_frames).enumerate() {
        let (file_time, points) =
            read_point_bin(file).with_context(|| format!("reading {}", file.display()))?;

        let begin = points.iter().map(|p| p.timestamp).fold(f64::INFINITY, f64::min);
        let end = points
            .iter()
            .map(|p| p.timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        let frame = DataFrame {
            timestamp: file_time,
            pointcloud: points,
            imu_samples: samples_in_window(&imu_samples, |s| s.timestamp, begin, end),
            pose_samples: samples_in_window(&pose_samples, |s| s.timestamp, begin, end),
        };

        match odometry.register_frame(frame) {
            Ok(summary) => {
                log::info!(
                    "frame {index}: {} residuals, position [{:.3} {:.3} {:.3}]",
                    summary.num_residuals,
                    summary.t_ms.x,
                    summary.t_ms.y,
                    summary.t_ms.z
                );
            }
            Err(err @ OdometryError::DegenerateFrame { .. }) => {
                failed_frames += 1;
                log::warn!("{err}; continuing with extrapolated trajectory");
            }
            Err(err) => return Err(err).context("registration failed"),
        }
    }
    if failed_frames > 0 {
        log::warn!("{failed_frames}/{num_frames} frames failed registration");
    }

    // Output artifacts.
    let utc = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let trajectory_path = output_dir.join(format!("trajectory_{utc}.txt"));
    let samples = odometry.sample_trajectory(TRAJECTORY_RATE_HZ)?;
    write_trajectory(&trajectory_path, &samples)
        .with_context(|| format!("writing {}", trajectory_path.display()))?;
    log::info!("wrote {} samples to {}", samples.len(), trajectory_path.display());

    let frames = odometry.trajectory()?;
    write_lidar_poses_csv(&output_dir.join("lidar_poses.csv"), &frames)
        .context("writing lidar_poses.csv")?;
    write_lidar_poses_tum(&output_dir.join("lidar_poses_tum.txt"), &frames)
        .context("writing lidar_poses_tum.txt")?;
    log::info!("done: {} frames, map holds {} points", frames.len(), odometry.map().len());
    Ok(())
}
