//! File formats of recorded sequences and output artifacts.
//!
//! Inputs follow the Applanix-style layout: `lidar/<microseconds>.bin`
//! point files next to `applanix/imu.csv` (and optionally
//! `applanix/lidar_pose_meas.csv`). Outputs are the 100 Hz trajectory dump,
//! a ground-truth-shaped pose CSV, and a TUM-format pose file.

mod applanix;
mod pointcloud;
mod trajectory_writer;

pub use applanix::{
    read_imu_csv, read_pose_csv, write_lidar_poses_csv, write_lidar_poses_tum,
};
pub use pointcloud::{read_point_bin, timestamp_from_stem, write_point_bin};
pub use trajectory_writer::{TRAJECTORY_RATE_HZ, write_trajectory};

use thiserror::Error;

/// Errors raised by the sequence readers and artifact writers.
#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed point file {path}: {reason}")]
    MalformedPointFile { path: String, reason: String },

    #[error("malformed csv {path}: {reason}")]
    MalformedCsv { path: String, reason: String },
}

impl SequenceError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
