//! GatiLIO - Continuous-time LiDAR-inertial odometry
//!
//! Ingests motion-distorted LiDAR sweeps with interleaved IMU samples and
//! estimates a continuous 6-DoF trajectory plus a persistent voxel map. The
//! estimator couples a white-noise-on-jerk or Singer trajectory prior with
//! point-to-plane registration residuals, IMU residuals on interpolated
//! states, and sliding-window marginalization.
//!
//! # Architecture
//!
//! The crate is organized into 5 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Sequence files
//! │       (point bins, applanix csv, trajectory)        │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │         (odometry driver, sliding window)           │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                  algorithms/                        │  ← Core algorithms
//! │        (voxel map, matching, trajectory)            │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                   sensors/                          │  ← Sweep processing
//! │              (subsample, de-skew)                   │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                 (se3, types)                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipeline
//!
//! Per incoming sweep: voxel subsample and de-skew → knot creation for the
//! new interval → ICP loop (associate against the map, Gauss-Newton solve)
//! → sliding-window solve with marginalization → delayed map update with
//! motion-corrected points.

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Sweep processing (depends on core)
// ============================================================================
pub mod sensors;

// ============================================================================
// Layer 3: Algorithms (depends on core, sensors)
// ============================================================================
pub mod algorithms;

// ============================================================================
// Layer 4: Estimation engine (depends on core, sensors, algorithms)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 5: Sequence I/O (depends on all layers)
// ============================================================================
pub mod io;

// ============================================================================
// Crosscutting: configuration and errors
// ============================================================================
pub mod config;
pub mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use crate::core::se3::Se3;
pub use crate::core::types::{
    DataFrame, ImuSample, Point3D, PoseSample, RegistrationSummary, TrajectoryFrame, VoxelKey,
};

// Configuration and errors
pub use config::{OdometryConfig, P2pLossFunc, TrajectoryPriorKind};
pub use error::OdometryError;

// Algorithms
pub use algorithms::mapping::{VoxelMap, VoxelMapConfig};
pub use algorithms::matching::{Neighborhood, RobustLoss, compute_neighborhood};
pub use algorithms::trajectory::{InterpolatedState, KnotState, MotionPrior};

// Engine
pub use engine::odometry::{LioOdometry, TrajectoryKnot, TrajectorySample};

// I/O
pub use io::{
    SequenceError, read_imu_csv, read_point_bin, read_pose_csv, write_lidar_poses_csv,
    write_lidar_poses_tum, write_point_bin, write_trajectory,
};
