//! Core data types shared across the pipeline.

mod frame;
mod imu;
mod point;

pub use frame::{DataFrame, RegistrationSummary, TrajectoryFrame};
pub use imu::{ImuSample, PoseSample};
pub use point::{Point3D, VoxelKey};
