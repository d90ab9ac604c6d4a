//! Inertial and pose measurement samples.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::core::se3::Se3;

/// One accelerometer + gyroscope sample in the robot body frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImuSample {
    /// Absolute timestamp (seconds).
    pub timestamp: f64,
    /// Specific force measurement (m/s²).
    pub lin_acc: Vector3<f64>,
    /// Angular rate measurement (rad/s).
    pub ang_vel: Vector3<f64>,
}

/// An externally supplied sensor-to-world pose observation.
///
/// Carried through the frame record for downstream consumers; the estimator
/// itself attaches no residual to these.
#[derive(Debug, Clone, Copy)]
pub struct PoseSample {
    /// Absolute timestamp (seconds).
    pub timestamp: f64,
    /// Sensor pose in the world frame.
    pub t_ms: Se3,
}
