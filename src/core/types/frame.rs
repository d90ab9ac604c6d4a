//! Per-sweep records: input bundle, estimate history, registration result.

use nalgebra::{Matrix3, SMatrix, Vector3, Vector6};

use crate::core::se3::Se3;
use crate::core::types::{ImuSample, Point3D, PoseSample};

/// One sweep of input data handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct DataFrame {
    /// File/acquisition timestamp the trajectory is evaluated at (seconds).
    pub timestamp: f64,
    /// Motion-distorted points of the sweep.
    pub pointcloud: Vec<Point3D>,
    /// IMU samples covering the sweep interval.
    pub imu_samples: Vec<ImuSample>,
    /// Optional interleaved pose measurements.
    pub pose_samples: Vec<PoseSample>,
}

/// Estimate record for one processed sweep.
///
/// Poses are sensor-to-world (`T_ms`) split into rotation and translation.
/// The mid state is evaluated at the frame's eval time to line up with
/// ground truth stamps.
#[derive(Debug, Clone)]
pub struct TrajectoryFrame {
    pub begin_timestamp: f64,
    pub end_timestamp: f64,
    /// Timestamp the mid state is evaluated at (the input file stamp).
    pub eval_timestamp: f64,

    /// Down-sampled sweep points, retained until the delayed map update
    /// consumes them.
    pub points: Vec<Point3D>,

    pub begin_r: Matrix3<f64>,
    pub begin_t: Vector3<f64>,
    pub end_r: Matrix3<f64>,
    pub end_t: Vector3<f64>,
    pub mid_pose: Se3,

    /// Body velocity at the eval time.
    pub mid_w: Vector6<f64>,
    /// Body acceleration at the eval time.
    pub mid_dw: Vector6<f64>,
    /// IMU bias at the eval time.
    pub mid_b: Vector6<f64>,
    /// Gravity-frame transform at the eval time.
    pub mid_t_mi: Se3,
    /// Covariance of the (pose, velocity, acceleration) mid state.
    pub mid_state_cov: SMatrix<f64, 18, 18>,

    /// Pose measurements carried from the input bundle.
    pub pose_samples: Vec<PoseSample>,

    /// Whether registration succeeded for this sweep.
    pub success: bool,
}

impl TrajectoryFrame {
    pub fn new(begin_timestamp: f64, end_timestamp: f64, eval_timestamp: f64) -> Self {
        Self {
            begin_timestamp,
            end_timestamp,
            eval_timestamp,
            points: Vec::new(),
            begin_r: Matrix3::identity(),
            begin_t: Vector3::zeros(),
            end_r: Matrix3::identity(),
            end_t: Vector3::zeros(),
            mid_pose: Se3::identity(),
            mid_w: Vector6::zeros(),
            mid_dw: Vector6::zeros(),
            mid_b: Vector6::zeros(),
            mid_t_mi: Se3::identity(),
            mid_state_cov: SMatrix::<f64, 18, 18>::identity(),
            pose_samples: Vec::new(),
            success: true,
        }
    }

    /// Begin pose as a transform.
    pub fn begin_pose(&self) -> Se3 {
        Se3::new(self.begin_r, self.begin_t)
    }

    /// End pose as a transform.
    pub fn end_pose(&self) -> Se3 {
        Se3::new(self.end_r, self.end_t)
    }
}

/// What `register_frame` hands back to the caller.
#[derive(Debug, Clone)]
pub struct RegistrationSummary {
    /// False when the frame was degenerate; the trajectory then carries the
    /// extrapolated initialization and the map was left untouched.
    pub success: bool,
    /// Keypoints in world frame after the final trajectory update.
    pub keypoints: Vec<Point3D>,
    /// Number of point-to-plane residuals used in the last ICP iteration.
    pub num_residuals: usize,
    /// Sensor-to-world rotation at the sweep end.
    pub r_ms: Matrix3<f64>,
    /// Sensor-to-world translation at the sweep end.
    pub t_ms: Vector3<f64>,
}

impl RegistrationSummary {
    pub fn failed() -> Self {
        Self {
            success: false,
            keypoints: Vec::new(),
            num_residuals: 0,
            r_ms: Matrix3::identity(),
            t_ms: Vector3::zeros(),
        }
    }
}
