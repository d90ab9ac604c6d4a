//! Engine configuration.
//!
//! One flat struct carries every recognized option so a TOML file (or the
//! defaults) fully determines a run. Defaults follow the reference tuning
//! for automotive-scale LiDAR.

use serde::Deserialize;

use crate::core::se3::Se3;
use crate::error::OdometryError;
use nalgebra::{Matrix4, Vector6};

/// Robust loss applied to point-to-plane residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum P2pLossFunc {
    L2,
    Dcs,
    #[default]
    Cauchy,
    GemanMcClure,
}

/// Which continuous-time motion prior drives the trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TrajectoryPriorKind {
    /// White-noise-on-jerk (constant-acceleration Gauss-Markov).
    WhiteNoiseOnJerk,
    /// Mean-reverting acceleration with per-axis correlation times.
    #[default]
    Singer,
}

/// All recognized odometry options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OdometryConfig {
    // --- map ---
    /// Voxel edge length of the working frame subsample (meters).
    pub voxel_size: f64,
    /// Frame subsample voxel size for the first `init_num_frames` sweeps.
    pub init_voxel_size: f64,
    /// Keypoint subsample voxel size.
    pub sample_voxel_size: f64,
    /// Keypoint subsample voxel size for the first `init_num_frames` sweeps.
    pub init_sample_voxel_size: f64,
    /// Voxel edge length of the persistent map (meters).
    pub size_voxel_map: f64,
    /// Minimum spacing between stored points inside one map voxel (meters).
    pub min_distance_points: f64,
    /// Capacity of one map voxel.
    pub max_num_points_in_voxel: usize,
    /// Map voxels farther than this from the sensor are dropped (meters).
    pub max_distance: f64,

    // --- association ---
    /// Neighbors requested per keypoint query.
    pub max_number_neighbors: usize,
    /// Neighbors required before a plane is fit.
    pub min_number_neighbors: usize,
    /// Residuals required for a frame to count as registered.
    pub min_number_keypoints: usize,
    /// Point-to-plane gate (meters).
    pub p2p_max_dist: f64,
    /// Robust loss for point-to-plane terms.
    pub p2p_loss_func: P2pLossFunc,
    /// Scale of the point-to-plane robust loss.
    pub p2p_loss_sigma: f64,
    /// Exponent applied to the planarity coefficient when weighting planes.
    pub power_planarity: f64,

    // --- icp ---
    /// Outer association/solve iterations per sweep.
    pub num_iters_icp: usize,
    /// Gauss-Newton iterations inside each ICP iteration.
    pub max_iterations: usize,
    /// Early-stop threshold on the rotation change (degrees).
    pub threshold_orientation_norm: f64,
    /// Early-stop threshold on the translation change (meters).
    pub threshold_translation_norm: f64,

    // --- window ---
    /// Sweeps to wait before a frame's points enter the map.
    pub delay_adding_points: usize,
    /// Sweeps using the init voxel sizes and the wider neighbor search.
    pub init_num_frames: usize,
    /// Extra trajectory knots inserted per sweep (besides the sweep end).
    pub num_extra_states: usize,

    // --- imu ---
    /// Whether IMU residuals are assembled at all.
    pub use_imu: bool,
    /// Whether the accelerometer residual is used (gyro-only otherwise).
    pub use_accel: bool,
    /// Accelerometer measurement covariance diagonal.
    pub r_imu_acc: f64,
    /// Gyroscope measurement covariance diagonal.
    pub r_imu_ang: f64,
    /// Bias random-walk covariance diagonal.
    pub q_imu: f64,
    /// Initial bias prior covariance diagonal.
    pub p0_imu: f64,
    /// Gravity magnitude along the inertial z axis (m/s²).
    pub gravity: f64,
    /// Lock the gravity-frame transform after initialization.
    pub t_mi_init_only: bool,
    /// Gravity-frame random-walk covariance diagonal (used when unlocked).
    pub qg_diag: [f64; 6],

    // --- trajectory prior ---
    /// Which motion prior to use.
    pub trajectory_prior: TrajectoryPriorKind,
    /// Process-noise power spectral density diagonal.
    pub qc_diag: [f64; 6],
    /// Singer reciprocal correlation times (ignored by WNOJ).
    pub ad_diag: [f64; 6],

    // --- output/runtime ---
    /// Rebuild all frame poses from the final trajectory when dumping.
    pub use_final_state_value: bool,
    /// Worker threads for the data-parallel regions.
    pub num_threads: usize,
    /// Sensor-to-robot extrinsic, row-major 4x4.
    pub t_sr: [f64; 16],
    /// Directory output artifacts are written to.
    pub output_dir: String,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        let mut t_sr = [0.0; 16];
        t_sr[0] = 1.0;
        t_sr[5] = 1.0;
        t_sr[10] = 1.0;
        t_sr[15] = 1.0;
        Self {
            voxel_size: 0.5,
            init_voxel_size: 0.2,
            sample_voxel_size: 1.5,
            init_sample_voxel_size: 1.0,
            size_voxel_map: 1.0,
            min_distance_points: 0.1,
            max_num_points_in_voxel: 20,
            max_distance: 100.0,
            max_number_neighbors: 20,
            min_number_neighbors: 10,
            min_number_keypoints: 100,
            p2p_max_dist: 0.5,
            p2p_loss_func: P2pLossFunc::Cauchy,
            p2p_loss_sigma: 0.1,
            power_planarity: 2.0,
            num_iters_icp: 10,
            max_iterations: 5,
            threshold_orientation_norm: 0.05,
            threshold_translation_norm: 0.005,
            delay_adding_points: 1,
            init_num_frames: 20,
            num_extra_states: 0,
            use_imu: true,
            use_accel: true,
            r_imu_acc: 1.0,
            r_imu_ang: 0.1,
            q_imu: 1e-4,
            p0_imu: 1e-2,
            gravity: -9.8042,
            t_mi_init_only: true,
            qg_diag: [1e-4; 6],
            trajectory_prior: TrajectoryPriorKind::Singer,
            qc_diag: [1.0; 6],
            ad_diag: [1.0; 6],
            use_final_state_value: true,
            num_threads: 4,
            t_sr,
            output_dir: "output".to_string(),
        }
    }
}

impl OdometryConfig {
    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), OdometryError> {
        let positive = [
            ("voxel_size", self.voxel_size),
            ("init_voxel_size", self.init_voxel_size),
            ("sample_voxel_size", self.sample_voxel_size),
            ("init_sample_voxel_size", self.init_sample_voxel_size),
            ("size_voxel_map", self.size_voxel_map),
            ("min_distance_points", self.min_distance_points),
            ("max_distance", self.max_distance),
            ("p2p_max_dist", self.p2p_max_dist),
            ("p2p_loss_sigma", self.p2p_loss_sigma),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(OdometryError::MalformedConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        if self.max_num_points_in_voxel == 0 {
            return Err(OdometryError::MalformedConfig(
                "max_num_points_in_voxel must be at least 1".to_string(),
            ));
        }
        if self.min_number_neighbors < 3 {
            return Err(OdometryError::MalformedConfig(
                "min_number_neighbors must be at least 3 to fit a plane".to_string(),
            ));
        }
        if self.max_number_neighbors < self.min_number_neighbors {
            return Err(OdometryError::MalformedConfig(format!(
                "max_number_neighbors ({}) < min_number_neighbors ({})",
                self.max_number_neighbors, self.min_number_neighbors
            )));
        }
        if self.num_iters_icp == 0 || self.max_iterations == 0 {
            return Err(OdometryError::MalformedConfig(
                "num_iters_icp and max_iterations must be at least 1".to_string(),
            ));
        }
        if self.num_threads == 0 {
            return Err(OdometryError::MalformedConfig(
                "num_threads must be at least 1".to_string(),
            ));
        }
        for (name, diag) in [("qc_diag", &self.qc_diag), ("qg_diag", &self.qg_diag)] {
            if diag.iter().any(|v| !(*v > 0.0)) {
                return Err(OdometryError::MalformedConfig(format!(
                    "{name} entries must all be positive"
                )));
            }
        }
        if self.trajectory_prior == TrajectoryPriorKind::Singer
            && self.ad_diag.iter().any(|v| !(*v >= 0.0))
        {
            return Err(OdometryError::MalformedConfig(
                "ad_diag entries must be non-negative".to_string(),
            ));
        }
        let bottom = &self.t_sr[12..16];
        if bottom != [0.0, 0.0, 0.0, 1.0] {
            return Err(OdometryError::MalformedConfig(
                "t_sr must be a rigid transform with bottom row [0 0 0 1]".to_string(),
            ));
        }
        let t_sr = self.t_sr_transform();
        if t_sr.orthonormality_error() > 1e-6 {
            return Err(OdometryError::MalformedConfig(
                "t_sr rotation block is not orthonormal".to_string(),
            ));
        }
        Ok(())
    }

    /// The sensor-to-robot extrinsic as a transform.
    pub fn t_sr_transform(&self) -> Se3 {
        let m = Matrix4::from_row_slice(&self.t_sr);
        Se3::from_matrix(&m)
    }

    pub fn qc_diag_vector(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.qc_diag)
    }

    pub fn ad_diag_vector(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.ad_diag)
    }

    pub fn qg_diag_vector(&self) -> Vector6<f64> {
        Vector6::from_row_slice(&self.qg_diag)
    }
}
