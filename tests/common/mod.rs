#![allow(dead_code)]
//! Shared helpers for the synthetic-scene integration tests.
//!
//! Scenes are noiseless surface samples of a closed room expressed in the
//! odometry world frame (the sensor pose at startup), so ground truth is
//! known exactly and registration quality can be asserted in millimeters.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gati_lio::{DataFrame, OdometryConfig, P2pLossFunc, Point3D, Se3, TrajectoryPriorKind};

/// Room extent: floor at z = −1, four walls at ±HALF, walls up to z = 3.
pub const HALF: f64 = 15.0;

/// Configuration tuned for the synthetic room scenes.
pub fn test_config() -> OdometryConfig {
    OdometryConfig {
        voxel_size: 0.5,
        init_voxel_size: 0.5,
        sample_voxel_size: 1.0,
        init_sample_voxel_size: 1.0,
        size_voxel_map: 1.0,
        min_distance_points: 0.05,
        max_num_points_in_voxel: 20,
        max_distance: 200.0,
        max_number_neighbors: 20,
        min_number_neighbors: 5,
        min_number_keypoints: 30,
        p2p_max_dist: 0.5,
        // Noiseless scenes; plain least squares keeps convergence sharp.
        p2p_loss_func: P2pLossFunc::L2,
        num_iters_icp: 8,
        max_iterations: 4,
        threshold_orientation_norm: 1e-4,
        threshold_translation_norm: 1e-5,
        delay_adding_points: 1,
        init_num_frames: 2,
        num_extra_states: 0,
        use_imu: false,
        use_accel: false,
        trajectory_prior: TrajectoryPriorKind::WhiteNoiseOnJerk,
        qc_diag: [1.0; 6],
        num_threads: 2,
        ..OdometryConfig::default()
    }
}

/// Sample one point on the room surfaces (world frame).
pub fn room_surface_point(rng: &mut StdRng) -> Vector3<f64> {
    match rng.gen_range(0..8u32) {
        // Floor gets half of the returns.
        0..=3 => Vector3::new(
            rng.gen_range(-HALF..HALF),
            rng.gen_range(-HALF..HALF),
            -1.0,
        ),
        4 => Vector3::new(HALF, rng.gen_range(-HALF..HALF), rng.gen_range(-1.0..3.0)),
        5 => Vector3::new(-HALF, rng.gen_range(-HALF..HALF), rng.gen_range(-1.0..3.0)),
        6 => Vector3::new(rng.gen_range(-HALF..HALF), HALF, rng.gen_range(-1.0..3.0)),
        _ => Vector3::new(rng.gen_range(-HALF..HALF), -HALF, rng.gen_range(-1.0..3.0)),
    }
}

/// Build one sweep of `n` points over `[t0, t0 + duration]`, observed from
/// the ground-truth sensor trajectory `truth(t)` (sensor-to-world).
pub fn make_sweep(
    truth: &dyn Fn(f64) -> Se3,
    t0: f64,
    duration: f64,
    n: usize,
    seed: u64,
) -> DataFrame {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pointcloud = Vec::with_capacity(n);
    for i in 0..n {
        let t = t0 + duration * (i as f64) / ((n - 1) as f64);
        let world = room_surface_point(&mut rng);
        let raw = truth(t).inverse().transform(&world);
        pointcloud.push(Point3D::from_raw(raw, t));
    }
    DataFrame {
        timestamp: t0 + 0.5 * duration,
        pointcloud,
        imu_samples: Vec::new(),
        pose_samples: Vec::new(),
    }
}

/// Rotation angle between two rotation matrices, in degrees.
pub fn rotation_angle_deg(a: &nalgebra::Matrix3<f64>, b: &nalgebra::Matrix3<f64>) -> f64 {
    let cos = ((a * b.transpose()).trace() - 1.0) * 0.5;
    cos.clamp(-1.0, 1.0).acos().to_degrees()
}
