//! End-to-end sequence test: sweeps written in the on-disk format, read
//! back, and registered through the engine.
//!
//! Run with: `cargo test --test sequence_io`

mod common;

use common::{make_sweep, test_config};
use gati_lio::{
    DataFrame, LioOdometry, Se3, read_point_bin, write_lidar_poses_tum, write_point_bin,
    write_trajectory,
};

#[test]
fn test_recorded_sequence_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Record three static sweeps in the binary sweep format.
    let mut paths = Vec::new();
    for sweep in 0..3u64 {
        let t0_us = sweep * 500_000;
        let frame = make_sweep(&|_| Se3::identity(), t0_us as f64 * 1e-6, 0.5, 6_000, 800 + sweep);
        let path = dir.path().join(format!("{t0_us}.bin"));
        write_point_bin(&path, &frame.pointcloud).expect("write sweep");
        paths.push(path);
    }

    // Play them back through the engine.
    let mut odometry = LioOdometry::new(test_config()).expect("engine");
    for path in &paths {
        let (file_time, pointcloud) = read_point_bin(path).expect("read sweep");
        let frame = DataFrame {
            timestamp: file_time + 0.25,
            pointcloud,
            imu_samples: Vec::new(),
            pose_samples: Vec::new(),
        };
        let summary = odometry.register_frame(frame).expect("registration");
        assert!(summary.success);
    }

    // Timestamps quantized to f32 offsets still stay well under a
    // millisecond of drift for a static scene.
    let last = odometry.frames().last().expect("frames");
    assert!(last.end_t.norm() < 5e-3);

    // The output artifacts are writable from the run's state.
    let samples = odometry.sample_trajectory(100.0).expect("samples");
    write_trajectory(&dir.path().join("trajectory_0.txt"), &samples).expect("trajectory");
    let frames = odometry.trajectory().expect("frames");
    write_lidar_poses_tum(&dir.path().join("lidar_poses_tum.txt"), &frames).expect("tum");
    assert!(dir.path().join("trajectory_0.txt").exists());
}
