//! Failure-path regression: keypoint starvation must mark the frame failed
//! without corrupting the map or stopping the run, and broken input
//! invariants must be fatal.
//!
//! Run with: `cargo test --test degenerate_frames`

mod common;

use common::{make_sweep, test_config};
use gati_lio::{DataFrame, LioOdometry, OdometryError, Point3D, Se3};
use nalgebra::Vector3;

fn static_truth(_t: f64) -> Se3 {
    Se3::identity()
}

/// A sweep whose points all collapse into one voxel.
fn starved_sweep(t0: f64, duration: f64, n: usize) -> DataFrame {
    let mut pointcloud = Vec::with_capacity(n);
    for i in 0..n {
        let t = t0 + duration * (i as f64) / ((n - 1) as f64);
        let jitter = 1e-3 * (i % 7) as f64;
        pointcloud.push(Point3D::from_raw(
            Vector3::new(5.0 + jitter, 5.0, -1.0),
            t,
        ));
    }
    DataFrame {
        timestamp: t0 + 0.5 * duration,
        pointcloud,
        imu_samples: Vec::new(),
        pose_samples: Vec::new(),
    }
}

#[test]
fn test_keypoint_starvation_is_degenerate_and_recoverable() {
    let mut odometry = LioOdometry::new(test_config()).expect("engine");

    let first = make_sweep(&static_truth, 0.0, 0.5, 8_000, 1);
    odometry.register_frame(first).expect("first frame");
    let map_len_before = odometry.map().len();

    let result = odometry.register_frame(starved_sweep(0.5, 0.5, 2_000));
    match result {
        Err(OdometryError::DegenerateFrame { frame_index, .. }) => {
            assert_eq!(frame_index, 1);
        }
        other => panic!("expected DegenerateFrame, got {other:?}"),
    }

    // Map untouched, frame marked failed, trajectory extrapolated.
    assert_eq!(odometry.map().len(), map_len_before);
    assert!(!odometry.frames()[1].success);

    // A healthy sweep afterwards keeps the run going.
    let third = make_sweep(&static_truth, 1.0, 0.5, 8_000, 3);
    let summary = odometry.register_frame(third).expect("third frame");
    assert!(summary.success);
    assert!(odometry.frames()[2].success);
}

#[test]
fn test_empty_sweep_is_degenerate() {
    let mut odometry = LioOdometry::new(test_config()).expect("engine");
    let frame = DataFrame {
        timestamp: 0.0,
        ..DataFrame::default()
    };
    assert!(matches!(
        odometry.register_frame(frame),
        Err(OdometryError::DegenerateFrame { .. })
    ));
}

#[test]
fn test_non_increasing_sweep_times_are_fatal() {
    let mut odometry = LioOdometry::new(test_config()).expect("engine");
    odometry
        .register_frame(make_sweep(&static_truth, 0.0, 0.5, 6_000, 11))
        .expect("first frame");
    // Re-feeding the same time interval breaks knot monotonicity.
    let result = odometry.register_frame(make_sweep(&static_truth, 0.0, 0.5, 6_000, 12));
    assert!(matches!(
        result,
        Err(OdometryError::InvariantViolation(_))
    ));
}

#[test]
fn test_imu_sample_outside_knots_is_fatal() {
    let mut config = test_config();
    config.use_imu = true;
    let mut odometry = LioOdometry::new(config).expect("engine");

    odometry
        .register_frame(make_sweep(&static_truth, 0.0, 0.5, 6_000, 21))
        .expect("first frame");

    let mut second = make_sweep(&static_truth, 0.5, 0.5, 6_000, 22);
    second.imu_samples.push(gati_lio::ImuSample {
        timestamp: 4.0, // far outside the sweep interval
        lin_acc: Vector3::new(0.0, 0.0, -9.8042),
        ang_vel: Vector3::zeros(),
    });
    assert!(matches!(
        odometry.register_frame(second),
        Err(OdometryError::InvariantViolation(_))
    ));
}
