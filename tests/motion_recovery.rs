//! Motion-recovery regression: a platform accelerating from rest through a
//! closed room must be tracked to centimeter accuracy by the
//! continuous-time estimator.
//!
//! Run with: `cargo test --test motion_recovery`

mod common;

use common::{make_sweep, test_config};
use gati_lio::{LioOdometry, Se3};
use nalgebra::{Matrix3, Vector3};

const SWEEP_DURATION: f64 = 0.5;
const ACCEL: f64 = 0.2;

/// At rest for the first sweep, then constant acceleration along +x.
fn ramp_truth(t: f64) -> Se3 {
    let x = if t <= SWEEP_DURATION {
        0.0
    } else {
        0.5 * ACCEL * (t - SWEEP_DURATION) * (t - SWEEP_DURATION)
    };
    Se3::new(Matrix3::identity(), Vector3::new(x, 0.0, 0.0))
}

#[test]
fn test_translation_ramp_is_recovered() {
    let mut odometry = LioOdometry::new(test_config()).expect("engine");

    let num_sweeps = 5;
    for sweep in 0..num_sweeps {
        let frame = make_sweep(
            &ramp_truth,
            sweep as f64 * SWEEP_DURATION,
            SWEEP_DURATION,
            10_000,
            500 + sweep as u64,
        );
        let summary = odometry.register_frame(frame).expect("registration");
        assert!(summary.success, "sweep {sweep} failed");
    }

    for (index, frame) in odometry.frames().iter().enumerate() {
        let truth = ramp_truth(frame.end_timestamp);
        let error = (frame.end_t - truth.t).norm();
        assert!(
            error < 2e-2,
            "frame {index}: end position error {error:.4} m (truth {:?})",
            truth.t
        );
    }

    // The estimated body velocity at the last eval time should reflect the
    // ramp. With T_rm = T_mr⁻¹ the twist carries the opposite sign of the
    // platform velocity.
    let last = odometry.frames().last().expect("frames");
    let truth_speed = ACCEL * (last.eval_timestamp - SWEEP_DURATION);
    let est = last.mid_w.fixed_rows::<3>(0).into_owned();
    assert!(
        (est.x + truth_speed).abs() < 0.05,
        "velocity estimate {est:?} vs truth speed {truth_speed:.3}"
    );
}

/// At rest for the first sweep, then a constant yaw acceleration.
fn yaw_truth(t: f64) -> Se3 {
    let yaw = if t <= SWEEP_DURATION {
        0.0
    } else {
        0.5 * 0.1 * (t - SWEEP_DURATION) * (t - SWEEP_DURATION)
    };
    let r = gati_lio::core::se3::so3_exp(&Vector3::new(0.0, 0.0, yaw));
    Se3::new(r, Vector3::zeros())
}

#[test]
fn test_yaw_ramp_is_recovered() {
    let mut odometry = LioOdometry::new(test_config()).expect("engine");

    for sweep in 0..5 {
        let frame = make_sweep(
            &yaw_truth,
            sweep as f64 * SWEEP_DURATION,
            SWEEP_DURATION,
            10_000,
            1300 + sweep as u64,
        );
        let summary = odometry.register_frame(frame).expect("registration");
        assert!(summary.success, "sweep {sweep} failed");
    }

    let last = odometry.frames().last().expect("frames");
    let truth = yaw_truth(last.end_timestamp);
    let angle_error =
        common::rotation_angle_deg(&last.end_r, &truth.r);
    assert!(
        angle_error < 0.5,
        "end yaw off by {angle_error:.3}° (truth yaw {:.4} rad)",
        0.5 * 0.1 * (last.end_timestamp - SWEEP_DURATION).powi(2)
    );
    assert!(last.end_t.norm() < 2e-2, "spurious translation {:?}", last.end_t);
}

#[test]
fn test_posterior_rebuild_tracks_the_ramp() {
    let mut config = test_config();
    config.use_final_state_value = true;
    let mut odometry = LioOdometry::new(config).expect("engine");

    for sweep in 0..4 {
        let frame = make_sweep(
            &ramp_truth,
            sweep as f64 * SWEEP_DURATION,
            SWEEP_DURATION,
            8_000,
            900 + sweep as u64,
        );
        odometry.register_frame(frame).expect("registration");
    }

    // Rebuilt begin/end poses stay consistent with the live estimates.
    let rebuilt = odometry.trajectory().expect("trajectory");
    for (live, post) in odometry.frames().iter().zip(&rebuilt) {
        assert!((live.end_t - post.end_t).norm() < 1e-2);
    }
}
