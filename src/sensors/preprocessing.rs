//! Sweep preprocessing: voxel-grid subsampling and initial motion
//! compensation.
//!
//! Subsampling keeps the first point encountered in each voxel and emits
//! voxels in first-encounter order. Combined with the fixed-seed shuffle the
//! driver runs beforehand, the retained point is effectively random per
//! voxel while results stay identical across runs.

use nalgebra::{Rotation3, UnitQuaternion};
use std::collections::HashSet;

use crate::core::se3::Se3;
use crate::core::types::{Point3D, VoxelKey};

/// Keep one point per voxel of edge length `voxel_size`.
///
/// Selection rule: the first point encountered per voxel, in input order.
pub fn grid_subsample(points: &[Point3D], voxel_size: f64) -> Vec<Point3D> {
    let mut seen: HashSet<VoxelKey> = HashSet::with_capacity(points.len());
    let mut kept = Vec::new();
    for point in points {
        if seen.insert(VoxelKey::of(&point.raw_pt, voxel_size)) {
            kept.push(point.clone());
        }
    }
    kept
}

/// Subsample a sweep into keypoints without disturbing the input.
pub fn keypoint_sample(points: &[Point3D], voxel_size: f64) -> Vec<Point3D> {
    grid_subsample(points, voxel_size)
}

/// Interpolate a pose between sweep begin and end at fraction `alpha`.
///
/// Rotation by unit-quaternion slerp, translation linearly. At `alpha = 0`
/// this is exactly the begin pose, at `alpha = 1` exactly the end pose.
pub fn interpolate_pose(begin: &Se3, end: &Se3, alpha: f64) -> Se3 {
    let q_begin = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(begin.r));
    let q_end = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(end.r));
    let r = q_begin.slerp(&q_end, alpha).to_rotation_matrix().into_inner();
    let t = (1.0 - alpha) * begin.t + alpha * end.t;
    Se3::new(r, t)
}

/// De-skew a sweep with begin/end pose estimates.
///
/// Bootstraps the first ICP iteration before a continuous-time trajectory
/// covers the sweep; afterwards world positions come from the interpolated
/// trajectory instead.
pub fn deskew(points: &mut [Point3D], begin: &Se3, end: &Se3) {
    for point in points.iter_mut() {
        let pose = interpolate_pose(begin, end, point.alpha_timestamp);
        point.pt = pose.transform(&point.raw_pt);
    }
}

/// Fill per-point sweep fractions from the given begin/end times.
pub fn assign_alpha_timestamps(points: &mut [Point3D], begin_time: f64, end_time: f64) {
    let span = end_time - begin_time;
    for point in points.iter_mut() {
        point.alpha_timestamp = if span > 0.0 {
            ((point.timestamp - begin_time) / span).clamp(0.0, 1.0)
        } else {
            0.0
        };
    }
}
