//! Local surface estimation from map neighborhoods.
//!
//! A keypoint's nearest map points define a reference plane: barycenter,
//! covariance, and the eigenvector of the smallest eigenvalue as the normal.
//! The planarity coefficient `a2D` grades how plane-like the neighborhood
//! is and later weights the point-to-plane information matrix.

use nalgebra::{Matrix3, Vector3};

use crate::error::OdometryError;

/// Distribution of a keypoint's map neighborhood.
#[derive(Debug, Clone, Copy)]
pub struct Neighborhood {
    /// Barycenter of the neighbors.
    pub center: Vector3<f64>,
    /// Unit normal of the fitted plane.
    pub normal: Vector3<f64>,
    /// Neighbor covariance.
    pub covariance: Matrix3<f64>,
    /// Planarity coefficient `(σ₂ − σ₃)/σ₁` in [0, 1].
    pub a2d: f64,
}

/// Estimate the neighborhood distribution of a set of map points.
///
/// The caller guarantees at least the configured minimum number of
/// neighbors; a NaN planarity (a fully degenerate neighborhood) is an
/// invariant violation and fatal.
pub fn compute_neighborhood(points: &[Vector3<f64>]) -> Result<Neighborhood, OdometryError> {
    let n = points.len() as f64;
    let mut barycenter = Vector3::zeros();
    for p in points {
        barycenter += p;
    }
    barycenter /= n;

    let mut covariance = Matrix3::zeros();
    for p in points {
        let d = p - barycenter;
        covariance += d * d.transpose();
    }

    let eigen = covariance.symmetric_eigen();
    // nalgebra does not order the eigenpairs; sort ascending by eigenvalue.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let normal = eigen.eigenvectors.column(order[0]).normalize();

    let sigma_1 = eigen.eigenvalues[order[2]].abs().sqrt();
    let sigma_2 = eigen.eigenvalues[order[1]].abs().sqrt();
    let sigma_3 = eigen.eigenvalues[order[0]].abs().sqrt();
    let a2d = (sigma_2 - sigma_3) / sigma_1;

    if a2d.is_nan() {
        return Err(OdometryError::InvariantViolation(
            "NaN planarity in neighborhood estimation".to_string(),
        ));
    }

    Ok(Neighborhood {
        center: barycenter,
        normal,
        covariance,
        a2d,
    })
}
