//! SO(3)/SE(3) Lie group primitives for the continuous-time estimator.
//!
//! Conventions:
//! - se(3) coordinates are ordered `[translation; rotation]` (ξ = [ρ; φ]).
//! - Body twists are ordered `[linear; angular]`.
//! - All Jacobians are *left* Jacobians; state updates compose on the left,
//!   `T ← exp(δ)·T`.
//!
//! Every map has a small-angle branch so the estimator stays stable when the
//! window barely moves (static sensor, first frames).

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector6};

/// Below this angle the closed forms are replaced by their series expansions.
const SMALL_ANGLE: f64 = 1e-9;

/// Squared-Frobenius orthogonality error above which a rotation matrix is
/// reprojected onto SO(3).
pub const ORTHONORMALITY_TOLERANCE: f64 = 1e-6;

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// SO(3) exponential map (Rodrigues).
pub fn so3_exp(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let px = skew(phi);
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        // Second-order series keeps exp/log round trips tight near zero.
        return Matrix3::identity() + px + 0.5 * px * px;
    }
    let theta = theta2.sqrt();
    Matrix3::identity() + (theta.sin() / theta) * px + ((1.0 - theta.cos()) / theta2) * px * px
}

/// SO(3) logarithm. Stable for all rotations with angle < π.
pub fn so3_log(r: &Matrix3<f64>) -> Vector3<f64> {
    let cos_theta = ((r.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    if theta < SMALL_ANGLE {
        return 0.5 * Vector3::new(r[(2, 1)] - r[(1, 2)], r[(0, 2)] - r[(2, 0)], r[(1, 0)] - r[(0, 1)]);
    }

    if (std::f64::consts::PI - theta) < 1e-6 {
        // Near π the antisymmetric part vanishes; recover the axis from the
        // symmetric part via a·aᵀ = I + (S − I)/(1 − cos θ).
        let s = 0.5 * (r + r.transpose());
        let aat = Matrix3::identity() + (s - Matrix3::identity()) / (1.0 - cos_theta);
        let k = Vector3::new(aat[(0, 0)], aat[(1, 1)], aat[(2, 2)]).imax();
        let mut axis = Vector3::new(aat[(0, k)], aat[(1, k)], aat[(2, k)]);
        axis /= aat[(k, k)].max(f64::EPSILON).sqrt();
        // Disambiguate the axis sign with what is left of the antisymmetric part.
        let w = Vector3::new(r[(2, 1)] - r[(1, 2)], r[(0, 2)] - r[(2, 0)], r[(1, 0)] - r[(0, 1)]);
        if axis.dot(&w) < 0.0 {
            axis = -axis;
        }
        return theta * axis.normalize();
    }

    let w = Vector3::new(r[(2, 1)] - r[(1, 2)], r[(0, 2)] - r[(2, 0)], r[(1, 0)] - r[(0, 1)]);
    (theta / (2.0 * theta.sin())) * w
}

/// SO(3) left Jacobian J(φ).
pub fn so3_left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let px = skew(phi);
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * px + (px * px) / 6.0;
    }
    let theta = theta2.sqrt();
    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta2) * px
        + ((theta - theta.sin()) / (theta2 * theta)) * px * px
}

/// Inverse SO(3) left Jacobian J⁻¹(φ).
pub fn so3_inv_left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let px = skew(phi);
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * px + (px * px) / 12.0;
    }
    let theta = theta2.sqrt();
    let coeff = 1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() - 0.5 * px + coeff * px * px
}

/// Barfoot's Q(ξ) matrix, the translation-rotation coupling block of the
/// SE(3) left Jacobian.
fn se3_q_matrix(rho: &Vector3<f64>, phi: &Vector3<f64>) -> Matrix3<f64> {
    let rx = skew(rho);
    let px = skew(phi);
    let theta2 = phi.norm_squared();
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return 0.5 * rx + (px * rx + rx * px) / 6.0;
    }
    let theta = theta2.sqrt();
    let theta3 = theta2 * theta;
    let theta4 = theta2 * theta2;
    let theta5 = theta4 * theta;
    let (sin_t, cos_t) = theta.sin_cos();

    let c1 = (theta - sin_t) / theta3;
    let c2 = (1.0 - 0.5 * theta2 - cos_t) / theta4;
    let c3 = 0.5 * (c2 - 3.0 * (theta - sin_t - theta3 / 6.0) / theta5);

    0.5 * rx
        + c1 * (px * rx + rx * px + px * rx * px)
        + c2 * (px * px * rx + rx * px * px - 3.0 * px * rx * px)
        + c3 * (px * rx * px * px + px * px * rx * px)
}

/// SE(3) left Jacobian of ξ = [ρ; φ].
pub fn se3_left_jacobian(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let j = so3_left_jacobian(&phi);
    let q = se3_q_matrix(&rho, &phi);
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&j);
    out.fixed_view_mut::<3, 3>(0, 3).copy_from(&q);
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&j);
    out
}

/// Inverse SE(3) left Jacobian.
pub fn se3_inv_left_jacobian(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let j_inv = so3_inv_left_jacobian(&phi);
    let q = se3_q_matrix(&rho, &phi);
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&j_inv);
    out.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-j_inv * q * j_inv));
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&j_inv);
    out
}

/// se(3) adjoint operator (curly hat) of ξ = [ρ; φ].
pub fn curly_hat(xi: &Vector6<f64>) -> Matrix6<f64> {
    let rho = xi.fixed_rows::<3>(0).into_owned();
    let phi = xi.fixed_rows::<3>(3).into_owned();
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&skew(&phi));
    out.fixed_view_mut::<3, 3>(0, 3).copy_from(&skew(&rho));
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(&skew(&phi));
    out
}

/// Reproject a matrix onto SO(3) via SVD: `O(C) = (CCᵀ)^{-1/2} C`.
pub fn orthonormalize(r: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = r.svd(true, true);
    let u = svd.u.expect("3x3 SVD always yields U");
    let v_t = svd.v_t.expect("3x3 SVD always yields Vᵀ");
    let mut out = u * v_t;
    // Keep the determinant positive (proper rotation).
    if out.determinant() < 0.0 {
        let mut u_fixed = u;
        u_fixed.column_mut(2).neg_mut();
        out = u_fixed * v_t;
    }
    out
}

/// Rigid transform (rotation matrix + translation).
///
/// Stored unpacked rather than as a 4×4 to keep the point action and the
/// adjoint cheap in the inner loops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Se3 {
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
}

impl Se3 {
    #[inline]
    pub fn identity() -> Self {
        Self {
            r: Matrix3::identity(),
            t: Vector3::zeros(),
        }
    }

    #[inline]
    pub fn new(r: Matrix3<f64>, t: Vector3<f64>) -> Self {
        Self { r, t }
    }

    /// Build from a homogeneous 4×4 (the bottom row is ignored).
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Self {
            r: m.fixed_view::<3, 3>(0, 0).into_owned(),
            t: m.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }

    /// Homogeneous 4×4 representation.
    pub fn matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.t);
        m
    }

    /// SE(3) exponential map of ξ = [ρ; φ].
    pub fn exp(xi: &Vector6<f64>) -> Self {
        let rho = xi.fixed_rows::<3>(0).into_owned();
        let phi = xi.fixed_rows::<3>(3).into_owned();
        Self {
            r: so3_exp(&phi),
            t: so3_left_jacobian(&phi) * rho,
        }
    }

    /// SE(3) logarithm, inverse of [`Se3::exp`] for rotation angles < π.
    pub fn log(&self) -> Vector6<f64> {
        let phi = so3_log(&self.r);
        let rho = so3_inv_left_jacobian(&phi) * self.t;
        let mut xi = Vector6::zeros();
        xi.fixed_rows_mut::<3>(0).copy_from(&rho);
        xi.fixed_rows_mut::<3>(3).copy_from(&phi);
        xi
    }

    #[inline]
    pub fn compose(&self, other: &Se3) -> Se3 {
        Se3 {
            r: self.r * other.r,
            t: self.r * other.t + self.t,
        }
    }

    #[inline]
    pub fn inverse(&self) -> Se3 {
        let r_inv = self.r.transpose();
        Se3 {
            r: r_inv,
            t: -(r_inv * self.t),
        }
    }

    /// Apply the transform to a point.
    #[inline]
    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.r * p + self.t
    }

    /// Adjoint `Ad(T)` mapping se(3) vectors between frames.
    pub fn adjoint(&self) -> Matrix6<f64> {
        let mut out = Matrix6::zeros();
        out.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.r);
        out.fixed_view_mut::<3, 3>(0, 3).copy_from(&(skew(&self.t) * self.r));
        out.fixed_view_mut::<3, 3>(3, 3).copy_from(&self.r);
        out
    }

    /// Squared-Frobenius distance of `RRᵀ` from the identity.
    pub fn orthonormality_error(&self) -> f64 {
        (self.r * self.r.transpose() - Matrix3::identity()).norm_squared()
    }

    /// Reproject the rotation onto SO(3) when it has drifted past the
    /// tolerance. Called on every estimate that leaves the optimizer's
    /// inner loop; the reprojection itself is silent.
    pub fn reprojected(&self) -> Se3 {
        if self.orthonormality_error() > ORTHONORMALITY_TOLERANCE {
            Se3 {
                r: orthonormalize(&self.r),
                t: self.t,
            }
        } else {
            *self
        }
    }
}

impl Default for Se3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn xi(tx: f64, ty: f64, tz: f64, rx: f64, ry: f64, rz: f64) -> Vector6<f64> {
        Vector6::new(tx, ty, tz, rx, ry, rz)
    }

    #[test]
    fn test_skew_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(-0.5, 4.0, 0.25);
        assert_relative_eq!(skew(&v) * u, v.cross(&u), epsilon = 1e-14);
    }

    #[test]
    fn test_exp_log_round_trip() {
        for xi in [
            xi(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            xi(0.1, -0.2, 0.3, 0.4, 0.5, -0.6),
            xi(1.0, 2.0, -0.5, 1.2, -0.3, 0.9),
            xi(1e-8, -2e-8, 3e-8, 1e-7, 0.0, -1e-7),
            // Rotation angle close to (but below) π.
            xi(0.0, 0.0, 0.0, 3.0, 0.0, 0.0),
        ] {
            let t = Se3::exp(&xi);
            assert_relative_eq!(t.log(), xi, epsilon = 1e-10, max_relative = 1e-9);
        }
    }

    #[test]
    fn test_left_jacobian_inverse_relationship() {
        let phi = Vector3::new(0.3, -0.7, 0.2);
        let product = so3_left_jacobian(&phi) * so3_inv_left_jacobian(&phi);
        assert_relative_eq!(product, Matrix3::identity(), epsilon = 1e-12);

        let xi6 = xi(0.2, 0.5, -0.1, 0.3, -0.7, 0.2);
        let product6 = se3_left_jacobian(&xi6) * se3_inv_left_jacobian(&xi6);
        assert_relative_eq!(product6, Matrix6::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_left_jacobian_small_angle_branch() {
        let phi = Vector3::new(1e-11, -2e-11, 5e-12);
        assert_relative_eq!(so3_left_jacobian(&phi), Matrix3::identity(), epsilon = 1e-10);
        assert_relative_eq!(so3_inv_left_jacobian(&phi), Matrix3::identity(), epsilon = 1e-10);
    }

    #[test]
    fn test_exp_translation_only() {
        let t = Se3::exp(&xi(1.0, 2.0, 3.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(t.r, Matrix3::identity(), epsilon = 1e-14);
        assert_relative_eq!(t.t, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-14);
    }

    #[test]
    fn test_compose_inverse() {
        let a = Se3::exp(&xi(0.1, 0.2, 0.3, 0.4, 0.5, 0.6));
        let b = a.compose(&a.inverse());
        assert_relative_eq!(b.r, Matrix3::identity(), epsilon = 1e-12);
        assert_relative_eq!(b.t, Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_adjoint_identity() {
        // Ad(T) log(X) = log(T X T⁻¹)
        let t = Se3::exp(&xi(0.3, -0.1, 0.2, 0.5, 0.1, -0.4));
        let x = xi(0.02, 0.01, -0.03, 0.01, -0.02, 0.015);
        let lhs = t.adjoint() * x;
        let rhs = t.compose(&Se3::exp(&x)).compose(&t.inverse()).log();
        assert_relative_eq!(lhs, rhs, epsilon = 1e-6);
    }

    #[test]
    fn test_curly_hat_annihilates_itself() {
        // ad(ξ)ξ = 0 for any se(3) vector.
        let v = xi(0.4, -0.2, 0.1, 0.3, 0.7, -0.5);
        assert_relative_eq!(curly_hat(&v) * v, Vector6::zeros(), epsilon = 1e-14);
    }

    #[test]
    fn test_orthonormalize_recovers_rotation() {
        let r = so3_exp(&Vector3::new(0.4, -0.3, 0.8));
        // Perturb the rotation off the manifold.
        let mut drifted = r;
        drifted[(0, 0)] += 1e-3;
        drifted[(1, 2)] -= 2e-3;
        let fixed = orthonormalize(&drifted);
        assert_relative_eq!(
            fixed * fixed.transpose(),
            Matrix3::identity(),
            epsilon = 1e-12
        );
        assert!((fixed - r).norm() < 1e-2);
        assert!(fixed.determinant() > 0.0);
    }

    #[test]
    fn test_reprojected_is_silent_below_tolerance() {
        let t = Se3::exp(&xi(0.1, 0.0, 0.0, 0.2, 0.0, 0.0));
        let same = t.reprojected();
        assert_relative_eq!(same.r, t.r, epsilon = 1e-15);
    }
}
