//! Motion priors: white-noise-on-jerk and Singer.
//!
//! Both models are diagonal across the six twist axes, so every 18×18
//! matrix here is assembled from per-axis 3×3 blocks over the local state
//! `[position-ish ξ, velocity ξ̇, acceleration ξ̈]` of one axis. The Singer
//! model mean-reverts acceleration with per-axis rate α and collapses to
//! white-noise-on-jerk as α → 0; below `α·Δt = 1e-2` the closed forms are
//! replaced by that limit to dodge catastrophic cancellation.

use nalgebra::{Matrix3, SMatrix, SVector, Vector6};

pub type Matrix18 = SMatrix<f64, 18, 18>;
pub type Vector18 = SVector<f64, 18>;

/// Below this value of `α·Δt` the Singer closed forms use the WNOJ limit.
const SINGER_SMALL: f64 = 1e-2;

/// Continuous-time motion prior over knot states.
#[derive(Debug, Clone, Copy)]
pub enum MotionPrior {
    /// Constant-acceleration Gauss-Markov process (white noise on jerk).
    WhiteNoiseOnJerk {
        /// Process-noise power spectral density per axis.
        qc_diag: Vector6<f64>,
    },
    /// Mean-reverting acceleration.
    Singer {
        /// Process-noise power spectral density per axis.
        qc_diag: Vector6<f64>,
        /// Reciprocal correlation time per axis.
        ad_diag: Vector6<f64>,
    },
}

impl MotionPrior {
    fn axis_params(&self, axis: usize) -> (f64, f64) {
        match self {
            MotionPrior::WhiteNoiseOnJerk { qc_diag } => (qc_diag[axis], 0.0),
            MotionPrior::Singer { qc_diag, ad_diag } => (qc_diag[axis], ad_diag[axis]),
        }
    }

    /// Per-axis state transition over `dt` (negative `dt` extrapolates
    /// backwards).
    fn phi_axis(alpha: f64, dt: f64) -> Matrix3<f64> {
        if alpha * dt.abs() < SINGER_SMALL {
            Matrix3::new(
                1.0, dt, 0.5 * dt * dt, //
                0.0, 1.0, dt, //
                0.0, 0.0, 1.0,
            )
        } else {
            let adt = alpha * dt;
            let e = (-adt).exp();
            Matrix3::new(
                1.0,
                dt,
                (adt - 1.0 + e) / (alpha * alpha),
                0.0,
                1.0,
                (1.0 - e) / alpha,
                0.0,
                0.0,
                e,
            )
        }
    }

    /// Per-axis process-noise covariance over `dt > 0`.
    fn q_axis(q: f64, alpha: f64, dt: f64) -> Matrix3<f64> {
        if alpha * dt < SINGER_SMALL {
            let dt2 = dt * dt;
            let dt3 = dt2 * dt;
            let dt4 = dt3 * dt;
            let dt5 = dt4 * dt;
            return q * Matrix3::new(
                dt5 / 20.0,
                dt4 / 8.0,
                dt3 / 6.0,
                dt4 / 8.0,
                dt3 / 3.0,
                dt2 / 2.0,
                dt3 / 6.0,
                dt2 / 2.0,
                dt,
            );
        }
        let a = alpha;
        let adt = a * dt;
        let e = (-adt).exp();
        let e2 = (-2.0 * adt).exp();
        let a2 = a * a;
        let a3 = a2 * a;
        let a4 = a3 * a;
        let a5 = a4 * a;
        let q11 = q / (2.0 * a5)
            * (1.0 - e2 + 2.0 * adt + (2.0 / 3.0) * adt * adt * adt - 2.0 * adt * adt
                - 4.0 * adt * e);
        let q12 = q / (2.0 * a4) * (e2 + 1.0 - 2.0 * e + 2.0 * adt * e - 2.0 * adt + adt * adt);
        let q13 = q / (2.0 * a3) * (1.0 - e2 - 2.0 * adt * e);
        let q22 = q / (2.0 * a3) * (4.0 * e - 3.0 - e2 + 2.0 * adt);
        let q23 = q / (2.0 * a2) * (e2 + 1.0 - 2.0 * e);
        let q33 = q / (2.0 * a) * (1.0 - e2);
        Matrix3::new(q11, q12, q13, q12, q22, q23, q13, q23, q33)
    }

    /// Scatter per-axis 3×3 blocks into the 18-dim `[ξ, ξ̇, ξ̈]` layout.
    fn assemble(&self, mut block: impl FnMut(usize) -> Matrix3<f64>) -> Matrix18 {
        let mut out = Matrix18::zeros();
        for axis in 0..6 {
            let b = block(axis);
            for i in 0..3 {
                for j in 0..3 {
                    out[(6 * i + axis, 6 * j + axis)] = b[(i, j)];
                }
            }
        }
        out
    }

    /// State transition `Φ(dt)` over the 18-dim local state.
    pub fn transition(&self, dt: f64) -> Matrix18 {
        self.assemble(|axis| {
            let (_, alpha) = self.axis_params(axis);
            Self::phi_axis(alpha, dt)
        })
    }

    /// Process-noise covariance `Q(dt)`, `dt > 0`.
    pub fn process_noise(&self, dt: f64) -> Matrix18 {
        self.assemble(|axis| {
            let (q, alpha) = self.axis_params(axis);
            Self::q_axis(q, alpha, dt)
        })
    }

    /// Process-noise information `Q(dt)⁻¹`, the weight of a knot-to-knot
    /// prior residual.
    pub fn process_information(&self, dt: f64) -> Matrix18 {
        self.assemble(|axis| {
            let (q, alpha) = self.axis_params(axis);
            Self::q_axis(q, alpha, dt)
                .try_inverse()
                .unwrap_or_else(Matrix3::zeros)
        })
    }

    /// Interpolation matrices `(Λ, Ψ)` for a query at `tau ∈ [0, dt]` after
    /// the first knot of a pair spaced `dt` apart:
    /// `γ(tau) = Λ γ₁ + Ψ γ₂`.
    pub fn lambda_psi(&self, dt: f64, tau: f64) -> (Matrix18, Matrix18) {
        let mut lambda = Matrix18::zeros();
        let mut psi = Matrix18::zeros();
        for axis in 0..6 {
            let (q, alpha) = self.axis_params(axis);
            let q_tau = Self::q_axis(q, alpha, tau);
            let phi_rest_t = Self::phi_axis(alpha, dt - tau).transpose();
            let q_inv = Self::q_axis(q, alpha, dt)
                .try_inverse()
                .unwrap_or_else(Matrix3::zeros);
            let psi_b = q_tau * phi_rest_t * q_inv;
            let lambda_b = Self::phi_axis(alpha, tau) - psi_b * Self::phi_axis(alpha, dt);
            for i in 0..3 {
                for j in 0..3 {
                    psi[(6 * i + axis, 6 * j + axis)] = psi_b[(i, j)];
                    lambda[(6 * i + axis, 6 * j + axis)] = lambda_b[(i, j)];
                }
            }
        }
        (lambda, psi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn wnoj() -> MotionPrior {
        MotionPrior::WhiteNoiseOnJerk {
            qc_diag: Vector6::repeat(1.0),
        }
    }

    fn singer(alpha: f64) -> MotionPrior {
        MotionPrior::Singer {
            qc_diag: Vector6::repeat(1.0),
            ad_diag: Vector6::repeat(alpha),
        }
    }

    #[test]
    fn test_transition_composes_over_time() {
        // Φ(a + b) = Φ(b) Φ(a) for a time-invariant model.
        for prior in [wnoj(), singer(2.0)] {
            let lhs = prior.transition(0.7);
            let rhs = prior.transition(0.4) * prior.transition(0.3);
            assert_relative_eq!(lhs, rhs, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_transition_at_zero_is_identity() {
        for prior in [wnoj(), singer(1.5)] {
            assert_relative_eq!(prior.transition(0.0), Matrix18::identity(), epsilon = 1e-14);
        }
    }

    #[test]
    fn test_process_noise_is_symmetric_positive() {
        for prior in [wnoj(), singer(3.0)] {
            let q = prior.process_noise(0.25);
            assert_relative_eq!(q, q.transpose(), epsilon = 1e-12);
            // Diagonal entries are variances.
            for i in 0..18 {
                assert!(q[(i, i)] > 0.0);
            }
        }
    }

    #[test]
    fn test_information_inverts_noise() {
        for prior in [wnoj(), singer(2.0)] {
            let product = prior.process_noise(0.3) * prior.process_information(0.3);
            assert_relative_eq!(product, Matrix18::identity(), epsilon = 1e-7);
        }
    }

    #[test]
    fn test_singer_matches_wnoj_for_small_alpha() {
        let a = singer(1e-6);
        let b = wnoj();
        assert_relative_eq!(a.transition(0.1), b.transition(0.1), epsilon = 1e-6);
        assert_relative_eq!(a.process_noise(0.1), b.process_noise(0.1), epsilon = 1e-6);
    }

    #[test]
    fn test_singer_acceleration_decays() {
        let prior = singer(2.0);
        let phi = prior.transition(1.0);
        // The acceleration-to-acceleration block is e^{-α·dt}.
        assert_relative_eq!(phi[(12, 12)], (-2.0_f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_lambda_psi_endpoints() {
        for prior in [wnoj(), singer(1.0)] {
            let dt = 0.5;
            let (lambda0, psi0) = prior.lambda_psi(dt, 0.0);
            assert_relative_eq!(lambda0, Matrix18::identity(), epsilon = 1e-9);
            assert_relative_eq!(psi0, Matrix18::zeros(), epsilon = 1e-9);

            let (lambda1, psi1) = prior.lambda_psi(dt, dt);
            assert_relative_eq!(psi1, Matrix18::identity(), epsilon = 1e-7);
            assert_relative_eq!(lambda1, Matrix18::zeros(), epsilon = 1e-7);
        }
    }
}
