//! Robust loss functions for M-estimator weighting.
//!
//! Losses down-weight outlier residuals during registration so occlusions,
//! dynamic objects, and bad associations do not drag the solution. Each
//! variant carries its own scale; weights apply to the *whitened* residual
//! norm `e = sqrt(rᵀ W r)` in iteratively reweighted least squares.

/// Robust loss selector.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum RobustLoss {
    /// Standard least squares. All residuals weigh equally.
    #[default]
    L2,

    /// Absolute-value loss. Weight `1/|e|`, bounded near zero.
    ///
    /// Used for the IMU residuals: individual samples are noisy but
    /// plentiful, and L1 keeps a handful of spikes from steering the window.
    L1,

    /// Cauchy (Lorentzian) loss with scale `k`: weight `1/(1 + (e/k)²)`.
    Cauchy { k: f64 },

    /// Geman-McClure with scale `k`: weight `(k²/(k² + e²))²`.
    ///
    /// Strongest smooth outlier rejection of the set.
    GemanMcClure { k: f64 },

    /// Dynamic covariance scaling with scale `k`:
    /// weight `min(1, 2k²/(k² + e²))²`.
    Dcs { k: f64 },
}

impl RobustLoss {
    /// IRLS weight for a whitened residual norm.
    ///
    /// Returns a value in [0, 1] except for L1 where the weight is the usual
    /// `1/|e|` influence ratio (clamped below `e = 1e-3`).
    #[inline]
    pub fn weight(&self, e: f64) -> f64 {
        let e = e.abs();
        match *self {
            RobustLoss::L2 => 1.0,
            RobustLoss::L1 => 1.0 / e.max(1e-3),
            RobustLoss::Cauchy { k } => 1.0 / (1.0 + (e / k) * (e / k)),
            RobustLoss::GemanMcClure { k } => {
                let k2 = k * k;
                let w = k2 / (k2 + e * e);
                w * w
            }
            RobustLoss::Dcs { k } => {
                let k2 = k * k;
                let s = (2.0 * k2 / (k2 + e * e)).min(1.0);
                s * s
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_weight_is_constant() {
        for e in [0.0, 0.1, 1.0, 100.0] {
            assert_eq!(RobustLoss::L2.weight(e), 1.0);
        }
    }

    #[test]
    fn test_l1_weight_is_inverse_norm() {
        assert_relative_eq!(RobustLoss::L1.weight(2.0), 0.5);
        assert_relative_eq!(RobustLoss::L1.weight(0.5), 2.0);
        // Clamped near zero instead of blowing up.
        assert!(RobustLoss::L1.weight(0.0).is_finite());
    }

    #[test]
    fn test_cauchy_half_weight_at_scale() {
        let loss = RobustLoss::Cauchy { k: 0.1 };
        assert_relative_eq!(loss.weight(0.1), 0.5, epsilon = 1e-12);
        assert_eq!(loss.weight(0.0), 1.0);
    }

    #[test]
    fn test_geman_mcclure_quarter_weight_at_scale() {
        let loss = RobustLoss::GemanMcClure { k: 0.1 };
        assert_relative_eq!(loss.weight(0.1), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_dcs_is_exact_least_squares_for_inliers() {
        let loss = RobustLoss::Dcs { k: 0.1 };
        // Below the scale the scaling saturates at 1.
        assert_eq!(loss.weight(0.05), 1.0);
        assert!(loss.weight(0.5) < 0.2);
    }

    #[test]
    fn test_weights_decrease_with_residual() {
        for loss in [
            RobustLoss::L1,
            RobustLoss::Cauchy { k: 0.1 },
            RobustLoss::GemanMcClure { k: 0.1 },
            RobustLoss::Dcs { k: 0.1 },
        ] {
            let w1 = loss.weight(0.05);
            let w2 = loss.weight(0.2);
            let w3 = loss.weight(1.0);
            assert!(w1 >= w2, "{loss:?}: w1={w1} should be >= w2={w2}");
            assert!(w2 >= w3, "{loss:?}: w2={w2} should be >= w3={w3}");
        }
    }
}
