//! Cost terms of the sliding-window problem.
//!
//! A tagged enum covers the closed set of residuals the engine needs:
//! point-to-plane, knot-to-knot trajectory priors, absolute priors,
//! accelerometer/gyroscope, and random walks on bias and gravity frame.
//! Each term linearizes to a residual, per-variable 6-column Jacobian
//! blocks, an information matrix, and a robust loss.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x6, Matrix6, Vector3, Vector6};

use crate::algorithms::matching::RobustLoss;
use crate::algorithms::trajectory::{
    InterpolatedJacobians, MotionPrior, extrapolate_with_jacobians, interpolate_with_jacobians,
    prior_residual,
};
use crate::core::se3::{Se3, se3_inv_left_jacobian, skew};
use crate::engine::filter::variables::{VarKey, VariableStore};
use crate::error::OdometryError;

use super::variables::VarValue;

/// The three trajectory variables of one knot.
#[derive(Debug, Clone, Copy)]
pub struct KnotKeys {
    pub pose: VarKey,
    pub w: VarKey,
    pub dw: VarKey,
}

impl KnotKeys {
    fn as_array(&self) -> [VarKey; 3] {
        [self.pose, self.w, self.dw]
    }
}

/// Which knots a time-interpolated term evaluates between.
#[derive(Debug, Clone, Copy)]
pub enum Bracket {
    /// Query time between two knots.
    Pair {
        t1: f64,
        k1: KnotKeys,
        t2: f64,
        k2: KnotKeys,
    },
    /// Query time beyond the knot span; extrapolate from this knot.
    Single { t: f64, k: KnotKeys },
}

impl Bracket {
    fn keys(&self) -> Vec<VarKey> {
        match self {
            Bracket::Pair { k1, k2, .. } => {
                let mut keys = k1.as_array().to_vec();
                keys.extend_from_slice(&k2.as_array());
                keys
            }
            Bracket::Single { k, .. } => k.as_array().to_vec(),
        }
    }

    /// Evaluate the interpolated state with Jacobians at `tau` and pair each
    /// Jacobian slot with its variable key.
    fn eval(
        &self,
        store: &VariableStore,
        prior: &MotionPrior,
        tau: f64,
    ) -> Result<(InterpolatedJacobians, Vec<VarKey>), OdometryError> {
        let knot_state = |k: &KnotKeys| -> Result<_, OdometryError> {
            Ok(crate::algorithms::trajectory::KnotState {
                pose: store.pose(k.pose)?,
                w: store.vector(k.w)?,
                dw: store.vector(k.dw)?,
            })
        };
        match self {
            Bracket::Pair { t1, k1, t2, k2 } => {
                let s1 = knot_state(k1)?;
                let s2 = knot_state(k2)?;
                let interp = interpolate_with_jacobians(prior, &s1, *t1, &s2, *t2, tau);
                Ok((interp, self.keys()))
            }
            Bracket::Single { t, k } => {
                let s = knot_state(k)?;
                let interp = extrapolate_with_jacobians(prior, &s, *t, tau);
                Ok((interp, self.keys()))
            }
        }
    }
}

/// A linearized cost term: residual `r`, Jacobian blocks `J_v` per variable,
/// information `W`, and the robust loss applied to `‖r‖_W`.
#[derive(Debug, Clone)]
pub struct LinearizedTerm {
    pub residual: DVector<f64>,
    pub blocks: Vec<(VarKey, DMatrix<f64>)>,
    pub information: DMatrix<f64>,
    pub loss: RobustLoss,
}

impl LinearizedTerm {
    /// Whitened residual norm `sqrt(rᵀ W r)`.
    pub fn whitened_norm(&self) -> f64 {
        (self.residual.dot(&(&self.information * &self.residual))).max(0.0).sqrt()
    }
}

/// One residual of the window problem.
#[derive(Debug, Clone)]
pub enum CostTerm {
    /// Point-to-plane registration residual on the interpolated pose.
    PointToPlane {
        bracket: Bracket,
        prior: MotionPrior,
        query_time: f64,
        /// Raw point in the sensor frame.
        raw_pt: Vector3<f64>,
        /// Robot-from-sensor extrinsic (`T_sr⁻¹`).
        t_rs: Se3,
        /// Reference point on the associated plane (world frame).
        reference: Vector3<f64>,
        /// Plane information `(w·n̂)(w·n̂)ᵀ + εI`.
        information: Matrix3<f64>,
        loss: RobustLoss,
    },

    /// Knot-to-knot motion prior, weighted by `Q(Δt)⁻¹`.
    TrajectoryPrior {
        t1: f64,
        k1: KnotKeys,
        t2: f64,
        k2: KnotKeys,
        prior: MotionPrior,
    },

    /// Absolute pose prior `log(T · T₀⁻¹)`.
    PosePrior {
        key: VarKey,
        value: Se3,
        information: Matrix6<f64>,
    },

    /// Absolute prior on an ℝ⁶ variable.
    VectorPrior {
        key: VarKey,
        value: Vector6<f64>,
        information: Matrix6<f64>,
    },

    /// Accelerometer residual on the interpolated state.
    Accelerometer {
        bracket: Bracket,
        prior: MotionPrior,
        query_time: f64,
        bias: VarKey,
        t_mi: VarKey,
        /// Gravity along the inertial z axis.
        gravity: f64,
        meas: Vector3<f64>,
        information: Matrix3<f64>,
        loss: RobustLoss,
    },

    /// Gyroscope residual on the interpolated body velocity.
    Gyroscope {
        bracket: Bracket,
        prior: MotionPrior,
        query_time: f64,
        bias: VarKey,
        meas: Vector3<f64>,
        information: Matrix3<f64>,
        loss: RobustLoss,
    },

    /// Random walk `v₂ − v₁` between ℝ⁶ variables (IMU bias).
    RelativeVector {
        from: VarKey,
        to: VarKey,
        information: Matrix6<f64>,
    },

    /// Random walk `log(T₂ · T₁⁻¹)` between poses (gravity frame).
    RelativePose {
        from: VarKey,
        to: VarKey,
        information: Matrix6<f64>,
    },
}

impl CostTerm {
    /// Every variable this term touches (locked or not).
    pub fn keys(&self) -> Vec<VarKey> {
        match self {
            CostTerm::PointToPlane { bracket, .. } => bracket.keys(),
            CostTerm::TrajectoryPrior { k1, k2, .. } => {
                let mut keys = k1.as_array().to_vec();
                keys.extend_from_slice(&k2.as_array());
                keys
            }
            CostTerm::PosePrior { key, .. } | CostTerm::VectorPrior { key, .. } => vec![*key],
            CostTerm::Accelerometer { bracket, bias, t_mi, .. } => {
                let mut keys = bracket.keys();
                keys.push(*bias);
                keys.push(*t_mi);
                keys
            }
            CostTerm::Gyroscope { bracket, bias, .. } => {
                let mut keys = bracket.keys();
                keys.push(*bias);
                keys
            }
            CostTerm::RelativeVector { from, to, .. }
            | CostTerm::RelativePose { from, to, .. } => vec![*from, *to],
        }
    }

    /// Linearize at the store's current values.
    pub fn linearize(&self, store: &VariableStore) -> Result<LinearizedTerm, OdometryError> {
        let term = match self {
            CostTerm::PointToPlane {
                bracket,
                prior,
                query_time,
                raw_pt,
                t_rs,
                reference,
                information,
                loss,
            } => {
                let (interp, vars) = bracket.eval(store, prior, *query_time)?;
                let t_rm = interp.state.pose;
                let t_mr = t_rm.inverse();
                // Robot-frame point, then world.
                let q = t_rs.transform(raw_pt);
                let p_m = t_mr.transform(&q);
                let residual = p_m - reference;

                // ∂p_m/∂(δζ on T_rm) = −R_mr [I | −q×]
                let mut d_pm = Matrix3x6::zeros();
                d_pm.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-t_mr.r));
                d_pm.fixed_view_mut::<3, 3>(0, 3).copy_from(&(t_mr.r * skew(&q)));

                let blocks = vars
                    .iter()
                    .enumerate()
                    .map(|(i, key)| {
                        let jac: Matrix3x6<f64> = d_pm * interp.pose_jac[i];
                        (*key, dmatrix_from(&jac))
                    })
                    .collect();

                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks,
                    information: dmatrix_from(information),
                    loss: *loss,
                }
            }

            CostTerm::TrajectoryPrior { t1, k1, t2, k2, prior } => {
                let s1 = crate::algorithms::trajectory::KnotState {
                    pose: store.pose(k1.pose)?,
                    w: store.vector(k1.w)?,
                    dw: store.vector(k1.dw)?,
                };
                let s2 = crate::algorithms::trajectory::KnotState {
                    pose: store.pose(k2.pose)?,
                    w: store.vector(k2.w)?,
                    dw: store.vector(k2.dw)?,
                };
                let (residual, jacobians) = prior_residual(prior, &s1, *t1, &s2, *t2);
                let information = prior.process_information(*t2 - *t1);

                let mut keys = k1.as_array().to_vec();
                keys.extend_from_slice(&k2.as_array());
                let blocks = keys
                    .iter()
                    .zip(jacobians.iter())
                    .map(|(key, jac)| (*key, dmatrix_from(jac)))
                    .collect();

                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks,
                    information: dmatrix_from(&information),
                    loss: RobustLoss::L2,
                }
            }

            CostTerm::PosePrior { key, value, information } => {
                let pose = store.pose(*key)?;
                let residual = pose.compose(&value.inverse()).log();
                let jac = se3_inv_left_jacobian(&residual);
                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks: vec![(*key, dmatrix_from(&jac))],
                    information: dmatrix_from(information),
                    loss: RobustLoss::L2,
                }
            }

            CostTerm::VectorPrior { key, value, information } => {
                let v = store.vector(*key)?;
                let residual = v - value;
                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks: vec![(*key, dmatrix_from(&Matrix6::identity()))],
                    information: dmatrix_from(information),
                    loss: RobustLoss::L2,
                }
            }

            CostTerm::Accelerometer {
                bracket,
                prior,
                query_time,
                bias,
                t_mi,
                gravity,
                meas,
                information,
                loss,
            } => {
                let (interp, vars) = bracket.eval(store, prior, *query_time)?;
                let b = store.vector(*bias)?;
                let t_mi_val = store.pose(*t_mi)?;

                let dw_lin = interp.state.acceleration.fixed_rows::<3>(0).into_owned();
                let r_rm = interp.state.pose.r;
                let g_i = Vector3::new(0.0, 0.0, *gravity);
                let g_m = t_mi_val.r * g_i;
                let b_a = b.fixed_rows::<3>(0).into_owned();

                let residual = dw_lin + r_rm * g_m + b_a - meas;

                // Gravity rotated by the interpolated pose: left perturbation
                // on T_rm moves R_rm·g_m by −(R_rm g_m)× δφ.
                let mut d_pose = Matrix3x6::zeros();
                d_pose
                    .fixed_view_mut::<3, 3>(0, 3)
                    .copy_from(&(-skew(&(r_rm * g_m))));

                let mut blocks: Vec<(VarKey, DMatrix<f64>)> = vars
                    .iter()
                    .enumerate()
                    .map(|(i, key)| {
                        let jac: Matrix3x6<f64> = interp.acceleration_jac[i].fixed_view::<3, 6>(0, 0).into_owned()
                            + d_pose * interp.pose_jac[i];
                        (*key, dmatrix_from(&jac))
                    })
                    .collect();

                // Accelerometer bias occupies the first three bias rows.
                let mut d_bias = Matrix3x6::zeros();
                d_bias
                    .fixed_view_mut::<3, 3>(0, 0)
                    .copy_from(&Matrix3::identity());
                blocks.push((*bias, dmatrix_from(&d_bias)));

                // Gravity frame: δ(R_rm R_mi g) = −R_rm (R_mi g)× δη_φ.
                let mut d_tmi = Matrix3x6::zeros();
                d_tmi
                    .fixed_view_mut::<3, 3>(0, 3)
                    .copy_from(&(-(r_rm * skew(&g_m))));
                blocks.push((*t_mi, dmatrix_from(&d_tmi)));

                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks,
                    information: dmatrix_from(information),
                    loss: *loss,
                }
            }

            CostTerm::Gyroscope {
                bracket,
                prior,
                query_time,
                bias,
                meas,
                information,
                loss,
            } => {
                let (interp, vars) = bracket.eval(store, prior, *query_time)?;
                let b = store.vector(*bias)?;
                let w_ang = interp.state.velocity.fixed_rows::<3>(3).into_owned();
                let b_g = b.fixed_rows::<3>(3).into_owned();
                let residual = w_ang + b_g - meas;

                let mut blocks: Vec<(VarKey, DMatrix<f64>)> = vars
                    .iter()
                    .enumerate()
                    .map(|(i, key)| {
                        let jac = interp.velocity_jac[i].fixed_view::<3, 6>(3, 0).into_owned();
                        (*key, dmatrix_from(&jac))
                    })
                    .collect();

                // Gyro bias occupies the last three bias rows.
                let mut d_bias = Matrix3x6::zeros();
                d_bias
                    .fixed_view_mut::<3, 3>(0, 3)
                    .copy_from(&Matrix3::identity());
                blocks.push((*bias, dmatrix_from(&d_bias)));

                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks,
                    information: dmatrix_from(information),
                    loss: *loss,
                }
            }

            CostTerm::RelativeVector { from, to, information } => {
                let residual = store.vector(*to)? - store.vector(*from)?;
                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks: vec![
                        (*from, dmatrix_from(&(-Matrix6::<f64>::identity()))),
                        (*to, dmatrix_from(&Matrix6::<f64>::identity())),
                    ],
                    information: dmatrix_from(information),
                    loss: RobustLoss::L2,
                }
            }

            CostTerm::RelativePose { from, to, information } => {
                let t_from = store.pose(*from)?;
                let t_to = store.pose(*to)?;
                let rel = t_to.compose(&t_from.inverse());
                let residual = rel.log();
                let j_inv = se3_inv_left_jacobian(&residual);
                LinearizedTerm {
                    residual: DVector::from_column_slice(residual.as_slice()),
                    blocks: vec![
                        (*from, dmatrix_from(&(-j_inv * rel.adjoint()))),
                        (*to, dmatrix_from(&j_inv)),
                    ],
                    information: dmatrix_from(information),
                    loss: RobustLoss::L2,
                }
            }
        };

        if term.residual.iter().any(|v| !v.is_finite()) {
            return Err(OdometryError::InvariantViolation(
                "non-finite residual in cost term".to_string(),
            ));
        }
        Ok(term)
    }
}

/// Copy a fixed-size nalgebra matrix into a `DMatrix`.
fn dmatrix_from<const R: usize, const C: usize>(
    m: &nalgebra::SMatrix<f64, R, C>,
) -> DMatrix<f64> {
    DMatrix::from_fn(R, C, |i, j| m[(i, j)])
}

/// Build a `VarValue`-preserving snapshot used by marginalization
/// linearization points.
pub(super) fn value_snapshot(
    store: &VariableStore,
    keys: &[VarKey],
) -> Result<Vec<VarValue>, OdometryError> {
    keys.iter().map(|k| store.value(*k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn store_with_knot_pair() -> (VariableStore, KnotKeys, KnotKeys) {
        let mut store = VariableStore::new();
        let k1 = KnotKeys {
            pose: store.add_pose(Se3::identity(), false),
            w: store.add_vector(Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0), false),
            dw: store.add_vector(Vector6::zeros(), false),
        };
        let k2 = KnotKeys {
            pose: store.add_pose(
                Se3::exp(&Vector6::new(0.5, 0.0, 0.0, 0.0, 0.0, 0.0)),
                false,
            ),
            w: store.add_vector(Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0), false),
            dw: store.add_vector(Vector6::zeros(), false),
        };
        (store, k1, k2)
    }

    fn wnoj() -> MotionPrior {
        MotionPrior::WhiteNoiseOnJerk {
            qc_diag: Vector6::repeat(1.0),
        }
    }

    #[test]
    fn test_trajectory_prior_zero_residual_on_consistent_knots() {
        let (store, k1, k2) = store_with_knot_pair();
        let term = CostTerm::TrajectoryPrior {
            t1: 0.0,
            k1,
            t2: 0.5,
            k2,
            prior: wnoj(),
        };
        let lin = term.linearize(&store).expect("linearize");
        assert!(lin.residual.norm() < 1e-9, "residual = {}", lin.residual.norm());
        assert_eq!(lin.blocks.len(), 6);
        assert_eq!(lin.residual.len(), 18);
    }

    #[test]
    fn test_point_to_plane_residual_is_plane_offset() {
        let (store, k1, k2) = store_with_knot_pair();
        // Keypoint measured at the first knot time: world pose is identity.
        let term = CostTerm::PointToPlane {
            bracket: Bracket::Pair { t1: 0.0, k1, t2: 0.5, k2 },
            prior: wnoj(),
            query_time: 0.0,
            raw_pt: Vector3::new(1.0, 2.0, 0.3),
            t_rs: Se3::identity(),
            reference: Vector3::new(1.0, 2.0, 0.0),
            information: Matrix3::identity(),
            loss: RobustLoss::L2,
        };
        let lin = term.linearize(&store).expect("linearize");
        assert_relative_eq!(lin.residual[2], 0.3, epsilon = 1e-10);
    }

    #[test]
    fn test_pose_prior_residual_and_identity_jacobian_at_value() {
        let mut store = VariableStore::new();
        let value = Se3::exp(&Vector6::new(0.1, 0.2, 0.0, 0.0, 0.0, 0.3));
        let key = store.add_pose(value, false);
        let term = CostTerm::PosePrior {
            key,
            value,
            information: Matrix6::identity(),
        };
        let lin = term.linearize(&store).expect("linearize");
        assert!(lin.residual.norm() < 1e-12);
        assert_relative_eq!(lin.blocks[0].1[(0, 0)], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gyroscope_residual_uses_angular_rows() {
        let (store, k1, k2) = store_with_knot_pair();
        let mut store = store;
        let bias = store.add_vector(Vector6::zeros(), false);
        let term = CostTerm::Gyroscope {
            bracket: Bracket::Pair { t1: 0.0, k1, t2: 0.5, k2 },
            prior: wnoj(),
            query_time: 0.0,
            bias,
            meas: Vector3::new(0.0, 0.0, 0.2),
            information: Matrix3::identity(),
            loss: RobustLoss::L1,
        };
        let lin = term.linearize(&store).expect("linearize");
        // w_ang = 0, bias = 0 → residual = −meas.
        assert_relative_eq!(lin.residual[2], -0.2, epsilon = 1e-10);
    }

    #[test]
    fn test_accelerometer_stationary_measures_gravity() {
        let (store, k1, k2) = store_with_knot_pair();
        let mut store = store;
        let bias = store.add_vector(Vector6::zeros(), false);
        let t_mi = store.add_pose(Se3::identity(), true);
        let gravity = -9.8042;
        let term = CostTerm::Accelerometer {
            bracket: Bracket::Pair { t1: 0.0, k1, t2: 0.5, k2 },
            prior: wnoj(),
            query_time: 0.0,
            bias,
            t_mi,
            gravity,
            meas: Vector3::new(0.0, 0.0, gravity),
            information: Matrix3::identity(),
            loss: RobustLoss::L1,
        };
        let lin = term.linearize(&store).expect("linearize");
        // dw = 0 and the measurement equals rotated gravity → zero residual.
        assert!(lin.residual.norm() < 1e-10, "residual = {}", lin.residual.norm());
    }

    #[test]
    fn test_relative_vector_random_walk() {
        let mut store = VariableStore::new();
        let a = store.add_vector(Vector6::repeat(0.1), false);
        let b = store.add_vector(Vector6::repeat(0.3), false);
        let term = CostTerm::RelativeVector {
            from: a,
            to: b,
            information: Matrix6::identity(),
        };
        let lin = term.linearize(&store).expect("linearize");
        assert_relative_eq!(lin.residual[0], 0.2, epsilon = 1e-12);
    }
}
