//! Dense Gauss-Newton solve over the active variables.
//!
//! Assembly runs in variable-key order over the unlocked variables, so the
//! normal equations are deterministic for a given store and cost set.
//! Robust losses enter as IRLS weights on the whitened residual norm. The
//! iteration budget is a contract, not a convergence requirement: the
//! solver reports whether the step tolerance was reached but never fails on
//! a slow solve.

use std::collections::BTreeMap;

use nalgebra::{Cholesky, DMatrix, DVector};

use crate::engine::filter::cost_terms::CostTerm;
use crate::engine::filter::sliding_window::MarginalizationPrior;
use crate::engine::filter::variables::{VarKey, VariableStore};
use crate::error::OdometryError;

/// Solve parameters.
#[derive(Debug, Clone, Copy)]
pub struct GaussNewtonParams {
    /// Fixed iteration budget.
    pub max_iterations: usize,
    /// Infinity-norm step size below which the solve stops early.
    pub step_tolerance: f64,
    /// Log per-iteration cost.
    pub verbose: bool,
}

impl Default for GaussNewtonParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            step_tolerance: 1e-10,
            verbose: false,
        }
    }
}

/// Result of a Gauss-Newton run, retaining the final normal equations for
/// covariance queries.
#[derive(Debug, Clone)]
pub struct SolveSummary {
    pub iterations: usize,
    pub converged: bool,
    pub final_cost: f64,
    offsets: BTreeMap<VarKey, usize>,
    hessian: DMatrix<f64>,
}

impl SolveSummary {
    /// Joint covariance of the given (unlocked, active) variables as the
    /// corresponding block of `H⁻¹`. Returns `None` for unknown variables
    /// or a non-invertible system.
    pub fn covariance(&self, keys: &[VarKey]) -> Option<DMatrix<f64>> {
        let chol = Cholesky::new(self.hessian.clone())?;
        let full_inv = chol.inverse();
        let n = 6 * keys.len();
        let mut out = DMatrix::zeros(n, n);
        for (a, key_a) in keys.iter().enumerate() {
            let oa = *self.offsets.get(key_a)?;
            for (b, key_b) in keys.iter().enumerate() {
                let ob = *self.offsets.get(key_b)?;
                out.view_mut((6 * a, 6 * b), (6, 6))
                    .copy_from(&full_inv.view((oa, ob), (6, 6)));
            }
        }
        Some(out)
    }
}

/// Dense-index the unlocked variables in key order.
pub(super) fn active_offsets(store: &VariableStore) -> BTreeMap<VarKey, usize> {
    let mut offsets = BTreeMap::new();
    let mut offset = 0;
    for (key, var) in store.iter() {
        if !var.locked {
            offsets.insert(key, offset);
            offset += 6;
        }
    }
    offsets
}

/// Accumulate `JᵀWJ` and `−JᵀWe` of every cost term into `(h, g)`.
///
/// Blocks whose variable is absent from `offsets` (locked variables) are
/// skipped. Returns the accumulated robust cost.
pub(super) fn accumulate_costs<'a>(
    store: &VariableStore,
    costs: impl Iterator<Item = &'a CostTerm>,
    offsets: &BTreeMap<VarKey, usize>,
    h: &mut DMatrix<f64>,
    g: &mut DVector<f64>,
) -> Result<f64, OdometryError> {
    let mut total_cost = 0.0;
    for term in costs {
        let lin = term.linearize(store)?;
        let u = lin.whitened_norm();
        let weight = lin.loss.weight(u);
        total_cost += 0.5 * weight * u * u;

        for (key_a, jac_a) in &lin.blocks {
            let Some(&oa) = offsets.get(key_a) else { continue };
            let jtw = jac_a.transpose() * &lin.information * weight;
            let g_block = &jtw * &lin.residual;
            for i in 0..6 {
                g[oa + i] -= g_block[i];
            }
            for (key_b, jac_b) in &lin.blocks {
                let Some(&ob) = offsets.get(key_b) else { continue };
                let h_block = &jtw * jac_b;
                for i in 0..6 {
                    for j in 0..6 {
                        h[(oa + i, ob + j)] += h_block[(i, j)];
                    }
                }
            }
        }
    }
    Ok(total_cost)
}

/// Add the marginalization prior's quadratic contribution at the current
/// estimate.
pub(super) fn accumulate_prior(
    store: &VariableStore,
    prior: &MarginalizationPrior,
    offsets: &BTreeMap<VarKey, usize>,
    h: &mut DMatrix<f64>,
    g: &mut DVector<f64>,
) -> Result<f64, OdometryError> {
    let delta = prior.delta(store)?;
    // Gradient of ½δᵀHδ − bᵀδ is Hδ − b; the solver uses g = −gradient.
    let grad = &prior.hessian * &delta - &prior.rhs;
    for (a, key_a) in prior.keys.iter().enumerate() {
        let Some(&oa) = offsets.get(key_a) else {
            return Err(OdometryError::InvariantViolation(format!(
                "marginalization prior references inactive variable {key_a:?}"
            )));
        };
        for i in 0..6 {
            g[oa + i] -= grad[6 * a + i];
        }
        for (b, key_b) in prior.keys.iter().enumerate() {
            let Some(&ob) = offsets.get(key_b) else { continue };
            for i in 0..6 {
                for j in 0..6 {
                    h[(oa + i, ob + j)] += prior.hessian[(6 * a + i, 6 * b + j)];
                }
            }
        }
    }
    Ok(0.5 * delta.dot(&(&prior.hessian * &delta)) - prior.rhs.dot(&delta))
}

/// Run Gauss-Newton over the store's unlocked variables.
pub(super) fn solve(
    store: &mut VariableStore,
    prior: Option<&MarginalizationPrior>,
    cost_sets: &[&[CostTerm]],
    params: &GaussNewtonParams,
) -> Result<SolveSummary, OdometryError> {
    let offsets = active_offsets(store);
    let dim = 6 * offsets.len();
    if dim == 0 {
        return Ok(SolveSummary {
            iterations: 0,
            converged: true,
            final_cost: 0.0,
            offsets,
            hessian: DMatrix::zeros(0, 0),
        });
    }

    let mut hessian = DMatrix::zeros(dim, dim);
    let mut converged = false;
    let mut iterations = 0;
    let mut final_cost = 0.0;

    for iter in 0..params.max_iterations {
        iterations = iter + 1;
        hessian.fill(0.0);
        let mut g = DVector::zeros(dim);

        let mut cost = 0.0;
        for costs in cost_sets {
            cost += accumulate_costs(store, costs.iter(), &offsets, &mut hessian, &mut g)?;
        }
        if let Some(prior) = prior {
            cost += accumulate_prior(store, prior, &offsets, &mut hessian, &mut g)?;
        }
        final_cost = cost;

        let step = cholesky_solve(&hessian, &g)?;

        for (key, &offset) in &offsets {
            let delta = step.fixed_rows::<6>(offset).into_owned();
            store.apply_step(*key, &delta)?;
        }

        if params.verbose {
            log::debug!(
                "gauss-newton iter {iter}: cost {cost:.6e}, step {:.3e}",
                step.amax()
            );
        }
        if step.amax() < params.step_tolerance {
            converged = true;
            break;
        }
    }

    // Estimates leave the inner loop here; rotations get reprojected.
    store.reproject_poses();

    Ok(SolveSummary {
        iterations,
        converged,
        final_cost,
        offsets,
        hessian,
    })
}

/// Solve `H x = g` by Cholesky, with one jittered retry before giving up.
pub(super) fn cholesky_solve(
    h: &DMatrix<f64>,
    g: &DVector<f64>,
) -> Result<DVector<f64>, OdometryError> {
    if let Some(chol) = Cholesky::new(h.clone()) {
        return Ok(chol.solve(g));
    }
    let jitter = 1e-9 * h.diagonal().amax().max(1.0);
    let mut damped = h.clone();
    for i in 0..h.nrows() {
        damped[(i, i)] += jitter;
    }
    match Cholesky::new(damped) {
        Some(chol) => Ok(chol.solve(g)),
        None => Err(OdometryError::InvariantViolation(
            "normal equations are not positive definite".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::se3::Se3;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix6, Vector6};

    #[test]
    fn test_solve_pulls_vector_onto_prior() {
        let mut store = VariableStore::new();
        let key = store.add_vector(Vector6::repeat(1.0), false);
        let costs = vec![CostTerm::VectorPrior {
            key,
            value: Vector6::repeat(-2.0),
            information: Matrix6::identity(),
        }];
        let summary = solve(&mut store, None, &[&costs], &GaussNewtonParams::default())
            .expect("solve");
        assert!(summary.converged);
        let v = store.vector(key).expect("vector");
        assert_relative_eq!(v, Vector6::repeat(-2.0), epsilon = 1e-9);
    }

    #[test]
    fn test_solve_pulls_pose_onto_prior() {
        let mut store = VariableStore::new();
        let key = store.add_pose(Se3::identity(), false);
        let target = Se3::exp(&Vector6::new(0.3, -0.2, 0.5, 0.1, 0.05, -0.2));
        let costs = vec![CostTerm::PosePrior {
            key,
            value: target,
            information: Matrix6::identity(),
        }];
        let summary = solve(&mut store, None, &[&costs], &GaussNewtonParams::default())
            .expect("solve");
        assert!(summary.converged);
        let pose = store.pose(key).expect("pose");
        assert!(pose.compose(&target.inverse()).log().norm() < 1e-8);
    }

    #[test]
    fn test_locked_variable_does_not_move() {
        let mut store = VariableStore::new();
        let locked = store.add_vector(Vector6::zeros(), true);
        let free = store.add_vector(Vector6::zeros(), false);
        let costs = vec![
            CostTerm::VectorPrior {
                key: locked,
                value: Vector6::repeat(5.0),
                information: Matrix6::identity(),
            },
            CostTerm::VectorPrior {
                key: free,
                value: Vector6::repeat(1.0),
                information: Matrix6::identity(),
            },
        ];
        solve(&mut store, None, &[&costs], &GaussNewtonParams::default()).expect("solve");
        assert_relative_eq!(store.vector(locked).expect("locked"), Vector6::zeros());
        assert_relative_eq!(
            store.vector(free).expect("free"),
            Vector6::repeat(1.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_competing_priors_balance_by_information() {
        let mut store = VariableStore::new();
        let key = store.add_vector(Vector6::zeros(), false);
        let costs = vec![
            CostTerm::VectorPrior {
                key,
                value: Vector6::repeat(0.0),
                information: Matrix6::identity(),
            },
            CostTerm::VectorPrior {
                key,
                value: Vector6::repeat(3.0),
                information: Matrix6::identity() * 2.0,
            },
        ];
        solve(&mut store, None, &[&costs], &GaussNewtonParams::default()).expect("solve");
        // Weighted mean (0·1 + 3·2)/3 = 2.
        assert_relative_eq!(
            store.vector(key).expect("vector"),
            Vector6::repeat(2.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_covariance_matches_information() {
        let mut store = VariableStore::new();
        let key = store.add_vector(Vector6::zeros(), false);
        let costs = vec![CostTerm::VectorPrior {
            key,
            value: Vector6::zeros(),
            information: Matrix6::identity() * 4.0,
        }];
        let summary = solve(&mut store, None, &[&costs], &GaussNewtonParams::default())
            .expect("solve");
        let cov = summary.covariance(&[key]).expect("covariance");
        assert_relative_eq!(cov[(0, 0)], 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_problem_is_trivially_converged() {
        let mut store = VariableStore::new();
        store.add_pose(Se3::identity(), true);
        let summary = solve(&mut store, None, &[], &GaussNewtonParams::default())
            .expect("solve");
        assert!(summary.converged);
        assert_eq!(summary.iterations, 0);
    }
}
