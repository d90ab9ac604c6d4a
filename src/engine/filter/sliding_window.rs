//! The sliding-window filter: persistent variables and cost terms plus a
//! dense marginalization prior.
//!
//! Marginalizing a set of variables folds every cost term that touches them
//! (and the previous prior) into a linearized system, Schur-complements the
//! marginalized block away, and keeps the result as a quadratic prior on
//! the frontier variables, anchored at their values at marginalization
//! time. Consumed cost terms and variables are dropped; the active problem
//! stays bounded.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};

use crate::engine::filter::cost_terms::{CostTerm, value_snapshot};
use crate::engine::filter::gauss_newton::{
    self, GaussNewtonParams, SolveSummary, accumulate_costs, accumulate_prior, cholesky_solve,
};
use crate::engine::filter::variables::{VarKey, VarValue, VariableStore};
use crate::error::OdometryError;

/// Dense quadratic prior `½δᵀHδ − bᵀδ` over the frontier variables, with
/// `δ` measured from the stored linearization points.
#[derive(Debug, Clone)]
pub struct MarginalizationPrior {
    pub(super) keys: Vec<VarKey>,
    pub(super) hessian: DMatrix<f64>,
    pub(super) rhs: DVector<f64>,
    lin_points: Vec<VarValue>,
}

impl MarginalizationPrior {
    /// Variables the prior constrains.
    pub fn keys(&self) -> &[VarKey] {
        &self.keys
    }

    /// Stacked `x ⊟ x_lin` over the prior's variables.
    pub(super) fn delta(&self, store: &VariableStore) -> Result<DVector<f64>, OdometryError> {
        let mut delta = DVector::zeros(6 * self.keys.len());
        for (i, (key, lin)) in self.keys.iter().zip(self.lin_points.iter()).enumerate() {
            let d = store.value(*key)?.boxminus(lin)?;
            for j in 0..6 {
                delta[6 * i + j] = d[j];
            }
        }
        Ok(delta)
    }
}

/// Bounded nonlinear least-squares problem with marginalization.
#[derive(Debug, Default)]
pub struct SlidingWindowFilter {
    store: VariableStore,
    costs: Vec<CostTerm>,
    prior: Option<MarginalizationPrior>,
}

impl SlidingWindowFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut VariableStore {
        &mut self.store
    }

    pub fn prior(&self) -> Option<&MarginalizationPrior> {
        self.prior.as_ref()
    }

    /// Commit a cost term to the persistent window problem.
    pub fn add_cost_term(&mut self, term: CostTerm) {
        self.costs.push(term);
    }

    pub fn add_cost_terms(&mut self, terms: impl IntoIterator<Item = CostTerm>) {
        self.costs.extend(terms);
    }

    /// Number of unlocked (optimized) variables.
    pub fn num_variables(&self) -> usize {
        self.store.num_unlocked()
    }

    /// Number of persistent cost terms.
    pub fn num_cost_terms(&self) -> usize {
        self.costs.len()
    }

    /// Solve over the persistent terms plus any number of transient term
    /// sets.
    ///
    /// Transient terms see the same variables and prior but are not
    /// committed; the ICP inner loop relies on this.
    pub fn solve(
        &mut self,
        extra: &[&[CostTerm]],
        params: &GaussNewtonParams,
    ) -> Result<SolveSummary, OdometryError> {
        let mut sets: Vec<&[CostTerm]> = Vec::with_capacity(extra.len() + 1);
        sets.push(&self.costs);
        sets.extend_from_slice(extra);
        gauss_newton::solve(&mut self.store, self.prior.as_ref(), &sets, params)
    }

    /// Marginalize the given variables out of the window.
    ///
    /// Every persistent cost term touching one of them is consumed into the
    /// new dense prior; the variables are removed from the store.
    pub fn marginalize(&mut self, marg_keys: &[VarKey]) -> Result<(), OdometryError> {
        if marg_keys.is_empty() {
            return Ok(());
        }
        let marg_set: BTreeSet<VarKey> = marg_keys.iter().copied().collect();
        for key in &marg_set {
            if self.store.is_locked(*key)? {
                return Err(OdometryError::InvariantViolation(format!(
                    "cannot marginalize locked variable {key:?}"
                )));
            }
        }

        // Split the persistent costs into consumed (touching a marginalized
        // variable) and surviving.
        let costs = std::mem::take(&mut self.costs);
        let (consumed, remaining): (Vec<_>, Vec<_>) = costs
            .into_iter()
            .partition(|term| term.keys().iter().any(|k| marg_set.contains(k)));

        // Frontier: unlocked variables sharing a consumed term, plus
        // everything the previous prior constrained.
        let mut related: BTreeSet<VarKey> = BTreeSet::new();
        for term in &consumed {
            for key in term.keys() {
                if !marg_set.contains(&key) && !self.store.is_locked(key)? {
                    related.insert(key);
                }
            }
        }
        if let Some(prior) = &self.prior {
            for key in &prior.keys {
                if !marg_set.contains(key) {
                    related.insert(*key);
                }
            }
        }

        // Local dense system ordered [marginalized | frontier].
        let marg_list: Vec<VarKey> = marg_set.iter().copied().collect();
        let related_list: Vec<VarKey> = related.iter().copied().collect();
        let mut offsets = std::collections::BTreeMap::new();
        for (i, key) in marg_list.iter().chain(related_list.iter()).enumerate() {
            offsets.insert(*key, 6 * i);
        }
        let dim = 6 * (marg_list.len() + related_list.len());
        let m = 6 * marg_list.len();
        let r = dim - m;

        let mut h = DMatrix::zeros(dim, dim);
        let mut g = DVector::zeros(dim);
        accumulate_costs(&self.store, consumed.iter(), &offsets, &mut h, &mut g)?;
        if let Some(prior) = &self.prior {
            accumulate_prior(&self.store, prior, &offsets, &mut h, &mut g)?;
        }

        if r == 0 {
            // Nothing survives; the information dies with the variables.
            self.prior = None;
        } else {
            let h_mm = h.view((0, 0), (m, m)).into_owned();
            let h_rm = h.view((m, 0), (r, m)).into_owned();
            let h_rr = h.view((m, m), (r, r)).into_owned();
            let g_m = g.rows(0, m).into_owned();
            let g_r = g.rows(m, r).into_owned();

            // Schur complement onto the frontier. Solving column-wise keeps
            // this free of an explicit H_mm inverse.
            let h_mr = h_rm.transpose();
            let mut h_mm_inv_h_mr = DMatrix::zeros(m, r);
            for col in 0..r {
                let solved = cholesky_solve(&h_mm, &h_mr.column(col).into_owned())?;
                h_mm_inv_h_mr.set_column(col, &solved);
            }
            let h_mm_inv_g_m = cholesky_solve(&h_mm, &g_m)?;

            let mut new_h = h_rr - &h_rm * &h_mm_inv_h_mr;
            // Symmetrize against floating-point drift.
            new_h = 0.5 * (&new_h + &new_h.transpose());
            let new_rhs = g_r - &h_rm * h_mm_inv_g_m;

            self.prior = Some(MarginalizationPrior {
                lin_points: value_snapshot(&self.store, &related_list)?,
                keys: related_list,
                hessian: new_h,
                rhs: new_rhs,
            });
        }

        self.costs = remaining;
        for key in &marg_list {
            self.store.remove(*key);
        }
        Ok(())
    }
}
