//! Sliding-window nonlinear least squares.
//!
//! The filter owns 6-dof state variables (poses and ℝ⁶ vectors), a set of
//! persistent cost terms, and a dense prior produced by marginalizing old
//! variables. Solves are Gauss-Newton with iteratively reweighted robust
//! losses and a fixed iteration budget.

mod cost_terms;
mod gauss_newton;
mod sliding_window;
mod variables;

pub use cost_terms::{Bracket, CostTerm, KnotKeys, LinearizedTerm};
pub use gauss_newton::{GaussNewtonParams, SolveSummary};
pub use sliding_window::{MarginalizationPrior, SlidingWindowFilter};
pub use variables::{VarKey, VarValue, Variable, VariableStore};
