//! Continuous-time trajectory model.
//!
//! A trajectory is a sequence of knots `(T_rm, w, dw)` tied together by a
//! Gauss-Markov motion prior. The prior supplies transition and
//! process-noise matrices; interpolation evaluates pose, velocity, and
//! acceleration anywhere between (or beyond) knots as pure functions of the
//! two bracketing knot states.

mod interp;
mod prior;

pub use interp::{
    InterpolatedJacobians, InterpolatedState, KnotState, extrapolate, extrapolate_with_jacobians,
    interpolate, interpolate_with_jacobians, prior_residual,
};
pub use prior::{Matrix18, MotionPrior, Vector18};
