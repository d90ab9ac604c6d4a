//! Closed-form trajectory interpolation between knots.
//!
//! All functions are pure: they take the two bracketing knot states and a
//! query time and return values (and, where needed, Jacobian blocks with
//! respect to the six knot variables). Local coordinates follow the
//! Gauss-Markov construction: relative to knot 1 the second knot is
//!
//! ```text
//! γ₂ = [ ξ₂₁,  J(ξ₂₁)⁻¹ w₂,  −½ ad(J⁻¹w₂) w₂ + J⁻¹ ẇ₂ ]
//! ```
//!
//! and the interpolated local state is `γ(τ) = Λ γ₁ + Ψ γ₂`. Velocity and
//! acceleration are mapped back through the SE(3) left Jacobian; the
//! acceleration carries the `½ ad(γ_v) w` correction so knot states are
//! reproduced exactly at knot times. Jacobians keep the first-order
//! curly-hat corrections and drop higher orders.

use nalgebra::{Matrix6, Vector6};

use crate::algorithms::trajectory::prior::{Matrix18, MotionPrior, Vector18};
use crate::core::se3::{Se3, curly_hat, se3_inv_left_jacobian, se3_left_jacobian};

/// Trajectory state at one knot.
#[derive(Debug, Clone, Copy)]
pub struct KnotState {
    /// World-in-robot pose `T_rm`.
    pub pose: Se3,
    /// Body twist `w_mr_inr` (`[linear; angular]`).
    pub w: Vector6<f64>,
    /// Body acceleration `dw_mr_inr`.
    pub dw: Vector6<f64>,
}

impl KnotState {
    pub fn identity() -> Self {
        Self {
            pose: Se3::identity(),
            w: Vector6::zeros(),
            dw: Vector6::zeros(),
        }
    }
}

/// Interpolated trajectory state at a query time.
#[derive(Debug, Clone, Copy)]
pub struct InterpolatedState {
    pub pose: Se3,
    pub velocity: Vector6<f64>,
    pub acceleration: Vector6<f64>,
}

/// Interpolated state plus Jacobians with respect to the knot variables, in
/// the order `[T₁, w₁, ẇ₁, T₂, w₂, ẇ₂]` (half of that for extrapolation).
#[derive(Debug, Clone)]
pub struct InterpolatedJacobians {
    pub state: InterpolatedState,
    pub pose_jac: Vec<Matrix6<f64>>,
    pub velocity_jac: Vec<Matrix6<f64>>,
    pub acceleration_jac: Vec<Matrix6<f64>>,
}

/// Relative-state context shared by the prior residual and the
/// interpolators.
struct Gamma2 {
    gamma2: Vector18,
    /// ∂ξ₂₁/∂ε₁ and ∂ξ₂₁/∂ε₂.
    dxi_de1: Matrix6<f64>,
    dxi_de2: Matrix6<f64>,
    /// Derivatives of the velocity/acceleration rows of γ₂.
    dg2v_dxi: Matrix6<f64>,
    dg2v_dw2: Matrix6<f64>,
    dg2a_dxi: Matrix6<f64>,
    dg2a_dw2: Matrix6<f64>,
    dg2a_ddw2: Matrix6<f64>,
}

fn gamma2_context(k1: &KnotState, k2: &KnotState) -> Gamma2 {
    let t21 = k2.pose.compose(&k1.pose.inverse());
    let xi21 = t21.log();
    let j21_inv = se3_inv_left_jacobian(&xi21);

    let g2v = j21_inv * k2.w;
    let g2a = -0.5 * curly_hat(&g2v) * k2.w + j21_inv * k2.dw;

    let mut gamma2 = Vector18::zeros();
    gamma2.fixed_rows_mut::<6>(0).copy_from(&xi21);
    gamma2.fixed_rows_mut::<6>(6).copy_from(&g2v);
    gamma2.fixed_rows_mut::<6>(12).copy_from(&g2a);

    let w2_hat = curly_hat(&k2.w);
    Gamma2 {
        gamma2,
        dxi_de1: -j21_inv * t21.adjoint(),
        dxi_de2: j21_inv,
        dg2v_dxi: 0.5 * w2_hat,
        dg2v_dw2: j21_inv,
        dg2a_dxi: 0.25 * w2_hat * w2_hat + 0.5 * curly_hat(&k2.dw),
        dg2a_dw2: 0.5 * w2_hat * j21_inv - 0.5 * curly_hat(&g2v),
        dg2a_ddw2: j21_inv,
    }
}

fn gamma1(k1: &KnotState) -> Vector18 {
    let mut g = Vector18::zeros();
    g.fixed_rows_mut::<6>(6).copy_from(&k1.w);
    g.fixed_rows_mut::<6>(12).copy_from(&k1.dw);
    g
}

fn state_from_gamma(gamma_tau: &Vector18, base: &Se3) -> (InterpolatedState, Vector6<f64>, Matrix6<f64>) {
    let xi_tau = gamma_tau.fixed_rows::<6>(0).into_owned();
    let g_v = gamma_tau.fixed_rows::<6>(6).into_owned();
    let g_a = gamma_tau.fixed_rows::<6>(12).into_owned();

    let j_tau = se3_left_jacobian(&xi_tau);
    let pose = Se3::exp(&xi_tau).compose(base);
    let velocity = j_tau * g_v;
    let h = g_a + 0.5 * curly_hat(&g_v) * velocity;
    let acceleration = j_tau * h;
    (
        InterpolatedState {
            pose,
            velocity,
            acceleration,
        },
        h,
        j_tau,
    )
}

/// Interpolate the trajectory state at `tau ∈ [t1, t2]`.
pub fn interpolate(
    prior: &MotionPrior,
    k1: &KnotState,
    t1: f64,
    k2: &KnotState,
    t2: f64,
    tau: f64,
) -> InterpolatedState {
    if tau == t1 {
        return InterpolatedState {
            pose: k1.pose,
            velocity: k1.w,
            acceleration: k1.dw,
        };
    }
    if tau == t2 {
        return InterpolatedState {
            pose: k2.pose,
            velocity: k2.w,
            acceleration: k2.dw,
        };
    }
    let (lambda, psi) = prior.lambda_psi(t2 - t1, tau - t1);
    let ctx = gamma2_context(k1, k2);
    let gamma_tau = lambda * gamma1(k1) + psi * ctx.gamma2;
    state_from_gamma(&gamma_tau, &k1.pose).0
}

/// Extrapolate the trajectory state from a single knot to `tau` (either
/// side of the knot time).
pub fn extrapolate(prior: &MotionPrior, knot: &KnotState, t: f64, tau: f64) -> InterpolatedState {
    let gamma_tau = prior.transition(tau - t) * gamma1(knot);
    state_from_gamma(&gamma_tau, &knot.pose).0
}

/// Row-block views of an 18×18 interpolation matrix.
fn row_blocks(m: &Matrix18, row: usize) -> [Matrix6<f64>; 3] {
    [
        m.fixed_view::<6, 6>(row, 0).into_owned(),
        m.fixed_view::<6, 6>(row, 6).into_owned(),
        m.fixed_view::<6, 6>(row, 12).into_owned(),
    ]
}

/// Interpolate with Jacobians w.r.t. `[T₁, w₁, ẇ₁, T₂, w₂, ẇ₂]`.
pub fn interpolate_with_jacobians(
    prior: &MotionPrior,
    k1: &KnotState,
    t1: f64,
    k2: &KnotState,
    t2: f64,
    tau: f64,
) -> InterpolatedJacobians {
    let (lambda, psi) = prior.lambda_psi(t2 - t1, tau - t1);
    let ctx = gamma2_context(k1, k2);
    let gamma_tau = lambda * gamma1(k1) + psi * ctx.gamma2;
    let (state, h, j_tau) = state_from_gamma(&gamma_tau, &k1.pose);

    let g_v = gamma_tau.fixed_rows::<6>(6).into_owned();
    let g_v_hat = curly_hat(&g_v);
    let w_hat = curly_hat(&state.velocity);
    let h_hat = curly_hat(&h);

    // γ(τ) row derivatives per variable. For the pose perturbations the γ₂
    // rows all chain through ∂ξ₂₁/∂ε, so the Ψ row combination can be
    // factored once.
    let mut dgam = [[Matrix6::<f64>::zeros(); 6]; 3];
    for (r, row) in [0usize, 6, 12].iter().enumerate() {
        let [psi_p, psi_v, psi_a] = row_blocks(&psi, *row);
        let [_, lam_v, lam_a] = row_blocks(&lambda, *row);
        let through_xi = psi_p + psi_v * ctx.dg2v_dxi + psi_a * ctx.dg2a_dxi;
        dgam[r][0] = through_xi * ctx.dxi_de1;
        dgam[r][1] = lam_v;
        dgam[r][2] = lam_a;
        dgam[r][3] = through_xi * ctx.dxi_de2;
        dgam[r][4] = psi_v * ctx.dg2v_dw2 + psi_a * ctx.dg2a_dw2;
        dgam[r][5] = psi_a * ctx.dg2a_ddw2;
    }

    let mut pose_jac = Vec::with_capacity(6);
    let mut velocity_jac = Vec::with_capacity(6);
    let mut acceleration_jac = Vec::with_capacity(6);
    for var in 0..6 {
        let dxi = dgam[0][var];
        let dgv = dgam[1][var];
        let dga = dgam[2][var];

        let mut dpose = j_tau * dxi;
        if var == 0 {
            // T(τ) = exp(ξ_τ)·T₁ also moves with T₁ directly.
            dpose += Se3::exp(&gamma_tau.fixed_rows::<6>(0).into_owned()).adjoint();
        }
        pose_jac.push(dpose);

        let dvel = j_tau * dgv - 0.5 * g_v_hat * dxi;
        velocity_jac.push(dvel);

        let dh = dga + 0.5 * (g_v_hat * dvel - w_hat * dgv);
        acceleration_jac.push(j_tau * dh - 0.5 * h_hat * dxi);
    }

    InterpolatedJacobians {
        state,
        pose_jac,
        velocity_jac,
        acceleration_jac,
    }
}

/// Extrapolate with Jacobians w.r.t. `[T, w, ẇ]` of the single knot.
pub fn extrapolate_with_jacobians(
    prior: &MotionPrior,
    knot: &KnotState,
    t: f64,
    tau: f64,
) -> InterpolatedJacobians {
    let phi = prior.transition(tau - t);
    let gamma_tau = phi * gamma1(knot);
    let (state, h, j_tau) = state_from_gamma(&gamma_tau, &knot.pose);

    let g_v = gamma_tau.fixed_rows::<6>(6).into_owned();
    let g_v_hat = curly_hat(&g_v);
    let w_hat = curly_hat(&state.velocity);
    let h_hat = curly_hat(&h);

    let mut dgam = [[Matrix6::<f64>::zeros(); 3]; 3];
    for (r, row) in [0usize, 6, 12].iter().enumerate() {
        let [_, phi_v, phi_a] = row_blocks(&phi, *row);
        dgam[r][1] = phi_v;
        dgam[r][2] = phi_a;
    }

    let mut pose_jac = Vec::with_capacity(3);
    let mut velocity_jac = Vec::with_capacity(3);
    let mut acceleration_jac = Vec::with_capacity(3);
    for var in 0..3 {
        let dxi = dgam[0][var];
        let dgv = dgam[1][var];
        let dga = dgam[2][var];

        let mut dpose = j_tau * dxi;
        if var == 0 {
            dpose += Se3::exp(&gamma_tau.fixed_rows::<6>(0).into_owned()).adjoint();
        }
        pose_jac.push(dpose);

        let dvel = j_tau * dgv - 0.5 * g_v_hat * dxi;
        velocity_jac.push(dvel);

        let dh = dga + 0.5 * (g_v_hat * dvel - w_hat * dgv);
        acceleration_jac.push(j_tau * dh - 0.5 * h_hat * dxi);
    }

    InterpolatedJacobians {
        state,
        pose_jac,
        velocity_jac,
        acceleration_jac,
    }
}

/// Knot-to-knot prior residual `γ₂ − Φ(Δt) γ₁` and its Jacobians w.r.t.
/// `[T₁, w₁, ẇ₁, T₂, w₂, ẇ₂]`. Weighted by `Q(Δt)⁻¹` by the caller.
pub fn prior_residual(
    prior: &MotionPrior,
    k1: &KnotState,
    t1: f64,
    k2: &KnotState,
    t2: f64,
) -> (Vector18, Vec<nalgebra::SMatrix<f64, 18, 6>>) {
    let dt = t2 - t1;
    let phi = prior.transition(dt);
    let ctx = gamma2_context(k1, k2);
    let residual = ctx.gamma2 - phi * gamma1(k1);

    let phi_pv = phi.fixed_view::<6, 6>(0, 6).into_owned();
    let phi_pa = phi.fixed_view::<6, 6>(0, 12).into_owned();
    let phi_va = phi.fixed_view::<6, 6>(6, 12).into_owned();
    let phi_aa = phi.fixed_view::<6, 6>(12, 12).into_owned();

    let stack = |p: Matrix6<f64>, v: Matrix6<f64>, a: Matrix6<f64>| {
        let mut m = nalgebra::SMatrix::<f64, 18, 6>::zeros();
        m.fixed_view_mut::<6, 6>(0, 0).copy_from(&p);
        m.fixed_view_mut::<6, 6>(6, 0).copy_from(&v);
        m.fixed_view_mut::<6, 6>(12, 0).copy_from(&a);
        m
    };

    let jacobians = vec![
        // T₁
        stack(
            ctx.dxi_de1,
            ctx.dg2v_dxi * ctx.dxi_de1,
            ctx.dg2a_dxi * ctx.dxi_de1,
        ),
        // w₁
        stack(-phi_pv, -Matrix6::identity(), Matrix6::zeros()),
        // ẇ₁
        stack(-phi_pa, -phi_va, -phi_aa),
        // T₂
        stack(
            ctx.dxi_de2,
            ctx.dg2v_dxi * ctx.dxi_de2,
            ctx.dg2a_dxi * ctx.dxi_de2,
        ),
        // w₂
        stack(Matrix6::zeros(), ctx.dg2v_dw2, ctx.dg2a_dw2),
        // ẇ₂
        stack(Matrix6::zeros(), Matrix6::zeros(), ctx.dg2a_ddw2),
    ];

    (residual, jacobians)
}
