//! The four conditional updates of one Gibbs cycle.
//!
//! A cycle draws, in this order,
//!
//! 1. `Betas | .  ~ N(S b, S)` with `S = (Xᵗ Σ_Y⁻¹ X + Betas_cov0⁻¹)⁻¹` and
//!    `b = Xᵗ Σ_Y⁻¹ (Y - Delta Alphas) + Betas_cov0⁻¹ Betas_mean0`,
//! 2. `Alphas | . ~ N(S b, S)` with `S = (Deltaᵗ Σ_Y⁻¹ Delta + Σ_Alpha⁻¹)⁻¹` and
//!    `b = Deltaᵗ Σ_Y⁻¹ (Y - X Betas)`,
//! 3. `Tau2 | .   ~ IG(J / 2 + Tau2_a0, Alphasᵗ Ψ_λ⁻¹ Alphas / 2 + Tau2_b0)`,
//! 4. `Sigma2 | . ~ IG(N / 2 + Sigma2_a0, ηᵗ Ψ_ρ⁻¹ η / 2 + Sigma2_b0)` with
//!    `η = Y - X Betas - Delta Alphas`,
//!
//! where `Σ_Y = Sigma2 I(N)` and `Σ_Alpha = Tau2 I(J)`. Every step reads
//! the values written by the steps before it in the same cycle.

use std::fmt;

use faer::{Col, Mat};
use rand::Rng;

use crate::error::Result;
use crate::linalg::{invert, sample_invgamma, sample_mvn};
use crate::state::{ChainState, Setup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Step {
    Betas,
    Alphas,
    Tau2,
    Sigma2,
}

impl Step {
    pub const ORDER: [Step; 4] = [Step::Betas, Step::Alphas, Step::Tau2, Step::Sigma2];

    /// The step after this one; `Sigma2` wraps around to `Betas`.
    pub fn next(self) -> Step {
        match self {
            Step::Betas => Step::Alphas,
            Step::Alphas => Step::Tau2,
            Step::Tau2 => Step::Sigma2,
            Step::Sigma2 => Step::Betas,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Step::Betas => "Betas",
            Step::Alphas => "Alphas",
            Step::Tau2 => "Tau2",
            Step::Sigma2 => "Sigma2",
        }
    }

    /// Whether this step completes a cycle.
    pub fn is_last(self) -> bool {
        self == Step::Sigma2
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Conditional posterior of the parameter updated by one step.
#[derive(Debug, Clone, PartialEq)]
pub enum Conditional {
    Normal { mean: Col<f64>, covariance: Mat<f64> },
    InverseGamma { shape: f64, scale: f64 },
}

/// What happened in a single step.
#[derive(Debug, Clone)]
pub struct StepInfo {
    pub step: Step,
    /// Index of the cycle the step belongs to, starting at zero.
    pub cycle: u64,
    pub conditional: Conditional,
    /// The accepted draw.
    pub value: Box<[f64]>,
}

/// Observes every step of a chain, e.g. to compare the conditionals with
/// an independent implementation.
pub trait StepInspector {
    fn inspect(&mut self, _chain: u64, _info: &StepInfo) {}
}

/// Inspector that ignores everything.
pub struct NullInspector;

impl StepInspector for NullInspector {}

impl<F: FnMut(u64, &StepInfo)> StepInspector for F {
    fn inspect(&mut self, chain: u64, info: &StepInfo) {
        self(chain, info)
    }
}

fn betas_conditional(setup: &Setup, state: &ChainState) -> Result<(Col<f64>, Mat<f64>)> {
    let data = setup.data();
    let (n, p) = (setup.n(), setup.p());
    let prec_y = state.psi_sigma2_inv().scale();

    let precision = Mat::from_fn(p, p, |a, b| {
        setup.xtx[(a, b)] * prec_y + setup.betas_cov0i[(a, b)]
    });
    let covariance = invert(precision.as_ref(), "fixed effects posterior precision")?;

    let resids = Col::from_fn(n, |i| data.y()[i] - state.delta_alphas()[i]);
    let xt_resids = data.x().transpose() * &resids;
    let rhs = Col::from_fn(p, |k| xt_resids[k] * prec_y + setup.betas_precm[k]);
    let mean = &covariance * &rhs;

    Ok((mean, covariance))
}

fn alphas_conditional(setup: &Setup, state: &ChainState) -> Result<(Col<f64>, Mat<f64>)> {
    let data = setup.data();
    let (n, j) = (setup.n(), setup.j());
    let prec_y = state.psi_sigma2_inv().scale();
    let prec_alpha = state.psi_tau2_inv().scale();

    let precision = Mat::from_fn(j, j, |a, b| {
        let prior = if a == b { prec_alpha } else { 0f64 };
        setup.deltat_delta[(a, b)] * prec_y + prior
    });
    let covariance = invert(precision.as_ref(), "random effects posterior precision")?;

    let resids = Col::from_fn(n, |i| data.y()[i] - state.x_betas()[i]);
    let dt_resids = data.delta().transpose() * &resids;
    let rhs = Col::from_fn(j, |k| dt_resids[k] * prec_y);
    let mean = &covariance * &rhs;

    Ok((mean, covariance))
}

fn tau2_conditional(setup: &Setup, state: &ChainState) -> (f64, f64) {
    let scale = setup.psi_lambda_inv.quad_form(state.alphas().as_ref()) * 0.5 + setup.tau2_b0;
    (setup.tau2_an, scale)
}

fn sigma2_conditional(setup: &Setup, state: &ChainState) -> (f64, f64) {
    let y = setup.data().y();
    let eta = Col::from_fn(setup.n(), |i| {
        y[i] - state.x_betas()[i] - state.delta_alphas()[i]
    });
    let scale = setup.psi_rho_inv.quad_form(eta.as_ref()) * 0.5 + setup.sigma2_b0;
    (setup.sigma2_an, scale)
}

/// The conditional distribution `step` would draw from in the current state.
pub fn conditional(step: Step, setup: &Setup, state: &ChainState) -> Result<Conditional> {
    Ok(match step {
        Step::Betas => {
            let (mean, covariance) = betas_conditional(setup, state)?;
            Conditional::Normal { mean, covariance }
        }
        Step::Alphas => {
            let (mean, covariance) = alphas_conditional(setup, state)?;
            Conditional::Normal { mean, covariance }
        }
        Step::Tau2 => {
            let (shape, scale) = tau2_conditional(setup, state);
            Conditional::InverseGamma { shape, scale }
        }
        Step::Sigma2 => {
            let (shape, scale) = sigma2_conditional(setup, state);
            Conditional::InverseGamma { shape, scale }
        }
    })
}

/// Draw the parameter of `step` from its conditional and write it into
/// the state together with everything that depends on it.
///
/// On error the state is left as it was before the failing update.
pub fn update<R: Rng + ?Sized>(
    step: Step,
    setup: &Setup,
    state: &mut ChainState,
    rng: &mut R,
) -> Result<(Conditional, Box<[f64]>)> {
    let conditional = conditional(step, setup, state)?;
    let value: Box<[f64]> = match (&conditional, step) {
        (Conditional::Normal { mean, covariance }, Step::Betas) => {
            let betas = sample_mvn(rng, mean.as_ref(), covariance.as_ref(), "Betas covariance")?;
            let value = betas.iter().copied().collect();
            state.set_betas(setup, betas);
            value
        }
        (Conditional::Normal { mean, covariance }, _) => {
            let alphas = sample_mvn(rng, mean.as_ref(), covariance.as_ref(), "Alphas covariance")?;
            let value = alphas.iter().copied().collect();
            state.set_alphas(setup, alphas);
            value
        }
        // No groups: Tau2 has nothing to condition on and stays where it is.
        (Conditional::InverseGamma { .. }, Step::Tau2) if setup.j() == 0 => {
            Box::new([state.tau2()])
        }
        (&Conditional::InverseGamma { shape, scale }, Step::Tau2) => {
            let tau2 = sample_invgamma(rng, shape, scale, "Tau2 conditional")?;
            state.set_tau2(tau2)?;
            Box::new([tau2])
        }
        (&Conditional::InverseGamma { shape, scale }, _) => {
            let sigma2 = sample_invgamma(rng, shape, scale, "Sigma2 conditional")?;
            state.set_sigma2(sigma2)?;
            Box::new([sigma2])
        }
    };
    Ok((conditional, value))
}
