//! Sampler state.
//!
//! [`Setup`] holds the data, the priors and everything derived from them
//! once before sampling. It never changes and is shared by all chains.
//! [`ChainState`] holds the current draws of one chain together with the
//! products that depend on them.

use faer::{Col, Mat};

use crate::data::Observations;
use crate::error::{Result, VcmError};
use crate::linalg::{invert, ScaledIdentity};
use crate::settings::{Priors, StartingValues};

#[derive(Debug, Clone)]
pub struct Setup {
    data: Observations,

    pub sigma2_a0: f64,
    pub sigma2_b0: f64,
    pub tau2_a0: f64,
    pub tau2_b0: f64,
    pub betas_mean0: Col<f64>,
    pub betas_cov0: Mat<f64>,

    /// `Xᵗ X`
    pub xtx: Mat<f64>,
    /// `Deltaᵗ Delta`, diagonal with the group sizes.
    pub deltat_delta: Mat<f64>,
    /// Prior precision of the fixed effects.
    pub betas_cov0i: Mat<f64>,
    /// `Betas_cov0 · Betas_mean0`
    pub betas_covm: Col<f64>,
    /// `Betas_cov0⁻¹ · Betas_mean0`, the prior term of the fixed effects mean.
    pub betas_precm: Col<f64>,
    /// Posterior shape of `Sigma2`, `N / 2 + Sigma2_a0`.
    pub sigma2_an: f64,
    /// Posterior shape of `Tau2`, `J / 2 + Tau2_a0`.
    pub tau2_an: f64,
    /// Inverse correlation structure of the residuals.
    pub psi_rho_inv: ScaledIdentity,
    /// Inverse correlation structure of the random effects.
    pub psi_lambda_inv: ScaledIdentity,
}

impl Setup {
    pub fn new(data: Observations, priors: &Priors) -> Result<Self> {
        priors.check_scalars()?;

        let (n, p, j) = (data.n(), data.p(), data.j());

        let betas_cov0 = match &priors.betas_cov0 {
            Some(cov) => {
                if cov.nrows() != cov.ncols() {
                    return Err(VcmError::shape(
                        "prior covariance Betas_cov0",
                        "square matrix",
                        format!("{}x{}", cov.nrows(), cov.ncols()),
                    ));
                }
                if cov.nrows() != p {
                    return Err(VcmError::shape(
                        "prior covariance Betas_cov0",
                        format!("{p}x{p}"),
                        format!("{}x{}", cov.nrows(), cov.ncols()),
                    ));
                }
                cov.clone()
            }
            None => crate::linalg::diag_covariance(p, 100.0),
        };
        let betas_mean0 = match &priors.betas_mean0 {
            Some(mean) => {
                if mean.nrows() != p {
                    return Err(VcmError::shape(
                        "prior mean Betas_mean0",
                        format!("{p} entries"),
                        format!("{} entries", mean.nrows()),
                    ));
                }
                mean.clone()
            }
            None => Col::zeros(p),
        };

        let x = data.x();
        let delta = data.delta();
        let xtx = x.transpose() * x;
        let deltat_delta = delta.transpose() * delta;

        let betas_cov0i = invert(betas_cov0.as_ref(), "prior covariance Betas_cov0")?;
        let betas_covm = &betas_cov0 * &betas_mean0;
        let betas_precm = &betas_cov0i * &betas_mean0;

        Ok(Self {
            sigma2_a0: priors.sigma2_a0,
            sigma2_b0: priors.sigma2_b0,
            tau2_a0: priors.tau2_a0,
            tau2_b0: priors.tau2_b0,
            betas_mean0,
            betas_cov0,
            xtx,
            deltat_delta,
            betas_cov0i,
            betas_covm,
            betas_precm,
            sigma2_an: n as f64 / 2.0 + priors.sigma2_a0,
            tau2_an: j as f64 / 2.0 + priors.tau2_a0,
            psi_rho_inv: ScaledIdentity::identity(n),
            psi_lambda_inv: ScaledIdentity::identity(j),
            data,
        })
    }

    pub fn data(&self) -> &Observations {
        &self.data
    }

    pub fn n(&self) -> usize {
        self.data.n()
    }

    pub fn p(&self) -> usize {
        self.data.p()
    }

    pub fn j(&self) -> usize {
        self.data.j()
    }

    /// Scalar constants stored with each chain's trace.
    pub fn statics(&self) -> [(&'static str, f64); 6] {
        [
            ("Sigma2_an", self.sigma2_an),
            ("Tau2_an", self.tau2_an),
            ("Sigma2_a0", self.sigma2_a0),
            ("Sigma2_b0", self.sigma2_b0),
            ("Tau2_a0", self.tau2_a0),
            ("Tau2_b0", self.tau2_b0),
        ]
    }
}

/// Current draws of one chain.
///
/// The setters keep `XBetas`, `DeltaAlphas` and the covariance
/// structures consistent with the parameter they depend on.
#[derive(Debug, Clone)]
pub struct ChainState {
    betas: Col<f64>,
    alphas: Col<f64>,
    sigma2: f64,
    tau2: f64,
    x_betas: Col<f64>,
    delta_alphas: Col<f64>,
    psi_sigma2: ScaledIdentity,
    psi_sigma2_inv: ScaledIdentity,
    psi_tau2: ScaledIdentity,
    psi_tau2_inv: ScaledIdentity,
}

impl ChainState {
    pub fn new(setup: &Setup, start: &StartingValues) -> Result<Self> {
        let (p, j) = (setup.p(), setup.j());

        let betas = match &start.betas {
            Some(betas) if betas.nrows() != p => {
                return Err(VcmError::shape(
                    "starting value Betas",
                    format!("{p} entries"),
                    format!("{} entries", betas.nrows()),
                ))
            }
            Some(betas) => betas.clone(),
            None => Col::zeros(p),
        };
        let alphas = match &start.alphas {
            Some(alphas) if alphas.nrows() != j => {
                return Err(VcmError::shape(
                    "starting value Alphas",
                    format!("{j} entries"),
                    format!("{} entries", alphas.nrows()),
                ))
            }
            Some(alphas) => alphas.clone(),
            None => Col::zeros(j),
        };
        for (name, value) in [("Sigma2", start.sigma2), ("Tau2", start.tau2)] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(VcmError::InvalidStartingValue { name, value });
            }
        }

        let x_betas = setup.data().x() * &betas;
        let delta_alphas = setup.data().delta() * &alphas;
        let psi_sigma2 = ScaledIdentity::new(setup.n(), start.sigma2);
        let psi_tau2 = ScaledIdentity::new(j, start.tau2);

        Ok(Self {
            betas,
            alphas,
            sigma2: start.sigma2,
            tau2: start.tau2,
            x_betas,
            delta_alphas,
            psi_sigma2_inv: psi_sigma2.try_inverse("residual covariance Sigma2 I")?,
            psi_sigma2,
            psi_tau2_inv: psi_tau2.try_inverse("random effect covariance Tau2 I")?,
            psi_tau2,
        })
    }

    pub fn betas(&self) -> &Col<f64> {
        &self.betas
    }

    pub fn alphas(&self) -> &Col<f64> {
        &self.alphas
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn tau2(&self) -> f64 {
        self.tau2
    }

    /// `X · Betas`
    pub fn x_betas(&self) -> &Col<f64> {
        &self.x_betas
    }

    /// `Delta · Alphas`
    pub fn delta_alphas(&self) -> &Col<f64> {
        &self.delta_alphas
    }

    /// Residual covariance `Sigma2 · I(N)`.
    pub fn psi_sigma2(&self) -> ScaledIdentity {
        self.psi_sigma2
    }

    pub fn psi_sigma2_inv(&self) -> ScaledIdentity {
        self.psi_sigma2_inv
    }

    /// Random effect covariance `Tau2 · I(J)`.
    pub fn psi_tau2(&self) -> ScaledIdentity {
        self.psi_tau2
    }

    pub fn psi_tau2_inv(&self) -> ScaledIdentity {
        self.psi_tau2_inv
    }

    pub fn set_betas(&mut self, setup: &Setup, betas: Col<f64>) {
        debug_assert_eq!(betas.nrows(), setup.p());
        self.x_betas = setup.data().x() * &betas;
        self.betas = betas;
    }

    pub fn set_alphas(&mut self, setup: &Setup, alphas: Col<f64>) {
        debug_assert_eq!(alphas.nrows(), setup.j());
        self.delta_alphas = setup.data().delta() * &alphas;
        self.alphas = alphas;
    }

    /// Fails without changing the state if `tau2 · I` can not be inverted.
    pub fn set_tau2(&mut self, tau2: f64) -> Result<()> {
        let psi_tau2 = ScaledIdentity::new(self.psi_tau2.dim(), tau2);
        self.psi_tau2_inv = psi_tau2.try_inverse("random effect covariance Tau2 I")?;
        self.psi_tau2 = psi_tau2;
        self.tau2 = tau2;
        Ok(())
    }

    /// Fails without changing the state if `sigma2 · I` can not be inverted.
    pub fn set_sigma2(&mut self, sigma2: f64) -> Result<()> {
        let psi_sigma2 = ScaledIdentity::new(self.psi_sigma2.dim(), sigma2);
        self.psi_sigma2_inv = psi_sigma2.try_inverse("residual covariance Sigma2 I")?;
        self.psi_sigma2 = psi_sigma2;
        self.sigma2 = sigma2;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn small_data() -> Observations {
        // 4 observations, 2 groups, intercept + one covariate
        Observations::from_row_major(
            &[1.0, 2.0, 0.5, -1.0],
            &[1.0, 0.5, 1.0, -0.5, 1.0, 1.5, 1.0, -1.5],
            2,
            &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
            2,
        )
        .unwrap()
    }

    #[test]
    fn setup_quantities() {
        let setup = Setup::new(small_data(), &Priors::default()).unwrap();
        assert_eq!(setup.sigma2_an, 4.0 / 2.0 + 0.001);
        assert_eq!(setup.tau2_an, 2.0 / 2.0 + 0.001);
        assert_abs_diff_eq!(setup.xtx[(0, 0)], 4.0);
        assert_abs_diff_eq!(setup.xtx[(0, 1)], 0.0);
        assert_abs_diff_eq!(setup.xtx[(1, 1)], 0.25 + 0.25 + 2.25 + 2.25);
        assert_abs_diff_eq!(setup.deltat_delta[(0, 0)], 2.0);
        assert_abs_diff_eq!(setup.deltat_delta[(1, 0)], 0.0);
        assert_abs_diff_eq!(setup.betas_cov0i[(0, 0)], 0.01, epsilon = 1e-14);
        assert_eq!(setup.betas_precm.nrows(), 2);
    }

    #[test]
    fn setup_is_deterministic() {
        let priors = Priors::default().with_betas_mean0(Col::from_fn(2, |i| i as f64 + 1.0));
        let a = Setup::new(small_data(), &priors).unwrap();
        let b = Setup::new(small_data(), &priors).unwrap();
        assert_eq!(a.sigma2_an, b.sigma2_an);
        assert_eq!(a.tau2_an, b.tau2_an);
        assert_eq!(a.betas_cov0i, b.betas_cov0i);
        assert_eq!(a.betas_covm, b.betas_covm);
    }

    #[test]
    fn non_square_prior_covariance() {
        let priors = Priors::default().with_betas_cov0(Mat::zeros(2, 3));
        let err = Setup::new(small_data(), &priors).unwrap_err();
        assert!(matches!(
            err,
            VcmError::ShapeMismatch {
                what: "prior covariance Betas_cov0",
                ..
            }
        ));
    }

    #[test]
    fn singular_prior_covariance() {
        let priors = Priors::default().with_betas_cov0(Mat::zeros(2, 2));
        let err = Setup::new(small_data(), &priors).unwrap_err();
        assert!(matches!(err, VcmError::SingularMatrix { .. }));
    }

    #[test]
    fn starting_values() {
        let setup = Setup::new(small_data(), &Priors::default()).unwrap();
        let start = StartingValues::default().with_betas(Col::from_fn(2, |i| [1.0, 2.0][i]));
        let state = ChainState::new(&setup, &start).unwrap();
        assert_abs_diff_eq!(state.x_betas()[0], 2.0);
        assert_abs_diff_eq!(state.x_betas()[3], -2.0);
        assert_eq!(state.sigma2(), 4.0);
        assert_eq!(state.psi_sigma2_inv().scale(), 0.25);

        let bad = StartingValues::default().with_alphas(Col::zeros(3));
        assert!(matches!(
            ChainState::new(&setup, &bad).unwrap_err(),
            VcmError::ShapeMismatch { .. }
        ));
        let bad = StartingValues::default().with_variances(-1.0, 1.0);
        assert_eq!(
            ChainState::new(&setup, &bad).unwrap_err(),
            VcmError::InvalidStartingValue {
                name: "Sigma2",
                value: -1.0
            }
        );
    }

    #[test]
    fn setters_refresh_products() {
        let setup = Setup::new(small_data(), &Priors::default()).unwrap();
        let mut state = ChainState::new(&setup, &StartingValues::default()).unwrap();

        state.set_alphas(&setup, Col::from_fn(2, |i| [0.5, -0.5][i]));
        assert_eq!(state.delta_alphas()[1], 0.5);
        assert_eq!(state.delta_alphas()[2], -0.5);

        state.set_tau2(2.0).unwrap();
        assert_eq!(state.psi_tau2_inv().scale(), 0.5);

        assert!(state.set_sigma2(0.0).is_err());
        assert_eq!(state.sigma2(), 4.0);

        let err = state.set_tau2(f64::INFINITY).unwrap_err();
        assert!(matches!(err, VcmError::SingularMatrix { .. }));
        assert_eq!(state.tau2(), 2.0);
        assert_eq!(state.psi_tau2_inv().scale(), 0.5);
    }
}
