use faer::{Col, Mat};

use crate::error::{Result, VcmError};
use crate::trace::TracedParam;

/// Hyperparameters of the prior distributions.
///
/// `Betas ~ N(betas_mean0, betas_cov0)`, `Sigma2 ~ IG(sigma2_a0, sigma2_b0)`
/// and `Tau2 ~ IG(tau2_a0, tau2_b0)`. The vector and matrix priors default
/// to `0` and `100 I` once the number of fixed effects is known.
#[derive(Debug, Clone)]
pub struct Priors {
    pub sigma2_a0: f64,
    pub sigma2_b0: f64,
    pub tau2_a0: f64,
    pub tau2_b0: f64,
    pub betas_mean0: Option<Col<f64>>,
    pub betas_cov0: Option<Mat<f64>>,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            sigma2_a0: 0.001,
            sigma2_b0: 0.001,
            tau2_a0: 0.001,
            tau2_b0: 0.0001,
            betas_mean0: None,
            betas_cov0: None,
        }
    }
}

impl Priors {
    pub fn with_sigma2(mut self, a0: f64, b0: f64) -> Self {
        self.sigma2_a0 = a0;
        self.sigma2_b0 = b0;
        self
    }

    pub fn with_tau2(mut self, a0: f64, b0: f64) -> Self {
        self.tau2_a0 = a0;
        self.tau2_b0 = b0;
        self
    }

    pub fn with_betas_mean0(mut self, mean: Col<f64>) -> Self {
        self.betas_mean0 = Some(mean);
        self
    }

    pub fn with_betas_cov0(mut self, cov: Mat<f64>) -> Self {
        self.betas_cov0 = Some(cov);
        self
    }

    pub(crate) fn check_scalars(&self) -> Result<()> {
        let scalars = [
            ("Sigma2_a0", self.sigma2_a0),
            ("Sigma2_b0", self.sigma2_b0),
            ("Tau2_a0", self.tau2_a0),
            ("Tau2_b0", self.tau2_b0),
        ];
        for (name, value) in scalars {
            if !value.is_finite() {
                return Err(VcmError::InvalidPrior {
                    name,
                    value,
                    reason: "must be finite",
                });
            }
            if value <= 0.0 {
                return Err(VcmError::InvalidPrior {
                    name,
                    value,
                    reason: "must be positive",
                });
            }
        }
        Ok(())
    }
}

/// Where each chain starts. Unset vectors start at zero.
#[derive(Debug, Clone)]
pub struct StartingValues {
    pub betas: Option<Col<f64>>,
    pub alphas: Option<Col<f64>>,
    pub sigma2: f64,
    pub tau2: f64,
}

impl Default for StartingValues {
    fn default() -> Self {
        Self {
            betas: None,
            alphas: None,
            sigma2: 4.0,
            tau2: 4.0,
        }
    }
}

impl StartingValues {
    pub fn with_betas(mut self, betas: Col<f64>) -> Self {
        self.betas = Some(betas);
        self
    }

    pub fn with_alphas(mut self, alphas: Col<f64>) -> Self {
        self.alphas = Some(alphas);
        self
    }

    pub fn with_variances(mut self, sigma2: f64, tau2: f64) -> Self {
        self.sigma2 = sigma2;
        self.tau2 = tau2;
        self
    }
}

/// Settings of a sampling run.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    /// The number of cycles every chain runs in [`Sampler::run`](crate::Sampler::run).
    pub num_draws: u64,
    pub num_chains: usize,
    /// Worker threads. `None` uses one thread per chain.
    pub num_cores: Option<usize>,
    pub seed: u64,
    /// Parameters traced in addition to `Betas`, `Alphas`, `Sigma2` and `Tau2`.
    pub extra_traced: Vec<TracedParam>,
    /// Keep the latest conditional distribution of each step in the trace.
    pub store_derived: bool,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            num_draws: 1000,
            num_chains: 1,
            num_cores: None,
            seed: 0,
            extra_traced: Vec::new(),
            store_derived: true,
        }
    }
}

impl SamplerSettings {
    pub fn with_draws(mut self, num_draws: u64) -> Self {
        self.num_draws = num_draws;
        self
    }

    pub fn with_chains(mut self, num_chains: usize) -> Self {
        self.num_chains = num_chains;
        self
    }

    pub fn with_cores(mut self, num_cores: usize) -> Self {
        self.num_cores = Some(num_cores);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn trace_also(mut self, param: TracedParam) -> Self {
        if !self.extra_traced.contains(&param) {
            self.extra_traced.push(param);
        }
        self
    }

    /// All traced parameters in column order.
    pub fn traced_params(&self) -> Vec<TracedParam> {
        let mut params = TracedParam::CORE.to_vec();
        for param in &self.extra_traced {
            if !params.contains(param) {
                params.push(*param);
            }
        }
        params
    }

    pub(crate) fn worker_threads(&self) -> usize {
        self.num_cores.unwrap_or(self.num_chains).max(1)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_priors_are_valid() {
        Priors::default().check_scalars().unwrap();
    }

    #[test]
    fn rejects_non_positive_scale() {
        let err = Priors::default().with_tau2(1.0, 0.0).check_scalars().unwrap_err();
        assert_eq!(
            err,
            VcmError::InvalidPrior {
                name: "Tau2_b0",
                value: 0.0,
                reason: "must be positive",
            }
        );
        let err = Priors::default()
            .with_sigma2(f64::NAN, 1.0)
            .check_scalars()
            .unwrap_err();
        assert!(matches!(err, VcmError::InvalidPrior { name: "Sigma2_a0", .. }));
    }

    #[test]
    fn traced_params_are_unique() {
        let settings = SamplerSettings::default()
            .trace_also(TracedParam::XBetas)
            .trace_also(TracedParam::XBetas)
            .trace_also(TracedParam::Tau2);
        assert_eq!(
            settings.traced_params(),
            vec![
                TracedParam::Betas,
                TracedParam::Alphas,
                TracedParam::Sigma2,
                TracedParam::Tau2,
                TracedParam::XBetas,
            ]
        );
    }

    #[test]
    fn worker_threads() {
        assert_eq!(SamplerSettings::default().with_chains(4).worker_threads(), 4);
        assert_eq!(
            SamplerSettings::default()
                .with_chains(4)
                .with_cores(2)
                .worker_threads(),
            2
        );
        assert_eq!(SamplerSettings::default().with_chains(0).worker_threads(), 1);
    }
}
