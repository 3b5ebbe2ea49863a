//! Gibbs sampling for hierarchical linear variance-components models
//!
//! ```text
//! y = X Betas + Delta Alphas + eps,   eps ~ N(0, Sigma2 I),   Alphas ~ N(0, Tau2 I)
//! ```
//!
//! Each cycle draws `Betas`, `Alphas`, `Tau2` and `Sigma2` in that order
//! from their full conditionals. Several independent chains can run in
//! parallel, each with its own random stream.
//!
//! ```no_run
//! use hlm_gibbs::{Observations, Priors, Sampler, SamplerSettings, StartingValues, TracedParam};
//!
//! # fn main() -> hlm_gibbs::Result<()> {
//! let data = Observations::from_row_major(
//!     &[0.3, 1.2, -0.4, 0.8],
//!     &[1.0, 0.1, 1.0, -0.3, 1.0, 0.5, 1.0, 0.2],
//!     2,
//!     &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
//!     2,
//! )?;
//! let settings = SamplerSettings::default().with_draws(1000).with_chains(4);
//! let sampler = Sampler::run(data, Priors::default(), StartingValues::default(), settings)?;
//!
//! let betas = sampler.trace().get(0, TracedParam::Betas).unwrap();
//! println!("posterior mean of Betas: {:?}", betas.mean(200));
//! # Ok(())
//! # }
//! ```

pub(crate) mod chain;
pub(crate) mod data;
pub(crate) mod error;
pub mod linalg;
pub(crate) mod sampler;
pub(crate) mod settings;
pub(crate) mod state;
pub(crate) mod step;
pub(crate) mod trace;

pub use chain::GibbsChain;
pub use data::Observations;
pub use error::{Result, VcmError};
pub use linalg::ScaledIdentity;
pub use sampler::{ChainOutcome, Sampler};
pub use settings::{Priors, SamplerSettings, StartingValues};
pub use state::{ChainState, Setup};
pub use step::{conditional, update, Conditional, NullInspector, Step, StepInfo, StepInspector};
pub use trace::{ChainTrace, DrawView, ParamTrace, Trace, TracedParam, UnknownParam};
