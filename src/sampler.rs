use std::sync::Arc;

use log::{debug, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::chain::GibbsChain;
use crate::data::Observations;
use crate::error::{Result, VcmError};
use crate::settings::{Priors, SamplerSettings, StartingValues};
use crate::state::{ChainState, Setup};
use crate::step::{Conditional, NullInspector, Step, StepInfo, StepInspector};
use crate::trace::{ChainTrace, Trace};

/// How the last run of a chain ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed {
        chain: u64,
        cycles: u64,
    },
    /// The chain hit a numerical failure. Its state is left as it was at
    /// the failure and its trace holds the cycles completed before.
    Failed {
        chain: u64,
        /// Index of the cycle that failed, equal to the number of
        /// completed cycles.
        iteration: u64,
        step: Step,
        error: VcmError,
    },
}

impl ChainOutcome {
    pub fn chain(&self) -> u64 {
        match self {
            ChainOutcome::Completed { chain, .. } | ChainOutcome::Failed { chain, .. } => *chain,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ChainOutcome::Failed { .. })
    }

    pub fn error(&self) -> Option<&VcmError> {
        match self {
            ChainOutcome::Failed { error, .. } => Some(error),
            ChainOutcome::Completed { .. } => None,
        }
    }
}

/// A hierarchical linear model together with its chains and their trace.
pub struct Sampler {
    settings: SamplerSettings,
    setup: Arc<Setup>,
    chains: Vec<GibbsChain>,
    trace: Trace,
    outcomes: Vec<ChainOutcome>,
    /// Worker pool for the chains, `None` if it could not be started.
    pool: Option<ThreadPool>,
}

impl Sampler {
    /// Validate the input and compute everything that stays fixed during
    /// sampling. No draws are made.
    pub fn new(
        data: Observations,
        priors: Priors,
        start: StartingValues,
        settings: SamplerSettings,
    ) -> Result<Self> {
        let setup = Arc::new(Setup::new(data, &priors)?);
        let chains: Vec<GibbsChain> = (0..settings.num_chains as u64)
            .map(|chain| {
                GibbsChain::new(
                    chain,
                    setup.clone(),
                    &start,
                    settings.seed,
                    settings.store_derived,
                )
            })
            .collect::<Result<_>>()?;
        let trace = Trace::new(&setup, chains.len(), &settings.traced_params());
        let outcomes = chains
            .iter()
            .map(|chain| ChainOutcome::Completed {
                chain: chain.chain(),
                cycles: 0,
            })
            .collect();

        let pool = match ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads())
            .thread_name(|i| format!("hlm-gibbs-worker-{}", i))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!("Could not start thread pool, chains will run sequentially: {}", err);
                None
            }
        };

        debug!(
            "Set up model with N = {}, p = {}, J = {} and {} chains",
            setup.n(),
            setup.p(),
            setup.j(),
            chains.len()
        );

        Ok(Self {
            settings,
            setup,
            chains,
            trace,
            outcomes,
            pool,
        })
    }

    /// Set up the model and draw `settings.num_draws` cycles per chain.
    ///
    /// Numerical failures do not make this fail: the affected chain stops
    /// and the sampler is returned with the partial trace, see
    /// [`Sampler::outcomes`].
    pub fn run(
        data: Observations,
        priors: Priors,
        start: StartingValues,
        settings: SamplerSettings,
    ) -> Result<Self> {
        let draws = settings.num_draws;
        let mut sampler = Self::new(data, priors, start, settings)?;
        sampler.sample(draws);
        Ok(sampler)
    }

    /// Draw `draws` more cycles on every chain that has not failed.
    pub fn sample(&mut self, draws: u64) -> &[ChainOutcome] {
        self.sample_with(draws, |_| NullInspector)
    }

    /// Continue sampling from the current state of every chain.
    pub fn resume(&mut self, draws: u64) -> &[ChainOutcome] {
        self.sample(draws)
    }

    /// Like [`Sampler::sample`], observing every step of chain `i` with
    /// `make_inspector(i)`.
    pub fn sample_with<I, F>(&mut self, draws: u64, make_inspector: F) -> &[ChainOutcome]
    where
        I: StepInspector,
        F: Fn(u64) -> I + Sync,
    {
        let Self {
            chains,
            trace,
            outcomes,
            pool,
            ..
        } = self;

        let work = |((chain, trace), outcome): ((&mut GibbsChain, &mut ChainTrace), &mut ChainOutcome)| {
            let mut inspector = make_inspector(chain.chain());
            run_chain(chain, trace, outcome, draws, &mut inspector);
        };

        match pool {
            Some(pool) => pool.install(|| {
                chains
                    .par_iter_mut()
                    .zip(trace.chains_mut().par_iter_mut())
                    .zip(outcomes.par_iter_mut())
                    .for_each(work)
            }),
            None => chains
                .iter_mut()
                .zip(trace.chains_mut().iter_mut())
                .zip(outcomes.iter_mut())
                .for_each(work),
        }

        &self.outcomes
    }

    /// Perform a single conditional draw on one chain.
    ///
    /// Returns `None` if there is no chain with index `chain`.
    pub fn step(&mut self, chain: usize) -> Option<Result<StepInfo>> {
        self.step_with(chain, &mut NullInspector)
    }

    pub fn step_with<I: StepInspector + ?Sized>(
        &mut self,
        chain: usize,
        inspector: &mut I,
    ) -> Option<Result<StepInfo>> {
        let sampler = self.chains.get_mut(chain)?;
        let trace = self.trace.chains_mut().get_mut(chain)?;
        let result = sampler.step(trace, inspector);
        if let Err(error) = &result {
            self.outcomes[chain] = failure(sampler, error.clone());
        }
        Some(result)
    }

    /// Conditional distribution of the next step of one chain.
    pub fn conditional(&self, chain: usize) -> Option<Result<Conditional>> {
        self.chains.get(chain).map(|chain| chain.conditional())
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn chains(&self) -> &[GibbsChain] {
        &self.chains
    }

    pub fn chain(&self, chain: usize) -> Option<&GibbsChain> {
        self.chains.get(chain)
    }

    /// Current draws of one chain.
    pub fn state(&self, chain: usize) -> Option<&ChainState> {
        self.chains.get(chain).map(|chain| chain.state())
    }

    /// Completed cycles of the least advanced chain.
    pub fn cycles(&self) -> u64 {
        self.chains
            .iter()
            .map(|chain| chain.cycles())
            .min()
            .unwrap_or(0)
    }

    pub fn outcomes(&self) -> &[ChainOutcome] {
        &self.outcomes
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChainOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.is_failed())
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }
}

fn failure(chain: &GibbsChain, error: VcmError) -> ChainOutcome {
    ChainOutcome::Failed {
        chain: chain.chain(),
        iteration: chain.cycles(),
        step: chain.next_step(),
        error,
    }
}

fn run_chain<I: StepInspector>(
    chain: &mut GibbsChain,
    trace: &mut ChainTrace,
    outcome: &mut ChainOutcome,
    draws: u64,
    inspector: &mut I,
) {
    if outcome.is_failed() {
        debug!("Skipping chain {}, it failed earlier", chain.chain());
        return;
    }
    debug!(
        "Chain {} drawing {} cycles starting at cycle {}",
        chain.chain(),
        draws,
        chain.cycles()
    );
    for _ in 0..draws {
        if let Err(error) = chain.draw(trace, inspector) {
            warn!(
                "Chain {} stopped at iteration {} in the {} step: {}. \
                 Returning the partial trace for inspection.",
                chain.chain(),
                chain.cycles(),
                chain.next_step(),
                error
            );
            *outcome = failure(chain, error);
            return;
        }
    }
    *outcome = ChainOutcome::Completed {
        chain: chain.chain(),
        cycles: chain.cycles(),
    };
}

#[cfg(test)]
mod tests {
    use faer::{Col, Mat};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::trace::TracedParam;

    fn data() -> Observations {
        Observations::from_row_major(
            &[0.3, 1.2, -0.4, 0.8, 2.0, 1.1],
            &[0.1, -0.3, 0.5, 0.2, -0.5, 0.0],
            1,
            &[
                1.0, 0.0, 0.0, //
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0, //
                0.0, 0.0, 1.0,
            ],
            3,
        )
        .unwrap()
    }

    #[test]
    fn run_records_every_cycle() {
        let settings = SamplerSettings::default()
            .with_draws(25)
            .with_chains(3)
            .with_seed(9)
            .trace_also(TracedParam::XBetas);
        let sampler = Sampler::run(data(), Priors::default(), StartingValues::default(), settings)
            .unwrap();

        assert_eq!(sampler.cycles(), 25);
        assert_eq!(sampler.failures().count(), 0);
        assert_eq!(sampler.trace().num_chains(), 3);
        for chain in sampler.trace().chains() {
            assert_eq!(chain.len(), 25);
            assert_eq!(chain.get(TracedParam::XBetas).unwrap().width(), 6);
            assert_eq!(chain.statics()["Sigma2_an"], 3.0 + 0.001);
        }
    }

    #[test]
    fn resume_keeps_history() {
        let settings = SamplerSettings::default().with_draws(10).with_chains(2);
        let mut sampler =
            Sampler::run(data(), Priors::default(), StartingValues::default(), settings).unwrap();
        let before = sampler.trace().clone();

        let outcomes = sampler.resume(5).to_vec();
        assert_eq!(
            outcomes,
            vec![
                ChainOutcome::Completed { chain: 0, cycles: 15 },
                ChainOutcome::Completed { chain: 1, cycles: 15 },
            ]
        );

        for (old, new) in before.chains().iter().zip(sampler.trace().chains()) {
            assert_eq!(new.len(), 15);
            for (old, new) in old.params().iter().zip(new.params()) {
                assert_eq!(old.values(), &new.values()[..old.values().len()]);
            }
        }
    }

    #[test]
    fn failing_chain_returns_partial_trace() {
        let settings = SamplerSettings::default().with_draws(3).with_chains(2);
        let mut sampler =
            Sampler::run(data(), Priors::default(), StartingValues::default(), settings).unwrap();

        let setup = sampler.setup.clone();
        sampler.chains[0]
            .state_mut()
            .set_alphas(&setup, Col::from_fn(3, |_| f64::NAN));

        let outcomes = sampler.sample(4).to_vec();
        assert!(matches!(
            outcomes[0],
            ChainOutcome::Failed {
                chain: 0,
                iteration: 3,
                step: Step::Betas,
                error: VcmError::SingularMatrix { .. },
            }
        ));
        assert_eq!(outcomes[1], ChainOutcome::Completed { chain: 1, cycles: 7 });
        assert_eq!(sampler.trace().chain(0).unwrap().len(), 3);
        assert_eq!(sampler.trace().chain(1).unwrap().len(), 7);

        // Failed chains are not resumed.
        sampler.resume(2);
        assert_eq!(sampler.trace().chain(0).unwrap().len(), 3);
        assert_eq!(sampler.trace().chain(1).unwrap().len(), 9);
        assert_eq!(sampler.cycles(), 3);
    }

    #[test]
    fn construction_errors_are_returned() {
        let priors = Priors::default().with_betas_cov0(Mat::zeros(1, 2));
        let err = Sampler::new(data(), priors, StartingValues::default(), Default::default())
            .err()
            .unwrap();
        assert!(matches!(err, VcmError::ShapeMismatch { .. }));

        let start = StartingValues::default().with_betas(Col::zeros(4));
        let err = Sampler::new(data(), Priors::default(), start, Default::default())
            .err()
            .unwrap();
        assert!(matches!(err, VcmError::ShapeMismatch { .. }));
    }

    #[test]
    fn stepping_protocol() {
        let settings = SamplerSettings::default().with_chains(1);
        let mut sampler =
            Sampler::new(data(), Priors::default(), StartingValues::default(), settings).unwrap();

        let expected = sampler.conditional(0).unwrap().unwrap();
        let info = sampler.step(0).unwrap().unwrap();
        assert_eq!(info.step, Step::Betas);
        assert_eq!(info.conditional, expected);
        assert_eq!(
            sampler.trace().chain(0).unwrap().derived()[&Step::Betas],
            expected
        );
        let betas: Vec<f64> = sampler.state(0).unwrap().betas().iter().copied().collect();
        assert_eq!(&*info.value, &betas[..]);
        assert!(sampler.conditional(4).is_none());
        assert!(sampler.step(4).is_none());
        assert!(sampler.step_with(1, &mut NullInspector).is_none());
        assert_eq!(sampler.chain(0).unwrap().next_step(), Step::Alphas);
    }

    #[test]
    fn pool_outlives_runs() {
        let settings = SamplerSettings::default().with_chains(3).with_cores(2);
        let mut sampler =
            Sampler::new(data(), Priors::default(), StartingValues::default(), settings).unwrap();
        let pool: *const ThreadPool = sampler.pool.as_ref().unwrap();
        assert_eq!(sampler.pool.as_ref().unwrap().current_num_threads(), 2);

        let threads = std::sync::Mutex::new(std::collections::BTreeSet::new());
        let seen = &threads;
        for _ in 0..3 {
            sampler.sample_with(2, |_| {
                move |_: u64, _: &StepInfo| {
                    let name = std::thread::current().name().map(str::to_string);
                    seen.lock().unwrap().insert(name);
                }
            });
        }
        assert_eq!(sampler.cycles(), 6);
        assert!(std::ptr::eq(pool, sampler.pool.as_ref().unwrap()));

        let threads = threads.into_inner().unwrap();
        assert!(threads.len() <= 2);
        assert!(threads
            .iter()
            .all(|name| name.as_deref().is_some_and(|n| n.starts_with("hlm-gibbs-worker-"))));
    }
}
