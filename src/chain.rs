use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::Result;
use crate::settings::StartingValues;
use crate::state::{ChainState, Setup};
use crate::step::{self, Conditional, Step, StepInfo, StepInspector};
use crate::trace::ChainTrace;

/// One Gibbs chain: its own state, random stream and position within
/// the current cycle.
///
/// The chain does not own its trace, the sampler hands in the chain's
/// slot of the [`Trace`](crate::Trace) on every call.
#[derive(Debug, Clone)]
pub struct GibbsChain {
    chain: u64,
    setup: Arc<Setup>,
    state: ChainState,
    rng: ChaCha8Rng,
    next_step: Step,
    cycles: u64,
    store_derived: bool,
}

impl GibbsChain {
    pub fn new(
        chain: u64,
        setup: Arc<Setup>,
        start: &StartingValues,
        seed: u64,
        store_derived: bool,
    ) -> Result<Self> {
        let state = ChainState::new(&setup, start)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(chain);
        Ok(Self {
            chain,
            setup,
            state,
            rng,
            next_step: Step::Betas,
            cycles: 0,
            store_derived,
        })
    }

    pub fn chain(&self) -> u64 {
        self.chain
    }

    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Number of completed cycles.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The step the next call to [`GibbsChain::step`] performs.
    pub fn next_step(&self) -> Step {
        self.next_step
    }

    #[cfg(test)]
    pub(crate) fn state_mut(&mut self) -> &mut ChainState {
        &mut self.state
    }

    /// Conditional distribution of the next step, without drawing from it.
    pub fn conditional(&self) -> Result<Conditional> {
        step::conditional(self.next_step, &self.setup, &self.state)
    }

    /// Perform exactly one conditional draw.
    ///
    /// When the draw completes a cycle, the cycle is appended to `trace`.
    /// On error the chain stays at the failing step.
    pub fn step<I: StepInspector + ?Sized>(
        &mut self,
        trace: &mut ChainTrace,
        inspector: &mut I,
    ) -> Result<StepInfo> {
        debug_assert_eq!(trace.chain(), self.chain);

        let step = self.next_step;
        let (conditional, value) = step::update(step, &self.setup, &mut self.state, &mut self.rng)?;
        let info = StepInfo {
            step,
            cycle: self.cycles,
            conditional,
            value,
        };
        if self.store_derived {
            trace.set_derived(step, info.conditional.clone());
        }
        inspector.inspect(self.chain, &info);

        self.next_step = step.next();
        if step.is_last() {
            self.cycles += 1;
            trace.record(&self.state);
        }
        Ok(info)
    }

    /// Run the remaining steps of the current cycle.
    pub fn draw<I: StepInspector + ?Sized>(
        &mut self,
        trace: &mut ChainTrace,
        inspector: &mut I,
    ) -> Result<()> {
        loop {
            let info = self.step(trace, inspector)?;
            if info.step.is_last() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::data::Observations;
    use crate::settings::Priors;
    use crate::step::NullInspector;
    use crate::trace::TracedParam;

    fn setup() -> Arc<Setup> {
        let data = Observations::from_row_major(
            &[0.3, 1.2, -0.4, 0.8, 2.0],
            &[0.1, -0.3, 0.5, 0.2, -0.5],
            1,
            &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0],
            2,
        )
        .unwrap();
        Arc::new(Setup::new(data, &Priors::default()).unwrap())
    }

    fn layout(setup: &Setup) -> Vec<(TracedParam, usize)> {
        TracedParam::CORE
            .iter()
            .map(|&param| (param, param.width(setup)))
            .collect()
    }

    #[test]
    fn single_steps() {
        let setup = setup();
        let mut trace = ChainTrace::new(0, &layout(&setup));
        let mut chain =
            GibbsChain::new(0, setup, &StartingValues::default(), 1, true).unwrap();

        let mut seen = Vec::new();
        let mut inspector = |chain: u64, info: &StepInfo| seen.push((chain, info.step, info.cycle));

        for _ in 0..3 {
            let expected = chain.conditional().unwrap();
            let info = chain.step(&mut trace, &mut inspector).unwrap();
            assert_eq!(info.conditional, expected);
        }
        assert_eq!(chain.next_step(), Step::Sigma2);
        assert_eq!(chain.cycles(), 0);
        assert!(trace.is_empty());

        chain.step(&mut trace, &mut inspector).unwrap();
        assert_eq!(chain.cycles(), 1);
        assert_eq!(trace.len(), 1);
        assert_eq!(
            trace.front().unwrap().get(TracedParam::Sigma2).unwrap()[0],
            chain.state().sigma2()
        );
        assert_eq!(trace.derived().len(), 4);

        drop(inspector);
        assert_eq!(
            seen,
            vec![
                (0, Step::Betas, 0),
                (0, Step::Alphas, 0),
                (0, Step::Tau2, 0),
                (0, Step::Sigma2, 0),
            ]
        );
    }

    #[test]
    fn draw_finishes_cycle() {
        let setup = setup();
        let mut trace = ChainTrace::new(3, &layout(&setup));
        let mut chain =
            GibbsChain::new(3, setup, &StartingValues::default(), 1, false).unwrap();

        chain.step(&mut trace, &mut NullInspector).unwrap();
        chain.draw(&mut trace, &mut NullInspector).unwrap();
        assert_eq!(chain.cycles(), 1);
        assert_eq!(chain.next_step(), Step::Betas);
        chain.draw(&mut trace, &mut NullInspector).unwrap();
        assert_eq!(trace.len(), 2);
        assert!(trace.derived().is_empty());
    }

    #[test]
    fn streams_differ_between_chains() {
        let setup = setup();
        let run = |id: u64| {
            let mut trace = ChainTrace::new(id, &layout(&setup));
            let mut chain =
                GibbsChain::new(id, setup.clone(), &StartingValues::default(), 5, false)
                    .unwrap();
            chain.draw(&mut trace, &mut NullInspector).unwrap();
            chain.state().sigma2()
        };
        assert_eq!(run(0), run(0));
        assert!(run(0) != run(1));
    }
}
