/*!
A single Metropolis Markov chain.

The chain owns its density, its proposal function, and its seeded RNG; it
never talks to other chains. Each call to [`MarkovChain::run`] advances the
walk by a fixed number of iterations, accumulating running statistics with
Welford's method and, when history keeping is on, appending every visited
state to the in-memory history. Proposal scales are set from outside by the
sampler; the chain never tunes itself.
*/

use std::ops::Range;

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::density::Density;
use crate::error::{Error, Result};
use crate::proposal::{uniform_in, ProposalFunction, ScaledProposal};

/// A point in parameter space.
pub type Point = Vec<f64>;

/// One visited state: the point and the density parts evaluated there.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoAtPoint {
    pub point: Point,
    pub log_likelihood: f64,
    pub log_prior: f64,
    pub log_posterior: f64,
}

/// Append-only record of visited states.
///
/// With `keep == false` nothing is stored; run statistics still accumulate
/// in [`Stats`], so convergence diagnostics work on discarded histories too.
#[derive(Debug, Clone, Default)]
pub struct History {
    keep: bool,
    states: Vec<InfoAtPoint>,
}

impl History {
    #[cfg(test)]
    pub(crate) fn from_states(states: Vec<InfoAtPoint>) -> Self {
        History { keep: true, states }
    }

    pub fn states(&self) -> &[InfoAtPoint] {
        &self.states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    fn record(&mut self, state: &InfoAtPoint) {
        if self.keep {
            self.states.push(state.clone());
        }
    }

    /// Per-dimension mean and sample variance of the points in `range`,
    /// accumulated with Welford's method.
    pub fn mean_and_variance(&self, range: Range<usize>) -> Result<(Vec<f64>, Vec<f64>)> {
        let states = self
            .states
            .get(range)
            .ok_or(Error::EmptyHistory)?;
        let first = states.first().ok_or(Error::EmptyHistory)?;

        let dimension = first.point.len();
        let mut mean = first.point.clone();
        let mut m2 = vec![0.0; dimension];

        for (n, state) in states.iter().enumerate().skip(1) {
            for d in 0..dimension {
                let x = state.point[d];
                let previous_mean = mean[d];
                mean[d] += (x - previous_mean) / (n as f64 + 1.0);
                m2[d] += (x - previous_mean) * (x - mean[d]);
            }
        }

        let denominator = (states.len() as f64 - 1.0).max(1.0);
        let variance = m2.into_iter().map(|v| v / denominator).collect();
        Ok((mean, variance))
    }

    /// The state with the highest log-posterior within `range`.
    pub fn local_mode(&self, range: Range<usize>) -> Result<&InfoAtPoint> {
        self.states
            .get(range)
            .and_then(|states| {
                states
                    .iter()
                    .max_by(|a, b| a.log_posterior.total_cmp(&b.log_posterior))
            })
            .ok_or(Error::EmptyHistory)
    }
}

/// Running statistics of a chain.
///
/// The accept/reject/invalid counters cover the current run only (they are
/// reset softly at the start of every [`MarkovChain::run`]); the Welford
/// accumulators and the mode survive soft resets and are wiped only by a
/// hard reset.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub iterations_accepted: u32,
    pub iterations_rejected: u32,
    pub iterations_invalid: u32,
    /// Iterations accumulated since the last hard reset, across runs.
    pub iterations_total: u32,

    parameter_means: Vec<f64>,
    parameter_m2: Vec<f64>,
    posterior_mean: f64,
    posterior_m2: f64,
    mode: f64,
    parameters_at_mode: Point,
}

impl Stats {
    fn new(dimension: usize) -> Self {
        Stats {
            parameter_means: vec![0.0; dimension],
            parameter_m2: vec![0.0; dimension],
            mode: f64::NEG_INFINITY,
            ..Default::default()
        }
    }

    /// Acceptance efficiency of the current run. Invalid proposals do not
    /// enter; a run that only produced invalid proposals reports 0.
    pub fn efficiency(&self) -> f64 {
        let decided = self.iterations_accepted + self.iterations_rejected;
        if decided == 0 {
            0.0
        } else {
            f64::from(self.iterations_accepted) / f64::from(decided)
        }
    }

    pub fn parameter_means(&self) -> &[f64] {
        &self.parameter_means
    }

    pub fn parameter_variances(&self) -> Vec<f64> {
        let denominator = (f64::from(self.iterations_total) - 1.0).max(1.0);
        self.parameter_m2.iter().map(|m2| m2 / denominator).collect()
    }

    pub fn posterior_mean(&self) -> f64 {
        self.posterior_mean
    }

    pub fn posterior_variance(&self) -> f64 {
        let denominator = (f64::from(self.iterations_total) - 1.0).max(1.0);
        self.posterior_m2 / denominator
    }

    /// Highest log-posterior seen since the last hard reset.
    pub fn mode(&self) -> f64 {
        self.mode
    }

    pub fn parameters_at_mode(&self) -> &Point {
        &self.parameters_at_mode
    }

    fn update(&mut self, state: &InfoAtPoint) {
        self.iterations_total += 1;
        let n = f64::from(self.iterations_total);

        for d in 0..self.parameter_means.len() {
            let x = state.point[d];
            let previous_mean = self.parameter_means[d];
            self.parameter_means[d] += (x - previous_mean) / n;
            self.parameter_m2[d] += (x - previous_mean) * (x - self.parameter_means[d]);
        }

        let previous_mean = self.posterior_mean;
        self.posterior_mean += (state.log_posterior - previous_mean) / n;
        self.posterior_m2 +=
            (state.log_posterior - previous_mean) * (state.log_posterior - self.posterior_mean);

        if state.log_posterior > self.mode {
            self.mode = state.log_posterior;
            self.parameters_at_mode = state.point.clone();
        }
    }

    fn reset(&mut self, hard: bool) {
        self.iterations_accepted = 0;
        self.iterations_rejected = 0;
        self.iterations_invalid = 0;
        if hard {
            self.iterations_total = 0;
            self.parameter_means.iter_mut().for_each(|m| *m = 0.0);
            self.parameter_m2.iter_mut().for_each(|m| *m = 0.0);
            self.posterior_mean = 0.0;
            self.posterior_m2 = 0.0;
            self.mode = f64::NEG_INFINITY;
            self.parameters_at_mode.clear();
        }
    }
}

/// A Metropolis chain over a cloned density.
pub struct MarkovChain<D, P = ScaledProposal>
where
    D: Density + Clone,
    P: ProposalFunction,
{
    density: D,
    proposal: P,
    rng: SmallRng,
    index: usize,
    current: InfoAtPoint,
    proposal_accepted: bool,
    history: History,
    stats: Stats,
    iterations_last_run: u32,
}

impl<D, P> MarkovChain<D, P>
where
    D: Density + Clone,
    P: ProposalFunction,
{
    /// Creates chain number `index` with an RNG seeded by `seed + index`
    /// and a starting point drawn uniformly within the parameter ranges.
    pub fn new(density: D, proposal: P, seed: u64, index: usize) -> Result<Self> {
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(index as u64));
        let start: Point = density
            .parameters()
            .iter()
            .map(|p| uniform_in(&mut rng, p.min, p.max))
            .collect();
        let current = Self::info_at(&density, start)?;
        let dimension = density.dimension();

        Ok(MarkovChain {
            density,
            proposal,
            rng,
            index,
            current,
            proposal_accepted: false,
            history: History::default(),
            stats: Stats::new(dimension),
            iterations_last_run: 0,
        })
    }

    fn info_at(density: &D, point: Point) -> Result<InfoAtPoint> {
        let value = density.evaluate(&point)?;
        Ok(InfoAtPoint {
            point,
            log_likelihood: value.log_likelihood,
            log_prior: value.log_prior,
            log_posterior: value.log_posterior(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_state(&self) -> &InfoAtPoint {
        &self.current
    }

    /// Whether the most recent iteration accepted its proposal.
    pub fn proposal_accepted(&self) -> bool {
        self.proposal_accepted
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn statistics(&self) -> &Stats {
        &self.stats
    }

    pub fn iterations_last_run(&self) -> u32 {
        self.iterations_last_run
    }

    pub fn keep_history(&mut self, keep: bool) {
        self.history.keep = keep;
    }

    /// Drops the stored history. Statistics are unaffected.
    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn proposal_function(&self) -> &P {
        &self.proposal
    }

    pub fn proposal_function_mut(&mut self) -> &mut P {
        &mut self.proposal
    }

    /// Sets every per-dimension proposal scale.
    pub fn set_scale(&mut self, scale: f64) {
        self.proposal.set_scale(scale);
    }

    /// Sets the proposal scale of one dimension.
    pub fn set_scale_at(&mut self, index: usize, scale: f64) {
        self.proposal.set_scale_at(index, scale);
    }

    /// Moves the chain to `point`, re-evaluating the density there. Every
    /// coordinate must lie within its parameter range.
    pub fn set_point(&mut self, point: Point) -> Result<()> {
        if point.len() != self.density.dimension() {
            return Err(Error::DimensionMismatch {
                expected: self.density.dimension(),
                got: point.len(),
            });
        }
        for (parameter, &value) in self.density.parameters().iter().zip(&point) {
            if value < parameter.min || value > parameter.max {
                return Err(Error::PointOutOfRange {
                    name: parameter.name.clone(),
                    value,
                    min: parameter.min,
                    max: parameter.max,
                });
            }
        }
        self.current = Self::info_at(&self.density, point)?;
        self.proposal_accepted = false;
        Ok(())
    }

    /// Clears the per-run counters; a hard reset also wipes the Welford
    /// accumulators and the mode. The current point never moves.
    pub fn reset(&mut self, hard: bool) {
        self.stats.reset(hard);
        self.iterations_last_run = 0;
    }

    /// Advances the chain by `iterations` steps.
    ///
    /// Starts with a soft reset, so the accept/reject/invalid counters
    /// afterwards describe exactly this run. A failing density evaluation
    /// aborts the run; the iteration in flight is not recorded.
    pub fn run(&mut self, iterations: u32) -> Result<()> {
        self.reset(false);

        for _ in 0..iterations {
            self.advance()?;
            self.stats.update(&self.current);
            self.history.record(&self.current);
            self.iterations_last_run += 1;
        }

        debug!(
            "chain {}: {} iterations, efficiency {:.4}, {} invalid",
            self.index,
            self.iterations_last_run,
            self.stats.efficiency(),
            self.stats.iterations_invalid
        );
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        let candidate = self.proposal.propose(&self.current.point, &mut self.rng);

        // out-of-range proposals are rejected before touching the density
        let in_range = self
            .density
            .parameters()
            .iter()
            .zip(&candidate)
            .all(|(p, &x)| x >= p.min && x <= p.max);
        if !in_range {
            self.stats.iterations_invalid += 1;
            self.proposal_accepted = false;
            return Ok(());
        }

        let proposed = Self::info_at(&self.density, candidate)?;
        // a -inf ratio is a regular rejection (zero-density candidate);
        // NaN means the density itself is broken
        let log_r = proposed.log_posterior - self.current.log_posterior;
        if log_r.is_nan() {
            return Err(Error::NonFiniteAcceptanceRatio(log_r));
        }

        let log_u = self.rng.gen::<f64>().ln();
        if log_u < log_r {
            self.current = proposed;
            self.stats.iterations_accepted += 1;
            self.proposal_accepted = true;
        } else {
            self.stats.iterations_rejected += 1;
            self.proposal_accepted = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::{DensityValue, DiagonalGaussian, ParameterDescription};
    use approx::assert_relative_eq;

    /// Deterministic proposal stepping +1 in every dimension.
    #[derive(Clone)]
    struct StepProposal;

    impl ProposalFunction for StepProposal {
        fn propose(&self, current: &[f64], _rng: &mut SmallRng) -> Vec<f64> {
            current.iter().map(|x| x + 1.0).collect()
        }

        fn adapt(&mut self, _efficiency: f64, _min: f64, _max: f64, _variances: &[f64]) {}
        fn set_scale(&mut self, _scale: f64) {}
        fn set_scale_at(&mut self, _index: usize, _scale: f64) {}
    }

    /// log-posterior = slope * x, on [min, max].
    #[derive(Clone)]
    struct Ramp {
        parameters: Vec<ParameterDescription>,
        slope: f64,
    }

    impl Ramp {
        fn new(min: f64, max: f64, slope: f64) -> Self {
            Ramp {
                parameters: vec![ParameterDescription::new("x", min, max)],
                slope,
            }
        }
    }

    impl Density for Ramp {
        fn parameters(&self) -> &[ParameterDescription] {
            &self.parameters
        }

        fn evaluate(&self, point: &[f64]) -> Result<DensityValue> {
            Ok(DensityValue {
                log_likelihood: self.slope * point[0],
                log_prior: 0.0,
            })
        }
    }

    #[test]
    fn uphill_steps_are_always_accepted() {
        let mut chain = MarkovChain::new(Ramp::new(0.0, 1000.0, 1.0), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.keep_history(true);
        chain.run(10).unwrap();

        assert_eq!(chain.statistics().iterations_accepted, 10);
        assert_eq!(chain.statistics().iterations_rejected, 0);
        assert_eq!(chain.statistics().iterations_invalid, 0);
        assert!(chain.proposal_accepted());
        assert_relative_eq!(chain.current_state().point[0], 10.0);
        assert_eq!(chain.history().len(), 10);
    }

    #[test]
    fn steeply_downhill_steps_are_rejected() {
        let mut chain =
            MarkovChain::new(Ramp::new(0.0, 1000.0, -1.0e6), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.run(10).unwrap();

        assert_eq!(chain.statistics().iterations_accepted, 0);
        assert_eq!(chain.statistics().iterations_rejected, 10);
        assert!(!chain.proposal_accepted());
        assert_relative_eq!(chain.current_state().point[0], 0.0);
    }

    #[test]
    fn acceptance_draws_are_seed_reproducible() {
        // slope -1 accepts each +1 step with probability 1/e, so the
        // decision sequence depends on the uniform draws alone
        let run_one = || {
            let mut chain =
                MarkovChain::new(Ramp::new(0.0, 1000.0, -1.0), StepProposal, 123, 0).unwrap();
            chain.set_point(vec![0.0]).unwrap();
            chain.keep_history(true);
            chain.run(100).unwrap();
            chain
        };
        let a = run_one();
        let b = run_one();

        // same seed, same accept/reject sequence, same trajectory
        assert_eq!(a.current_state().point, b.current_state().point);
        assert_eq!(
            a.statistics().iterations_accepted,
            b.statistics().iterations_accepted
        );

        let stats = a.statistics();
        assert!(stats.iterations_accepted > 0);
        assert!(stats.iterations_rejected > 0);
        assert_eq!(stats.iterations_accepted + stats.iterations_rejected, 100);

        // the walk moves exactly one unit per accepted draw
        assert_relative_eq!(
            a.current_state().point[0],
            f64::from(stats.iterations_accepted)
        );
        let mut previous = 0.0;
        for state in a.history().states() {
            let step = state.point[0] - previous;
            assert!(step == 0.0 || step == 1.0, "unexpected step {}", step);
            previous = state.point[0];
        }
    }

    #[test]
    fn out_of_range_proposals_count_as_invalid() {
        let mut chain = MarkovChain::new(Ramp::new(0.0, 0.5, 1.0), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.25]).unwrap();
        chain.run(5).unwrap();

        assert_eq!(chain.statistics().iterations_invalid, 5);
        assert_eq!(chain.statistics().iterations_accepted, 0);
        assert_eq!(chain.statistics().iterations_rejected, 0);
        assert_relative_eq!(chain.current_state().point[0], 0.25);
        // invalid proposals never enter the efficiency
        assert_relative_eq!(chain.statistics().efficiency(), 0.0);
    }

    /// An uphill ramp whose evaluation fails once a budget of calls is
    /// spent, the way a density backed by an external lookup would.
    #[derive(Clone)]
    struct FlakyRamp {
        parameters: Vec<ParameterDescription>,
        evaluations_left: std::cell::Cell<u32>,
    }

    impl Density for FlakyRamp {
        fn parameters(&self) -> &[ParameterDescription] {
            &self.parameters
        }

        fn evaluate(&self, point: &[f64]) -> Result<DensityValue> {
            let left = self.evaluations_left.get();
            if left == 0 {
                return Err(Error::Density("interpolation table exhausted".into()));
            }
            self.evaluations_left.set(left - 1);
            Ok(DensityValue {
                log_likelihood: point[0],
                log_prior: 0.0,
            })
        }
    }

    #[test]
    fn density_failure_aborts_the_run_without_a_partial_iteration() {
        let density = FlakyRamp {
            parameters: vec![ParameterDescription::new("x", 0.0, 1000.0)],
            // construction + set_point + two run iterations
            evaluations_left: std::cell::Cell::new(4),
        };
        let mut chain = MarkovChain::new(density, StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.keep_history(true);

        // uphill steps to 1 and 2 are accepted; evaluating at 3 fails
        assert!(matches!(chain.run(10), Err(Error::Density(_))));
        assert_relative_eq!(chain.current_state().point[0], 2.0);
        assert_eq!(chain.iterations_last_run(), 2);
        assert_eq!(chain.statistics().iterations_total, 2);
        assert_eq!(chain.history().len(), 2);
    }

    #[test]
    fn starting_point_is_inside_the_box() {
        let density = DiagonalGaussian::new(vec![("x", -3.0, 7.0)], vec![0.0], vec![1.0]);
        for index in 0..10 {
            let chain = MarkovChain::new(
                density.clone(),
                ScaledProposal::new(crate::proposal::ProposalFamily::Gaussian, vec![1.0]),
                7,
                index,
            )
            .unwrap();
            let x = chain.current_state().point[0];
            assert!((-3.0..=7.0).contains(&x), "start {} escaped the box", x);
        }
    }

    #[test]
    fn set_point_rejects_out_of_range_values() {
        let density = DiagonalGaussian::new(vec![("x", -1.0, 1.0)], vec![0.0], vec![1.0]);
        let mut chain = MarkovChain::new(
            density,
            ScaledProposal::new(crate::proposal::ProposalFamily::Gaussian, vec![1.0]),
            7,
            0,
        )
        .unwrap();
        assert!(matches!(
            chain.set_point(vec![2.0]),
            Err(Error::PointOutOfRange { .. })
        ));
        assert!(matches!(
            chain.set_point(vec![0.0, 0.0]),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn welford_statistics_match_direct_formulas() {
        let mut chain = MarkovChain::new(Ramp::new(0.0, 1000.0, 1.0), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.keep_history(true);
        chain.run(5).unwrap();

        // visited points are 1..=5
        let stats = chain.statistics();
        assert_relative_eq!(stats.parameter_means()[0], 3.0);
        assert_relative_eq!(stats.parameter_variances()[0], 2.5);
        assert_relative_eq!(stats.posterior_mean(), 3.0);
        assert_relative_eq!(stats.mode(), 5.0);
        assert_relative_eq!(stats.parameters_at_mode()[0], 5.0);

        let (mean, variance) = chain.history().mean_and_variance(0..5).unwrap();
        assert_relative_eq!(mean[0], 3.0);
        assert_relative_eq!(variance[0], 2.5);

        let mode = chain.history().local_mode(0..5).unwrap();
        assert_relative_eq!(mode.point[0], 5.0);
    }

    #[test]
    fn soft_reset_keeps_welford_hard_reset_wipes_it() {
        let mut chain = MarkovChain::new(Ramp::new(0.0, 1000.0, 1.0), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.run(5).unwrap();
        assert_eq!(chain.statistics().iterations_total, 5);

        chain.reset(false);
        assert_eq!(chain.statistics().iterations_accepted, 0);
        assert_eq!(chain.statistics().iterations_total, 5);

        chain.reset(true);
        assert_eq!(chain.statistics().iterations_total, 0);
        assert_relative_eq!(chain.statistics().parameter_means()[0], 0.0);
    }

    #[test]
    fn history_off_keeps_statistics_running() {
        let mut chain = MarkovChain::new(Ramp::new(0.0, 1000.0, 1.0), StepProposal, 42, 0).unwrap();
        chain.set_point(vec![0.0]).unwrap();
        chain.run(5).unwrap();

        assert!(chain.history().is_empty());
        assert_eq!(chain.statistics().iterations_total, 5);
    }
}
