/*!
The adaptive multi-chain sampler.

Orchestrates a set of [`MarkovChain`]s through two phases. The prerun
repeatedly advances every chain by a fixed number of iterations, tunes each
chain's proposal towards a target acceptance band, and tests convergence
with Gelman-Rubin R-values until all chains agree or the iteration budget
runs out. The main run then draws the production samples in chunks,
streaming each chunk to a [`SampleSink`].

Chains are advanced in parallel through a [`ThreadPool`] when
[`Config::parallelize`] is set; each round is one pool job per chain, joined
through tickets.

# Examples

```rust,no_run
use multichain::density::DiagonalGaussian;
use multichain::sampler::{Config, Sampler};
use multichain::sink::MemorySink;

let density = DiagonalGaussian::new(vec![("x", -10.0, 10.0)], vec![0.0], vec![1.0]);
let mut sampler = Sampler::new(density, Config::quick()).unwrap();
let mut sink = MemorySink::new();
sampler.run(&mut sink).unwrap();
assert!(sampler.pre_run_info().unwrap().converged);
```
*/

use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use crate::chain::{MarkovChain, Point, Stats};
use crate::cluster::RValueFn;
use crate::density::Density;
use crate::error::{Error, Result};
use crate::pool::{ThreadPool, Ticket};
use crate::proposal::{automatic_scale, ProposalFamily, ProposalFunction, ScaledProposal};
use crate::rvalue;
use crate::sink::{SampleRecord, SampleSink};

/// Sampler settings. `Config::default()` gives the production defaults;
/// [`Config::quick`] trades accuracy for speed.
#[derive(Debug, Clone)]
pub struct Config {
    pub number_of_chains: usize,
    /// Base RNG seed; chain `c` is seeded with `seed + c`.
    pub seed: u64,
    /// Dispatch chain updates through the thread pool.
    pub parallelize: bool,

    /// Acceptance band targeted by proposal adaptation.
    pub min_efficiency: f64,
    pub max_efficiency: f64,

    pub rvalue_criterion_param: f64,
    pub rvalue_criterion_posterior: f64,
    /// Use the t-corrected R-value instead of the approximation.
    pub use_strict_rvalue_definition: bool,
    /// Additionally require the posterior R-value to pass.
    pub use_posterior_rvalue: bool,

    pub need_prerun: bool,
    pub prerun_iterations_update: u32,
    pub prerun_iterations_min: u64,
    pub prerun_iterations_max: u64,

    pub proposal_family: ProposalFamily,
    /// Per-dimension initial proposal variances; the flat-prior variance
    /// `(max - min)² / 12` is used when unset.
    pub proposal_initial_variances: Option<Vec<f64>>,
    /// Initial global scale factor; `2.38² / d` when unset.
    pub initial_scale_factor: Option<f64>,

    /// Keep adapting during the main run while the completed iterations
    /// stay below this count; 0 freezes the proposal after the prerun.
    pub adapt_iterations: u64,
    pub chunks: u32,
    pub chunk_size: u32,
    pub need_main_run: bool,
    /// Fraction of the prerun history discarded before R-value tests.
    pub skip_initial: f64,
    /// Stream main-run samples to the sink.
    pub store: bool,
    /// Stream prerun samples to the sink as well.
    pub store_prerun: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            number_of_chains: 3,
            seed: 0,
            parallelize: true,
            min_efficiency: 0.15,
            max_efficiency: 0.35,
            rvalue_criterion_param: 1.1,
            rvalue_criterion_posterior: 1.1,
            use_strict_rvalue_definition: true,
            use_posterior_rvalue: false,
            need_prerun: true,
            prerun_iterations_update: 1000,
            prerun_iterations_min: 1000,
            prerun_iterations_max: 1_000_000,
            proposal_family: ProposalFamily::Gaussian,
            proposal_initial_variances: None,
            initial_scale_factor: None,
            adapt_iterations: 0,
            chunks: 100,
            chunk_size: 1000,
            need_main_run: true,
            skip_initial: 0.1,
            store: true,
            store_prerun: false,
        }
    }
}

impl Config {
    /// A fast low-accuracy preset: one chain, short prerun, small main run.
    pub fn quick() -> Self {
        Config {
            number_of_chains: 1,
            use_strict_rvalue_definition: false,
            use_posterior_rvalue: false,
            prerun_iterations_update: 400,
            prerun_iterations_min: 400,
            prerun_iterations_max: 100_000,
            chunks: 10,
            chunk_size: 100,
            ..Config::default()
        }
    }

    fn rvalue_fn(&self) -> RValueFn {
        if self.use_strict_rvalue_definition {
            rvalue::gelman_rubin
        } else {
            rvalue::approximation
        }
    }
}

/// Outcome of the prerun phase.
#[derive(Debug, Clone)]
pub struct PreRunInfo {
    pub converged: bool,
    /// Total prerun iterations per chain.
    pub iterations: u64,
    /// Iterations at the first round that passed all convergence checks.
    pub iterations_at_convergence: Option<u64>,
    /// `f64::MAX` when not computed.
    pub rvalue_posterior: f64,
    /// Last per-parameter R-values; empty for a single chain.
    pub rvalue_parameters: Vec<f64>,
}

enum Pool {
    Global,
    Owned(ThreadPool),
}

impl Pool {
    fn get(&self) -> &ThreadPool {
        match self {
            Pool::Global => ThreadPool::global(),
            Pool::Owned(pool) => pool,
        }
    }
}

type SharedChain<D> = Arc<Mutex<MarkovChain<D, ScaledProposal>>>;

/// Drives several Metropolis chains to convergence and through a main run.
pub struct Sampler<D>
where
    D: Density + Clone + Send + 'static,
{
    config: Config,
    chains: Vec<SharedChain<D>>,
    pool: Pool,
    pre_run_info: Option<PreRunInfo>,
    dimension: usize,
}

impl<D> Sampler<D>
where
    D: Density + Clone + Send + 'static,
{
    /// Builds `config.number_of_chains` chains over clones of `density`,
    /// each with its own seeded RNG and proposal.
    pub fn new(density: D, config: Config) -> Result<Self> {
        Self::with_pool_choice(density, config, Pool::Global)
    }

    /// Like [`Sampler::new`] but dispatching to a dedicated pool instead of
    /// the process-wide one.
    pub fn with_pool(density: D, config: Config, pool: ThreadPool) -> Result<Self> {
        Self::with_pool_choice(density, config, Pool::Owned(pool))
    }

    fn with_pool_choice(density: D, config: Config, pool: Pool) -> Result<Self> {
        if !(0.0..1.0).contains(&config.skip_initial) {
            return Err(Error::InvalidFraction("skip_initial"));
        }
        if config.number_of_chains == 0 {
            return Err(Error::TooFewChains(0));
        }
        let dimension = density.dimension();

        let variances = match &config.proposal_initial_variances {
            Some(v) => {
                if v.len() != dimension {
                    return Err(Error::DimensionMismatch {
                        expected: dimension,
                        got: v.len(),
                    });
                }
                v.clone()
            }
            // flat-prior variance over each parameter range
            None => density
                .parameters()
                .iter()
                .map(|p| (p.max - p.min) * (p.max - p.min) / 12.0)
                .collect(),
        };
        let scale_factor = config
            .initial_scale_factor
            .unwrap_or_else(|| automatic_scale(dimension));

        let chains = (0..config.number_of_chains)
            .map(|c| {
                let proposal = ScaledProposal::with_scale_factor(
                    config.proposal_family,
                    variances.clone(),
                    scale_factor,
                );
                MarkovChain::new(density.clone(), proposal, config.seed, c)
                    .map(|chain| Arc::new(Mutex::new(chain)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Sampler {
            config,
            chains,
            pool,
            pre_run_info: None,
            dimension,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prerun outcome; an error before the first completed prerun.
    pub fn pre_run_info(&self) -> Result<&PreRunInfo> {
        self.pre_run_info.as_ref().ok_or(Error::NoPreRun)
    }

    /// Snapshot of every chain's running statistics.
    pub fn chain_statistics(&self) -> Vec<Stats> {
        self.chains
            .iter()
            .map(|chain| chain.lock().unwrap_or_else(|e| e.into_inner()).statistics().clone())
            .collect()
    }

    /// Pins the starting point of every chain, overriding the random
    /// initialization. One point per chain.
    pub fn set_start_points(&mut self, points: &[Point]) -> Result<()> {
        if points.len() != self.chains.len() {
            return Err(Error::DimensionMismatch {
                expected: self.chains.len(),
                got: points.len(),
            });
        }
        for (chain, point) in self.chains.iter().zip(points) {
            chain
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .set_point(point.clone())?;
        }
        Ok(())
    }

    /// Runs the configured phases back to back.
    pub fn run<S: SampleSink>(&mut self, sink: &mut S) -> Result<()> {
        self.run_inner(sink, false)
    }

    /// Like [`Sampler::run`], with progress bars on stderr.
    pub fn run_with_progress<S: SampleSink>(&mut self, sink: &mut S) -> Result<()> {
        self.run_inner(sink, true)
    }

    fn run_inner<S: SampleSink>(&mut self, sink: &mut S, progress: bool) -> Result<()> {
        if self.config.need_prerun {
            let bar = progress.then(|| {
                Self::progress_bar("prerun", self.config.prerun_iterations_max)
            });
            self.pre_run(sink, bar.as_ref())?;
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
        }
        if self.config.need_main_run {
            let bar = progress.then(|| {
                Self::progress_bar(
                    "main run",
                    u64::from(self.config.chunks) * u64::from(self.config.chunk_size),
                )
            });
            self.main_run(sink, bar.as_ref())?;
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
        }
        Ok(())
    }

    fn progress_bar(phase: &str, length: u64) -> ProgressBar {
        let bar = ProgressBar::new(length);
        bar.set_style(
            ProgressStyle::with_template(
                "{msg} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar.set_message(phase.to_string());
        bar
    }

    /// Advances every chain by `iterations`, in parallel when configured.
    /// The first chain error aborts the phase.
    fn run_round(&self, iterations: u32) -> Result<()> {
        if self.config.parallelize && self.chains.len() > 1 {
            let pool = self.pool.get();
            let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

            let tickets: Vec<Ticket> = self
                .chains
                .iter()
                .map(|chain| {
                    pool.wait_for_free_capacity();
                    let chain = Arc::clone(chain);
                    let failure = Arc::clone(&failure);
                    pool.enqueue(move || {
                        let mut chain = chain.lock().unwrap_or_else(|e| e.into_inner());
                        if let Err(error) = chain.run(iterations) {
                            let mut slot = failure.lock().unwrap_or_else(|e| e.into_inner());
                            if slot.is_none() {
                                *slot = Some(error);
                            }
                        }
                    })
                })
                .collect();
            for ticket in &tickets {
                ticket.wait();
            }

            let error = failure.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(error) = error {
                return Err(error);
            }
        } else {
            for chain in &self.chains {
                chain.lock().unwrap_or_else(|e| e.into_inner()).run(iterations)?;
            }
        }
        Ok(())
    }

    fn pre_run<S: SampleSink>(&mut self, sink: &mut S, bar: Option<&ProgressBar>) -> Result<()> {
        info!(
            "commencing the prerun with {} to {} iterations in rounds of {}",
            self.config.prerun_iterations_min,
            self.config.prerun_iterations_max,
            self.config.prerun_iterations_update
        );

        for chain in &self.chains {
            let mut chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            chain.keep_history(true);
            chain.reset(true);
            chain.clear();
        }

        let mut info = PreRunInfo {
            converged: false,
            iterations: 0,
            iterations_at_convergence: None,
            rvalue_posterior: f64::MAX,
            rvalue_parameters: Vec::new(),
        };

        while info.iterations < self.config.prerun_iterations_min
            || (!info.converged && info.iterations < self.config.prerun_iterations_max)
        {
            let round = self.config.prerun_iterations_update;
            self.run_round(round)?;
            info.iterations += u64::from(round);
            if let Some(bar) = bar {
                bar.inc(u64::from(round));
            }

            if self.config.store_prerun {
                let offset = info.iterations - u64::from(round);
                self.append_round(sink, offset, round)?;
            }

            let efficiencies_ok = self.adjust_scales(round);
            info.converged = if self.chains.len() == 1 {
                // a lone chain has nothing to disagree with
                info.iterations >= self.config.prerun_iterations_min
            } else {
                // evaluate both so the R-values are reported even while
                // the efficiencies still drift
                let rvalues_ok = self.check_rvalues(&mut info)?;
                efficiencies_ok && rvalues_ok
            };

            if info.converged && info.iterations_at_convergence.is_none() {
                info.iterations_at_convergence = Some(info.iterations);
                info!("prerun converged after {} iterations", info.iterations);
            }
        }

        if !info.converged {
            warn!(
                "prerun did NOT converge within {} iterations",
                self.config.prerun_iterations_max
            );
        }
        self.pre_run_info = Some(info);
        Ok(())
    }

    /// Tunes the proposal of every chain whose acceptance efficiency left
    /// the target band during the last round. Returns whether all chains
    /// were inside the band.
    fn adjust_scales(&self, round: u32) -> bool {
        let mut all_ok = true;
        for chain in &self.chains {
            let mut chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            let efficiency = chain.statistics().efficiency();
            if (self.config.min_efficiency..=self.config.max_efficiency).contains(&efficiency) {
                continue;
            }
            all_ok = false;

            debug!(
                "chain {}: efficiency {:.4} outside [{}, {}], adapting",
                chain.index(),
                efficiency,
                self.config.min_efficiency,
                self.config.max_efficiency
            );
            // sample variances over the last round only
            let history_length = chain.history().len();
            let round_begin = history_length.saturating_sub(round as usize);
            let variances = chain
                .history()
                .mean_and_variance(round_begin..history_length)
                .map(|(_, v)| v)
                .unwrap_or_default();
            let (min, max) = (self.config.min_efficiency, self.config.max_efficiency);
            chain
                .proposal_function_mut()
                .adapt(efficiency, min, max, &variances);
        }
        all_ok
    }

    /// Computes the per-parameter (and optionally posterior) R-values over
    /// the post-burn-in prerun history and compares them against the
    /// criteria.
    fn check_rvalues(&self, info: &mut PreRunInfo) -> Result<bool> {
        let rvalue_fn = self.config.rvalue_fn();

        // one (means, variances) summary per chain
        let mut summaries = Vec::with_capacity(self.chains.len());
        let mut effective_length = 0;
        for chain in &self.chains {
            let chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            let history_length = chain.history().len();
            let begin = (self.config.skip_initial * history_length as f64) as usize;
            summaries.push(chain.history().mean_and_variance(begin..history_length)?);
            effective_length = history_length - begin;
        }

        let mut all_ok = true;
        info.rvalue_parameters.clear();
        for d in 0..self.dimension {
            let means: Vec<f64> = summaries.iter().map(|(m, _)| m[d]).collect();
            let variances: Vec<f64> = summaries.iter().map(|(_, v)| v[d]).collect();
            let r = rvalue_fn(&means, &variances, effective_length)?;
            info.rvalue_parameters.push(r);
            if r > self.config.rvalue_criterion_param || r.is_nan() {
                debug!(
                    "parameter {}: R = {:.4} > {}",
                    d, r, self.config.rvalue_criterion_param
                );
                all_ok = false;
            }
        }

        if self.config.use_posterior_rvalue {
            let mut means = Vec::with_capacity(self.chains.len());
            let mut variances = Vec::with_capacity(self.chains.len());
            let mut length = 0;
            for chain in &self.chains {
                let chain = chain.lock().unwrap_or_else(|e| e.into_inner());
                let stats = chain.statistics();
                means.push(stats.posterior_mean());
                variances.push(stats.posterior_variance());
                length = stats.iterations_total as usize;
            }
            info.rvalue_posterior = rvalue_fn(&means, &variances, length)?;
            if info.rvalue_posterior > self.config.rvalue_criterion_posterior
                || info.rvalue_posterior.is_nan()
            {
                debug!(
                    "posterior R = {:.4} > {}",
                    info.rvalue_posterior, self.config.rvalue_criterion_posterior
                );
                all_ok = false;
            }
        }

        Ok(all_ok)
    }

    /// Appends the last `round` history entries of every chain to the sink.
    fn append_round<S: SampleSink>(&self, sink: &mut S, offset: u64, round: u32) -> Result<()> {
        let mut records = Vec::new();
        for chain in &self.chains {
            let chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            let states = chain.history().states();
            let begin = states.len().saturating_sub(round as usize);
            for (i, state) in states[begin..].iter().enumerate() {
                records.push(SampleRecord::new(chain.index(), offset + i as u64, state));
            }
        }
        sink.append(&records)
    }

    fn main_run<S: SampleSink>(&mut self, sink: &mut S, bar: Option<&ProgressBar>) -> Result<()> {
        info!(
            "commencing the main run: {} chunks of {} iterations",
            self.config.chunks, self.config.chunk_size
        );

        // start production statistics from scratch
        for chain in &self.chains {
            let mut chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            chain.keep_history(true);
            chain.reset(true);
            chain.clear();
        }

        for chunk in 0..self.config.chunks {
            let chunk_size = self.config.chunk_size;
            self.run_round(chunk_size)?;
            if let Some(bar) = bar {
                bar.inc(u64::from(chunk_size));
            }

            if self.config.store {
                let offset = u64::from(chunk) * u64::from(chunk_size);
                self.append_round(sink, offset, chunk_size)?;
            }

            // diagnostics only; a drifting main run is logged, not aborted
            if self.chains.len() > 1 {
                self.log_main_run_rvalues(chunk)?;
            }

            let completed = u64::from(chunk + 1) * u64::from(chunk_size);
            if completed < self.config.adapt_iterations {
                self.adjust_scales(chunk_size);
            }

            for chain in &self.chains {
                chain.lock().unwrap_or_else(|e| e.into_inner()).clear();
            }
        }
        Ok(())
    }

    fn log_main_run_rvalues(&self, chunk: u32) -> Result<()> {
        let rvalue_fn = self.config.rvalue_fn();
        let mut summaries = Vec::with_capacity(self.chains.len());
        let mut length = 0;
        for chain in &self.chains {
            let chain = chain.lock().unwrap_or_else(|e| e.into_inner());
            length = chain.history().len();
            summaries.push(chain.history().mean_and_variance(0..length)?);
        }

        for d in 0..self.dimension {
            let means: Vec<f64> = summaries.iter().map(|(m, _)| m[d]).collect();
            let variances: Vec<f64> = summaries.iter().map(|(_, v)| v[d]).collect();
            let r = rvalue_fn(&means, &variances, length)?;
            if r > self.config.rvalue_criterion_param || r.is_nan() {
                info!(
                    "chunk {}: parameter {} R = {:.4} exceeds {}",
                    chunk, d, r, self.config.rvalue_criterion_param
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::DiagonalGaussian;
    use crate::sink::MemorySink;

    fn unit_gaussian() -> DiagonalGaussian {
        DiagonalGaussian::new(vec![("x", -10.0, 10.0)], vec![0.0], vec![1.0])
    }

    #[test]
    fn pre_run_info_before_prerun_is_an_error() {
        let sampler = Sampler::new(unit_gaussian(), Config::default()).unwrap();
        assert!(matches!(sampler.pre_run_info(), Err(Error::NoPreRun)));
    }

    #[test]
    fn quick_preset_runs_a_single_chain_to_completion() {
        let mut config = Config::quick();
        config.parallelize = false;
        config.seed = 11;
        let mut sampler = Sampler::new(unit_gaussian(), config).unwrap();
        let mut sink = MemorySink::new();
        sampler.run(&mut sink).unwrap();

        let info = sampler.pre_run_info().unwrap();
        // single chain: convergence declared at the minimum, no R-values
        assert!(info.converged);
        assert_eq!(info.iterations_at_convergence, Some(400));
        assert!(info.rvalue_parameters.is_empty());

        // 10 chunks of 100 from one chain
        assert_eq!(sink.records().len(), 1000);
    }

    #[test]
    fn main_run_samples_are_numbered_consecutively() {
        let mut config = Config::quick();
        config.parallelize = false;
        config.seed = 3;
        let mut sampler = Sampler::new(unit_gaussian(), config).unwrap();
        let mut sink = MemorySink::new();
        sampler.run(&mut sink).unwrap();

        let iterations: Vec<u64> = sink.chain_records(0).map(|r| r.iteration).collect();
        let expected: Vec<u64> = (0..1000).collect();
        assert_eq!(iterations, expected);
    }

    #[test]
    fn store_false_keeps_the_sink_empty() {
        let mut config = Config::quick();
        config.parallelize = false;
        config.store = false;
        let mut sampler = Sampler::new(unit_gaussian(), config).unwrap();
        let mut sink = MemorySink::new();
        sampler.run(&mut sink).unwrap();
        assert!(sink.records().is_empty());
    }

    #[test]
    fn set_start_points_requires_one_point_per_chain() {
        let mut config = Config::default();
        config.number_of_chains = 2;
        let mut sampler = Sampler::new(unit_gaussian(), config).unwrap();
        assert!(sampler.set_start_points(&[vec![0.0]]).is_err());
        sampler
            .set_start_points(&[vec![-1.0], vec![1.0]])
            .unwrap();
    }

    #[test]
    fn default_proposal_variance_is_the_flat_prior_variance() {
        let config = Config {
            number_of_chains: 1,
            ..Config::default()
        };
        let sampler = Sampler::new(unit_gaussian(), config).unwrap();
        let chain = sampler.chains[0].lock().unwrap();
        // (10 - (-10))² / 12
        approx::assert_relative_eq!(chain.proposal_function().scales()[0], 400.0 / 12.0);
    }
}
