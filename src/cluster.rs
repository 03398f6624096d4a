/*!
Grouping of chains whose histories explore the same region.

A [`Cluster`] is seeded with one chain's history and grows by absorbing
further chains that pass a per-dimension R-value overlap test against the
current members. Summary statistics are computed once per chain over the
post-burn-in part of its history, so overlap tests are cheap no matter how
long the histories are.
*/

use log::debug;

use crate::chain::History;
use crate::error::{Error, Result};

/// Signature shared by [`crate::rvalue::gelman_rubin`] and
/// [`crate::rvalue::approximation`].
pub type RValueFn = fn(&[f64], &[f64], usize) -> Result<f64>;

/// A group of chains with mutually overlapping histories.
pub struct Cluster {
    rvalue_fn: RValueFn,
    max_rvalue: f64,
    skip_initial: f64,
    /// Indices of the dimensions entering the overlap test; all of them by
    /// default.
    parameter_indices: Vec<usize>,
    dimension: usize,
    /// Post-burn-in summary per member chain, one inner Vec per dimension.
    chain_means: Vec<Vec<f64>>,
    chain_variances: Vec<Vec<f64>>,
    chain_indices: Vec<usize>,
}

impl Cluster {
    /// Seeds a cluster with chain `index` and its history.
    ///
    /// `skip_initial` is the fraction of each history discarded as burn-in
    /// before computing the summary statistics; it must lie in `[0, 1)`.
    pub fn new(
        rvalue_fn: RValueFn,
        max_rvalue: f64,
        initial_history: &History,
        index: usize,
        skip_initial: f64,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&skip_initial) {
            return Err(Error::InvalidFraction("skip_initial"));
        }
        let (mean, variance) = Self::post_skip_statistics(initial_history, skip_initial)?;
        let dimension = mean.len();

        Ok(Cluster {
            rvalue_fn,
            max_rvalue,
            skip_initial,
            parameter_indices: (0..dimension).collect(),
            dimension,
            chain_means: vec![mean],
            chain_variances: vec![variance],
            chain_indices: vec![index],
        })
    }

    fn post_skip_statistics(history: &History, skip_initial: f64) -> Result<(Vec<f64>, Vec<f64>)> {
        let begin = (skip_initial * history.len() as f64) as usize;
        history.mean_and_variance(begin..history.len())
    }

    /// Number of post-burn-in points the summaries were computed from.
    fn effective_length(&self, history: &History) -> usize {
        ((1.0 - self.skip_initial) * history.len() as f64).ceil() as usize
    }

    /// Tests whether a candidate history overlaps every member of the
    /// cluster: for each checked dimension, the R-value over the member
    /// summaries plus the candidate's must stay within the criterion.
    pub fn overlaps(&self, history: &History) -> Result<bool> {
        let (candidate_mean, candidate_variance) =
            Self::post_skip_statistics(history, self.skip_initial)?;
        if candidate_mean.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: candidate_mean.len(),
            });
        }
        let length = self.effective_length(history);

        for &d in &self.parameter_indices {
            let mut means: Vec<f64> = self.chain_means.iter().map(|m| m[d]).collect();
            let mut variances: Vec<f64> = self.chain_variances.iter().map(|v| v[d]).collect();
            means.push(candidate_mean[d]);
            variances.push(candidate_variance[d]);

            let r = (self.rvalue_fn)(&means, &variances, length)?;
            if r > self.max_rvalue {
                debug!("dimension {}: R = {:.4} > {:.4}, no overlap", d, r, self.max_rvalue);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Adds chain `index` unconditionally; pair with [`Self::overlaps`] to
    /// grow clusters by agreement.
    pub fn add(&mut self, history: &History, index: usize) -> Result<()> {
        let (mean, variance) = Self::post_skip_statistics(history, self.skip_initial)?;
        if mean.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                got: mean.len(),
            });
        }
        self.chain_means.push(mean);
        self.chain_variances.push(variance);
        self.chain_indices.push(index);
        Ok(())
    }

    /// Restricts the overlap test to the given dimensions. Duplicates are
    /// removed and the indices kept sorted.
    pub fn parameter_indices(&mut self, mut indices: Vec<usize>) -> Result<()> {
        indices.sort_unstable();
        indices.dedup();
        if let Some(&out_of_range) = indices.iter().find(|&&i| i >= self.dimension) {
            return Err(Error::ParameterIndexOutOfRange {
                index: out_of_range,
                dimension: self.dimension,
            });
        }
        self.parameter_indices = indices;
        Ok(())
    }

    /// Per-dimension mean over all member chains, Welford-combined from the
    /// member means.
    pub fn mean(&self) -> Vec<f64> {
        let mut mean = self.chain_means[0].clone();
        for (n, chain_mean) in self.chain_means.iter().enumerate().skip(1) {
            for d in 0..self.dimension {
                mean[d] += (chain_mean[d] - mean[d]) / (n as f64 + 1.0);
            }
        }
        mean
    }

    pub fn means(&self) -> &[Vec<f64>] {
        &self.chain_means
    }

    pub fn variances(&self) -> &[Vec<f64>] {
        &self.chain_variances
    }

    pub fn chain_indices(&self) -> &[usize] {
        &self.chain_indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InfoAtPoint;
    use crate::rvalue;
    use approx::assert_relative_eq;

    /// A history oscillating tightly around `center` (one point per entry).
    fn history_around(center: &[f64], n: usize, spread: f64) -> History {
        let states = (0..n)
            .map(|i| {
                let offset = if i % 2 == 0 { spread } else { -spread };
                let point: Vec<f64> = center.iter().map(|c| c + offset).collect();
                InfoAtPoint {
                    point,
                    log_likelihood: 0.0,
                    log_prior: 0.0,
                    log_posterior: 0.0,
                }
            })
            .collect();
        History::from_states(states)
    }

    #[test]
    fn agreeing_chain_overlaps() {
        let a = history_around(&[0.0], 1000, 1.0);
        let b = history_around(&[0.05], 1000, 1.0);

        let cluster = Cluster::new(rvalue::gelman_rubin, 1.1, &a, 0, 0.1).unwrap();
        assert!(cluster.overlaps(&b).unwrap());
    }

    #[test]
    fn distant_chain_does_not_overlap() {
        let a = history_around(&[0.0], 1000, 0.1);
        let b = history_around(&[5.0], 1000, 0.1);

        let cluster = Cluster::new(rvalue::gelman_rubin, 1.1, &a, 0, 0.1).unwrap();
        assert!(!cluster.overlaps(&b).unwrap());
    }

    #[test]
    fn restriction_can_only_admit_more_chains() {
        // agree in dimension 0, disagree in dimension 1
        let a = history_around(&[0.0, 0.0], 1000, 1.0);
        let b = history_around(&[0.05, 5.0], 1000, 1.0);

        let mut cluster = Cluster::new(rvalue::gelman_rubin, 1.1, &a, 0, 0.1).unwrap();
        assert!(!cluster.overlaps(&b).unwrap());

        cluster.parameter_indices(vec![0]).unwrap();
        assert!(cluster.overlaps(&b).unwrap());
    }

    #[test]
    fn parameter_indices_are_range_checked() {
        let a = history_around(&[0.0, 0.0], 100, 0.1);
        let mut cluster = Cluster::new(rvalue::approximation, 1.1, &a, 0, 0.0).unwrap();
        assert!(matches!(
            cluster.parameter_indices(vec![0, 2]),
            Err(Error::ParameterIndexOutOfRange { index: 2, dimension: 2 })
        ));
    }

    #[test]
    fn mean_combines_member_means() {
        let a = history_around(&[0.0], 100, 1.0);
        let b = history_around(&[1.0], 100, 1.0);
        let c = history_around(&[2.0], 100, 1.0);

        let mut cluster = Cluster::new(rvalue::approximation, 10.0, &a, 0, 0.0).unwrap();
        cluster.add(&b, 1).unwrap();
        cluster.add(&c, 2).unwrap();

        assert_relative_eq!(cluster.mean()[0], 1.0, epsilon = 1e-12);
        assert_eq!(cluster.chain_indices(), &[0, 1, 2]);
        assert_eq!(cluster.means().len(), 3);
        assert_eq!(cluster.variances().len(), 3);
    }

    #[test]
    fn invalid_skip_fraction_is_rejected() {
        let a = history_around(&[0.0], 100, 1.0);
        assert!(matches!(
            Cluster::new(rvalue::approximation, 1.1, &a, 0, 1.0),
            Err(Error::InvalidFraction("skip_initial"))
        ));
    }
}
