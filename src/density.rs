/*!
Defines the boundary to the user-supplied posterior density.

The sampling core never evaluates physics itself: it only moves the
parameter point and asks the density for the log-likelihood and log-prior
there. Anything that can answer that question -- a closed-form test
distribution, a wrapper around an expensive simulation -- plugs in through
the [`Density`] trait.

# Examples

```rust
use multichain::density::{Density, DiagonalGaussian};

// A unit Gaussian in one dimension, restricted to [-10, 10].
let density = DiagonalGaussian::new(vec![("x", -10.0, 10.0)], vec![0.0], vec![1.0]);
let value = density.evaluate(&[0.5]).unwrap();
assert!(value.log_posterior() < 0.0);
```
*/

use crate::error::{Error, Result};

/// Description of one sampled parameter: its name, allowed range and
/// whether it is a nuisance parameter (nuisance dimensions can be excluded
/// from cluster overlap tests).
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDescription {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub nuisance: bool,
}

impl ParameterDescription {
    pub fn new(name: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            min,
            max,
            nuisance: false,
        }
    }

    pub fn nuisance(mut self) -> Self {
        self.nuisance = true;
        self
    }
}

/// The value of the density at one point. The log-posterior is always the
/// sum of the two parts (additive model).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityValue {
    pub log_likelihood: f64,
    pub log_prior: f64,
}

impl DensityValue {
    pub fn log_posterior(&self) -> f64 {
        self.log_likelihood + self.log_prior
    }
}

/// A target density over a fixed-dimensional parameter space.
///
/// Implementations must be cheap to clone: every chain owns its own copy so
/// that chains can be dispatched to worker threads independently. A failed
/// evaluation propagates verbatim out of the enclosing
/// [`MarkovChain::run`](crate::chain::MarkovChain::run) call; it is never
/// retried and no partial iteration is recorded.
pub trait Density {
    /// The parameters this density is defined over, in sampling order.
    fn parameters(&self) -> &[ParameterDescription];

    /// Evaluate the density at `point`. `point.len()` always equals
    /// `self.dimension()`; the caller guarantees every coordinate is within
    /// its parameter range.
    fn evaluate(&self, point: &[f64]) -> Result<DensityValue>;

    fn dimension(&self) -> usize {
        self.parameters().len()
    }
}

/// An axis-aligned Gaussian density with flat priors, mainly useful for
/// tests, demos and as a template for real implementations.
#[derive(Debug, Clone)]
pub struct DiagonalGaussian {
    parameters: Vec<ParameterDescription>,
    mean: Vec<f64>,
    sigma: Vec<f64>,
}

impl DiagonalGaussian {
    /// Builds a Gaussian from `(name, min, max)` triples plus per-dimension
    /// means and standard deviations.
    ///
    /// # Panics
    ///
    /// Panics if the three inputs disagree in length or a sigma is not
    /// positive; this is a construction-time programming error.
    pub fn new(
        parameters: Vec<(&str, f64, f64)>,
        mean: Vec<f64>,
        sigma: Vec<f64>,
    ) -> Self {
        assert_eq!(parameters.len(), mean.len());
        assert_eq!(parameters.len(), sigma.len());
        assert!(sigma.iter().all(|&s| s > 0.0), "sigma must be positive");

        let parameters = parameters
            .into_iter()
            .map(|(name, min, max)| ParameterDescription::new(name, min, max))
            .collect();
        Self {
            parameters,
            mean,
            sigma,
        }
    }
}

impl Density for DiagonalGaussian {
    fn parameters(&self) -> &[ParameterDescription] {
        &self.parameters
    }

    fn evaluate(&self, point: &[f64]) -> Result<DensityValue> {
        if point.len() != self.parameters.len() {
            return Err(Error::DimensionMismatch {
                expected: self.parameters.len(),
                got: point.len(),
            });
        }

        let mut log_likelihood = 0.0;
        for ((&x, &mu), &sigma) in point.iter().zip(&self.mean).zip(&self.sigma) {
            let z = (x - mu) / sigma;
            log_likelihood -= 0.5 * z * z;
        }

        // flat prior over the allowed box
        Ok(DensityValue {
            log_likelihood,
            log_prior: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn gaussian_peaks_at_mean() {
        let density =
            DiagonalGaussian::new(vec![("x", -5.0, 5.0), ("y", -5.0, 5.0)], vec![1.0, -1.0], vec![1.0, 2.0]);

        let at_mean = density.evaluate(&[1.0, -1.0]).unwrap();
        assert_abs_diff_eq!(at_mean.log_posterior(), 0.0);

        let off_mean = density.evaluate(&[2.0, -1.0]).unwrap();
        assert_abs_diff_eq!(off_mean.log_posterior(), -0.5);
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let density = DiagonalGaussian::new(vec![("x", -5.0, 5.0)], vec![0.0], vec![1.0]);
        assert!(matches!(
            density.evaluate(&[0.0, 0.0]),
            Err(Error::DimensionMismatch { expected: 1, got: 2 })
        ));
    }
}
