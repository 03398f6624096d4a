/*!
Componentwise random-walk proposals and their adaptation.

A [`ScaledProposal`] draws each coordinate independently around the current
point: per-dimension variances set the shape, one global scale factor sets
the overall step size. During the prerun the sampler adapts both, blending
observed sample variances into the per-dimension scales and multiplying or
dividing the global factor by a fixed update factor whenever the acceptance
efficiency leaves the target band.
*/

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::{Distribution, Normal, StudentT};

/// Multiplier applied to the global scale factor on each adaptation step.
const SCALE_UPDATE_FACTOR: f64 = 1.5;
/// Bounds beyond which the global scale factor is clamped.
const SCALE_MIN: f64 = 1e-4;
const SCALE_MAX: f64 = 100.0;
/// Exponent of the cooling schedule for sample-variance blending.
const COOLING_POWER: f64 = 0.5;

/// Returns the dimension-dependent initial global scale factor.
///
/// `2.38² / d` is the optimal scaling of a random-walk proposal for a
/// Gaussian target in `d` dimensions.
pub fn automatic_scale(dimension: usize) -> f64 {
    2.38 * 2.38 / dimension as f64
}

/// The distribution family a [`ScaledProposal`] draws its steps from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProposalFamily {
    Gaussian,
    /// Heavier tails help chains escape local modes; one degree of freedom
    /// gives a Cauchy walk.
    StudentT { degrees_of_freedom: f64 },
}

/// How a chain generates candidate points.
///
/// All shipped families are symmetric, so the Metropolis ratio needs no
/// proposal-density correction.
pub trait ProposalFunction: Send {
    /// Draws a candidate point around `current`.
    fn propose(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64>;

    /// Adapts the proposal after one prerun round, given the observed
    /// acceptance efficiency, the target band, and the sample variances of
    /// the round's history (one per dimension; empty when unknown).
    fn adapt(&mut self, efficiency: f64, min_efficiency: f64, max_efficiency: f64, sample_variances: &[f64]);

    /// Overrides every per-dimension scale (a variance).
    fn set_scale(&mut self, scale: f64);

    /// Overrides the scale of a single dimension.
    fn set_scale_at(&mut self, index: usize, scale: f64);
}

/// Componentwise random walk with per-dimension variances and a global
/// scale factor.
#[derive(Debug, Clone)]
pub struct ScaledProposal {
    family: ProposalFamily,
    /// Per-dimension proposal variances.
    scales: Vec<f64>,
    /// Global multiplier on all variances.
    scale_factor: f64,
    /// Number of completed adaptation steps, drives the cooling weight.
    adaptations: u32,
}

impl ScaledProposal {
    /// Creates a proposal with the given per-dimension variances and the
    /// automatic `2.38²/d` global scale.
    pub fn new(family: ProposalFamily, scales: Vec<f64>) -> Self {
        let scale_factor = automatic_scale(scales.len());
        Self::with_scale_factor(family, scales, scale_factor)
    }

    pub fn with_scale_factor(family: ProposalFamily, scales: Vec<f64>, scale_factor: f64) -> Self {
        assert!(!scales.is_empty(), "proposal needs at least one dimension");
        ScaledProposal {
            family,
            scales,
            scale_factor,
            adaptations: 0,
        }
    }

    pub fn scale_factor(&self) -> f64 {
        self.scale_factor
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    fn draw(&self, rng: &mut SmallRng) -> f64 {
        match self.family {
            ProposalFamily::Gaussian => {
                // unit normal; sigma is applied by the caller
                Normal::new(0.0, 1.0).map(|n| n.sample(rng)).unwrap_or(0.0)
            }
            ProposalFamily::StudentT { degrees_of_freedom } => StudentT::new(degrees_of_freedom)
                .map(|t| t.sample(rng))
                .unwrap_or(0.0),
        }
    }
}

impl ProposalFunction for ScaledProposal {
    fn propose(&self, current: &[f64], rng: &mut SmallRng) -> Vec<f64> {
        debug_assert_eq!(current.len(), self.scales.len());
        current
            .iter()
            .zip(&self.scales)
            .map(|(&x, &scale)| x + (self.scale_factor * scale).sqrt() * self.draw(rng))
            .collect()
    }

    fn adapt(&mut self, efficiency: f64, min_efficiency: f64, max_efficiency: f64, sample_variances: &[f64]) {
        self.adaptations += 1;

        // Blend the observed sample variances into the per-dimension scales
        // with a cooling weight, so early rounds move the proposal a lot and
        // late rounds barely perturb it.
        if sample_variances.len() == self.scales.len() {
            let weight = 1.0 / f64::from(self.adaptations + 1).powf(COOLING_POWER);
            for (scale, &variance) in self.scales.iter_mut().zip(sample_variances) {
                if variance > 0.0 {
                    *scale = (1.0 - weight) * *scale + weight * variance;
                }
            }
        }

        if efficiency > max_efficiency {
            if self.scale_factor >= SCALE_MAX {
                warn!(
                    "proposal scale factor hit its upper bound {}; cannot grow further",
                    SCALE_MAX
                );
            } else {
                self.scale_factor = (self.scale_factor * SCALE_UPDATE_FACTOR).min(SCALE_MAX);
            }
        } else if efficiency < min_efficiency {
            if self.scale_factor <= SCALE_MIN {
                warn!(
                    "proposal scale factor hit its lower bound {}; cannot shrink further",
                    SCALE_MIN
                );
            } else {
                self.scale_factor = (self.scale_factor / SCALE_UPDATE_FACTOR).max(SCALE_MIN);
            }
        }
        debug!(
            "adaptation #{}: efficiency {:.4}, scale factor now {:.4e}",
            self.adaptations, efficiency, self.scale_factor
        );
    }

    fn set_scale(&mut self, scale: f64) {
        for s in &mut self.scales {
            *s = scale;
        }
    }

    fn set_scale_at(&mut self, index: usize, scale: f64) {
        self.scales[index] = scale;
    }
}

/// Uniform draws in a box, used to pick chain starting points.
pub(crate) fn uniform_in(rng: &mut SmallRng, min: f64, max: f64) -> f64 {
    if min == max {
        min
    } else {
        rng.gen_range(min..max)
    }
}
