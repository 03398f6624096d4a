/*!
Gelman-Rubin potential-scale-reduction diagnostics.

Given per-chain means and variances of some scalar quantity, the R-value
compares the between-chain spread to the average within-chain spread. Values
near 1 indicate that all chains explore the same distribution; large values
mean the chains have not mixed.

Both estimators take the summary statistics rather than raw samples, so a
single pass over each chain's history suffices no matter how many parameters
are diagnosed.
*/

use crate::error::{Error, Result};

/// Mean and sample variance of each input sequence, accumulated with
/// Welford's method. Returns `(mean_of_means, variance_of_means,
/// mean_of_variances, variance_of_variances)`; the variances are the
/// unbiased (m-1) estimates.
fn summary(chain_means: &[f64], chain_variances: &[f64]) -> (f64, f64, f64, f64) {
    let m = chain_means.len() as f64;

    let mut mean_of_means = chain_means[0];
    let mut variance_of_means = 0.0;
    let mut mean_of_variances = chain_variances[0];
    let mut variance_of_variances = 0.0;

    for (i, (&mean, &variance)) in chain_means.iter().zip(chain_variances).enumerate().skip(1) {
        let previous_mean_of_means = mean_of_means;
        let previous_mean_of_variances = mean_of_variances;

        mean_of_means += (mean - previous_mean_of_means) / (i as f64 + 1.0);
        variance_of_means += (mean - previous_mean_of_means) * (mean - mean_of_means);
        mean_of_variances += (variance - previous_mean_of_variances) / (i as f64 + 1.0);
        variance_of_variances +=
            (variance - previous_mean_of_variances) * (variance - mean_of_variances);
    }

    variance_of_means /= m - 1.0;
    variance_of_variances /= m - 1.0;

    (
        mean_of_means,
        variance_of_means,
        mean_of_variances,
        variance_of_variances,
    )
}

fn check_inputs(chain_means: &[f64], chain_variances: &[f64]) -> Result<()> {
    if chain_means.len() != chain_variances.len() {
        return Err(Error::UnalignedChainStatistics {
            means: chain_means.len(),
            variances: chain_variances.len(),
        });
    }
    if chain_means.len() <= 1 {
        return Err(Error::TooFewChains(chain_means.len()));
    }
    Ok(())
}

/// The strict Gelman-Rubin R-value with the t-distribution
/// degrees-of-freedom correction.
///
/// `chain_length` is the number of points each mean/variance pair was
/// computed from. Degenerate inputs (zero within-chain variance, degrees of
/// freedom at or below 2) yield `f64::MAX` rather than NaN so that callers
/// can compare against a criterion without special-casing.
///
/// # Panics
///
/// Panics if the result drops below 0.99 for chains longer than 100 points.
/// By construction R approaches 1 from above, so such a value indicates a
/// bug in the statistics accumulation, not bad data.
pub fn gelman_rubin(chain_means: &[f64], chain_variances: &[f64], chain_length: usize) -> Result<f64> {
    check_inputs(chain_means, chain_variances)?;

    let n = chain_length as f64;
    let m = chain_means.len() as f64;

    let (mean_of_means, variance_of_means, mean_of_variances, variance_of_variances) =
        summary(chain_means, chain_variances);

    // Gelman/Rubin notation
    let b = variance_of_means * n;
    let w = mean_of_variances;
    let sigma_squared = (n - 1.0) / n * w + b / n;

    if w == 0.0 {
        log::debug!("W = 0, avoiding R = NaN");
        return Ok(f64::MAX);
    }

    // cov(s_i^2, x̄_i) and cov(s_i^2, x̄_i^2)
    let mut covariance_21 = 0.0;
    let mut covariance_22 = 0.0;
    for (&mean, &variance) in chain_means.iter().zip(chain_variances) {
        covariance_21 += (variance - mean_of_variances) * (mean - mean_of_means);
        covariance_22 +=
            (variance - mean_of_variances) * (mean * mean - mean_of_means * mean_of_means);
    }
    covariance_21 /= m - 1.0;
    covariance_22 /= m - 1.0;

    // scale of the t-distribution
    let v = sigma_squared + b / (m * n);

    // estimated variance of that scale
    let va = (n - 1.0) * (n - 1.0) / (n * n * m) * variance_of_variances;
    let vb = (m + 1.0) * (m + 1.0) / (m * n * m * n) * 2.0 / (m - 1.0) * b * b;
    let vc = 2.0 * (m + 1.0) * (n - 1.0) / (m * n * n) * n / m
        * (covariance_22 - 2.0 * mean_of_means * covariance_21);
    let variance_of_v = va + vb + vc;

    // NaN df (degenerate scale variance with B = 0) lands in the MAX branch
    let df = 2.0 * v * v / variance_of_v;
    if !(df > 2.0) {
        log::debug!("degrees of freedom ({}) at or below 2, avoiding R = NaN", df);
        return Ok(f64::MAX);
    }

    // infinite df (identical chains) means no correction at all
    let correction = if df.is_finite() { df / (df - 2.0) } else { 1.0 };

    // scale reduction expected if sampling were continued indefinitely
    let r = (v / w * correction).sqrt();

    // R slightly below 1 is fine for short chains; far below 1 on long
    // chains means the accumulators are corrupt.
    if r < 0.99 && chain_length > 100 {
        panic!("R-value {:.4} < 0.99; check the statistics accumulation for a bug", r);
    }

    Ok(r)
}

/// The relaxed R-value, `sqrt(sigma_hat² / W)`, without the
/// degrees-of-freedom correction.
///
/// Shares the input checks and the `W == 0` degenerate case with
/// [`gelman_rubin`], but never panics: without the correction the estimate
/// legitimately drops below 1 when the chains agree.
pub fn approximation(chain_means: &[f64], chain_variances: &[f64], chain_length: usize) -> Result<f64> {
    check_inputs(chain_means, chain_variances)?;

    let n = chain_length as f64;
    let (_, variance_of_means, mean_of_variances, _) = summary(chain_means, chain_variances);

    let b = variance_of_means * n;
    let w = mean_of_variances;
    if w == 0.0 {
        return Ok(f64::MAX);
    }
    let sigma_squared = (n - 1.0) / n * w + b / n;

    Ok((sigma_squared / w).sqrt())
}
