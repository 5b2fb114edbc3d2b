use crate::profile::RegionSummary;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use thiserror::Error;

/// Errors raised by the statistical aggregator.
#[derive(Error, Debug)]
pub enum StatsError {
    /// No trial-level values survived filtering; no meaningful estimate
    /// exists for this configuration.
    #[error("No samples to bootstrap (0 usable trials)")]
    NoSamples,

    /// A curve with fewer than two raw points has no defined integral; the
    /// trial is excluded from the AUC set.
    #[error("Too few data points for AUC ({0} < 2)")]
    TooFewPoints(usize),

    #[error("{0} is not a valid percentile (expected 0 < p <= 1)")]
    InvalidPercentile(f64),

    #[error("{0} is not a valid significance level (expected 0 < alpha < 1)")]
    InvalidAlpha(f64),
}

/// A resampling-based summary of a set of trial-level scalars.
///
/// Preferred over mean ± standard error because trial counts are small
/// (typically 5–30) and the value distribution is not assumed normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapEstimate {
    /// Sample mean of the original values.
    pub mean: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

impl BootstrapEstimate {
    /// Half of the interval width, for `mean +/- half_width` reporting.
    pub fn half_width(&self) -> f64 {
        (self.ci_high - self.ci_low) / 2.0
    }
}

/// Trapezoid-rule integral of `y` over `x`.
fn trapezoid(points: &[(f64, f64)]) -> f64 {
    points
        .windows(2)
        .map(|w| (w[1].0 - w[0].0) * (w[1].1 + w[0].1) / 2.0)
        .sum()
}

/// AUC of one trial's coverage curve, optionally restricted to a coverage
/// percentile.
///
/// `points` are `(time, metric)` pairs in time order; times are normalized
/// so integration starts at zero. With `percentile < 1`, only the sub-curve
/// where the metric is at most `final_value * percentile` is integrated. If
/// that restriction leaves fewer than two points, the first two raw points
/// are used instead so the integral stays defined.
pub fn coverage_auc(points: &[(f64, f64)], percentile: f64) -> Result<f64, StatsError> {
    if !(percentile > 0.0 && percentile <= 1.0) {
        return Err(StatsError::InvalidPercentile(percentile));
    }
    if points.len() < 2 {
        return Err(StatsError::TooFewPoints(points.len()));
    }

    let start = points[0].0;
    let normalized: Vec<(f64, f64)> = points.iter().map(|&(t, v)| (t - start, v)).collect();

    let total = normalized.last().map(|&(_, v)| v).unwrap_or(0.0);
    let threshold = total * percentile;
    let restricted: Vec<(f64, f64)> = normalized
        .iter()
        .copied()
        .filter(|&(_, v)| v <= threshold)
        .collect();

    let curve = if restricted.len() < 2 {
        &normalized[0..2]
    } else {
        &restricted[..]
    };

    Ok(trapezoid(curve))
}

/// Bootstrap estimate of the mean of `values`.
///
/// Resamples with replacement `resamples` times using a seeded RNG; the
/// interval is the `[alpha/2, 1 - alpha/2]` percentile range of the
/// resampled means. Deterministic for a fixed seed and resample count.
pub fn bootstrap_mean(
    values: &[f64],
    resamples: usize,
    alpha: f64,
    rng_seed: u64,
) -> Result<BootstrapEstimate, StatsError> {
    if values.is_empty() {
        return Err(StatsError::NoSamples);
    }
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(StatsError::InvalidAlpha(alpha));
    }

    let n = values.len();
    let mean = values.iter().sum::<f64>() / n as f64;

    let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);
    let mut means = Vec::with_capacity(resamples);
    for _ in 0..resamples {
        let mut sum = 0.0;
        for _ in 0..n {
            sum += values[rng.random_range(0..n)];
        }
        means.push(sum / n as f64);
    }
    means.sort_by(f64::total_cmp);

    let percentile = |q: f64| {
        let idx = (q * (means.len() - 1) as f64).round() as usize;
        means[idx.min(means.len() - 1)]
    };

    Ok(BootstrapEstimate {
        mean,
        ci_low: percentile(alpha / 2.0),
        ci_high: percentile(1.0 - alpha / 2.0),
    })
}

/// Bootstrap estimate of mean region coverage over a set of merged trial
/// summaries, applied directly to `covered/count*100` ratios.
pub fn region_percent_estimate(
    summaries: &[RegionSummary],
    resamples: usize,
    alpha: f64,
    rng_seed: u64,
) -> Result<BootstrapEstimate, StatsError> {
    let percents: Vec<f64> = summaries.iter().map(RegionSummary::percent).collect();
    bootstrap_mean(&percents, resamples, alpha, rng_seed)
}
