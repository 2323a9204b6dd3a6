//! Statistics Primitives
//!
//! Everything numeric the scanner and tester share:
//!
//! - `ReturnStats`: mean / median / sample std / count of a return sample
//! - `RunningMoments`: single-pass sum and sum-of-squares accumulation
//! - `welch_t_test`: Welch's unequal-variance t-test with a normal-approximated
//!   p-value (not exact Student-t)
//! - `annualized_sharpe`
//! - `Lcg`: the seeded linear-congruential generator behind the permutation
//!   test
//!
//! # Numeric edge cases
//!
//! Degenerate inputs (empty samples, zero variance on both sides, zero total
//! weight) degrade to neutral values: t = 0, p = 1, Sharpe = 0. Nothing here
//! panics or returns an error.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

/// Above this many degrees of freedom the t distribution is treated as normal.
pub const NORMAL_APPROX_DF: f64 = 30.0;

// =============================================================================
// RETURN STATISTICS
// =============================================================================

/// Summary of a forward-return sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReturnStats {
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation (n - 1); 0 when count < 2.
    pub std: f64,
    pub count: usize,
}

impl ReturnStats {
    pub fn from_samples(samples: &[f64]) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self::default();
        }
        let mean = mean(samples);
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = count / 2;
        let median = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };
        Self {
            mean,
            median,
            std: sample_std(samples),
            count,
        }
    }

    /// Sample variance (std squared).
    pub fn variance(&self) -> f64 {
        self.std * self.std
    }
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Sample standard deviation (n - 1 denominator). 0 for fewer than 2 samples.
pub fn sample_std(samples: &[f64]) -> f64 {
    let n = samples.len();
    if n < 2 {
        return 0.0;
    }
    let m = mean(samples);
    let ss: f64 = samples.iter().map(|x| (x - m) * (x - m)).sum();
    (ss / (n - 1) as f64).sqrt()
}

/// Single-pass moments over a population that is never materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMoments {
    pub count: usize,
    pub sum: f64,
    pub sum_sq: f64,
}

impl RunningMoments {
    #[inline]
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Sample variance; clamped at 0 against cancellation.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0)
    }
}

// =============================================================================
// SHARPE
// =============================================================================

/// `mean / std * sqrt(events_per_year)`; 0 when the sample has no spread.
pub fn annualized_sharpe(samples: &[f64], events_per_year: f64) -> f64 {
    let std = sample_std(samples);
    if !(std > 0.0) || !std.is_finite() {
        return 0.0;
    }
    mean(samples) / std * events_per_year.sqrt()
}

// =============================================================================
// WELCH T-TEST
// =============================================================================

/// Outcome of a two-sample Welch test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WelchTest {
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
}

impl WelchTest {
    fn neutral() -> Self {
        Self {
            t_statistic: 0.0,
            degrees_of_freedom: 0.0,
            p_value: 1.0,
        }
    }
}

/// Welch's t-test from summary moments.
///
/// p-value: df > 30 uses `2 * (1 - Phi(|t|))`; smaller df shrinks the statistic
/// to `|t| * sqrt(df / (df + 2))` before the same normal tail, which is
/// conservative relative to the normal but is still only an approximation of
/// the Student-t tail.
pub fn welch_t_test(
    mean_a: f64,
    var_a: f64,
    n_a: usize,
    mean_b: f64,
    var_b: f64,
    n_b: usize,
) -> WelchTest {
    if n_a == 0 || n_b == 0 {
        return WelchTest::neutral();
    }
    let wa = var_a / n_a as f64;
    let wb = var_b / n_b as f64;
    let se_sq = wa + wb;
    if !(se_sq > 0.0) || !se_sq.is_finite() {
        return WelchTest::neutral();
    }

    let t = (mean_a - mean_b) / se_sq.sqrt();
    if !t.is_finite() {
        return WelchTest::neutral();
    }

    let tail = |w: f64, n: usize| if n > 1 { w * w / (n - 1) as f64 } else { 0.0 };
    let denom = tail(wa, n_a) + tail(wb, n_b);
    let df = if denom > 0.0 {
        se_sq * se_sq / denom
    } else {
        f64::INFINITY
    };

    let z = if df > NORMAL_APPROX_DF {
        t.abs()
    } else {
        t.abs() * (df / (df + 2.0)).sqrt()
    };

    WelchTest {
        t_statistic: t,
        degrees_of_freedom: df,
        p_value: normal_two_sided_p(z),
    }
}

/// Two-sided standard-normal tail probability of `|z|`.
pub fn normal_two_sided_p(z: f64) -> f64 {
    let Some(n) = Normal::new(0.0, 1.0).ok() else {
        return 1.0;
    };
    (2.0 * (1.0 - n.cdf(z.abs()))).clamp(0.0, 1.0)
}

// =============================================================================
// LCG
// =============================================================================

const LCG_MULTIPLIER: u32 = 1_664_525;
const LCG_INCREMENT: u32 = 1_013_904_223;
const LCG_MODULUS: f64 = 4_294_967_296.0;

/// Linear-congruential generator, modulus 2^32.
///
/// Recorded permutation p-values depend on this exact sequence; changing the
/// generator means re-baselining them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lcg {
    state: u32,
}

impl Lcg {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        self.state = self
            .state
            .wrapping_mul(LCG_MULTIPLIER)
            .wrapping_add(LCG_INCREMENT);
        self.state
    }

    /// Uniform in [0, 1).
    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        self.next_u32() as f64 / LCG_MODULUS
    }

    /// In-place Fisher-Yates, last index first.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = (self.next_f64() * (i + 1) as f64) as usize;
            items.swap(i, j.min(i));
        }
    }
}
