//! Statistical Edge Tester
//!
//! Runs an ordered hypothesis battery on each `PatternCandidate`:
//!
//! ```text
//! 1. sample-size gate ──fail──▶ score 0, REJECT (nothing else runs)
//! 2. Welch t-test         pattern sample vs. streamed complement moments
//! 3. permutation test     LCG-driven Fisher-Yates over the pooled sample
//! 4. Sharpe test          annualized, direction-adjusted
//! 5. regime robustness    Sharpe per declared regime (unconstrained: pass)
//! ```
//!
//! `overall_score` is the fraction of tests 2-5 passed. A skipped permutation
//! test counts as passed. ACCEPT >= 0.75 > WEAK >= 0.5 > REJECT.
//!
//! # Design Principles
//!
//! 1. **Never materialize the complement for the t-test**: running sum and
//!    sum-of-squares only.
//! 2. **Reproducible permutations**: a fresh `Lcg` per pattern from
//!    `permutation_seed`; results do not depend on batch scheduling.
//! 3. **Verified replay**: the permutation test re-traverses the dataset and
//!    must observe the same complement (count and bit-exact checksum) as the
//!    t-test traversal, otherwise the run aborts with `ReplayMismatch`.
//! 4. **Fail fast on memory**: the permutation test holds the full pooled
//!    sample; the host memory ceiling is checked before its first run.

use anyhow::Result;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::mining::cluster::{ClusterModel, KMeansModel};
use crate::mining::config::TesterConfig;
use crate::mining::dataset::{Dataset, FeatureRow};
use crate::mining::memory::{format_bytes, system_heap_probe, HeapProbe, MB};
use crate::mining::pattern::{PatternCandidate, PatternType};
use crate::mining::stats::{annualized_sharpe, sample_std, welch_t_test, Lcg, RunningMoments};

const SIGNIFICANT_SCORE: f64 = 0.75;
const WEAK_SCORE: f64 = 0.5;
const SCORED_TESTS: f64 = 4.0;

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal tester conditions. Each aborts the whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TesterError {
    /// Host memory below the configured permutation-test minimum.
    InsufficientHeap { required_mb: u64, actual_mb: u64 },
    /// Two traversals of the same dataset disagreed.
    ReplayMismatch {
        pattern_id: String,
        first_count: usize,
        replay_count: usize,
        first_checksum: u64,
        replay_checksum: u64,
    },
    /// A capped cluster pattern whose stored k-means snapshot is missing or
    /// unreadable; cap-dropped members could not be told from the complement.
    InvalidClusterSnapshot { pattern_id: String, reason: String },
}

impl std::fmt::Display for TesterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientHeap {
                required_mb,
                actual_mb,
            } => write!(
                f,
                "permutation test requires {} of memory but only {} is available; \
                 raise the process/container memory limit, lower \
                 tester.permutation_min_heap_mb, or set \
                 tester.permutation_test_enabled = false",
                format_bytes(required_mb.saturating_mul(MB)),
                format_bytes(actual_mb.saturating_mul(MB))
            ),
            Self::ReplayMismatch {
                pattern_id,
                first_count,
                replay_count,
                first_checksum,
                replay_checksum,
            } => write!(
                f,
                "dataset replay is not deterministic while testing {}: complement \
                 count {} vs {}, checksum {:016x} vs {:016x}",
                pattern_id, first_count, replay_count, first_checksum, replay_checksum
            ),
            Self::InvalidClusterSnapshot { pattern_id, reason } => write!(
                f,
                "capped cluster pattern {} has no usable cluster snapshot: {}",
                pattern_id, reason
            ),
        }
    }
}

impl std::error::Error for TesterError {}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Accept,
    Weak,
    Reject,
}

impl Recommendation {
    pub fn from_score(score: f64) -> Self {
        if score >= SIGNIFICANT_SCORE {
            Self::Accept
        } else if score >= WEAK_SCORE {
            Self::Weak
        } else {
            Self::Reject
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSizeTest {
    pub passed: bool,
    pub support: usize,
    pub min_sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TTest {
    pub passed: bool,
    pub t_statistic: f64,
    pub degrees_of_freedom: f64,
    pub p_value: f64,
    pub pattern_mean: f64,
    pub complement_mean: f64,
    pub complement_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationTest {
    pub passed: bool,
    /// Disabled by configuration; counts as passed.
    pub skipped: bool,
    pub p_value: Option<f64>,
    pub permutations: usize,
    pub observed_diff: Option<f64>,
}

impl PermutationTest {
    fn skipped() -> Self {
        Self {
            passed: true,
            skipped: true,
            p_value: None,
            permutations: 0,
            observed_diff: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharpeTest {
    pub passed: bool,
    pub sharpe: f64,
    pub min_sharpe: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeRobustness {
    pub passed: bool,
    /// False for unconstrained patterns (trivial pass).
    pub evaluated: bool,
    /// Sharpe per regime observed among the matches.
    pub regime_sharpe: BTreeMap<i32, f64>,
    /// Declared regimes that failed to clear `min_sharpe`.
    pub failing_regimes: Vec<i32>,
}

/// Sub-results; everything after the gate is `None` when the gate fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTests {
    pub sample_size_test: SampleSizeTest,
    pub t_test: Option<TTest>,
    pub permutation_test: Option<PermutationTest>,
    pub sharpe_test: Option<SharpeTest>,
    pub regime_robustness: Option<RegimeRobustness>,
}

impl EdgeTests {
    /// Fraction of the four scored tests passed; 0 when gated.
    pub fn score(&self) -> f64 {
        if !self.sample_size_test.passed {
            return 0.0;
        }
        let passed = [
            self.t_test.as_ref().map_or(false, |t| t.passed),
            self.permutation_test.as_ref().map_or(false, |p| p.passed),
            self.sharpe_test.as_ref().map_or(false, |s| s.passed),
            self.regime_robustness.as_ref().map_or(false, |r| r.passed),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        passed as f64 / SCORED_TESTS
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeTestResult {
    pub pattern_id: String,
    pub is_significant: bool,
    pub tests: EdgeTests,
    pub overall_score: f64,
    pub recommendation: Recommendation,
    /// Significance level actually applied (after any correction).
    pub p_value_threshold: f64,
}

impl EdgeTestResult {
    fn from_tests(pattern_id: String, tests: EdgeTests, p_value_threshold: f64) -> Self {
        let overall_score = tests.score();
        Self {
            pattern_id,
            is_significant: overall_score >= SIGNIFICANT_SCORE,
            tests,
            overall_score,
            recommendation: Recommendation::from_score(overall_score),
            p_value_threshold,
        }
    }

    fn rescore(&mut self) {
        self.overall_score = self.tests.score();
        self.is_significant = self.overall_score >= SIGNIFICANT_SCORE;
        self.recommendation = Recommendation::from_score(self.overall_score);
    }
}

// =============================================================================
// BONFERRONI
// =============================================================================

/// Re-judge t-test and permutation flags against `alpha / count` using the
/// stored p-values, then rescore. Gated results and skipped permutation tests
/// are left as they are.
pub fn apply_bonferroni(results: &mut [EdgeTestResult], alpha: f64, count: usize) {
    if count <= 1 {
        return;
    }
    let corrected = alpha / count as f64;
    for result in results.iter_mut() {
        result.p_value_threshold = corrected;
        if !result.tests.sample_size_test.passed {
            continue;
        }
        if let Some(t) = result.tests.t_test.as_mut() {
            t.passed = t.p_value < corrected;
        }
        if let Some(p) = result.tests.permutation_test.as_mut() {
            if !p.skipped {
                p.passed = p.p_value.map_or(false, |v| v < corrected);
            }
        }
        result.rescore();
    }
}

// =============================================================================
// PERMUTATION TEST
// =============================================================================

/// Two-sided permutation p-value.
///
/// `pool` holds every sample in dataset order and `is_pattern` labels it.
/// Each permutation shuffles the pool with the LCG (cumulatively) and compares
/// the first `min(n_pattern, n_rest)` values against the remainder. Returns
/// `(p_value, observed |mean diff|)`; degenerate pools yield `(1, 0)`.
pub fn permutation_p_value(
    pool: &[f64],
    is_pattern: &[bool],
    permutations: usize,
    seed: u32,
) -> (f64, f64) {
    let n_pattern = is_pattern.iter().filter(|p| **p).count();
    let n_rest = pool.len() - n_pattern;
    if n_pattern == 0 || n_rest == 0 || permutations == 0 {
        return (1.0, 0.0);
    }

    let (mut sum_p, mut sum_r) = (0.0, 0.0);
    for (x, p) in pool.iter().zip(is_pattern) {
        if *p {
            sum_p += x;
        } else {
            sum_r += x;
        }
    }
    let observed = (sum_p / n_pattern as f64 - sum_r / n_rest as f64).abs();

    let split = n_pattern.min(n_rest);
    let mut shuffled = pool.to_vec();
    let mut lcg = Lcg::new(seed);
    let mut extreme = 0usize;
    for _ in 0..permutations {
        lcg.shuffle(&mut shuffled);
        let (a, b) = shuffled.split_at(split);
        let diff = (a.iter().sum::<f64>() / a.len() as f64
            - b.iter().sum::<f64>() / b.len() as f64)
            .abs();
        if diff >= observed {
            extreme += 1;
        }
    }
    (extreme as f64 / permutations as f64, observed)
}

// =============================================================================
// TESTER
// =============================================================================

/// Pattern sample plus complement summary from one traversal.
struct SampleTraversal {
    /// (return, regime) of each counted match, dataset order.
    pattern: Vec<(f64, i32)>,
    complement: RunningMoments,
    checksum: u64,
}

/// Order-sensitive, bit-exact fold over complement returns.
#[inline]
fn checksum_step(acc: u64, x: f64) -> u64 {
    (acc.rotate_left(5) ^ x.to_bits()).wrapping_mul(0x0000_0100_0000_01b3)
}

/// Re-derives membership of a pattern from its stored matches and conditions.
struct Membership<'a> {
    pattern: &'a PatternCandidate,
    matches: HashSet<usize>,
    cluster_model: Option<KMeansModel>,
}

enum RowRole {
    Pattern,
    Complement,
    /// Matches the conditions but was dropped by a scan cap.
    Excluded,
}

impl<'a> Membership<'a> {
    fn new(pattern: &'a PatternCandidate) -> Result<Self, TesterError> {
        let cluster_model = if pattern.capped && pattern.pattern_type == PatternType::Cluster {
            let invalid = |reason: String| TesterError::InvalidClusterSnapshot {
                pattern_id: pattern.id.clone(),
                reason,
            };
            let snapshot = pattern
                .cluster_model
                .clone()
                .ok_or_else(|| invalid("snapshot missing".to_string()))?;
            let model: KMeansModel =
                serde_json::from_value(snapshot).map_err(|e| invalid(e.to_string()))?;
            Some(model)
        } else {
            None
        };
        Ok(Self {
            pattern,
            matches: pattern.matching_indices.iter().copied().collect(),
            cluster_model,
        })
    }

    fn role(&self, row: &FeatureRow) -> RowRole {
        if self.matches.contains(&row.index) {
            return RowRole::Pattern;
        }
        if self.pattern.capped {
            let cluster = self
                .cluster_model
                .as_ref()
                .map(|m| m.predict(&row.vector(m.feature_order())).cluster);
            if self.pattern.matches_row(row, cluster) {
                return RowRole::Excluded;
            }
        }
        RowRole::Complement
    }
}

/// Hypothesis battery over candidates from one dataset.
pub struct StatisticalEdgeTester {
    config: TesterConfig,
    heap_probe: HeapProbe,
    heap_gate: OnceLock<Result<u64, TesterError>>,
}

impl StatisticalEdgeTester {
    pub fn new(config: TesterConfig) -> Self {
        Self {
            config,
            heap_probe: system_heap_probe(),
            heap_gate: OnceLock::new(),
        }
    }

    /// Replace the host memory probe.
    pub fn with_heap_probe(mut self, probe: HeapProbe) -> Self {
        self.heap_probe = probe;
        self.heap_gate = OnceLock::new();
        self
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// Checked once per tester.
    fn ensure_heap(&self) -> Result<(), TesterError> {
        let gate = self.heap_gate.get_or_init(|| {
            let actual_mb = (self.heap_probe)();
            let required_mb = self.config.permutation_min_heap_mb;
            if actual_mb < required_mb {
                Err(TesterError::InsufficientHeap {
                    required_mb,
                    actual_mb,
                })
            } else {
                info!(
                    available = %format_bytes(actual_mb.saturating_mul(MB)),
                    required = %format_bytes(required_mb.saturating_mul(MB)),
                    "permutation test heap gate passed"
                );
                Ok(actual_mb)
            }
        });
        gate.clone().map(|_| ())
    }

    /// Full battery for one pattern.
    pub fn test(&self, pattern: &PatternCandidate, dataset: &Dataset) -> Result<EdgeTestResult> {
        let alpha = self.config.p_value_threshold;
        let sample_size_test = SampleSizeTest {
            passed: pattern.support >= self.config.min_sample_size,
            support: pattern.support,
            min_sample_size: self.config.min_sample_size,
        };
        if !sample_size_test.passed {
            debug!(pattern = %pattern.id, support = pattern.support, "sample-size gate failed");
            let tests = EdgeTests {
                sample_size_test,
                t_test: None,
                permutation_test: None,
                sharpe_test: None,
                regime_robustness: None,
            };
            return Ok(EdgeTestResult::from_tests(pattern.id.clone(), tests, alpha));
        }

        let membership = Membership::new(pattern)?;
        let traversal = self.sample_traversal(pattern, &membership, dataset)?;
        let sample: Vec<f64> = traversal.pattern.iter().map(|(r, _)| *r).collect();

        let t_test = self.t_test(&sample, &traversal.complement);
        let permutation_test = if self.config.permutation_test_enabled {
            self.ensure_heap()?;
            self.permutation_test(pattern, &membership, dataset, &traversal)?
        } else {
            PermutationTest::skipped()
        };

        let sign = pattern.direction.sign();
        let adjusted: Vec<f64> = sample.iter().map(|r| r * sign).collect();
        let sharpe = annualized_sharpe(&adjusted, self.config.events_per_year);
        let sharpe_test = SharpeTest {
            passed: sharpe >= self.config.min_sharpe,
            sharpe,
            min_sharpe: self.config.min_sharpe,
        };
        let regime_robustness = self.regime_robustness(pattern, &traversal.pattern, sign);

        let tests = EdgeTests {
            sample_size_test,
            t_test: Some(t_test),
            permutation_test: Some(permutation_test),
            sharpe_test: Some(sharpe_test),
            regime_robustness: Some(regime_robustness),
        };
        let result = EdgeTestResult::from_tests(pattern.id.clone(), tests, alpha);
        debug!(
            pattern = %pattern.id,
            shape = %pattern.describe(),
            score = result.overall_score,
            recommendation = ?result.recommendation,
            "pattern tested"
        );
        Ok(result)
    }

    /// Test every pattern (in parallel), then apply Bonferroni correction when
    /// enabled and more than one pattern was tested. Output order follows
    /// input order.
    pub fn test_batch(
        &self,
        patterns: &[PatternCandidate],
        dataset: &Dataset,
    ) -> Result<Vec<EdgeTestResult>> {
        let mut results = patterns
            .par_iter()
            .map(|p| self.test(p, dataset))
            .collect::<Result<Vec<_>>>()?;

        if self.config.multiple_comparison_correction && patterns.len() > 1 {
            apply_bonferroni(&mut results, self.config.p_value_threshold, patterns.len());
            info!(
                patterns = patterns.len(),
                corrected_alpha = self.config.p_value_threshold / patterns.len() as f64,
                "bonferroni correction applied"
            );
        }

        let accepted = results
            .iter()
            .filter(|r| r.recommendation == Recommendation::Accept)
            .count();
        let weak = results
            .iter()
            .filter(|r| r.recommendation == Recommendation::Weak)
            .count();
        info!(
            tested = results.len(),
            accepted,
            weak,
            rejected = results.len() - accepted - weak,
            "batch tested"
        );
        Ok(results)
    }

    fn sample_traversal(
        &self,
        pattern: &PatternCandidate,
        membership: &Membership<'_>,
        dataset: &Dataset,
    ) -> Result<SampleTraversal> {
        let mut out = SampleTraversal {
            pattern: Vec::with_capacity(pattern.support),
            complement: RunningMoments::default(),
            checksum: 0,
        };
        dataset.for_each_row(|row| {
            let Some(ret) = row.forward_return(pattern.horizon) else {
                return Ok(());
            };
            match membership.role(row) {
                RowRole::Pattern => out.pattern.push((ret, row.regime)),
                RowRole::Complement => {
                    out.complement.push(ret);
                    out.checksum = checksum_step(out.checksum, ret);
                }
                RowRole::Excluded => {}
            }
            Ok(())
        })?;
        Ok(out)
    }

    fn t_test(&self, sample: &[f64], complement: &RunningMoments) -> TTest {
        let mut pattern = RunningMoments::default();
        sample.iter().for_each(|x| pattern.push(*x));
        let pattern_var = sample_std(sample).powi(2);
        let welch = welch_t_test(
            pattern.mean(),
            pattern_var,
            pattern.count,
            complement.mean(),
            complement.variance(),
            complement.count,
        );
        TTest {
            passed: welch.p_value < self.config.p_value_threshold,
            t_statistic: welch.t_statistic,
            degrees_of_freedom: welch.degrees_of_freedom,
            p_value: welch.p_value,
            pattern_mean: pattern.mean(),
            complement_mean: complement.mean(),
            complement_count: complement.count,
        }
    }

    /// Second traversal: materialize the pool, verify it replays the first
    /// traversal, then permute.
    fn permutation_test(
        &self,
        pattern: &PatternCandidate,
        membership: &Membership<'_>,
        dataset: &Dataset,
        first: &SampleTraversal,
    ) -> Result<PermutationTest> {
        let mut pool = Vec::new();
        let mut is_pattern = Vec::new();
        let mut replay_count = 0usize;
        let mut replay_checksum = 0u64;
        dataset.for_each_row(|row| {
            let Some(ret) = row.forward_return(pattern.horizon) else {
                return Ok(());
            };
            match membership.role(row) {
                RowRole::Pattern => {
                    pool.push(ret);
                    is_pattern.push(true);
                }
                RowRole::Complement => {
                    pool.push(ret);
                    is_pattern.push(false);
                    replay_count += 1;
                    replay_checksum = checksum_step(replay_checksum, ret);
                }
                RowRole::Excluded => {}
            }
            Ok(())
        })?;

        let replay_pattern = is_pattern.iter().filter(|p| **p).count();
        if replay_count != first.complement.count
            || replay_checksum != first.checksum
            || replay_pattern != first.pattern.len()
        {
            return Err(TesterError::ReplayMismatch {
                pattern_id: pattern.id.clone(),
                first_count: first.complement.count,
                replay_count,
                first_checksum: first.checksum,
                replay_checksum,
            }
            .into());
        }

        let (p_value, observed) = permutation_p_value(
            &pool,
            &is_pattern,
            self.config.permutation_n,
            self.config.permutation_seed,
        );
        Ok(PermutationTest {
            passed: p_value < self.config.p_value_threshold,
            skipped: false,
            p_value: Some(p_value),
            permutations: self.config.permutation_n,
            observed_diff: Some(observed),
        })
    }

    fn regime_robustness(
        &self,
        pattern: &PatternCandidate,
        sample: &[(f64, i32)],
        sign: f64,
    ) -> RegimeRobustness {
        let Some(declared) = pattern
            .regimes
            .as_ref()
            .filter(|_| pattern.has_regime_constraint())
        else {
            return RegimeRobustness {
                passed: true,
                evaluated: false,
                regime_sharpe: BTreeMap::new(),
                failing_regimes: Vec::new(),
            };
        };

        let mut by_regime: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
        for (ret, regime) in sample {
            by_regime.entry(*regime).or_default().push(ret * sign);
        }
        let regime_sharpe: BTreeMap<i32, f64> = by_regime
            .iter()
            .map(|(r, xs)| (*r, annualized_sharpe(xs, self.config.events_per_year)))
            .collect();

        let failing_regimes: Vec<i32> = declared
            .iter()
            .copied()
            .filter(|r| {
                let enough = by_regime.get(r).map_or(false, |xs| xs.len() >= 2);
                let sharpe = regime_sharpe.get(r).copied().unwrap_or(0.0);
                !(enough && sharpe >= self.config.min_sharpe)
            })
            .collect();

        RegimeRobustness {
            passed: failing_regimes.is_empty(),
            evaluated: true,
            regime_sharpe,
            failing_regimes,
        }
    }
}
