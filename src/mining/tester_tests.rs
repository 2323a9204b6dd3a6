//! Statistical Edge Tester Tests
//!
//! - Gate short-circuit and scoring
//! - Welch small-sample shrinkage and zero-variance samples
//! - Bonferroni re-judging of stored p-values
//! - Permutation p-value symmetry under label/sign swaps
//! - Regime robustness with declared regimes
//! - Heap fail-fast, replay verification and unusable cluster snapshots
//! - Array vs. streaming result equivalence

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::mining::config::{ScannerConfig, TesterConfig};
use crate::mining::dataset::{Dataset, FeatureRow, RowStream};
use crate::mining::memory::fixed_heap_probe;
use crate::mining::pattern::{Condition, Direction, Operator, PatternCandidate, PatternType};
use crate::mining::scanner::{PatternScanner, ScanMethod};
use crate::mining::stats::ReturnStats;
use crate::mining::test_support::{quick_tester, row, small_scanner, streaming_of, synthetic_rows};
use crate::mining::tester::{
    apply_bonferroni, permutation_p_value, EdgeTestResult, EdgeTests, PermutationTest,
    Recommendation, RegimeRobustness, SampleSizeTest, SharpeTest, StatisticalEdgeTester, TTest,
    TesterError,
};

const STRONG_ID: &str = "threshold:x:gt:0.5:h1:all";

fn threshold_scanner() -> PatternScanner {
    PatternScanner::new(ScannerConfig {
        methods: vec![ScanMethod::Threshold],
        min_support: 30,
        ..small_scanner()
    })
}

fn find(patterns: &[PatternCandidate], id: &str) -> PatternCandidate {
    patterns
        .iter()
        .find(|p| p.id == id)
        .cloned()
        .unwrap_or_else(|| panic!("pattern {id} not emitted"))
}

/// Candidate built by hand from `rows`, the way the scanner would.
fn candidate(
    rows: &[FeatureRow],
    id: &str,
    conditions: Vec<Condition>,
    regimes: Option<BTreeSet<i32>>,
    horizon: usize,
) -> PatternCandidate {
    let mut pattern = PatternCandidate {
        id: id.to_string(),
        pattern_type: PatternType::Threshold,
        conditions,
        regimes,
        direction: Direction::Long,
        support: 0,
        forward_returns: ReturnStats::default(),
        horizon,
        matching_indices: Vec::new(),
        cluster_model: None,
        capped: false,
    };
    let mut returns = Vec::new();
    for r in rows {
        if let Some(ret) = r.forward_return(horizon) {
            if pattern.matches_row(r, None) {
                returns.push(ret);
                pattern.matching_indices.push(r.index);
            }
        }
    }
    pattern.support = returns.len();
    pattern.forward_returns = ReturnStats::from_samples(&returns);
    pattern.direction = Direction::from_mean(pattern.forward_returns.mean);
    pattern
}

// =============================================================================
// GATE AND SCORING
// =============================================================================

#[test]
fn test_strong_pattern_is_accepted() {
    let rows = synthetic_rows(400, 7);
    let dataset = Dataset::from_rows(rows);
    let pattern = find(&threshold_scanner().scan(&dataset).unwrap(), STRONG_ID);

    let result = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &dataset)
        .unwrap();

    let t = result.tests.t_test.as_ref().unwrap();
    assert!(t.passed && t.t_statistic > 0.0);
    assert!(t.pattern_mean > t.complement_mean);
    let perm = result.tests.permutation_test.as_ref().unwrap();
    assert!(perm.passed && !perm.skipped);
    assert_eq!(perm.permutations, 200);
    assert!(result.tests.sharpe_test.as_ref().unwrap().passed);
    let regime = result.tests.regime_robustness.as_ref().unwrap();
    assert!(regime.passed && !regime.evaluated);

    assert_eq!(result.overall_score, 1.0);
    assert!(result.is_significant);
    assert_eq!(result.recommendation, Recommendation::Accept);
    assert_eq!(result.p_value_threshold, 0.05);
}

#[test]
fn test_sample_size_gate_short_circuits() {
    let rows = synthetic_rows(200, 1);
    let dataset = Dataset::from_rows(rows);
    let pattern = find(&threshold_scanner().scan(&dataset).unwrap(), STRONG_ID);

    // The heap gate would trip if anything past the sample-size gate ran.
    let tester = StatisticalEdgeTester::new(TesterConfig {
        min_sample_size: pattern.support + 1,
        permutation_min_heap_mb: 1_000_000,
        ..quick_tester()
    })
    .with_heap_probe(fixed_heap_probe(0));

    let result = tester.test(&pattern, &dataset).unwrap();
    assert!(!result.tests.sample_size_test.passed);
    assert_eq!(result.tests.sample_size_test.support, pattern.support);
    assert!(result.tests.t_test.is_none());
    assert!(result.tests.permutation_test.is_none());
    assert!(result.tests.sharpe_test.is_none());
    assert!(result.tests.regime_robustness.is_none());
    assert_eq!(result.overall_score, 0.0);
    assert!(!result.is_significant);
    assert_eq!(result.recommendation, Recommendation::Reject);
}

#[test]
fn test_recommendation_boundaries() {
    assert_eq!(Recommendation::from_score(1.0), Recommendation::Accept);
    assert_eq!(Recommendation::from_score(0.75), Recommendation::Accept);
    assert_eq!(Recommendation::from_score(0.5), Recommendation::Weak);
    assert_eq!(Recommendation::from_score(0.25), Recommendation::Reject);
    assert_eq!(Recommendation::from_score(0.0), Recommendation::Reject);
}

#[test]
fn test_skipped_permutation_counts_as_passed() {
    let rows = synthetic_rows(400, 7);
    let dataset = Dataset::from_rows(rows);
    let pattern = find(&threshold_scanner().scan(&dataset).unwrap(), STRONG_ID);

    let result = StatisticalEdgeTester::new(TesterConfig {
        permutation_test_enabled: false,
        permutation_min_heap_mb: u64::MAX,
        ..quick_tester()
    })
    .with_heap_probe(fixed_heap_probe(1))
    .test(&pattern, &dataset)
    .unwrap();

    let perm = result.tests.permutation_test.unwrap();
    assert!(perm.passed && perm.skipped);
    assert_eq!(perm.p_value, None);
    assert_eq!(result.overall_score, 1.0);
}

#[test]
fn test_empty_complement_gives_neutral_t_test() {
    let rows = synthetic_rows(100, 3);
    let pattern = candidate(
        &rows,
        "everything",
        vec![Condition::new("x", Operator::Gt, -2.0)],
        None,
        1,
    );
    let result = StatisticalEdgeTester::new(TesterConfig {
        min_sample_size: 10,
        ..quick_tester()
    })
    .test(&pattern, &Dataset::from_rows(rows))
    .unwrap();

    let t = result.tests.t_test.unwrap();
    assert_eq!(t.complement_count, 0);
    assert_eq!(t.t_statistic, 0.0);
    assert_eq!(t.p_value, 1.0);
    assert!(!t.passed);
    let perm = result.tests.permutation_test.unwrap();
    assert_eq!(perm.p_value, Some(1.0));
    assert!(!perm.passed);
}

// =============================================================================
// WELCH T-TEST
// =============================================================================

/// `f = 1` rows carry `pattern`, `f = 0` rows carry `complement`.
fn two_sample_rows(pattern: &[f64], complement: &[f64]) -> Vec<FeatureRow> {
    pattern
        .iter()
        .map(|r| (1.0, *r))
        .chain(complement.iter().map(|r| (0.0, *r)))
        .enumerate()
        .map(|(i, (f, ret))| row(i, &[("f", f)], 0, &[(1, Some(ret))]))
        .collect()
}

fn mean_and_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

#[test]
fn test_small_sample_t_test_shrinks_statistic() {
    use statrs::distribution::{ContinuousCDF, Normal};

    let pattern_returns = [
        0.004, 0.0015, 0.003, -0.001, 0.0025, 0.002, 0.0005, 0.0035, 0.001, 0.0045,
    ];
    let complement_returns = [
        0.0005, -0.001, 0.0, 0.0015, -0.0005, 0.001, -0.002, 0.0, 0.0005, -0.001, 0.001, -0.0005,
    ];
    let rows = two_sample_rows(&pattern_returns, &complement_returns);
    let pattern = candidate(
        &rows,
        "f_up_small",
        vec![Condition::new("f", Operator::Gt, 0.5)],
        None,
        1,
    );
    assert_eq!(pattern.support, 10);

    let (ma, va) = mean_and_var(&pattern_returns);
    let (mb, vb) = mean_and_var(&complement_returns);
    let (wa, wb) = (va / 10.0, vb / 12.0);
    let t = (ma - mb) / (wa + wb).sqrt();
    let df = (wa + wb).powi(2) / (wa * wa / 9.0 + wb * wb / 11.0);
    let z = t.abs() * (df / (df + 2.0)).sqrt();
    let normal = Normal::new(0.0, 1.0).unwrap();
    let expected_p = 2.0 * (1.0 - normal.cdf(z));
    let unscaled_p = 2.0 * (1.0 - normal.cdf(t.abs()));

    let result = StatisticalEdgeTester::new(TesterConfig {
        min_sample_size: 10,
        ..quick_tester()
    })
    .test(&pattern, &Dataset::from_rows(rows))
    .unwrap();
    let t_test = result.tests.t_test.unwrap();

    assert!(df <= 30.0);
    assert_eq!(t_test.complement_count, 12);
    assert!((t_test.degrees_of_freedom - df).abs() < 1e-6);
    assert!((t_test.t_statistic - t).abs() < 1e-6);
    assert!((t_test.p_value - expected_p).abs() < 1e-9);
    assert!(t_test.p_value > unscaled_p);
}

#[test]
fn test_constant_returns_on_both_sides_are_neutral() {
    // 2^-10 keeps the pattern mean exact, so both variances are exactly zero.
    let rows = two_sample_rows(&[0.0009765625; 10], &[0.0; 10]);
    let pattern = candidate(
        &rows,
        "f_up_constant",
        vec![Condition::new("f", Operator::Gt, 0.5)],
        None,
        1,
    );

    let result = StatisticalEdgeTester::new(TesterConfig {
        min_sample_size: 10,
        ..quick_tester()
    })
    .test(&pattern, &Dataset::from_rows(rows))
    .unwrap();
    let t_test = result.tests.t_test.unwrap();

    assert_eq!(t_test.t_statistic, 0.0);
    assert_eq!(t_test.p_value, 1.0);
    assert!(!t_test.passed);
    assert_eq!(t_test.pattern_mean, 0.0009765625);
    assert_eq!(t_test.complement_count, 10);
}

// =============================================================================
// BONFERRONI
// =============================================================================

fn result_with_p(id: &str, t_p: f64, perm_p: f64) -> EdgeTestResult {
    let tests = EdgeTests {
        sample_size_test: SampleSizeTest {
            passed: true,
            support: 100,
            min_sample_size: 30,
        },
        t_test: Some(TTest {
            passed: t_p < 0.05,
            t_statistic: 2.5,
            degrees_of_freedom: 120.0,
            p_value: t_p,
            pattern_mean: 0.001,
            complement_mean: 0.0,
            complement_count: 500,
        }),
        permutation_test: Some(PermutationTest {
            passed: perm_p < 0.05,
            skipped: false,
            p_value: Some(perm_p),
            permutations: 1000,
            observed_diff: Some(0.001),
        }),
        sharpe_test: Some(SharpeTest {
            passed: true,
            sharpe: 2.0,
            min_sharpe: 0.5,
        }),
        regime_robustness: Some(RegimeRobustness {
            passed: true,
            evaluated: false,
            regime_sharpe: BTreeMap::new(),
            failing_regimes: Vec::new(),
        }),
    };
    let overall_score = tests.score();
    EdgeTestResult {
        pattern_id: id.to_string(),
        is_significant: overall_score >= 0.75,
        tests,
        overall_score,
        recommendation: Recommendation::from_score(overall_score),
        p_value_threshold: 0.05,
    }
}

#[test]
fn test_bonferroni_rejudges_stored_p_values() {
    let mut results = vec![result_with_p("a", 0.03, 0.02), result_with_p("b", 0.001, 0.001)];
    assert!(results.iter().all(|r| r.recommendation == Recommendation::Accept));

    apply_bonferroni(&mut results, 0.05, 5);

    // alpha / 5 = 0.01: "a" loses both tests, "b" keeps them.
    assert_eq!(results[0].p_value_threshold, 0.01);
    assert!(!results[0].tests.t_test.as_ref().unwrap().passed);
    assert!(!results[0].tests.permutation_test.as_ref().unwrap().passed);
    assert_eq!(results[0].overall_score, 0.5);
    assert_eq!(results[0].recommendation, Recommendation::Weak);
    assert!(!results[0].is_significant);

    assert_eq!(results[1].overall_score, 1.0);
    assert_eq!(results[1].recommendation, Recommendation::Accept);
}

#[test]
fn test_bonferroni_flips_results_just_under_alpha() {
    let mut results = vec![result_with_p("a", 0.04, 0.04), result_with_p("b", 0.049, 0.03)];
    assert!(results.iter().all(|r| r.overall_score == 1.0));

    apply_bonferroni(&mut results, 0.05, 2);
    for r in &results {
        assert_eq!(r.p_value_threshold, 0.025);
        assert!(!r.tests.t_test.as_ref().unwrap().passed);
        assert!(!r.tests.permutation_test.as_ref().unwrap().passed);
        assert_eq!(r.overall_score, 0.5);
        assert_eq!(r.recommendation, Recommendation::Weak);
    }
}

#[test]
fn test_bonferroni_partial_flip_and_single_pattern_noop() {
    let mut pair = vec![result_with_p("a", 0.03, 0.02)];
    apply_bonferroni(&mut pair, 0.05, 2);
    // alpha / 2 = 0.025: t-test fails, permutation still passes.
    assert!(!pair[0].tests.t_test.as_ref().unwrap().passed);
    assert!(pair[0].tests.permutation_test.as_ref().unwrap().passed);
    assert_eq!(pair[0].overall_score, 0.75);
    assert_eq!(pair[0].recommendation, Recommendation::Accept);

    let mut single = vec![result_with_p("a", 0.03, 0.02)];
    let before = single.clone();
    apply_bonferroni(&mut single, 0.05, 1);
    assert_eq!(single, before);
}

#[test]
fn test_bonferroni_leaves_gated_results_alone() {
    let mut gated = result_with_p("gated", 0.03, 0.02);
    gated.tests.sample_size_test.passed = false;
    gated.overall_score = 0.0;
    gated.recommendation = Recommendation::Reject;
    gated.is_significant = false;

    let mut results = vec![gated];
    apply_bonferroni(&mut results, 0.05, 10);
    assert_eq!(results[0].overall_score, 0.0);
    assert!(results[0].tests.t_test.as_ref().unwrap().passed);
    assert_eq!(results[0].p_value_threshold, 0.005);
}

// =============================================================================
// PERMUTATION
// =============================================================================

#[test]
fn test_permutation_p_value_is_symmetric() {
    let rows = synthetic_rows(300, 17);
    let mut pool = Vec::new();
    let mut mask = Vec::new();
    for r in &rows {
        if let Some(ret) = r.forward_return(5) {
            pool.push(ret);
            mask.push(r.feature("y").unwrap() > 0.2);
        }
    }
    let (p, observed) = permutation_p_value(&pool, &mask, 500, 42);
    assert!(p > 0.0 && p <= 1.0);

    let inverted: Vec<bool> = mask.iter().map(|m| !m).collect();
    let negated: Vec<f64> = pool.iter().map(|x| -x).collect();

    assert_eq!(permutation_p_value(&pool, &inverted, 500, 42), (p, observed));
    assert_eq!(permutation_p_value(&negated, &mask, 500, 42), (p, observed));
    assert_eq!(permutation_p_value(&negated, &inverted, 500, 42), (p, observed));
}

#[test]
fn test_permutation_p_value_degenerate_pools() {
    assert_eq!(permutation_p_value(&[1.0, 2.0], &[true, true], 100, 42), (1.0, 0.0));
    assert_eq!(permutation_p_value(&[1.0, 2.0], &[false, false], 100, 42), (1.0, 0.0));
    assert_eq!(permutation_p_value(&[], &[], 100, 42), (1.0, 0.0));
    assert_eq!(permutation_p_value(&[1.0, 2.0], &[true, false], 0, 42), (1.0, 0.0));
}

#[test]
fn test_permutation_p_value_depends_on_seed_only() {
    let pool: Vec<f64> = (0..50).map(|i| (i as f64 * 0.37).sin() * 0.001).collect();
    let mask: Vec<bool> = (0..50).map(|i| i % 3 == 0).collect();
    let a = permutation_p_value(&pool, &mask, 300, 7);
    let b = permutation_p_value(&pool, &mask, 300, 7);
    assert_eq!(a, b);
}

// =============================================================================
// REGIME ROBUSTNESS
// =============================================================================

fn regime_rows() -> Vec<FeatureRow> {
    let mut rows = Vec::new();
    for i in 0..60 {
        let regime = (i % 2) as i32;
        let ret = if regime == 1 {
            0.002 + 0.0001 * (i % 3) as f64
        } else if (i / 2) % 2 == 0 {
            0.001
        } else {
            -0.001
        };
        rows.push(row(i, &[("f", 1.0)], regime, &[(1, Some(ret))]));
    }
    for i in 60..80 {
        let ret = 0.0001 * ((i % 5) as f64 - 2.0);
        rows.push(row(i, &[("f", -1.0)], (i % 2) as i32, &[(1, Some(ret))]));
    }
    rows
}

#[test]
fn test_regime_robustness_flags_weak_and_missing_regimes() {
    let rows = regime_rows();
    let pattern = candidate(
        &rows,
        "f_up_regimes",
        vec![Condition::new("f", Operator::Gt, 0.0)],
        Some(BTreeSet::from([0, 1, 2])),
        1,
    );
    assert_eq!(pattern.support, 60);
    assert_eq!(pattern.direction, Direction::Long);

    let result = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &Dataset::from_rows(rows))
        .unwrap();
    let regime = result.tests.regime_robustness.unwrap();
    assert!(regime.evaluated);
    assert!(!regime.passed);
    // Regime 0 averages to zero; regime 2 never occurs.
    assert_eq!(regime.failing_regimes, vec![0, 2]);
    assert_eq!(regime.regime_sharpe.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(regime.regime_sharpe[&0], 0.0);
    assert!(regime.regime_sharpe[&1] > 0.5);
}

#[test]
fn test_regime_robustness_fails_despite_strong_unconditional_sharpe() {
    let rows = regime_rows();
    // Matches span both regimes, but only regime 0 is declared.
    let mut pattern = candidate(
        &rows,
        "f_up_declared_r0",
        vec![Condition::new("f", Operator::Gt, 0.0)],
        None,
        1,
    );
    pattern.regimes = Some(BTreeSet::from([0]));

    let result = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &Dataset::from_rows(rows))
        .unwrap();
    let sharpe = result.tests.sharpe_test.unwrap();
    assert!(sharpe.passed && sharpe.sharpe > 100.0);
    let regime = result.tests.regime_robustness.unwrap();
    assert!(!regime.passed);
    assert_eq!(regime.failing_regimes, vec![0]);
}

#[test]
fn test_regime_robustness_uses_direction_adjusted_returns() {
    let rows: Vec<FeatureRow> = regime_rows()
        .into_iter()
        .map(|mut r| {
            for v in r.forward_returns.values_mut() {
                *v = v.map(|x| -x);
            }
            r
        })
        .collect();
    let pattern = candidate(
        &rows,
        "f_down_regime_1",
        vec![Condition::new("f", Operator::Gt, 0.0)],
        Some(BTreeSet::from([1])),
        1,
    );
    assert_eq!(pattern.direction, Direction::Short);

    let result = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &Dataset::from_rows(rows))
        .unwrap();
    assert!(result.tests.sharpe_test.unwrap().passed);
    let regime = result.tests.regime_robustness.unwrap();
    assert!(regime.passed, "short edge in regime 1: {regime:?}");
}

// =============================================================================
// FATAL CONDITIONS
// =============================================================================

#[test]
fn test_insufficient_heap_fails_fast() {
    let rows = synthetic_rows(200, 7);
    let dataset = Dataset::from_rows(rows);
    let pattern = find(&threshold_scanner().scan(&dataset).unwrap(), STRONG_ID);

    let tester = StatisticalEdgeTester::new(TesterConfig {
        permutation_min_heap_mb: 6144,
        ..quick_tester()
    })
    .with_heap_probe(fixed_heap_probe(1));

    let err = tester.test(&pattern, &dataset).err().expect("heap gate must trip");
    assert_eq!(
        err.downcast_ref::<TesterError>(),
        Some(&TesterError::InsufficientHeap {
            required_mb: 6144,
            actual_mb: 1
        })
    );
    assert!(err.to_string().contains("permutation_test_enabled"));
    assert!(err.to_string().contains("requires 6.00 GB of memory but only 1.00 MB"));

    let batch = tester.test_batch(&[pattern.clone(), pattern], &dataset);
    assert!(batch.is_err());
}

#[test]
fn test_replay_mismatch_is_fatal() {
    let rows = Arc::new(synthetic_rows(300, 7));
    let pattern = find(
        &threshold_scanner()
            .scan(&Dataset::from_rows(rows.to_vec()))
            .unwrap(),
        STRONG_ID,
    );

    // Every traversal after the first sees slightly shifted returns.
    let opened = Arc::new(AtomicUsize::new(0));
    let drifting = Dataset::streaming({
        let rows = Arc::clone(&rows);
        let opened = Arc::clone(&opened);
        move || -> Result<RowStream> {
            let shift = if opened.fetch_add(1, Ordering::SeqCst) == 0 { 0.0 } else { 1e-6 };
            let rows = Arc::clone(&rows);
            Ok(Box::new((0..rows.len()).map(move |i| {
                let mut r = rows[i].clone();
                for v in r.forward_returns.values_mut() {
                    *v = v.map(|x| x + shift);
                }
                Ok(r)
            })))
        }
    });

    let err = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &drifting)
        .err()
        .expect("non-deterministic replay must abort");
    match err.downcast_ref::<TesterError>() {
        Some(TesterError::ReplayMismatch {
            pattern_id,
            first_count,
            replay_count,
            first_checksum,
            replay_checksum,
        }) => {
            assert_eq!(pattern_id, STRONG_ID);
            assert_eq!(first_count, replay_count);
            assert_ne!(first_checksum, replay_checksum);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// EQUIVALENCE AND CAPS
// =============================================================================

#[test]
fn test_batch_results_match_across_modes_and_runs() {
    let rows = synthetic_rows(300, 5);
    let array = Dataset::from_rows(rows.clone());
    let streaming = streaming_of(rows);
    let patterns = threshold_scanner().scan(&array).unwrap();
    assert!(patterns.len() > 1);

    let tester = StatisticalEdgeTester::new(quick_tester());
    let a = tester.test_batch(&patterns, &array).unwrap();
    let b = tester.test_batch(&patterns, &streaming).unwrap();
    let c = tester.test_batch(&patterns, &array).unwrap();

    assert_eq!(a, b);
    assert_eq!(a, c);
    let ids: Vec<&str> = a.iter().map(|r| r.pattern_id.as_str()).collect();
    let expected: Vec<&str> = patterns.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, expected);

    let corrected = 0.05 / patterns.len() as f64;
    assert!(a.iter().all(|r| r.p_value_threshold == corrected));
}

#[test]
fn test_batch_without_correction_keeps_alpha() {
    let rows = synthetic_rows(200, 5);
    let dataset = Dataset::from_rows(rows);
    let patterns = threshold_scanner().scan(&dataset).unwrap();
    let results = StatisticalEdgeTester::new(TesterConfig {
        multiple_comparison_correction: false,
        ..quick_tester()
    })
    .test_batch(&patterns, &dataset)
    .unwrap();
    assert!(results.iter().all(|r| r.p_value_threshold == 0.05));
}

#[test]
fn test_capped_matches_are_excluded_from_complement() {
    let rows = synthetic_rows(400, 23);
    let streaming = streaming_of(rows.clone());
    let scanner = PatternScanner::new(ScannerConfig {
        methods: vec![ScanMethod::Threshold],
        threshold_cap: 40,
        min_support: 0,
        ..small_scanner()
    });
    let pattern = find(&scanner.scan(&streaming).unwrap(), STRONG_ID);
    assert!(pattern.capped);
    assert_eq!(pattern.support, 40);

    let result = StatisticalEdgeTester::new(quick_tester())
        .test(&pattern, &streaming)
        .unwrap();
    let expected_complement = rows
        .iter()
        .filter(|r| r.forward_return(1).is_some() && r.feature("x").unwrap() <= 0.5)
        .count();
    assert_eq!(
        result.tests.t_test.unwrap().complement_count,
        expected_complement
    );
}

/// A capped horizon-1 cluster pattern from a streaming scan, the streaming
/// dataset it came from, and the uncapped scan of the same rows.
fn capped_cluster_case(rows: &[FeatureRow]) -> (PatternCandidate, Dataset, Vec<PatternCandidate>) {
    let streaming = streaming_of(rows.to_vec());
    let scanner = PatternScanner::new(ScannerConfig {
        methods: vec![ScanMethod::Cluster],
        cluster_cap: 10,
        min_support: 0,
        ..small_scanner()
    });
    let exact = PatternScanner::new(ScannerConfig {
        methods: vec![ScanMethod::Cluster],
        min_support: 0,
        ..small_scanner()
    })
    .scan(&Dataset::from_rows(rows.to_vec()))
    .unwrap();

    let capped = scanner.scan(&streaming).unwrap();
    let pattern = capped.iter().find(|p| p.capped && p.horizon == 1).unwrap().clone();
    (pattern, streaming, exact)
}

fn cluster_tester() -> StatisticalEdgeTester {
    StatisticalEdgeTester::new(TesterConfig {
        min_sample_size: 5,
        ..quick_tester()
    })
}

#[test]
fn test_capped_cluster_matches_are_excluded_from_complement() {
    let rows = synthetic_rows(300, 29);
    let (pattern, streaming, exact) = capped_cluster_case(&rows);
    let full = find(&exact, &pattern.id);

    let result = cluster_tester().test(&pattern, &streaming).unwrap();
    let with_h1 = rows.iter().filter(|r| r.forward_return(1).is_some()).count();
    assert_eq!(
        result.tests.t_test.unwrap().complement_count,
        with_h1 - full.support
    );
}

#[test]
fn test_capped_cluster_with_corrupt_snapshot_is_an_error() {
    let rows = synthetic_rows(300, 29);
    let (mut pattern, streaming, _) = capped_cluster_case(&rows);
    pattern.cluster_model = Some(serde_json::json!({ "bogus": 1 }));

    let err = cluster_tester()
        .test(&pattern, &streaming)
        .err()
        .expect("an unreadable snapshot must not fall back to the complement");
    match err.downcast_ref::<TesterError>() {
        Some(TesterError::InvalidClusterSnapshot { pattern_id, .. }) => {
            assert_eq!(pattern_id, &pattern.id)
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(cluster_tester()
        .test_batch(std::slice::from_ref(&pattern), &streaming)
        .is_err());
}

#[test]
fn test_capped_cluster_without_snapshot_is_an_error() {
    let rows = synthetic_rows(300, 29);
    let (mut pattern, streaming, _) = capped_cluster_case(&rows);
    pattern.cluster_model = None;

    let err = cluster_tester().test(&pattern, &streaming).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TesterError>(),
        Some(TesterError::InvalidClusterSnapshot { reason, .. }) if reason == "snapshot missing"
    ));
}

#[test]
fn test_uncapped_cluster_does_not_need_snapshot() {
    let rows = synthetic_rows(300, 29);
    let dataset = Dataset::from_rows(rows.clone());
    let (capped, _, exact) = capped_cluster_case(&rows);
    let mut pattern = find(&exact, &capped.id);
    assert!(!pattern.capped);
    pattern.cluster_model = None;

    assert!(cluster_tester().test(&pattern, &dataset).is_ok());
}
