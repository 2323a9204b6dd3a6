//! Run Fingerprint
//!
//! A SHA-256 digest over everything a mining run produces, so two runs can be
//! compared with one string:
//!
//! ```text
//! RunFingerprint = H(
//!   "EDGEFP_V1" ||
//!   PatternsHash ||
//!   ResultsHash
//! )
//! ```
//!
//! # Canonicalization
//!
//! - Floats are hashed by their IEEE-754 bit pattern: equal fingerprints mean
//!   bit-identical statistics, not merely close ones.
//! - Strings are length-prefixed UTF-8.
//! - Collections are hashed in their emitted order (pattern order is part of
//!   the contract).
//! - Cluster model snapshots are excluded; the assignments they produce are
//!   already covered by `matching_indices`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::mining::pattern::{Operator, PatternCandidate};
use crate::mining::tester::{EdgeTestResult, Recommendation};

/// Fingerprint version string; bump when the encoding changes.
pub const FINGERPRINT_VERSION: &str = "EDGEFP_V1";

/// Length-prefixed, fixed-width encoder over a SHA-256 state.
struct Canonical(Sha256);

impl Canonical {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn str(&mut self, s: &str) {
        self.u64(s.len() as u64);
        self.0.update(s.as_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.update(v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.0.update(v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.u64(v.to_bits());
    }

    fn bool(&mut self, v: bool) {
        self.0.update([v as u8]);
    }

    fn opt_f64(&mut self, v: Option<f64>) {
        match v {
            Some(x) => {
                self.bool(true);
                self.f64(x);
            }
            None => self.bool(false),
        }
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

fn operator_tag(op: Operator) -> u64 {
    match op {
        Operator::Gt => 1,
        Operator::Lt => 2,
        Operator::Eq => 3,
    }
}

fn recommendation_tag(r: Recommendation) -> u64 {
    match r {
        Recommendation::Accept => 1,
        Recommendation::Weak => 2,
        Recommendation::Reject => 3,
    }
}

/// Digest of a pattern list.
pub fn patterns_hash(patterns: &[PatternCandidate]) -> String {
    let mut h = Canonical::new();
    h.u64(patterns.len() as u64);
    for p in patterns {
        h.str(&p.id);
        h.str(&p.pattern_type.to_string());
        h.u64(p.conditions.len() as u64);
        for c in &p.conditions {
            h.str(&c.feature);
            h.u64(operator_tag(c.operator));
            h.f64(c.value);
        }
        match &p.regimes {
            Some(regimes) => {
                h.bool(true);
                h.u64(regimes.len() as u64);
                regimes.iter().for_each(|r| h.i64(*r as i64));
            }
            None => h.bool(false),
        }
        h.f64(p.direction.sign());
        h.u64(p.support as u64);
        h.f64(p.forward_returns.mean);
        h.f64(p.forward_returns.median);
        h.f64(p.forward_returns.std);
        h.u64(p.forward_returns.count as u64);
        h.u64(p.horizon as u64);
        h.u64(p.matching_indices.len() as u64);
        p.matching_indices.iter().for_each(|i| h.u64(*i as u64));
        h.bool(p.capped);
    }
    h.finish()
}

/// Digest of a result list.
pub fn results_hash(results: &[EdgeTestResult]) -> String {
    let mut h = Canonical::new();
    h.u64(results.len() as u64);
    for r in results {
        h.str(&r.pattern_id);
        h.bool(r.is_significant);
        h.f64(r.overall_score);
        h.u64(recommendation_tag(r.recommendation));
        h.f64(r.p_value_threshold);

        let t = &r.tests;
        h.bool(t.sample_size_test.passed);
        h.u64(t.sample_size_test.support as u64);
        match &t.t_test {
            Some(tt) => {
                h.bool(true);
                h.bool(tt.passed);
                h.f64(tt.t_statistic);
                h.f64(tt.degrees_of_freedom);
                h.f64(tt.p_value);
                h.u64(tt.complement_count as u64);
            }
            None => h.bool(false),
        }
        match &t.permutation_test {
            Some(pt) => {
                h.bool(true);
                h.bool(pt.passed);
                h.bool(pt.skipped);
                h.opt_f64(pt.p_value);
                h.u64(pt.permutations as u64);
                h.opt_f64(pt.observed_diff);
            }
            None => h.bool(false),
        }
        match &t.sharpe_test {
            Some(st) => {
                h.bool(true);
                h.bool(st.passed);
                h.f64(st.sharpe);
            }
            None => h.bool(false),
        }
        match &t.regime_robustness {
            Some(rr) => {
                h.bool(true);
                h.bool(rr.passed);
                h.bool(rr.evaluated);
                for (regime, sharpe) in &rr.regime_sharpe {
                    h.i64(*regime as i64);
                    h.f64(*sharpe);
                }
                rr.failing_regimes.iter().for_each(|r| h.i64(*r as i64));
            }
            None => h.bool(false),
        }
    }
    h.finish()
}

/// Combined run digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFingerprint {
    pub version: String,
    pub patterns_hash: String,
    pub results_hash: String,
    pub hash: String,
}

impl RunFingerprint {
    pub fn compute(patterns: &[PatternCandidate], results: &[EdgeTestResult]) -> Self {
        let patterns_hash = patterns_hash(patterns);
        let results_hash = results_hash(results);
        let mut h = Canonical::new();
        h.str(FINGERPRINT_VERSION);
        h.str(&patterns_hash);
        h.str(&results_hash);
        Self {
            version: FINGERPRINT_VERSION.to_string(),
            patterns_hash,
            results_hash,
            hash: h.finish(),
        }
    }

    /// First 16 hex characters.
    pub fn format_short(&self) -> String {
        self.hash.chars().take(16).collect()
    }
}

impl std::fmt::Display for RunFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.version, self.format_short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mining::pattern::{Condition, Direction, PatternType};
    use crate::mining::stats::ReturnStats;

    fn pattern(mean: f64) -> PatternCandidate {
        PatternCandidate {
            id: "threshold:x:gt:0.5:h10:all".to_string(),
            pattern_type: PatternType::Threshold,
            conditions: vec![Condition::new("x", Operator::Gt, 0.5)],
            regimes: None,
            direction: Direction::from_mean(mean),
            support: 3,
            forward_returns: ReturnStats::from_samples(&[mean, mean, mean]),
            horizon: 10,
            matching_indices: vec![1, 2, 3],
            cluster_model: None,
            capped: false,
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = RunFingerprint::compute(&[pattern(0.001)], &[]);
        let b = RunFingerprint::compute(&[pattern(0.001)], &[]);
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 64);
        assert!(a.to_string().starts_with("EDGEFP_V1:"));
    }

    #[test]
    fn test_fingerprint_sees_one_ulp() {
        let x = 0.001f64;
        let nudged = f64::from_bits(x.to_bits() + 1);
        assert_ne!(
            patterns_hash(&[pattern(x)]),
            patterns_hash(&[pattern(nudged)])
        );
    }

    #[test]
    fn test_pattern_order_matters() {
        let mut other = pattern(0.002);
        other.id = "other".to_string();
        assert_ne!(
            patterns_hash(&[pattern(0.001), other.clone()]),
            patterns_hash(&[other, pattern(0.001)])
        );
    }
}
