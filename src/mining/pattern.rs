//! Pattern Candidates
//!
//! A `PatternCandidate` is a conjunction of feature conditions (optionally
//! restricted to regimes) evaluated at one forward-return horizon. The scanner
//! emits them; the tester consumes them and re-derives membership from
//! `conditions` + `regimes`, so a candidate is self-describing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::mining::dataset::FeatureRow;
use crate::mining::stats::ReturnStats;

/// Pseudo-feature naming the cluster assignment in cluster patterns.
pub const CLUSTER_FEATURE: &str = "cluster";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Threshold,
    Quantile,
    Cluster,
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Threshold => write!(f, "threshold"),
            Self::Quantile => write!(f, "quantile"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
}

impl Operator {
    #[inline]
    pub fn matches(self, value: f64, bound: f64) -> bool {
        match self {
            Self::Gt => value > bound,
            Self::Lt => value < bound,
            Self::Eq => value == bound,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Eq => "==",
        }
    }
}

/// `feature <operator> value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub feature: String,
    pub operator: Operator,
    pub value: f64,
}

impl Condition {
    pub fn new(feature: impl Into<String>, operator: Operator, value: f64) -> Self {
        Self {
            feature: feature.into(),
            operator,
            value,
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.feature, self.operator.symbol(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// `Long` iff the mean forward return is strictly positive.
    pub fn from_mean(mean: f64) -> Self {
        if mean > 0.0 {
            Self::Long
        } else {
            Self::Short
        }
    }

    /// Multiplier that turns a raw return into a directional one.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

/// Candidate predictive pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub id: String,
    #[serde(rename = "type")]
    pub pattern_type: PatternType,
    pub conditions: Vec<Condition>,
    /// Regime constraint; `None` = unconstrained.
    pub regimes: Option<BTreeSet<i32>>,
    pub direction: Direction,
    /// Matches with a non-null forward return at `horizon`.
    pub support: usize,
    pub forward_returns: ReturnStats,
    pub horizon: usize,
    /// Dataset indices of the counted matches, ascending.
    pub matching_indices: Vec<usize>,
    /// Trained cluster model snapshot (cluster patterns only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_model: Option<serde_json::Value>,
    /// A streaming cap truncated the match list: support and statistics are
    /// sampled, not exhaustive.
    #[serde(default)]
    pub capped: bool,
}

impl PatternCandidate {
    /// Whether `row` satisfies every condition and the regime constraint.
    /// A missing feature never matches. Cluster conditions test the row's
    /// cluster assignment, supplied by the caller.
    pub fn matches_row(&self, row: &FeatureRow, cluster: Option<i32>) -> bool {
        if let Some(regimes) = &self.regimes {
            if !regimes.contains(&row.regime) {
                return false;
            }
        }
        self.conditions.iter().all(|c| {
            let value = if c.feature == CLUSTER_FEATURE {
                cluster.map(f64::from)
            } else {
                row.feature(&c.feature)
            };
            value.map_or(false, |v| c.operator.matches(v, c.value))
        })
    }

    pub fn has_regime_constraint(&self) -> bool {
        self.regimes.as_ref().map_or(false, |r| !r.is_empty())
    }

    pub fn describe(&self) -> String {
        let conds: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        let regimes = match &self.regimes {
            Some(r) => format!(
                " in regime {{{}}}",
                r.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(",")
            ),
            None => String::new(),
        };
        format!(
            "{} {}{} @h{} -> {:?} (n={}, mean={:.6})",
            self.pattern_type,
            conds.join(" && "),
            regimes,
            self.horizon,
            self.direction,
            self.support,
            self.forward_returns.mean
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn row(spread: f64, regime: i32) -> FeatureRow {
        let mut features = BTreeMap::new();
        features.insert("spread_bps".to_string(), spread);
        FeatureRow {
            features,
            regime,
            regime_confidence: 1.0,
            forward_returns: BTreeMap::new(),
            timestamp: 0,
            index: 0,
        }
    }

    fn candidate(regimes: Option<BTreeSet<i32>>) -> PatternCandidate {
        PatternCandidate {
            id: "t".to_string(),
            pattern_type: PatternType::Threshold,
            conditions: vec![Condition::new("spread_bps", Operator::Gt, 0.5)],
            regimes,
            direction: Direction::Long,
            support: 0,
            forward_returns: ReturnStats::default(),
            horizon: 10,
            matching_indices: Vec::new(),
            cluster_model: None,
            capped: false,
        }
    }

    #[test]
    fn test_matches_row_respects_regime() {
        let c = candidate(Some([1].into_iter().collect()));
        assert!(c.matches_row(&row(0.8, 1), None));
        assert!(!c.matches_row(&row(0.8, 0), None));
        assert!(!c.matches_row(&row(0.2, 1), None));
    }

    #[test]
    fn test_missing_feature_never_matches() {
        let mut c = candidate(None);
        c.conditions[0].feature = "absent".to_string();
        assert!(!c.matches_row(&row(0.8, 0), None));
    }

    #[test]
    fn test_regime_constraint_and_description() {
        let open = candidate(None);
        assert!(!open.has_regime_constraint());
        assert!(!candidate(Some(BTreeSet::new())).has_regime_constraint());
        assert_eq!(
            open.describe(),
            "threshold spread_bps > 0.5 @h10 -> Long (n=0, mean=0.000000)"
        );

        let constrained = candidate(Some([0, 2].into_iter().collect()));
        assert!(constrained.has_regime_constraint());
        assert_eq!(
            constrained.describe(),
            "threshold spread_bps > 0.5 in regime {0,2} @h10 -> Long (n=0, mean=0.000000)"
        );
    }

    #[test]
    fn test_direction_from_mean() {
        assert_eq!(Direction::from_mean(0.001), Direction::Long);
        assert_eq!(Direction::from_mean(0.0), Direction::Short);
        assert_eq!(Direction::from_mean(-0.001), Direction::Short);
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(candidate(None)).unwrap();
        assert_eq!(json["type"], "threshold");
        assert_eq!(json["direction"], "LONG");
        assert_eq!(json["conditions"][0]["operator"], "gt");
        assert!(json.get("cluster_model").is_none());
    }
}
