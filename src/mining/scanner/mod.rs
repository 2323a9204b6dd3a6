//! Pattern Scanner
//!
//! Generates `PatternCandidate`s from a `Dataset` with three methods:
//!
//! | method      | candidates per                                               | streaming passes |
//! |-------------|--------------------------------------------------------------|------------------|
//! | `threshold` | feature x level x polarity x horizon x regime constraint     | 1                |
//! | `quantile`  | feature x quantile level x horizon                           | 2                |
//! | `cluster`   | cluster x horizon                                            | 2                |
//!
//! # Design Principles
//!
//! 1. **One accumulator**: array and streaming paths feed matches through the
//!    same `MatchAccumulator` in dataset order, so uncapped runs agree to the
//!    bit.
//! 2. **Deterministic emission**: configurations are emitted in enumeration
//!    order (streaming keeps accumulators in ordered maps keyed by that order).
//! 3. **Visible degradation**: streaming accumulators stop storing matches at
//!    their cap; the overflow is counted, logged and flagged on the candidate
//!    (`capped`) and in `ScanDiagnostics`.
//!
//! # Memory
//!
//! Threshold streaming holds only match lists (bounded by `threshold_cap` per
//! configuration). Quantile streaming pass 1 holds every per-feature value.
//! Cluster streaming pass 1 holds the full rows x features matrix; that matrix
//! is the scanner's memory ceiling.

mod cluster;
mod quantile;
mod threshold;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::mining::config::ScannerConfig;
use crate::mining::dataset::{Dataset, DatasetMode};
use crate::mining::pattern::{Condition, Direction, PatternCandidate, PatternType};
use crate::mining::stats::ReturnStats;

/// Scan method selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMethod {
    Threshold,
    Quantile,
    Cluster,
}

impl ScanMethod {
    pub fn pattern_type(self) -> PatternType {
        match self {
            Self::Threshold => PatternType::Threshold,
            Self::Quantile => PatternType::Quantile,
            Self::Cluster => PatternType::Cluster,
        }
    }
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// Per-method scan counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDiagnostics {
    pub method: ScanMethod,
    /// Configurations evaluated.
    pub configurations: usize,
    /// Configurations whose match list hit the cap.
    pub capped_configurations: usize,
    /// Matches counted but not stored because of a cap.
    pub dropped_matches: u64,
    /// Candidates passing the support / return filter.
    pub passed_filter: usize,
    /// Candidates emitted after `max_patterns_per_method`.
    pub emitted: usize,
}

impl MethodDiagnostics {
    fn new(method: ScanMethod) -> Self {
        Self {
            method,
            configurations: 0,
            capped_configurations: 0,
            dropped_matches: 0,
            passed_filter: 0,
            emitted: 0,
        }
    }

    /// No cap triggered: support and statistics are exhaustive.
    pub fn is_exact(&self) -> bool {
        self.capped_configurations == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanDiagnostics {
    pub mode: DatasetMode,
    pub features: Vec<String>,
    pub horizons: Vec<usize>,
    pub methods: Vec<MethodDiagnostics>,
}

impl ScanDiagnostics {
    pub fn is_exact(&self) -> bool {
        self.methods.iter().all(MethodDiagnostics::is_exact)
    }

    pub fn dropped_matches(&self) -> u64 {
        self.methods.iter().map(|m| m.dropped_matches).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub patterns: Vec<PatternCandidate>,
    pub diagnostics: ScanDiagnostics,
}

// =============================================================================
// SHARED SCAN MACHINERY
// =============================================================================

/// Matches of one configuration, in dataset order.
#[derive(Debug, Clone)]
pub(crate) struct MatchAccumulator {
    indices: Vec<usize>,
    returns: Vec<f64>,
    cap: usize,
    dropped: u64,
}

impl MatchAccumulator {
    pub(crate) fn new(cap: usize) -> Self {
        Self {
            indices: Vec::new(),
            returns: Vec::new(),
            cap,
            dropped: 0,
        }
    }

    pub(crate) fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Record a match. Returns true on the first overflow.
    #[inline]
    pub(crate) fn push(&mut self, index: usize, forward_return: f64) -> bool {
        if self.indices.len() < self.cap {
            self.indices.push(index);
            self.returns.push(forward_return);
            false
        } else {
            self.dropped += 1;
            self.dropped == 1
        }
    }

    pub(crate) fn is_capped(&self) -> bool {
        self.dropped > 0
    }
}

/// Description of one configuration, without its matches.
pub(crate) struct CandidateSpec {
    pub id: String,
    pub pattern_type: PatternType,
    pub conditions: Vec<Condition>,
    pub regimes: Option<BTreeSet<i32>>,
    pub horizon: usize,
}

impl CandidateSpec {
    pub(crate) fn finish(
        self,
        acc: MatchAccumulator,
        cluster_model: Option<serde_json::Value>,
    ) -> PatternCandidate {
        let forward_returns = ReturnStats::from_samples(&acc.returns);
        PatternCandidate {
            id: self.id,
            pattern_type: self.pattern_type,
            conditions: self.conditions,
            regimes: self.regimes,
            direction: Direction::from_mean(forward_returns.mean),
            support: acc.indices.len(),
            forward_returns,
            horizon: self.horizon,
            matching_indices: acc.indices,
            cluster_model,
            capped: acc.dropped > 0,
        }
    }
}

/// Record the capping state of a finished accumulator.
pub(crate) fn note_cap(diag: &mut MethodDiagnostics, acc: &MatchAccumulator) {
    diag.configurations += 1;
    if acc.is_capped() {
        diag.capped_configurations += 1;
        diag.dropped_matches += acc.dropped;
    }
}

/// Log the first overflow of a configuration.
pub(crate) fn warn_capped(label: &str, cap: usize) {
    warn!(
        configuration = label,
        cap, "match list capped; support and statistics for this configuration are sampled"
    );
}

/// Rows and columns a scan works over.
pub struct ScanUniverse {
    pub features: Vec<String>,
    pub horizons: Vec<usize>,
}

/// `%g`-style number for pattern ids.
pub(crate) fn id_number(x: f64) -> String {
    let rounded = (x * 1e6).round() / 1e6;
    format!("{}", rounded)
}

// =============================================================================
// SCANNER
// =============================================================================

/// Candidate generator over a `Dataset`.
#[derive(Debug, Clone)]
pub struct PatternScanner {
    config: ScannerConfig,
}

impl PatternScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Candidates from every configured method, in method order.
    pub fn scan(&self, dataset: &Dataset) -> Result<Vec<PatternCandidate>> {
        Ok(self.scan_with_report(dataset)?.patterns)
    }

    pub fn scan_with_report(&self, dataset: &Dataset) -> Result<ScanReport> {
        let universe = self.universe(dataset)?;
        let mut patterns = Vec::new();
        let mut methods = Vec::with_capacity(self.config.methods.len());

        if universe.horizons.is_empty() {
            info!("dataset has no rows; nothing to scan");
        } else {
            for &method in &self.config.methods {
                let mut diag = MethodDiagnostics::new(method);
                let candidates = match (method, dataset) {
                    (ScanMethod::Threshold, Dataset::Array(rows)) => {
                        threshold::scan_array(rows, &universe, &self.config, &mut diag)
                    }
                    (ScanMethod::Threshold, Dataset::Streaming(_)) => threshold::scan_streaming(
                        dataset,
                        &universe,
                        &self.config,
                        &mut diag,
                    )?,
                    (ScanMethod::Quantile, Dataset::Array(rows)) => {
                        quantile::scan_array(rows, &universe, &self.config, &mut diag)
                    }
                    (ScanMethod::Quantile, Dataset::Streaming(_)) => {
                        quantile::scan_streaming(dataset, &universe, &self.config, &mut diag)?
                    }
                    (ScanMethod::Cluster, Dataset::Array(rows)) => {
                        cluster::scan_array(rows, &universe, &self.config, &mut diag)?
                    }
                    (ScanMethod::Cluster, Dataset::Streaming(_)) => {
                        cluster::scan_streaming(dataset, &universe, &self.config, &mut diag)?
                    }
                };
                let kept = self.select(candidates, &mut diag);
                info!(
                    method = ?method,
                    configurations = diag.configurations,
                    passed = diag.passed_filter,
                    emitted = diag.emitted,
                    capped = diag.capped_configurations,
                    dropped = diag.dropped_matches,
                    "scan method complete"
                );
                patterns.extend(kept);
                methods.push(diag);
            }
        }

        let diagnostics = ScanDiagnostics {
            mode: dataset.mode(),
            features: universe.features,
            horizons: universe.horizons,
            methods,
        };
        if !diagnostics.is_exact() {
            warn!(
                dropped = diagnostics.dropped_matches(),
                "scan results are capped; capped candidates carry sampled statistics"
            );
        }
        Ok(ScanReport {
            patterns,
            diagnostics,
        })
    }

    /// Feature universe: configured, or the first row's keys. Horizons: the
    /// first row's forward-return keys.
    fn universe(&self, dataset: &Dataset) -> Result<ScanUniverse> {
        let first = dataset.first_row()?;
        let features = if !self.config.scan_features.is_empty() {
            self.config.scan_features.clone()
        } else {
            first
                .as_ref()
                .map(|r| r.features.keys().cloned().collect())
                .unwrap_or_default()
        };
        let horizons = first
            .map(|r| r.forward_returns.keys().copied().collect())
            .unwrap_or_default();
        Ok(ScanUniverse { features, horizons })
    }

    /// Support / return filter, then the per-method limit.
    fn select(
        &self,
        candidates: Vec<PatternCandidate>,
        diag: &mut MethodDiagnostics,
    ) -> Vec<PatternCandidate> {
        let passed: Vec<PatternCandidate> = candidates
            .into_iter()
            .filter(|c| {
                c.support >= self.config.min_support
                    && c.forward_returns.mean.abs() >= self.config.return_threshold
            })
            .collect();
        diag.passed_filter = passed.len();
        let kept: Vec<PatternCandidate> = passed
            .into_iter()
            .take(self.config.max_patterns_per_method)
            .collect();
        diag.emitted = kept.len();
        kept
    }
}
