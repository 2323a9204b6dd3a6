//! Mining configuration
//!
//! One TOML document drives the loader, the scanner and the tester. Every
//! field has a serde default so partial files are valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::mining::features::ExtractorKind;
use crate::mining::scanner::ScanMethod;

/// Top-level mining configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Data loading and regime labelling
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Candidate generation
    #[serde(default)]
    pub scanner: ScannerConfig,

    /// Hypothesis battery
    #[serde(default)]
    pub tester: TesterConfig,
}

impl MiningConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment or default path
    pub fn from_env() -> Self {
        let path = std::env::var("EDGE_MINER_CONFIG")
            .unwrap_or_else(|_| "edge_miner.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default mining config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject configurations no run could honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.loader.horizons.is_empty() {
            problems.push("loader.horizons must not be empty".to_string());
        }
        if self.loader.horizons.iter().any(|&h| h == 0) {
            problems.push("loader.horizons must be >= 1".to_string());
        }
        if self.loader.regime_k == 0 {
            problems.push("loader.regime_k must be >= 1".to_string());
        }
        if self.loader.max_rows_per_day == Some(0) {
            problems.push("loader.max_rows_per_day must be >= 1 when set".to_string());
        }
        if self.scanner.cluster_k == 0 {
            problems.push("scanner.cluster_k must be >= 1".to_string());
        }
        if self
            .scanner
            .threshold_levels
            .iter()
            .any(|l| !l.is_finite() || *l <= 0.0)
        {
            problems.push("scanner.threshold_levels must be finite and > 0".to_string());
        }
        if self
            .scanner
            .quantile_levels
            .iter()
            .any(|q| !(*q > 0.0 && *q < 1.0))
        {
            problems.push("scanner.quantile_levels must lie strictly inside (0, 1)".to_string());
        }
        if self.scanner.threshold_cap == 0 || self.scanner.cluster_cap == 0 {
            problems.push("scanner caps must be >= 1".to_string());
        }
        if !(self.tester.p_value_threshold > 0.0 && self.tester.p_value_threshold < 1.0) {
            problems.push("tester.p_value_threshold must lie inside (0, 1)".to_string());
        }
        if self.tester.permutation_test_enabled && self.tester.permutation_n == 0 {
            problems.push("tester.permutation_n must be >= 1 when permutation testing is on".to_string());
        }
        if !(self.tester.events_per_year > 0.0) {
            problems.push("tester.events_per_year must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Invalid { problems: Vec<String> },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid { problems } => write!(
                f,
                "invalid mining configuration:\n{}",
                problems
                    .iter()
                    .enumerate()
                    .map(|(i, p)| format!("  {}. {}", i + 1, p))
                    .collect::<Vec<_>>()
                    .join("\n")
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// LOADER
// =============================================================================

/// Which rows survive the per-file smoke cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmokeSlice {
    #[default]
    Head,
    Tail,
    HeadTail,
}

/// Data loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Forward-return horizons in feature rows
    #[serde(default = "default_horizons")]
    pub horizons: Vec<usize>,

    /// Features fed to the regime model, in vector order
    #[serde(default = "default_regime_features")]
    pub regime_features: Vec<String>,

    /// Number of regimes
    #[serde(default = "default_regime_k")]
    pub regime_k: usize,

    /// Seed for regime model initialisation
    #[serde(default = "default_seed")]
    pub regime_seed: u64,

    /// Feature extractor built for each file
    #[serde(default)]
    pub extractor: ExtractorKind,

    /// Rolling window of the microstructure extractor (events)
    #[serde(default = "default_extractor_window")]
    pub extractor_window: usize,

    /// Smoke cap: rows kept per file (unset = all)
    #[serde(default)]
    pub max_rows_per_day: Option<usize>,

    /// Which slice the smoke cap keeps
    #[serde(default)]
    pub smoke_slice: SmokeSlice,
}

fn default_horizons() -> Vec<usize> {
    vec![10, 50, 100]
}

fn default_regime_features() -> Vec<String> {
    vec!["spread_bps".to_string(), "volatility_bps".to_string()]
}

fn default_regime_k() -> usize {
    4
}

fn default_seed() -> u64 {
    42
}

fn default_extractor_window() -> usize {
    50
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            horizons: default_horizons(),
            regime_features: default_regime_features(),
            regime_k: default_regime_k(),
            regime_seed: default_seed(),
            extractor: ExtractorKind::Microstructure,
            extractor_window: default_extractor_window(),
            max_rows_per_day: None,
            smoke_slice: SmokeSlice::Head,
        }
    }
}

impl LoaderConfig {
    /// Largest configured horizon (look-ahead depth).
    pub fn max_horizon(&self) -> usize {
        self.horizons.iter().copied().max().unwrap_or(0)
    }
}

// =============================================================================
// SCANNER
// =============================================================================

/// Pattern scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Scan methods to run, in order
    #[serde(default = "default_methods")]
    pub methods: Vec<ScanMethod>,

    /// Minimum matches with a forward return
    #[serde(default = "default_min_support")]
    pub min_support: usize,

    /// Minimum |mean forward return|
    #[serde(default = "default_return_threshold")]
    pub return_threshold: f64,

    /// Threshold levels; each yields `> +level` and `< -level`
    #[serde(default = "default_threshold_levels")]
    pub threshold_levels: Vec<f64>,

    /// Quantile levels (floor-index order statistics)
    #[serde(default = "default_quantile_levels")]
    pub quantile_levels: Vec<f64>,

    /// Clusters for the cluster scan
    #[serde(default = "default_cluster_k")]
    pub cluster_k: usize,

    /// Seed for the cluster scan model
    #[serde(default = "default_seed")]
    pub cluster_seed: u64,

    /// Cap on emitted patterns per method
    #[serde(default = "default_max_patterns_per_method")]
    pub max_patterns_per_method: usize,

    /// Features to scan (empty = keys of the first row)
    #[serde(default)]
    pub scan_features: Vec<String>,

    /// Features for the cluster matrix (empty = scan features)
    #[serde(default)]
    pub cluster_features: Vec<String>,

    /// Streaming: max indices kept per threshold/quantile configuration
    #[serde(default = "default_threshold_cap")]
    pub threshold_cap: usize,

    /// Streaming: max indices kept per (cluster, horizon)
    #[serde(default = "default_cluster_cap")]
    pub cluster_cap: usize,
}

fn default_methods() -> Vec<ScanMethod> {
    vec![ScanMethod::Threshold, ScanMethod::Quantile, ScanMethod::Cluster]
}

fn default_min_support() -> usize {
    30
}

fn default_return_threshold() -> f64 {
    0.0005
}

fn default_threshold_levels() -> Vec<f64> {
    vec![0.3, 0.5, 0.7]
}

fn default_quantile_levels() -> Vec<f64> {
    vec![0.1, 0.9]
}

fn default_cluster_k() -> usize {
    12
}

fn default_max_patterns_per_method() -> usize {
    200
}

fn default_threshold_cap() -> usize {
    50_000
}

fn default_cluster_cap() -> usize {
    100_000
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            methods: default_methods(),
            min_support: default_min_support(),
            return_threshold: default_return_threshold(),
            threshold_levels: default_threshold_levels(),
            quantile_levels: default_quantile_levels(),
            cluster_k: default_cluster_k(),
            cluster_seed: default_seed(),
            max_patterns_per_method: default_max_patterns_per_method(),
            scan_features: Vec::new(),
            cluster_features: Vec::new(),
            threshold_cap: default_threshold_cap(),
            cluster_cap: default_cluster_cap(),
        }
    }
}

// =============================================================================
// TESTER
// =============================================================================

/// Statistical edge tester configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TesterConfig {
    /// Gate: minimum support before any test runs
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,

    /// Significance level (per test, before correction)
    #[serde(default = "default_p_value_threshold")]
    pub p_value_threshold: f64,

    /// Minimum annualized Sharpe
    #[serde(default = "default_min_sharpe")]
    pub min_sharpe: f64,

    /// Run the permutation test
    #[serde(default = "default_true")]
    pub permutation_test_enabled: bool,

    /// Permutations per pattern
    #[serde(default = "default_permutation_n")]
    pub permutation_n: usize,

    /// Seed of the permutation LCG
    #[serde(default = "default_permutation_seed")]
    pub permutation_seed: u32,

    /// Host memory required before the permutation test may run (MB)
    #[serde(default = "default_permutation_min_heap_mb")]
    pub permutation_min_heap_mb: u64,

    /// Bonferroni correction across a batch
    #[serde(default = "default_true")]
    pub multiple_comparison_correction: bool,

    /// Annualization constant: events per year (250 days x 8h x 3600s)
    #[serde(default = "default_events_per_year")]
    pub events_per_year: f64,
}

fn default_min_sample_size() -> usize {
    30
}

fn default_p_value_threshold() -> f64 {
    0.05
}

fn default_min_sharpe() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

fn default_permutation_n() -> usize {
    1000
}

fn default_permutation_seed() -> u32 {
    42
}

fn default_permutation_min_heap_mb() -> u64 {
    6144
}

fn default_events_per_year() -> f64 {
    250.0 * 8.0 * 3600.0
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            min_sample_size: default_min_sample_size(),
            p_value_threshold: default_p_value_threshold(),
            min_sharpe: default_min_sharpe(),
            permutation_test_enabled: true,
            permutation_n: default_permutation_n(),
            permutation_seed: default_permutation_seed(),
            permutation_min_heap_mb: default_permutation_min_heap_mb(),
            multiple_comparison_correction: true,
            events_per_year: default_events_per_year(),
        }
    }
}
