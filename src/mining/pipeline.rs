//! Mining Pipeline
//!
//! Wires the three components into one run:
//!
//! ```text
//! day files ─▶ DataLoader ─▶ Dataset ─▶ PatternScanner ─▶ candidates ─▶ StatisticalEdgeTester ─▶ MiningReport
//! ```
//!
//! The tester is skipped when the scan yields no candidates. The report carries
//! a `RunFingerprint` so runs (and array vs. streaming executions of the same
//! input) can be compared directly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::mining::config::MiningConfig;
use crate::mining::events::DayFile;
use crate::mining::feed::EventSource;
use crate::mining::features::ExtractorFactory;
use crate::mining::fingerprint::RunFingerprint;
use crate::mining::loader::{DataLoader, LoadSummary};
use crate::mining::memory::HeapProbe;
use crate::mining::pattern::PatternCandidate;
use crate::mining::scanner::{PatternScanner, ScanDiagnostics};
use crate::mining::tester::{EdgeTestResult, Recommendation, StatisticalEdgeTester};

/// How the loader presents the dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Materialize every row (eager multi-file aggregation).
    #[default]
    Array,
    /// Restartable lazy traversals.
    Streaming,
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningReport {
    pub generated_at: DateTime<Utc>,
    pub mode: LoadMode,
    pub load: LoadSummary,
    pub regime_model: serde_json::Value,
    pub scan: ScanDiagnostics,
    pub patterns: Vec<PatternCandidate>,
    pub results: Vec<EdgeTestResult>,
    pub fingerprint: RunFingerprint,
}

impl MiningReport {
    pub fn accepted(&self) -> impl Iterator<Item = &EdgeTestResult> {
        self.results
            .iter()
            .filter(|r| r.recommendation == Recommendation::Accept)
    }

    pub fn format_summary(&self) -> String {
        let accepted = self.accepted().count();
        let weak = self
            .results
            .iter()
            .filter(|r| r.recommendation == Recommendation::Weak)
            .count();
        let mut out = String::new();
        out.push_str(&format!("mode:        {:?}\n", self.mode));
        out.push_str(&format!(
            "rows:        {}\n",
            self.load
                .rows
                .map(|r| r.to_string())
                .unwrap_or_else(|| "streamed".to_string())
        ));
        out.push_str(&format!("regimes:     {}\n", self.load.regime_count));
        out.push_str(&format!("candidates:  {}\n", self.patterns.len()));
        out.push_str(&format!(
            "exact scan:  {} (dropped matches: {})\n",
            self.scan.is_exact(),
            self.scan.dropped_matches()
        ));
        out.push_str(&format!(
            "results:     {} accept / {} weak / {} reject\n",
            accepted,
            weak,
            self.results.len() - accepted - weak
        ));
        out.push_str(&format!("fingerprint: {}\n", self.fingerprint));
        out
    }
}

/// Configured end-to-end run.
pub struct MiningPipeline {
    config: MiningConfig,
    source: Arc<dyn EventSource>,
    extractor: Option<ExtractorFactory>,
    heap_probe: Option<HeapProbe>,
}

impl MiningPipeline {
    /// Fails on an invalid configuration.
    pub fn new(config: MiningConfig, source: Arc<dyn EventSource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            extractor: None,
            heap_probe: None,
        })
    }

    pub fn with_extractor(mut self, extractor: ExtractorFactory) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_heap_probe(mut self, probe: HeapProbe) -> Self {
        self.heap_probe = Some(probe);
        self
    }

    pub fn config(&self) -> &MiningConfig {
        &self.config
    }

    pub fn loader(&self) -> DataLoader {
        let loader = DataLoader::new(self.config.loader.clone(), Arc::clone(&self.source));
        match &self.extractor {
            Some(factory) => loader.with_extractor(Arc::clone(factory)),
            None => loader,
        }
    }

    pub fn run(&self, days: &[DayFile], mode: LoadMode) -> Result<MiningReport> {
        info!(files = days.len(), mode = ?mode, "mining run starting");

        let loader = self.loader();
        let loaded = match mode {
            LoadMode::Array => loader.load_files(days),
            LoadMode::Streaming => loader.load_streaming(days),
        }
        .context("Failed to load dataset")?;

        let scanner = PatternScanner::new(self.config.scanner.clone());
        let scan = scanner
            .scan_with_report(&loaded.dataset)
            .context("Pattern scan failed")?;

        let results = if scan.patterns.is_empty() {
            info!("no candidates; statistical tests skipped");
            Vec::new()
        } else {
            let mut tester = StatisticalEdgeTester::new(self.config.tester.clone());
            if let Some(probe) = &self.heap_probe {
                tester = tester.with_heap_probe(Arc::clone(probe));
            }
            tester
                .test_batch(&scan.patterns, &loaded.dataset)
                .context("Statistical testing failed")?
        };

        let fingerprint = RunFingerprint::compute(&scan.patterns, &results);
        info!(
            candidates = scan.patterns.len(),
            accepted = results
                .iter()
                .filter(|r| r.recommendation == Recommendation::Accept)
                .count(),
            fingerprint = %fingerprint,
            "mining run complete"
        );

        Ok(MiningReport {
            generated_at: Utc::now(),
            mode,
            load: loaded.summary,
            regime_model: loaded.regime_model.to_json(),
            scan: scan.diagnostics,
            patterns: scan.patterns,
            results,
            fingerprint,
        })
    }
}
