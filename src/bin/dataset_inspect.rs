//! Dataset Inspection Tool
//!
//! Runs only the DataLoader over one or more day files and reports what a
//! mining run would see: row counts, regime distribution, per-feature moments
//! and forward-return coverage per horizon.
//!
//! Usage:
//!   cargo run --release --bin dataset_inspect -- --data day1.jsonl --data day2.jsonl
//!   cargo run --release --bin dataset_inspect -- --data trades.jsonl --meta trades.meta.json --json

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_miner::mining::stats::RunningMoments;
use edge_miner::mining::{DataLoader, DayFile, JsonlEventSource, LoadSummary, MiningConfig};

/// Inspect the feature rows a mining run would load
#[derive(Parser, Debug)]
#[command(name = "dataset_inspect")]
struct Cli {
    /// TOML configuration (loader section is used)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Day file (JSONL); repeat in chronological order
    #[arg(short, long = "data", required = true)]
    data: Vec<PathBuf>,

    /// Stream metadata JSON applied to every day file
    #[arg(long)]
    meta: Option<PathBuf>,

    /// Use the streaming loader (rows are counted by one traversal)
    #[arg(long)]
    streaming: bool,

    /// Smoke-test cap on rows kept per day file
    #[arg(long)]
    max_rows_per_day: Option<usize>,

    /// Emit JSON instead of the text report
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct FeatureSummary {
    count: usize,
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
}

#[derive(Debug, Serialize)]
struct InspectReport {
    load: LoadSummary,
    rows: usize,
    regime_counts: BTreeMap<i32, usize>,
    features: BTreeMap<String, FeatureSummary>,
    /// Rows with a non-null forward return, per horizon.
    forward_return_coverage: BTreeMap<usize, usize>,
    first_timestamp: Option<i64>,
    last_timestamp: Option<i64>,
}

#[derive(Default)]
struct FeatureAccumulator {
    moments: RunningMoments,
    min: f64,
    max: f64,
}

impl FeatureAccumulator {
    fn push(&mut self, x: f64) {
        if self.moments.count == 0 {
            self.min = x;
            self.max = x;
        } else {
            self.min = self.min.min(x);
            self.max = self.max.max(x);
        }
        self.moments.push(x);
    }

    fn finish(&self) -> FeatureSummary {
        FeatureSummary {
            count: self.moments.count,
            mean: self.moments.mean(),
            std: self.moments.variance().sqrt(),
            min: self.min,
            max: self.max,
        }
    }
}

fn inspect(cli: &Cli) -> Result<InspectReport> {
    let mut config = match &cli.config {
        Some(path) => MiningConfig::load(path)
            .with_context(|| format!("Failed to load config: {:?}", path))?,
        None => MiningConfig::from_env(),
    };
    if cli.max_rows_per_day.is_some() {
        config.loader.max_rows_per_day = cli.max_rows_per_day;
    }
    config.validate()?;

    let days: Vec<DayFile> = cli
        .data
        .iter()
        .map(|path| match &cli.meta {
            Some(meta) => DayFile::with_meta(path, meta),
            None => DayFile::new(path),
        })
        .collect();

    let loader = DataLoader::new(config.loader, Arc::new(JsonlEventSource::new()));
    let loaded = if cli.streaming {
        loader.load_streaming(&days)?
    } else {
        loader.load_files(&days)?
    };

    let mut rows = 0usize;
    let mut regime_counts: BTreeMap<i32, usize> = BTreeMap::new();
    let mut features: BTreeMap<String, FeatureAccumulator> = BTreeMap::new();
    let mut coverage: BTreeMap<usize, usize> = BTreeMap::new();
    let mut first_timestamp = None;
    let mut last_timestamp = None;

    loaded.dataset.for_each_row(|row| {
        rows += 1;
        *regime_counts.entry(row.regime).or_default() += 1;
        for (name, value) in &row.features {
            if value.is_finite() {
                features.entry(name.clone()).or_default().push(*value);
            }
        }
        for (horizon, ret) in &row.forward_returns {
            let covered = coverage.entry(*horizon).or_default();
            if ret.is_some() {
                *covered += 1;
            }
        }
        first_timestamp.get_or_insert(row.timestamp);
        last_timestamp = Some(row.timestamp);
        Ok(())
    })?;

    Ok(InspectReport {
        load: loaded.summary,
        rows,
        regime_counts,
        features: features
            .iter()
            .map(|(name, acc)| (name.clone(), acc.finish()))
            .collect(),
        forward_return_coverage: coverage,
        first_timestamp,
        last_timestamp,
    })
}

fn print_text(report: &InspectReport) {
    println!("=== Dataset ===");
    println!("files:            {}", report.load.files);
    println!("rows:             {}", report.rows);
    println!("regime training:  {} rows", report.load.regime_training_rows);
    match (report.first_timestamp, report.last_timestamp) {
        (Some(first), Some(last)) => println!("timestamps:       {} .. {}", first, last),
        _ => println!("timestamps:       (empty)"),
    }

    println!("\n=== Regimes ({}) ===", report.load.regime_count);
    for (regime, count) in &report.regime_counts {
        let pct = 100.0 * *count as f64 / report.rows.max(1) as f64;
        println!("  r{:<3} {:>10} ({:5.1}%)", regime, count, pct);
    }

    println!("\n=== Forward returns ===");
    for (horizon, covered) in &report.forward_return_coverage {
        println!("  h{:<5} {:>10} non-null", horizon, covered);
    }

    println!("\n=== Features ===");
    for (name, s) in &report.features {
        println!(
            "  {:<24} n={:<9} mean={:<12.6} std={:<12.6} min={:<12.6} max={:.6}",
            name, s.count, s.mean, s.std, s.min, s.max
        );
    }
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_miner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let report = match inspect(&cli) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        print_text(&report);
    }
}
