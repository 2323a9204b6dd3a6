//! Edge Miner CLI
//!
//! Runs the full mining pipeline over one or more day files and writes the
//! report as JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin edge_miner -- \
//!   --config edge_miner.toml \
//!   --data day1.jsonl --data day2.jsonl \
//!   --streaming \
//!   --output report.json
//! ```
//!
//! # Exit Codes
//!
//! - 0: Run completed with at least one ACCEPT recommendation
//! - 1: Run completed but nothing was accepted
//! - 2: Configuration or argument error
//! - 3: Runtime error (I/O, fatal loader/tester condition)

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_miner::mining::{
    DayFile, JsonlEventSource, LoadMode, MiningConfig, MiningPipeline, MiningReport, SmokeSlice,
};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SliceArg {
    Head,
    Tail,
    HeadTail,
}

impl From<SliceArg> for SmokeSlice {
    fn from(arg: SliceArg) -> Self {
        match arg {
            SliceArg::Head => SmokeSlice::Head,
            SliceArg::Tail => SmokeSlice::Tail,
            SliceArg::HeadTail => SmokeSlice::HeadTail,
        }
    }
}

/// Mine historical microstructure data for statistically defensible edges
#[derive(Parser, Debug)]
#[command(name = "edge_miner")]
#[command(version)]
struct Cli {
    /// TOML configuration (falls back to EDGE_MINER_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Day file (JSONL, one event per line); repeat in chronological order
    #[arg(short, long = "data", required = true)]
    data: Vec<PathBuf>,

    /// Stream metadata JSON applied to every day file
    #[arg(long)]
    meta: Option<PathBuf>,

    /// Restartable lazy traversals instead of materializing every row
    #[arg(long)]
    streaming: bool,

    /// Smoke-test cap on rows kept per day file
    #[arg(long)]
    max_rows_per_day: Option<usize>,

    /// Which rows the smoke cap keeps
    #[arg(long, value_enum)]
    smoke_slice: Option<SliceArg>,

    /// Disable the permutation test
    #[arg(long)]
    no_permutation: bool,

    /// Report output path (stdout summary only if omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Cli {
    fn mining_config(&self) -> Result<MiningConfig> {
        let mut config = match &self.config {
            Some(path) => MiningConfig::load(path)
                .with_context(|| format!("Failed to load config: {:?}", path))?,
            None => MiningConfig::from_env(),
        };
        if let Some(cap) = self.max_rows_per_day {
            config.loader.max_rows_per_day = Some(cap);
        }
        if let Some(slice) = self.smoke_slice {
            config.loader.smoke_slice = slice.into();
        }
        if self.no_permutation {
            config.tester.permutation_test_enabled = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn day_files(&self) -> Vec<DayFile> {
        self.data
            .iter()
            .map(|path| match &self.meta {
                Some(meta) => DayFile::with_meta(path, meta),
                None => DayFile::new(path),
            })
            .collect()
    }

    fn mode(&self) -> LoadMode {
        if self.streaming {
            LoadMode::Streaming
        } else {
            LoadMode::Array
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edge_miner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn write_report(report: &MiningReport, path: &PathBuf) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .with_context(|| format!("Failed to write report to {:?}", path))?;
    Ok(())
}

// =============================================================================
// MAIN
// =============================================================================

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let config = match cli.mining_config() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {:#}", e);
            std::process::exit(2);
        }
    };
    let pipeline = match MiningPipeline::new(config, Arc::new(JsonlEventSource::new())) {
        Ok(p) => p,
        Err(e) => {
            error!("configuration error: {:#}", e);
            std::process::exit(2);
        }
    };

    let report = match pipeline.run(&cli.day_files(), cli.mode()) {
        Ok(r) => r,
        Err(e) => {
            error!("mining run failed: {:#}", e);
            std::process::exit(3);
        }
    };

    if let Some(path) = &cli.output {
        if let Err(e) = write_report(&report, path) {
            error!("{:#}", e);
            std::process::exit(3);
        }
        info!(path = ?path, "report written");
    }

    println!("{}", report.format_summary());
    for result in report.accepted() {
        println!(
            "  ACCEPT {:<48} score={:.2}",
            result.pattern_id, result.overall_score
        );
    }

    if report.accepted().next().is_some() {
        std::process::exit(0);
    }
    std::process::exit(1);
}
