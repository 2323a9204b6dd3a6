//! Synthetic fixtures shared by the mining unit tests.

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::mining::config::{LoaderConfig, ScannerConfig, TesterConfig};
use crate::mining::dataset::{Dataset, FeatureRow, RowStream};
use crate::mining::events::MarketEvent;
use crate::mining::features::ExtractorKind;

/// Quote event at `mid` (spread 0.02) carrying precomputed features.
pub fn feature_event(ts: i64, mid: f64, features: &[(&str, f64)]) -> MarketEvent {
    MarketEvent {
        timestamp: ts,
        bid: Some(mid - 0.01),
        ask: Some(mid + 0.01),
        bid_size: Some(1.0),
        ask_size: Some(1.0),
        features: Some(
            features
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Passthrough loader config with small horizons.
pub fn passthrough_loader(horizons: Vec<usize>) -> LoaderConfig {
    LoaderConfig {
        horizons,
        regime_features: vec!["a".to_string()],
        regime_k: 2,
        extractor: ExtractorKind::Passthrough,
        ..LoaderConfig::default()
    }
}

pub fn row(index: usize, features: &[(&str, f64)], regime: i32, returns: &[(usize, Option<f64>)]) -> FeatureRow {
    FeatureRow {
        features: features
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
        regime,
        regime_confidence: 1.0,
        forward_returns: returns.iter().copied().collect(),
        timestamp: index as i64,
        index,
    }
}

/// Streaming view of fixed rows; every call replays from the start.
pub fn streaming_of(rows: Vec<FeatureRow>) -> Dataset {
    let rows = Arc::new(rows);
    Dataset::streaming(move || -> Result<RowStream> {
        let rows = Arc::clone(&rows);
        Ok(Box::new((0..rows.len()).map(move |i| Ok(rows[i].clone()))))
    })
}

/// Rows with two features (`x` in [-1, 1], `y` in [-1, 1]), two regimes and
/// forward returns at horizons 1 and 5. Rows with `x > 0.5` carry a positive
/// drift at horizon 1; everything else is noise.
pub fn synthetic_rows(n: usize, seed: u64) -> Vec<FeatureRow> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let x: f64 = rng.gen_range(-1.0..1.0);
            let y: f64 = rng.gen_range(-1.0..1.0);
            let noise: f64 = rng.gen_range(-0.001..0.001);
            let drift = if x > 0.5 { 0.002 } else { 0.0 };
            let mut forward_returns = BTreeMap::new();
            let tail = n - i - 1;
            forward_returns.insert(1, (tail >= 1).then_some(drift + noise));
            forward_returns.insert(5, (tail >= 5).then_some(noise * 0.5));
            let mut features = BTreeMap::new();
            features.insert("x".to_string(), x);
            features.insert("y".to_string(), y);
            FeatureRow {
                features,
                regime: if y > 0.0 { 1 } else { 0 },
                regime_confidence: 1.0,
                forward_returns,
                timestamp: i as i64,
                index: i,
            }
        })
        .collect()
}

pub fn small_scanner() -> ScannerConfig {
    ScannerConfig {
        min_support: 5,
        return_threshold: 0.0,
        cluster_k: 3,
        max_patterns_per_method: 10_000,
        ..ScannerConfig::default()
    }
}

/// Tester config that never trips the heap gate and keeps permutations cheap.
pub fn quick_tester() -> TesterConfig {
    TesterConfig {
        permutation_n: 200,
        permutation_min_heap_mb: 0,
        ..TesterConfig::default()
    }
}
