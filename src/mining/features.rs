//! Feature Extraction
//!
//! Turns replayed events into per-event feature mappings plus the reference
//! (mid) price used for forward returns. Extraction proper belongs upstream;
//! this module defines the seam the loader drives and two implementations:
//!
//! - `PassthroughExtractor`: the replay already attached a feature map
//! - `MicrostructureExtractor`: rolling top-of-book / trade-flow features
//!
//! An extractor returns `None` while warming up or whenever the event has no
//! valid reference price; the loader drops those rows.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::mining::events::MarketEvent;

/// Features of one event plus its reference price.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSnapshot {
    pub features: BTreeMap<String, f64>,
    pub mid: f64,
}

/// Stateful per-file feature extractor.
pub trait FeatureExtractor: Send {
    fn update(&mut self, event: &MarketEvent) -> Option<FeatureSnapshot>;
}

/// Builds a fresh extractor for every file traversal.
pub type ExtractorFactory = Arc<dyn Fn() -> Box<dyn FeatureExtractor> + Send + Sync>;

/// Which reference extractor the loader builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    #[default]
    Microstructure,
    Passthrough,
}

impl ExtractorKind {
    pub fn factory(self, window: usize) -> ExtractorFactory {
        match self {
            Self::Microstructure => Arc::new(move || {
                Box::new(MicrostructureExtractor::new(window)) as Box<dyn FeatureExtractor>
            }),
            Self::Passthrough => {
                Arc::new(|| Box::new(PassthroughExtractor) as Box<dyn FeatureExtractor>)
            }
        }
    }
}

// =============================================================================
// PASSTHROUGH
// =============================================================================

/// Uses the feature map carried on the event. Non-finite values are dropped so
/// that a missing feature simply fails to match any condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughExtractor;

impl FeatureExtractor for PassthroughExtractor {
    fn update(&mut self, event: &MarketEvent) -> Option<FeatureSnapshot> {
        let mid = event.mid()?;
        let features: BTreeMap<String, f64> = event
            .features
            .as_ref()?
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        if features.is_empty() {
            return None;
        }
        Some(FeatureSnapshot { features, mid })
    }
}

// =============================================================================
// MICROSTRUCTURE
// =============================================================================

pub const SPREAD_BPS: &str = "spread_bps";
pub const BOOK_IMBALANCE: &str = "book_imbalance";
pub const TRADE_FLOW_IMBALANCE: &str = "trade_flow_imbalance";
pub const RETURN_BPS: &str = "return_bps";
pub const VOLATILITY_BPS: &str = "volatility_bps";

/// Rolling-window microstructure features.
///
/// | feature                | range    | definition                                   |
/// |------------------------|----------|----------------------------------------------|
/// | `spread_bps`           | >= 0     | (ask - bid) / mid                            |
/// | `book_imbalance`       | [-1, 1]  | (bid_size - ask_size) / (bid_size + ask_size)|
/// | `trade_flow_imbalance` | [-1, 1]  | signed / absolute traded volume in window    |
/// | `return_bps`           | signed   | mid change over the window                   |
/// | `volatility_bps`       | >= 0     | std of one-step mid log returns in window    |
#[derive(Debug, Clone)]
pub struct MicrostructureExtractor {
    window: usize,
    mids: VecDeque<f64>,
    flows: VecDeque<f64>,
}

impl MicrostructureExtractor {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            mids: VecDeque::with_capacity(window + 1),
            flows: VecDeque::with_capacity(window),
        }
    }

    fn push_flow(&mut self, event: &MarketEvent, mid: f64) {
        let signed = match (event.price, event.quantity) {
            (Some(price), Some(qty)) if price.is_finite() && qty.is_finite() && qty > 0.0 => {
                let sign = match event.side {
                    Some(side) => side.sign(),
                    None if price >= mid => 1.0,
                    None => -1.0,
                };
                sign * qty
            }
            _ => 0.0,
        };
        if self.flows.len() == self.window {
            self.flows.pop_front();
        }
        self.flows.push_back(signed);
    }

    fn volatility_bps(&self) -> f64 {
        let n = self.mids.len();
        if n < 3 {
            return 0.0;
        }
        let returns: Vec<f64> = self
            .mids
            .iter()
            .zip(self.mids.iter().skip(1))
            .map(|(a, b)| (b / a).ln())
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
            / (returns.len() - 1) as f64;
        var.sqrt() * 1e4
    }
}

impl FeatureExtractor for MicrostructureExtractor {
    fn update(&mut self, event: &MarketEvent) -> Option<FeatureSnapshot> {
        let mid = event.mid()?;

        if self.mids.len() == self.window + 1 {
            self.mids.pop_front();
        }
        self.mids.push_back(mid);
        self.push_flow(event, mid);

        // Warm-up: a full window of mids is needed for return/volatility.
        if self.mids.len() <= self.window {
            return None;
        }

        let bid = event.bid?;
        let ask = event.ask?;
        let spread_bps = (ask - bid) / mid * 1e4;

        let book_imbalance = match (event.bid_size, event.ask_size) {
            (Some(b), Some(a)) if b.is_finite() && a.is_finite() && b + a > 0.0 => {
                (b - a) / (b + a)
            }
            _ => 0.0,
        };

        let gross: f64 = self.flows.iter().map(|f| f.abs()).sum();
        let trade_flow_imbalance = if gross > 0.0 {
            self.flows.iter().sum::<f64>() / gross
        } else {
            0.0
        };

        let first = self.mids.front().copied().unwrap_or(mid);
        let return_bps = (mid - first) / first * 1e4;

        let mut features = BTreeMap::new();
        features.insert(SPREAD_BPS.to_string(), spread_bps);
        features.insert(BOOK_IMBALANCE.to_string(), book_imbalance);
        features.insert(TRADE_FLOW_IMBALANCE.to_string(), trade_flow_imbalance);
        features.insert(RETURN_BPS.to_string(), return_bps);
        features.insert(VOLATILITY_BPS.to_string(), self.volatility_bps());

        Some(FeatureSnapshot { features, mid })
    }
}
