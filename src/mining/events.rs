//! Event Model
//!
//! Timestamped market events as they arrive from the upstream replay. Book
//! streams carry top-of-book quotes; trade streams carry only prints and are
//! normalised by the trade adapter in `feed`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Nanoseconds since epoch.
pub type Nanos = i64;

/// Aggressor side of a print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

/// A single replayed market event. Every payload field is optional; the
/// feature extractor decides what it can use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketEvent {
    /// Event time (ns).
    pub timestamp: Nanos,
    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub bid_size: Option<f64>,
    #[serde(default)]
    pub ask_size: Option<f64>,
    /// Trade price, when the event is (or includes) a print.
    #[serde(default)]
    pub price: Option<f64>,
    /// Trade quantity.
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub side: Option<Side>,
    /// Features already computed upstream, if the replay provides them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<BTreeMap<String, f64>>,
}

impl MarketEvent {
    /// Mid price if both quotes are present, finite and uncrossed.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid.is_finite() && ask.is_finite() && ask >= bid => {
                let mid = 0.5 * (bid + ask);
                (mid > 0.0).then_some(mid)
            }
            _ => None,
        }
    }

    pub fn has_quotes(&self) -> bool {
        self.bid.is_some() && self.ask.is_some()
    }
}

/// Kind of stream a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Book,
    Trades,
}

/// Sidecar metadata for one data file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMeta {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub kind: StreamKind,
}

/// One day of data: the (data-path, meta-path) pair the event source opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayFile {
    pub data_path: PathBuf,
    pub meta_path: Option<PathBuf>,
}

impl DayFile {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            meta_path: None,
        }
    }

    pub fn with_meta(data_path: impl Into<PathBuf>, meta_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            meta_path: Some(meta_path.into()),
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        self.data_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.data_path.display().to_string())
    }
}
