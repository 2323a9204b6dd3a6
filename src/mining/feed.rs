//! Event Feed
//!
//! Trait definition for sources that replay one day of historical events, a
//! JSON-lines file source, an in-memory source, and the trade-stream adapter.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::mining::events::{DayFile, MarketEvent, StreamKind, StreamMeta};

/// Lazy, forward-only sequence of events.
pub type EventStream = Box<dyn Iterator<Item = Result<MarketEvent>> + Send>;

/// Quantity substituted for missing or non-positive trade sizes.
pub const TRADE_QTY_EPSILON: f64 = 1e-9;

/// Relative half-width of the synthetic spread put around a trade price.
pub const SYNTHETIC_HALF_SPREAD_REL: f64 = 1e-6;

/// Absolute floor on the synthetic half-width.
pub const SYNTHETIC_HALF_SPREAD_MIN: f64 = 1e-8;

/// An opened day: its metadata plus the event stream.
pub struct OpenedDay {
    pub meta: StreamMeta,
    pub events: EventStream,
}

/// Trait for event sources that provide replay of a (data-path, meta-path) pair.
///
/// Every call to `open` must start a fresh traversal from the first event;
/// the loader relies on this to rebuild rows on each streaming pass.
pub trait EventSource: Send + Sync {
    fn open(&self, day: &DayFile) -> Result<OpenedDay>;

    /// Source identifier for logging/diagnostics.
    fn name(&self) -> &str {
        "unknown"
    }
}

// =============================================================================
// JSON-LINES SOURCE
// =============================================================================

/// Reads one `MarketEvent` JSON object per line. Blank lines are ignored.
/// The optional meta file is a single `StreamMeta` JSON object.
#[derive(Debug, Clone, Default)]
pub struct JsonlEventSource;

impl JsonlEventSource {
    pub fn new() -> Self {
        Self
    }

    fn read_meta(day: &DayFile) -> Result<StreamMeta> {
        match &day.meta_path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read meta file: {:?}", path))?;
                serde_json::from_str(&contents)
                    .with_context(|| format!("Invalid meta file: {:?}", path))
            }
            None => Ok(StreamMeta::default()),
        }
    }
}

impl EventSource for JsonlEventSource {
    fn open(&self, day: &DayFile) -> Result<OpenedDay> {
        let meta = Self::read_meta(day)?;
        let file = File::open(&day.data_path)
            .with_context(|| format!("Failed to open data file: {:?}", day.data_path))?;
        let path = day.data_path.clone();

        let events = BufReader::new(file)
            .lines()
            .enumerate()
            .filter_map(move |(line_no, line)| parse_line(&path, line_no + 1, line));

        Ok(OpenedDay {
            meta,
            events: Box::new(events),
        })
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

fn parse_line(
    path: &Path,
    line_no: usize,
    line: std::io::Result<String>,
) -> Option<Result<MarketEvent>> {
    let line = match line {
        Ok(line) => line,
        Err(e) => {
            return Some(Err(anyhow::Error::new(e)
                .context(format!("Read error in {:?} at line {}", path, line_no))))
        }
    };
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<MarketEvent>(trimmed)
            .with_context(|| format!("Invalid event in {:?} at line {}", path, line_no)),
    )
}

// =============================================================================
// IN-MEMORY SOURCE
// =============================================================================

/// A source backed by in-memory event vectors keyed by data path.
#[derive(Debug, Clone, Default)]
pub struct VecEventSource {
    days: HashMap<PathBuf, (StreamMeta, Arc<Vec<MarketEvent>>)>,
}

impl VecEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a day and return the handle the loader should be given.
    pub fn insert(
        &mut self,
        data_path: impl Into<PathBuf>,
        meta: StreamMeta,
        events: Vec<MarketEvent>,
    ) -> DayFile {
        let data_path = data_path.into();
        self.days
            .insert(data_path.clone(), (meta, Arc::new(events)));
        DayFile::new(data_path)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}

impl EventSource for VecEventSource {
    fn open(&self, day: &DayFile) -> Result<OpenedDay> {
        let (meta, events) = self
            .days
            .get(&day.data_path)
            .with_context(|| format!("Unknown day: {:?}", day.data_path))?;
        let events = Arc::clone(events);
        let len = events.len();

        Ok(OpenedDay {
            meta: meta.clone(),
            events: Box::new((0..len).map(move |i| Ok(events[i].clone()))),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// TRADE ADAPTER
// =============================================================================

/// Normalise a print from a quote-less stream so the book-oriented feature
/// extractor can consume it. Events whose price is missing or not finite pass
/// through untouched.
pub fn adapt_trade_event(mut event: MarketEvent) -> MarketEvent {
    let price = match event.price {
        Some(p) if p.is_finite() => p,
        _ => return event,
    };

    if !event.has_quotes() {
        let half = (price.abs() * SYNTHETIC_HALF_SPREAD_REL).max(SYNTHETIC_HALF_SPREAD_MIN);
        event.bid = Some(price - half);
        event.ask = Some(price + half);
    }

    let quantity = event
        .quantity
        .filter(|q| q.is_finite() && *q > 0.0)
        .unwrap_or(TRADE_QTY_EPSILON);
    event.quantity = Some(quantity);

    event
}

/// Wrap a stream with the trade adapter when its metadata says it is a trade tape.
pub fn adapt_stream(kind: StreamKind, events: EventStream) -> EventStream {
    match kind {
        StreamKind::Book => events,
        StreamKind::Trades => Box::new(events.map(|e| e.map(adapt_trade_event))),
    }
}
