//! Data Loader
//!
//! Assembles `FeatureRow`s from replayed events:
//!
//! ```text
//! events ─▶ (trade adapter) ─▶ feature extractor ─▶ look-ahead buffer ─▶ smoke cap ─▶ regime label
//!                                  (warm-up rows dropped)   (forward returns)
//! ```
//!
//! # Modes
//!
//! - **Array** (`load_file`, `load_files`): every file is collected, rows are
//!   concatenated in file order, then all rows are labelled with a regime model
//!   trained on file 1 only.
//! - **Streaming** (`load_streaming`): a bootstrap pass over file 1 collects
//!   only the regime-feature vectors, trains the model, discards the vectors and
//!   returns a restartable row factory. Each factory call re-derives features
//!   and forward returns file by file.
//!
//! Forward returns never cross a file boundary. The look-ahead buffer holds at
//! most `max(horizons)` rows, so a streaming traversal keeps O(max horizon)
//! rows in memory (plus the smoke-cap tail, when one is configured).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

use crate::mining::cluster::{ClusterModel, KMeansModel};
use crate::mining::config::{LoaderConfig, SmokeSlice};
use crate::mining::dataset::{Dataset, FeatureRow, RowStream};
use crate::mining::events::{DayFile, StreamKind};
use crate::mining::feed::{adapt_stream, EventSource, EventStream};
use crate::mining::features::{ExtractorFactory, FeatureExtractor};

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal loader conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderError {
    /// A trade-tape file produced no feature-eligible rows after warm-up.
    EmptyTradeStream { file: String },
    /// The regime bootstrap file produced no rows to train on.
    NoTrainingRows { file: String },
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTradeStream { file } => write!(
                f,
                "trade stream {} yielded zero feature-eligible rows after warm-up; \
                 refusing to train a regime model on nothing",
                file
            ),
            Self::NoTrainingRows { file } => write!(
                f,
                "regime bootstrap file {} yielded zero feature rows",
                file
            ),
        }
    }
}

impl std::error::Error for LoaderError {}

// =============================================================================
// SUMMARY
// =============================================================================

/// What a load produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub files: usize,
    /// Row count; unknown for streaming loads until traversed.
    pub rows: Option<usize>,
    /// Rows the regime model was trained on (file 1).
    pub regime_training_rows: usize,
    /// Regimes the trained model can emit.
    pub regime_count: usize,
    /// Rows per regime (array loads only).
    pub regime_counts: BTreeMap<i32, usize>,
}

/// Output of every load mode.
pub struct LoadedDataset {
    pub dataset: Dataset,
    pub regime_model: Arc<dyn ClusterModel>,
    pub summary: LoadSummary,
}

// =============================================================================
// PER-FILE ROW PRODUCTION
// =============================================================================

/// A feature row before regime labelling.
#[derive(Debug, Clone)]
struct RawRow {
    features: BTreeMap<String, f64>,
    mid: f64,
    timestamp: i64,
    forward_returns: BTreeMap<usize, Option<f64>>,
}

type RawRows = Box<dyn Iterator<Item = Result<RawRow>> + Send>;

/// Streams one file's rows with forward returns resolved through a bounded
/// look-ahead buffer.
struct DayRows {
    label: String,
    events: EventStream,
    extractor: Box<dyn FeatureExtractor>,
    horizons: Vec<usize>,
    max_horizon: usize,
    pending: VecDeque<RawRow>,
    trade_mode: bool,
    exhausted: bool,
    reported: bool,
    eligible: usize,
    skipped: usize,
}

impl DayRows {
    fn push(&mut self, features: BTreeMap<String, f64>, mid: f64, timestamp: i64) {
        let len = self.pending.len();
        for &h in &self.horizons {
            if h <= len {
                let earlier = &mut self.pending[len - h];
                earlier
                    .forward_returns
                    .insert(h, Some((mid - earlier.mid) / earlier.mid));
            }
        }
        let forward_returns = self.horizons.iter().map(|&h| (h, None)).collect();
        self.pending.push_back(RawRow {
            features,
            mid,
            timestamp,
            forward_returns,
        });
        self.eligible += 1;
    }
}

impl Iterator for DayRows {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pending.len() > self.max_horizon {
                return self.pending.pop_front().map(Ok);
            }
            if self.exhausted {
                if let Some(row) = self.pending.pop_front() {
                    return Some(Ok(row));
                }
                if !self.reported {
                    self.reported = true;
                    debug!(
                        file = %self.label,
                        rows = self.eligible,
                        skipped = self.skipped,
                        "file traversal complete"
                    );
                    if self.trade_mode && self.eligible == 0 {
                        return Some(Err(LoaderError::EmptyTradeStream {
                            file: self.label.clone(),
                        }
                        .into()));
                    }
                }
                return None;
            }
            match self.events.next() {
                None => self.exhausted = true,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(event)) => match self.extractor.update(&event) {
                    Some(snapshot) => self.push(snapshot.features, snapshot.mid, event.timestamp),
                    None => self.skipped += 1,
                },
            }
        }
    }
}

/// Keeps a head, tail or head+tail slice of a file's rows.
struct SmokeCap<I> {
    inner: I,
    head_left: usize,
    tail_cap: usize,
    tail: VecDeque<RawRow>,
    draining: bool,
}

impl<I> SmokeCap<I> {
    fn new(inner: I, cap: usize, slice: SmokeSlice) -> Self {
        let (head, tail) = match slice {
            SmokeSlice::Head => (cap, 0),
            SmokeSlice::Tail => (0, cap),
            SmokeSlice::HeadTail => (cap - cap / 2, cap / 2),
        };
        Self {
            inner,
            head_left: head,
            tail_cap: tail,
            tail: VecDeque::with_capacity(tail),
            draining: false,
        }
    }
}

impl<I: Iterator<Item = Result<RawRow>>> Iterator for SmokeCap<I> {
    type Item = Result<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.draining {
            if self.head_left == 0 && self.tail_cap == 0 {
                return None;
            }
            match self.inner.next() {
                None => self.draining = true,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(row)) if self.head_left > 0 => {
                    self.head_left -= 1;
                    return Some(Ok(row));
                }
                Some(Ok(row)) => {
                    if self.tail.len() == self.tail_cap {
                        self.tail.pop_front();
                    }
                    self.tail.push_back(row);
                }
            }
        }
        self.tail.pop_front().map(Ok)
    }
}

// =============================================================================
// LOADER
// =============================================================================

/// Turns day files into datasets.
#[derive(Clone)]
pub struct DataLoader {
    config: LoaderConfig,
    source: Arc<dyn EventSource>,
    extractor: ExtractorFactory,
}

impl DataLoader {
    pub fn new(config: LoaderConfig, source: Arc<dyn EventSource>) -> Self {
        let extractor = config.extractor.factory(config.extractor_window);
        Self {
            config,
            source,
            extractor,
        }
    }

    /// Replace the feature extractor built for each file.
    pub fn with_extractor(mut self, extractor: ExtractorFactory) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Array mode over a single file.
    pub fn load_file(&self, day: &DayFile) -> Result<LoadedDataset> {
        self.load_files(std::slice::from_ref(day))
    }

    /// Eager multi-file aggregation: concatenate every file, then label all
    /// rows with the model trained on file 1.
    pub fn load_files(&self, days: &[DayFile]) -> Result<LoadedDataset> {
        let Some(first) = days.first() else {
            return Ok(self.empty());
        };

        let mut raw: Vec<RawRow> = Vec::new();
        let mut first_file_rows = 0;
        for (i, day) in days.iter().enumerate() {
            let before = raw.len();
            for row in self.day_rows(day)? {
                raw.push(row?);
            }
            info!(file = %day.label(), rows = raw.len() - before, "loaded file");
            if i == 0 {
                first_file_rows = raw.len();
            }
        }

        let vectors: Vec<Vec<f64>> = raw[..first_file_rows]
            .iter()
            .map(|r| self.regime_vector(&r.features))
            .collect();
        let model = self.train_regime_model(first, &vectors)?;

        let mut regime_counts = BTreeMap::new();
        let rows: Vec<FeatureRow> = raw
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                let row = label_row(r, index, model.as_ref(), &self.config.regime_features);
                *regime_counts.entry(row.regime).or_insert(0) += 1;
                row
            })
            .collect();

        let summary = LoadSummary {
            files: days.len(),
            rows: Some(rows.len()),
            regime_training_rows: first_file_rows,
            regime_count: self.config.regime_k.min(first_file_rows),
            regime_counts,
        };
        info!(
            files = summary.files,
            rows = rows.len(),
            regimes = summary.regime_counts.len(),
            "array dataset ready"
        );

        Ok(LoadedDataset {
            dataset: Dataset::from_rows(rows),
            regime_model: model,
            summary,
        })
    }

    /// Streaming aggregation: bootstrap the regime model from file 1, then
    /// return a restartable factory.
    pub fn load_streaming(&self, days: &[DayFile]) -> Result<LoadedDataset> {
        let Some(first) = days.first() else {
            return Ok(self.empty());
        };

        let mut vectors = Vec::new();
        for row in self.day_rows(first)? {
            vectors.push(self.regime_vector(&row?.features));
        }
        let model = self.train_regime_model(first, &vectors)?;
        let training_rows = vectors.len();
        drop(vectors);

        let file_count = days.len();
        let loader = self.clone();
        let days: Arc<[DayFile]> = days.to_vec().into();
        let factory_model = Arc::clone(&model);
        let factory = move || -> Result<RowStream> {
            Ok(Box::new(StreamingRows {
                loader: loader.clone(),
                days: Arc::clone(&days),
                model: Arc::clone(&factory_model),
                next_day: 0,
                current: None,
                next_index: 0,
                failed: false,
            }))
        };

        info!(files = file_count, training_rows, "streaming dataset ready");

        Ok(LoadedDataset {
            dataset: Dataset::streaming(factory),
            regime_model: model,
            summary: LoadSummary {
                files: file_count,
                rows: None,
                regime_training_rows: training_rows,
                regime_count: self.config.regime_k.min(training_rows),
                regime_counts: BTreeMap::new(),
            },
        })
    }

    fn empty(&self) -> LoadedDataset {
        LoadedDataset {
            dataset: Dataset::from_rows(Vec::new()),
            regime_model: Arc::new(KMeansModel::new(self.config.regime_k, self.config.regime_seed)),
            summary: LoadSummary::default(),
        }
    }

    /// Rows of one file, forward returns resolved, smoke cap applied.
    fn day_rows(&self, day: &DayFile) -> Result<RawRows> {
        let opened = self
            .source
            .open(day)
            .with_context(|| format!("Failed to open {} via {}", day.label(), self.source.name()))?;
        let trade_mode = opened.meta.kind == StreamKind::Trades;
        let rows = DayRows {
            label: day.label(),
            events: adapt_stream(opened.meta.kind, opened.events),
            extractor: (self.extractor)(),
            horizons: self.config.horizons.clone(),
            max_horizon: self.config.max_horizon(),
            pending: VecDeque::with_capacity(self.config.max_horizon() + 1),
            trade_mode,
            exhausted: false,
            reported: false,
            eligible: 0,
            skipped: 0,
        };
        let rows: RawRows = match self.config.max_rows_per_day {
            Some(cap) => Box::new(SmokeCap::new(rows, cap, self.config.smoke_slice)),
            None => Box::new(rows),
        };
        Ok(rows)
    }

    fn regime_vector(&self, features: &BTreeMap<String, f64>) -> Vec<f64> {
        self.config
            .regime_features
            .iter()
            .map(|f| features.get(f).copied().unwrap_or(0.0))
            .collect()
    }

    fn train_regime_model(
        &self,
        first: &DayFile,
        vectors: &[Vec<f64>],
    ) -> Result<Arc<dyn ClusterModel>> {
        if vectors.is_empty() {
            return Err(LoaderError::NoTrainingRows {
                file: first.label(),
            }
            .into());
        }
        let mut model = KMeansModel::new(self.config.regime_k, self.config.regime_seed);
        model.train(vectors, &self.config.regime_features)?;
        info!(
            file = %first.label(),
            rows = vectors.len(),
            regimes = model.cluster_count(),
            "regime model trained"
        );
        Ok(Arc::new(model))
    }
}

/// Attach regime label and dataset index.
fn label_row(
    raw: RawRow,
    index: usize,
    model: &dyn ClusterModel,
    regime_features: &[String],
) -> FeatureRow {
    let vector: Vec<f64> = regime_features
        .iter()
        .map(|f| raw.features.get(f).copied().unwrap_or(0.0))
        .collect();
    let assignment = model.predict(&vector);
    FeatureRow {
        features: raw.features,
        regime: assignment.cluster,
        regime_confidence: assignment.confidence,
        forward_returns: raw.forward_returns,
        timestamp: raw.timestamp,
        index,
    }
}

/// One streaming traversal across all files.
struct StreamingRows {
    loader: DataLoader,
    days: Arc<[DayFile]>,
    model: Arc<dyn ClusterModel>,
    next_day: usize,
    current: Option<RawRows>,
    next_index: usize,
    failed: bool,
}

impl Iterator for StreamingRows {
    type Item = Result<FeatureRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(rows) = self.current.as_mut() {
                match rows.next() {
                    Some(Ok(raw)) => {
                        let row = label_row(
                            raw,
                            self.next_index,
                            self.model.as_ref(),
                            &self.loader.config.regime_features,
                        );
                        self.next_index += 1;
                        return Some(Ok(row));
                    }
                    Some(Err(e)) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                    None => self.current = None,
                }
            }

            let day = self.days.get(self.next_day)?;
            self.next_day += 1;
            match self.loader.day_rows(day) {
                Ok(rows) => self.current = Some(rows),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
