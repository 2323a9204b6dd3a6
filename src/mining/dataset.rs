//! Dataset Model
//!
//! `FeatureRow` is the unit every downstream component consumes. A `Dataset`
//! is either a materialized row collection or a factory that replays the rows
//! lazily; both present the same ordering (file order x intra-file order).
//!
//! Streaming traversals are independent: every `RowFactory::open` call starts
//! from the first row and owns its iterator. Nothing shares an in-flight
//! traversal.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One labelled feature row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub features: BTreeMap<String, f64>,
    pub regime: i32,
    pub regime_confidence: f64,
    /// Horizon (rows ahead) -> relative mid change; `None` when fewer than
    /// `h` rows follow in the same file.
    pub forward_returns: BTreeMap<usize, Option<f64>>,
    pub timestamp: i64,
    /// Position in the dataset ordering.
    pub index: usize,
}

impl FeatureRow {
    #[inline]
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }

    #[inline]
    pub fn forward_return(&self, horizon: usize) -> Option<f64> {
        self.forward_returns.get(&horizon).copied().flatten()
    }

    /// Dense vector over `names`; missing or non-finite features read as 0.
    pub fn vector(&self, names: &[String]) -> Vec<f64> {
        names
            .iter()
            .map(|f| self.feature(f).filter(|v| v.is_finite()).unwrap_or(0.0))
            .collect()
    }
}

/// Lazy row sequence of one traversal.
pub type RowStream = Box<dyn Iterator<Item = Result<FeatureRow>> + Send>;

/// Produces a fresh, independent traversal on every call.
pub trait RowFactory: Send + Sync {
    fn open(&self) -> Result<RowStream>;
}

impl<F> RowFactory for F
where
    F: Fn() -> Result<RowStream> + Send + Sync,
{
    fn open(&self) -> Result<RowStream> {
        self()
    }
}

/// Execution mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetMode {
    Array,
    Streaming,
}

/// Rows available to the scanner and tester.
#[derive(Clone)]
pub enum Dataset {
    /// Finite, randomly re-readable rows.
    Array(Arc<[FeatureRow]>),
    /// Restartable lazy row sequence.
    Streaming(Arc<dyn RowFactory>),
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Array(rows) => f.debug_tuple("Array").field(&rows.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

impl Dataset {
    pub fn from_rows(rows: Vec<FeatureRow>) -> Self {
        Self::Array(rows.into())
    }

    pub fn streaming(factory: impl RowFactory + 'static) -> Self {
        Self::Streaming(Arc::new(factory))
    }

    pub fn mode(&self) -> DatasetMode {
        match self {
            Self::Array(_) => DatasetMode::Array,
            Self::Streaming(_) => DatasetMode::Streaming,
        }
    }

    /// Visit every row once, in dataset order. Streaming datasets open a new
    /// traversal for each call.
    pub fn for_each_row<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&FeatureRow) -> Result<()>,
    {
        match self {
            Self::Array(rows) => {
                for row in rows.iter() {
                    visit(row)?;
                }
            }
            Self::Streaming(factory) => {
                for row in factory.open()? {
                    visit(&row?)?;
                }
            }
        }
        Ok(())
    }

    /// First row, if any. Streaming datasets pay one partial traversal.
    pub fn first_row(&self) -> Result<Option<FeatureRow>> {
        match self {
            Self::Array(rows) => Ok(rows.first().cloned()),
            Self::Streaming(factory) => factory.open()?.next().transpose(),
        }
    }

    /// Known row count (Array only).
    #[cfg(test)]
    pub(crate) fn len_hint(&self) -> Option<usize> {
        match self {
            Self::Array(rows) => Some(rows.len()),
            Self::Streaming(_) => None,
        }
    }

    /// Collect every row into an Array dataset.
    #[cfg(test)]
    pub(crate) fn materialize(&self) -> Result<Dataset> {
        match self {
            Self::Array(_) => Ok(self.clone()),
            Self::Streaming(factory) => {
                let rows = factory.open()?.collect::<Result<Vec<_>>>()?;
                Ok(Self::from_rows(rows))
            }
        }
    }
}
