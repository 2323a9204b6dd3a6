//! Pattern Mining Engine
//!
//! Mines historical microstructure feature data for predictive patterns under
//! two hard constraints: bounded memory on multi-day datasets and bit-exact
//! reproducibility.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌──────────────┐    ┌──────────────┐
//! │ EventSource  │───▶│  Feature     │───▶│  DataLoader  │──┐
//! │ (JSONL/Vec)  │    │  Extractor   │    │ (fwd returns,│  │
//! └──────────────┘    └──────────────┘    │  regimes)    │  │
//!                                         └──────────────┘  │
//!                                                           ▼
//!                          ┌─────────────────────────────────────────┐
//!                          │ Dataset = Array(rows) | Streaming(factory)│
//!                          └─────────────────────────────────────────┘
//!                                 │                         │
//!                                 ▼                         ▼
//!                        ┌────────────────┐       ┌─────────────────────┐
//!                        │ PatternScanner │──────▶│ StatisticalEdge     │
//!                        │ thr/qtl/cluster│ cands │ Tester (+Bonferroni)│
//!                        └────────────────┘       └─────────────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - **Ordering**: rows in file order x intra-file order; every map keyed by
//!   feature, horizon or configuration is a `BTreeMap`
//! - **Clustering**: k-means++ seeded from `ChaCha8Rng` with a configured seed
//! - **Permutations**: a fresh seeded LCG per pattern
//! - **Array vs. streaming**: both feed the same accumulators in the same
//!   order, so uncapped runs produce identical candidates and results

pub mod cluster;
pub mod config;
pub mod dataset;
pub mod events;
pub mod features;
pub mod feed;
pub mod fingerprint;
pub mod loader;
pub mod memory;
pub mod pattern;
pub mod pipeline;
pub mod scanner;
pub mod stats;
pub mod tester;

#[cfg(test)]
mod test_support;
#[cfg(test)]
mod tester_tests;

pub use cluster::{ClusterAssignment, ClusterModel, KMeansModel};
pub use config::{ConfigError, LoaderConfig, MiningConfig, ScannerConfig, SmokeSlice, TesterConfig};
pub use dataset::{Dataset, DatasetMode, FeatureRow, RowFactory, RowStream};
pub use events::{DayFile, MarketEvent, Side, StreamKind, StreamMeta};
pub use features::{
    ExtractorFactory, ExtractorKind, FeatureExtractor, FeatureSnapshot, MicrostructureExtractor,
    PassthroughExtractor,
};
pub use feed::{EventSource, EventStream, JsonlEventSource, OpenedDay, VecEventSource};
pub use fingerprint::RunFingerprint;
pub use loader::{DataLoader, LoadSummary, LoadedDataset, LoaderError};
pub use memory::{fixed_heap_probe, system_heap_probe, HeapProbe};
pub use pattern::{Condition, Direction, Operator, PatternCandidate, PatternType};
pub use pipeline::{LoadMode, MiningPipeline, MiningReport};
pub use scanner::{MethodDiagnostics, PatternScanner, ScanDiagnostics, ScanMethod, ScanReport};
pub use stats::{Lcg, ReturnStats};
pub use tester::{
    apply_bonferroni, permutation_p_value, EdgeTestResult, EdgeTests, Recommendation,
    StatisticalEdgeTester, TesterError,
};
