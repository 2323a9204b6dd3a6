//! Edge Miner Library
//!
//! Mines historical market-microstructure feature data for statistically
//! defensible predictive patterns. Exposes the mining engine for use by the
//! binaries and integration tests.

pub mod mining;
