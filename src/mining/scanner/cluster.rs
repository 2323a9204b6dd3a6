//! Cluster scan: forward-return statistics per (cluster, horizon) of a k-means
//! model trained on the scanned rows themselves.
//!
//! The model is independent of the loader's regime model (own k, own seed,
//! own feature list). Its JSON snapshot rides on every emitted pattern so the
//! assignment can be reproduced downstream.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use super::{note_cap, warn_capped, CandidateSpec, MatchAccumulator, MethodDiagnostics, ScanUniverse};
use crate::mining::cluster::{ClusterModel, KMeansModel};
use crate::mining::config::ScannerConfig;
use crate::mining::dataset::{Dataset, FeatureRow};
use crate::mining::pattern::{Condition, Operator, PatternCandidate, PatternType, CLUSTER_FEATURE};

/// Matrix columns: configured cluster features, else the scan universe.
pub fn cluster_features(universe: &ScanUniverse, config: &ScannerConfig) -> Vec<String> {
    if config.cluster_features.is_empty() {
        universe.features.clone()
    } else {
        config.cluster_features.clone()
    }
}

fn spec(cluster: usize, horizon: usize) -> CandidateSpec {
    CandidateSpec {
        id: format!("cluster:c{}:h{}", cluster, horizon),
        pattern_type: PatternType::Cluster,
        conditions: vec![Condition::new(CLUSTER_FEATURE, Operator::Eq, cluster as f64)],
        regimes: None,
        horizon,
    }
}

fn train(matrix: &[Vec<f64>], features: &[String], config: &ScannerConfig) -> Result<KMeansModel> {
    let mut model = KMeansModel::new(config.cluster_k, config.cluster_seed);
    model
        .train(matrix, features)
        .context("cluster scan model training failed")?;
    tracing::debug!(
        rows = matrix.len(),
        clusters = model.cluster_count(),
        iterations = model.iterations(),
        "cluster scan model trained"
    );
    Ok(model)
}

pub fn scan_array(
    rows: &[FeatureRow],
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Result<Vec<PatternCandidate>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let features = cluster_features(universe, config);
    let matrix: Vec<Vec<f64>> = rows.iter().map(|r| r.vector(&features)).collect();
    let model = train(&matrix, &features, config)?;
    let labels: Vec<usize> = matrix
        .iter()
        .map(|v| model.predict(v).cluster as usize)
        .collect();
    drop(matrix);
    let snapshot = model.to_json();

    let mut out = Vec::new();
    for c in 0..model.cluster_count() {
        for &horizon in &universe.horizons {
            let mut acc = MatchAccumulator::unbounded();
            for (row, &label) in rows.iter().zip(&labels) {
                if label != c {
                    continue;
                }
                if let Some(ret) = row.forward_return(horizon) {
                    acc.push(row.index, ret);
                }
            }
            note_cap(diag, &acc);
            out.push(spec(c, horizon).finish(acc, Some(snapshot.clone())));
        }
    }
    Ok(out)
}

/// Pass 1 builds the full matrix (the scanner's memory ceiling); pass 2
/// assigns labels and accumulates under `cluster_cap`.
pub fn scan_streaming(
    dataset: &Dataset,
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Result<Vec<PatternCandidate>> {
    let features = cluster_features(universe, config);
    let mut matrix = Vec::new();
    dataset.for_each_row(|row| {
        matrix.push(row.vector(&features));
        Ok(())
    })?;
    if matrix.is_empty() {
        return Ok(Vec::new());
    }
    let model = train(&matrix, &features, config)?;
    drop(matrix);
    let snapshot = model.to_json();

    let cap = config.cluster_cap;
    let mut accs: BTreeMap<(usize, usize), MatchAccumulator> = BTreeMap::new();
    for c in 0..model.cluster_count() {
        for hi in 0..universe.horizons.len() {
            accs.insert((c, hi), MatchAccumulator::new(cap));
        }
    }

    dataset.for_each_row(|row| {
        let c = model.predict(&row.vector(&features)).cluster as usize;
        for (hi, &horizon) in universe.horizons.iter().enumerate() {
            let Some(ret) = row.forward_return(horizon) else {
                continue;
            };
            if let Some(acc) = accs.get_mut(&(c, hi)) {
                if acc.push(row.index, ret) {
                    warn_capped(&spec(c, horizon).id, cap);
                }
            }
        }
        Ok(())
    })?;

    Ok(accs
        .into_iter()
        .map(|((c, hi), acc)| {
            note_cap(diag, &acc);
            spec(c, universe.horizons[hi]).finish(acc, Some(snapshot.clone()))
        })
        .collect())
}
