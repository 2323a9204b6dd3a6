//! Quantile scan: rows below a low order statistic or above a high one.
//!
//! Cutoffs are floor-index order statistics of the ascending-sorted finite
//! sample (`sorted[floor(N * q)]`, no interpolation). Recorded fixtures depend
//! on this convention.

use anyhow::Result;
use std::collections::BTreeMap;

use super::{
    id_number, note_cap, warn_capped, CandidateSpec, MatchAccumulator, MethodDiagnostics,
    ScanUniverse,
};
use crate::mining::config::ScannerConfig;
use crate::mining::dataset::{Dataset, FeatureRow};
use crate::mining::pattern::{Condition, Operator, PatternCandidate, PatternType};

/// (feature, level, horizon)
type ConfigKey = (usize, usize, usize);

/// `sorted[floor(N * q)]`, index clamped to the last element.
pub fn floor_quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Levels below the median select the low tail.
fn operator(q: f64) -> Operator {
    if q < 0.5 {
        Operator::Lt
    } else {
        Operator::Gt
    }
}

/// Per-feature, per-level cutoffs; `None` for features with no values.
fn cutoffs(values: Vec<Vec<f64>>, levels: &[f64]) -> Vec<Option<Vec<f64>>> {
    values
        .into_iter()
        .map(|mut v| {
            v.sort_by(f64::total_cmp);
            levels
                .iter()
                .map(|&q| floor_quantile(&v, q))
                .collect::<Option<Vec<f64>>>()
        })
        .collect()
}

fn collect_value(values: &mut [Vec<f64>], universe: &ScanUniverse, row: &FeatureRow) {
    for (fi, feature) in universe.features.iter().enumerate() {
        if let Some(v) = row.feature(feature).filter(|v| v.is_finite()) {
            values[fi].push(v);
        }
    }
}

fn spec(universe: &ScanUniverse, levels: &[f64], cutoff: f64, key: ConfigKey) -> CandidateSpec {
    let (fi, li, hi) = key;
    let feature = &universe.features[fi];
    let q = levels[li];
    let op = operator(q);
    let horizon = universe.horizons[hi];
    CandidateSpec {
        id: format!(
            "quantile:{}:{}:p{}:h{}",
            feature,
            if op == Operator::Lt { "below" } else { "above" },
            id_number(q * 100.0),
            horizon
        ),
        pattern_type: PatternType::Quantile,
        conditions: vec![Condition::new(feature.clone(), op, cutoff)],
        regimes: None,
        horizon,
    }
}

pub fn scan_array(
    rows: &[FeatureRow],
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Vec<PatternCandidate> {
    let levels = &config.quantile_levels;
    let mut values = vec![Vec::new(); universe.features.len()];
    for row in rows {
        collect_value(&mut values, universe, row);
    }
    let cutoffs = cutoffs(values, levels);

    let mut out = Vec::new();
    for (fi, feature) in universe.features.iter().enumerate() {
        let Some(feature_cutoffs) = &cutoffs[fi] else {
            continue;
        };
        for (li, &q) in levels.iter().enumerate() {
            let cutoff = feature_cutoffs[li];
            let op = operator(q);
            for (hi, &horizon) in universe.horizons.iter().enumerate() {
                let mut acc = MatchAccumulator::unbounded();
                for row in rows {
                    let matched = row.feature(feature).map_or(false, |v| op.matches(v, cutoff));
                    if !matched {
                        continue;
                    }
                    if let Some(ret) = row.forward_return(horizon) {
                        acc.push(row.index, ret);
                    }
                }
                note_cap(diag, &acc);
                out.push(spec(universe, levels, cutoff, (fi, li, hi)).finish(acc, None));
            }
        }
    }
    out
}

/// Pass 1 collects every per-feature value; pass 2 matches against the fixed
/// cutoffs under `threshold_cap`.
pub fn scan_streaming(
    dataset: &Dataset,
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Result<Vec<PatternCandidate>> {
    let levels = &config.quantile_levels;
    let cap = config.threshold_cap;

    let mut values = vec![Vec::new(); universe.features.len()];
    dataset.for_each_row(|row| {
        collect_value(&mut values, universe, row);
        Ok(())
    })?;
    let cutoffs = cutoffs(values, levels);

    let mut accs: BTreeMap<ConfigKey, MatchAccumulator> = BTreeMap::new();
    for (fi, feature_cutoffs) in cutoffs.iter().enumerate() {
        if feature_cutoffs.is_none() {
            continue;
        }
        for li in 0..levels.len() {
            for hi in 0..universe.horizons.len() {
                accs.insert((fi, li, hi), MatchAccumulator::new(cap));
            }
        }
    }

    dataset.for_each_row(|row| {
        for (fi, feature) in universe.features.iter().enumerate() {
            let (Some(feature_cutoffs), Some(value)) = (&cutoffs[fi], row.feature(feature)) else {
                continue;
            };
            for (li, &q) in levels.iter().enumerate() {
                let cutoff = feature_cutoffs[li];
                if !operator(q).matches(value, cutoff) {
                    continue;
                }
                for (hi, &horizon) in universe.horizons.iter().enumerate() {
                    let Some(ret) = row.forward_return(horizon) else {
                        continue;
                    };
                    if let Some(acc) = accs.get_mut(&(fi, li, hi)) {
                        if acc.push(row.index, ret) {
                            warn_capped(&spec(universe, levels, cutoff, (fi, li, hi)).id, cap);
                        }
                    }
                }
            }
        }
        Ok(())
    })?;

    Ok(accs
        .into_iter()
        .filter_map(|((fi, li, hi), acc)| {
            let cutoff = cutoffs[fi].as_ref()?[li];
            note_cap(diag, &acc);
            Some(spec(universe, levels, cutoff, (fi, li, hi)).finish(acc, None))
        })
        .collect())
}
