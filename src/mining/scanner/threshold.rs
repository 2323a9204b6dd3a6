//! Threshold scan: `feature > +level` / `feature < -level`, optionally
//! restricted to one observed regime.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    id_number, note_cap, warn_capped, CandidateSpec, MatchAccumulator, MethodDiagnostics,
    ScanUniverse,
};
use crate::mining::config::ScannerConfig;
use crate::mining::dataset::{Dataset, FeatureRow};
use crate::mining::pattern::{Condition, Operator, PatternCandidate, PatternType};

const POLARITIES: [Operator; 2] = [Operator::Gt, Operator::Lt];

/// (feature, level, polarity, horizon, regime); ordered like the array scan.
type ConfigKey = (usize, usize, usize, usize, Option<i32>);

fn bound(level: f64, polarity: Operator) -> f64 {
    match polarity {
        Operator::Lt => -level,
        _ => level,
    }
}

fn spec(universe: &ScanUniverse, levels: &[f64], key: ConfigKey) -> CandidateSpec {
    let (fi, li, pi, hi, regime) = key;
    let feature = &universe.features[fi];
    let polarity = POLARITIES[pi];
    let level = levels[li];
    let horizon = universe.horizons[hi];
    let id = format!(
        "threshold:{}:{}:{}:h{}:{}",
        feature,
        if polarity == Operator::Gt { "gt" } else { "lt" },
        id_number(level),
        horizon,
        match regime {
            Some(r) => format!("r{}", r),
            None => "all".to_string(),
        }
    );
    CandidateSpec {
        id,
        pattern_type: PatternType::Threshold,
        conditions: vec![Condition::new(feature.clone(), polarity, bound(level, polarity))],
        regimes: regime.map(|r| BTreeSet::from([r])),
        horizon,
    }
}

/// Every configuration key in emission order.
fn enumerate(universe: &ScanUniverse, levels: usize, regimes: &BTreeSet<i32>) -> Vec<ConfigKey> {
    let mut keys = Vec::new();
    for fi in 0..universe.features.len() {
        for li in 0..levels {
            for pi in 0..POLARITIES.len() {
                for hi in 0..universe.horizons.len() {
                    keys.push((fi, li, pi, hi, None));
                    keys.extend(regimes.iter().map(|&r| (fi, li, pi, hi, Some(r))));
                }
            }
        }
    }
    keys
}

/// Direct scan of materialized rows, one configuration at a time.
pub fn scan_array(
    rows: &[FeatureRow],
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Vec<PatternCandidate> {
    let levels = &config.threshold_levels;
    let regimes: BTreeSet<i32> = rows.iter().map(|r| r.regime).collect();

    enumerate(universe, levels.len(), &regimes)
        .into_iter()
        .map(|key| {
            let (fi, li, pi, hi, regime) = key;
            let feature = &universe.features[fi];
            let polarity = POLARITIES[pi];
            let b = bound(levels[li], polarity);
            let horizon = universe.horizons[hi];

            let mut acc = MatchAccumulator::unbounded();
            for row in rows {
                if regime.map_or(false, |r| r != row.regime) {
                    continue;
                }
                let Some(value) = row.feature(feature) else {
                    continue;
                };
                if !polarity.matches(value, b) {
                    continue;
                }
                if let Some(ret) = row.forward_return(horizon) {
                    acc.push(row.index, ret);
                }
            }
            note_cap(diag, &acc);
            spec(universe, levels, key).finish(acc, None)
        })
        .collect()
}

/// Single pass over the dataset, every configuration accumulating at once
/// under `threshold_cap`.
pub fn scan_streaming(
    dataset: &Dataset,
    universe: &ScanUniverse,
    config: &ScannerConfig,
    diag: &mut MethodDiagnostics,
) -> Result<Vec<PatternCandidate>> {
    let levels = &config.threshold_levels;
    let cap = config.threshold_cap;
    let mut accs: BTreeMap<ConfigKey, MatchAccumulator> = BTreeMap::new();
    let mut regimes = BTreeSet::new();
    // Unconstrained configurations exist regardless of which regimes appear.
    for key in enumerate(universe, levels.len(), &BTreeSet::new()) {
        accs.insert(key, MatchAccumulator::new(cap));
    }

    dataset.for_each_row(|row| {
        regimes.insert(row.regime);
        for (fi, feature) in universe.features.iter().enumerate() {
            let Some(value) = row.feature(feature) else {
                continue;
            };
            for (li, level) in levels.iter().enumerate() {
                for (pi, polarity) in POLARITIES.iter().enumerate() {
                    if !polarity.matches(value, bound(*level, *polarity)) {
                        continue;
                    }
                    for (hi, horizon) in universe.horizons.iter().enumerate() {
                        let Some(ret) = row.forward_return(*horizon) else {
                            continue;
                        };
                        for key in [(fi, li, pi, hi, None), (fi, li, pi, hi, Some(row.regime))] {
                            let acc = accs
                                .entry(key)
                                .or_insert_with(|| MatchAccumulator::new(cap));
                            if acc.push(row.index, ret) {
                                warn_capped(&spec(universe, levels, key).id, cap);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    })?;

    // Regime-constrained configurations with no matches still count.
    for key in enumerate(universe, levels.len(), &regimes) {
        accs.entry(key).or_insert_with(|| MatchAccumulator::new(cap));
    }

    Ok(accs
        .into_iter()
        .map(|(key, acc)| {
            note_cap(diag, &acc);
            spec(universe, levels, key).finish(acc, None)
        })
        .collect())
}
