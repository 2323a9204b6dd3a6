//! Cluster Models
//!
//! The regime labeller and the cluster scan both consume a clustering model
//! through the narrow `ClusterModel` seam: train once, then predict
//! read-only. `KMeansModel` is the in-tree implementation:
//!
//! - z-score standardisation per input dimension (zero spread => scale 1)
//! - k-means++ seeding from a `ChaCha8Rng` seeded by configuration
//! - Lloyd iterations until assignments stop changing
//!
//! Identical vectors + feature order + seed always produce identical
//! centroids, so labels are reproducible across runs and across files.

use anyhow::{bail, Result};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Lloyd iteration limit.
const MAX_ITERATIONS: usize = 100;

/// Result of `predict`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub cluster: i32,
    /// Inverse-distance share of the winning centroid, in (0, 1].
    pub confidence: f64,
}

/// Externally trained clustering model.
pub trait ClusterModel: Send + Sync {
    /// Fit on `vectors`, each laid out in `feature_order`.
    fn train(&mut self, vectors: &[Vec<f64>], feature_order: &[String]) -> Result<()>;

    /// Assign a vector laid out in the training feature order. Missing trailing
    /// components are read as 0.
    fn predict(&self, vector: &[f64]) -> ClusterAssignment;

    /// Serialisable snapshot of the trained state.
    fn to_json(&self) -> serde_json::Value;

    fn feature_order(&self) -> &[String];

    fn is_trained(&self) -> bool;
}

/// Deterministic k-means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansModel {
    pub k: usize,
    pub seed: u64,
    feature_order: Vec<String>,
    means: Vec<f64>,
    scales: Vec<f64>,
    /// Centroids in standardised space.
    centroids: Vec<Vec<f64>>,
    iterations: usize,
    inertia: f64,
    training_rows: usize,
    trained: bool,
}

impl KMeansModel {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            k,
            seed,
            feature_order: Vec::new(),
            means: Vec::new(),
            scales: Vec::new(),
            centroids: Vec::new(),
            iterations: 0,
            inertia: 0.0,
            training_rows: 0,
            trained: false,
        }
    }

    /// Number of fitted centroids (`min(k, rows)`).
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn inertia(&self) -> f64 {
        self.inertia
    }

    fn standardise(&self, vector: &[f64]) -> Vec<f64> {
        self.means
            .iter()
            .zip(&self.scales)
            .enumerate()
            .map(|(d, (mean, scale))| {
                let x = vector.get(d).copied().filter(|v| v.is_finite()).unwrap_or(0.0);
                (x - mean) / scale
            })
            .collect()
    }

    fn fit_scaling(&mut self, vectors: &[Vec<f64>], dims: usize) {
        let n = vectors.len() as f64;
        self.means = vec![0.0; dims];
        self.scales = vec![1.0; dims];
        for d in 0..dims {
            let mean = vectors.iter().map(|v| component(v, d)).sum::<f64>() / n;
            let var = vectors
                .iter()
                .map(|v| (component(v, d) - mean).powi(2))
                .sum::<f64>()
                / n;
            self.means[d] = mean;
            let std = var.sqrt();
            self.scales[d] = if std > 1e-12 { std } else { 1.0 };
        }
    }

    fn seed_centroids(&self, points: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut centroids: Vec<Vec<f64>> = Vec::with_capacity(k);
        centroids.push(points[rng.gen_range(0..points.len())].clone());

        let mut nearest: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &centroids[0]))
            .collect();

        while centroids.len() < k {
            let total: f64 = nearest.iter().sum();
            let next = if total > 0.0 {
                let mut target = rng.gen::<f64>() * total;
                let mut chosen = points.len() - 1;
                for (i, d) in nearest.iter().enumerate() {
                    if target < *d {
                        chosen = i;
                        break;
                    }
                    target -= d;
                }
                chosen
            } else {
                // Every point coincides with a centroid already.
                rng.gen_range(0..points.len())
            };
            centroids.push(points[next].clone());
            let added = centroids.len() - 1;
            for (i, p) in points.iter().enumerate() {
                let d = squared_distance(p, &centroids[added]);
                if d < nearest[i] {
                    nearest[i] = d;
                }
            }
        }
        centroids
    }
}

impl ClusterModel for KMeansModel {
    fn train(&mut self, vectors: &[Vec<f64>], feature_order: &[String]) -> Result<()> {
        if vectors.is_empty() {
            bail!("cannot train k-means on zero vectors");
        }
        if self.k == 0 {
            bail!("k-means requires k >= 1");
        }
        let dims = feature_order.len();
        self.feature_order = feature_order.to_vec();
        self.fit_scaling(vectors, dims);

        let points: Vec<Vec<f64>> = vectors.iter().map(|v| self.standardise(v)).collect();
        let k = self.k.min(points.len());
        let mut centroids = self.seed_centroids(&points, k);

        let mut assignments = vec![usize::MAX; points.len()];
        let mut iterations = 0;
        for _ in 0..MAX_ITERATIONS {
            iterations += 1;
            let mut changed = false;
            for (i, p) in points.iter().enumerate() {
                let best = nearest_centroid(p, &centroids).0;
                if assignments[i] != best {
                    assignments[i] = best;
                    changed = true;
                }
            }
            if !changed {
                break;
            }

            let mut sums = vec![vec![0.0; dims]; k];
            let mut counts = vec![0usize; k];
            for (p, &c) in points.iter().zip(&assignments) {
                counts[c] += 1;
                for (s, x) in sums[c].iter_mut().zip(p) {
                    *s += x;
                }
            }
            for c in 0..k {
                // An empty cluster keeps its previous centroid.
                if counts[c] > 0 {
                    centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
                }
            }
        }

        self.inertia = points
            .iter()
            .zip(&assignments)
            .map(|(p, &c)| squared_distance(p, &centroids[c]))
            .sum();
        self.centroids = centroids;
        self.iterations = iterations;
        self.training_rows = points.len();
        self.trained = true;

        tracing::debug!(
            k,
            rows = self.training_rows,
            iterations,
            inertia = self.inertia,
            "k-means trained"
        );
        Ok(())
    }

    fn predict(&self, vector: &[f64]) -> ClusterAssignment {
        if self.centroids.is_empty() {
            return ClusterAssignment {
                cluster: 0,
                confidence: 0.0,
            };
        }
        let point = self.standardise(vector);
        let (best, best_dist) = nearest_centroid(&point, &self.centroids);

        let confidence = if self.centroids.len() == 1 || best_dist <= 1e-24 {
            1.0
        } else {
            let inv = |d: f64| 1.0 / (d.sqrt() + 1e-12);
            let total: f64 = self
                .centroids
                .iter()
                .map(|c| inv(squared_distance(&point, c)))
                .sum();
            inv(best_dist) / total
        };

        ClusterAssignment {
            cluster: best as i32,
            confidence,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    fn feature_order(&self) -> &[String] {
        &self.feature_order
    }

    fn is_trained(&self) -> bool {
        self.trained
    }
}

#[inline]
fn component(v: &[f64], d: usize) -> f64 {
    v.get(d).copied().filter(|x| x.is_finite()).unwrap_or(0.0)
}

#[inline]
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Nearest centroid; ties go to the lowest index.
fn nearest_centroid(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (j, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best_dist {
            best_dist = d;
            best = j;
        }
    }
    (best, best_dist)
}
