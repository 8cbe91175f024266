// CANLink Fault - Predictive fault detection
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Isolation forest.
//!
//! Each tree recursively splits a random subsample on a random feature at a
//! random threshold until points are isolated or the height limit is hit.
//! Outliers isolate in few splits, so a short average path means a high
//! anomaly score:
//!
//! ```text
//! s(x) = 2 ^ ( -E[h(x)] / c(psi) )
//! ```
//!
//! where `c(n)` is the average unsuccessful-search path length of a binary
//! search tree over `n` points. The outlier cut-off is the training-score
//! quantile at `1 - contamination`.

use crate::config::ForestConfig;
use crate::error::{FaultError, Result};
use crate::model::{OutlierModel, OutlierScore, SavedModel};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// One isolation tree stored as a node arena, root at index 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(rows: Vec<&[f64]>, height_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(rows, 0, height_limit, rng);
        tree
    }

    fn grow(&mut self, rows: Vec<&[f64]>, depth: usize, limit: usize, rng: &mut StdRng) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= limit || rows.len() <= 1 {
            return index;
        }

        // Only features that still vary can split
        let dims = rows[0].len();
        let candidates: Vec<(usize, f64, f64)> = (0..dims)
            .filter_map(|f| {
                let (lo, hi) = rows
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
                        (lo.min(r[f]), hi.max(r[f]))
                    });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if candidates.is_empty() {
            return index;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);
        let (left_rows, right_rows): (Vec<&[f64]>, Vec<&[f64]>) =
            rows.into_iter().partition(|r| r[feature] < threshold);

        let left = self.grow(left_rows, depth + 1, limit, rng);
        let right = self.grow(right_rows, depth + 1, limit, rng);
        self.nodes[index] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        index
    }

    fn path_length(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Isolation forest outlier model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    config: ForestConfig,
    trees: Vec<IsolationTree>,
    /// Subsample size actually used (psi)
    sample_size: usize,
    dims: usize,
    /// Scores above this are outliers
    threshold: f64,
}

impl IsolationForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            trees: Vec::new(),
            sample_size: 0,
            dims: 0,
            threshold: 1.0,
        }
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    /// Score cut-off learned at fit time.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    fn anomaly_score(&self, row: &[f64]) -> f64 {
        let mean_path = self.trees.iter().map(|t| t.path_length(row)).sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self::new(ForestConfig::default())
    }
}

impl OutlierModel for IsolationForest {
    fn name(&self) -> &'static str {
        "isolation_forest"
    }

    fn fit(&mut self, rows: &[Vec<f64>]) -> Result<()> {
        if rows.len() < 2 {
            return Err(FaultError::InsufficientData {
                needed: 2,
                got: rows.len(),
            });
        }
        let dims = rows[0].len();
        if let Some(bad) = rows.iter().find(|r| r.len() != dims) {
            return Err(FaultError::FeatureCountMismatch {
                expected: dims,
                got: bad.len(),
            });
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let psi = self.config.sample_size.clamp(2, rows.len());
        let height_limit = (psi as f64).log2().ceil() as usize;

        let trees: Vec<IsolationTree> = (0..self.config.n_trees.max(1))
            .map(|_| {
                let subsample: Vec<&[f64]> = rand::seq::index::sample(&mut rng, rows.len(), psi)
                    .iter()
                    .map(|i| rows[i].as_slice())
                    .collect();
                IsolationTree::build(subsample, height_limit, &mut rng)
            })
            .collect();

        self.trees = trees;
        self.sample_size = psi;
        self.dims = dims;

        let mut scores: Vec<f64> = rows.iter().map(|r| self.anomaly_score(r)).collect();
        scores.sort_by(f64::total_cmp);
        let quantile = 1.0 - self.config.contamination.clamp(0.0, 0.5);
        let idx = ((scores.len() as f64 * quantile).ceil() as usize)
            .saturating_sub(1)
            .min(scores.len() - 1);
        self.threshold = scores[idx];
        Ok(())
    }

    fn score(&self, row: &[f64]) -> Result<OutlierScore> {
        if self.trees.is_empty() {
            return Err(FaultError::NotFitted);
        }
        if row.len() != self.dims {
            return Err(FaultError::FeatureCountMismatch {
                expected: self.dims,
                got: row.len(),
            });
        }
        let score = self.anomaly_score(row);
        Ok(OutlierScore {
            score,
            is_outlier: score > self.threshold,
        })
    }

    fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    fn fresh(&self) -> Box<dyn OutlierModel> {
        Box::new(IsolationForest::new(self.config.clone()))
    }

    fn save(&self) -> Option<SavedModel> {
        self.is_fitted().then(|| SavedModel::IsolationForest(self.clone()))
    }
}
