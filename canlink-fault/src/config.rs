// CANLink Fault - Predictive fault detection
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Fault detector configuration.

use crate::forest::IsolationForest;
use crate::model::{NoopModel, OutlierModel};
use serde::{Deserialize, Serialize};

/// Master configuration for the fault detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Ordered feature vector. A reading set missing any of these is skipped.
    pub features: Vec<String>,

    /// Ring buffer capacity (vectors).
    pub buffer_capacity: usize,

    /// Buffered vectors required before any verdict is produced.
    pub min_samples: usize,

    /// Lower bound on the training threshold.
    pub min_training_floor: usize,

    /// Training vectors required per feature.
    pub samples_per_feature: usize,

    /// Statistical fallback settings.
    pub fallback: FallbackConfig,

    /// Outlier model selection.
    pub model: ModelKind,

    /// Isolation forest parameters.
    pub forest: ForestConfig,
}

impl DetectorConfig {
    /// Detector over the given features with default tuning.
    pub fn with_features<I, S>(features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: features.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Samples needed before the first fit: `max(floor, per_feature * features)`.
    pub fn min_training(&self) -> usize {
        self.min_training_floor
            .max(self.samples_per_feature * self.features.len())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            features: vec![
                "Engine_RPM".to_string(),
                "Coolant_Temp".to_string(),
                "Oil_Pressure".to_string(),
                "Battery_Voltage".to_string(),
                "Engine_Load".to_string(),
            ],
            buffer_capacity: 512,
            min_samples: 20,
            min_training_floor: 60,
            samples_per_feature: 15,
            fallback: FallbackConfig::default(),
            model: ModelKind::IsolationForest,
            forest: ForestConfig::default(),
        }
    }
}

/// Per-feature z-score fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Most recent buffered samples compared against.
    pub window: usize,
    /// Flag when any feature exceeds this |z|.
    pub z_threshold: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            window: 50,
            z_threshold: 3.5,
        }
    }
}

/// Which outlier model backs the detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    IsolationForest,
    /// Fallback-only operation.
    Noop,
}

impl ModelKind {
    /// Build an unfitted model.
    pub fn build(&self, forest: &ForestConfig) -> Box<dyn OutlierModel> {
        match self {
            ModelKind::IsolationForest => Box::new(IsolationForest::new(forest.clone())),
            ModelKind::Noop => Box::new(NoopModel::new()),
        }
    }
}

/// Isolation forest parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForestConfig {
    /// Number of isolation trees.
    pub n_trees: usize,
    /// Rows subsampled per tree.
    pub sample_size: usize,
    /// Expected outlier fraction in training data; sets the score cut-off.
    pub contamination: f64,
    /// RNG seed. Fits are deterministic for a given seed and training set.
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            sample_size: 256,
            contamination: 0.01,
            seed: 42,
        }
    }
}
