// CANLink Fault - Predictive fault detection
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Outlier model abstraction and persistence.

use crate::error::{FaultError, Result};
use crate::forest::IsolationForest;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Snapshot format version written by [`ModelSnapshot::save`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Score for one feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierScore {
    /// Model-specific anomaly score, higher is more anomalous.
    pub score: f64,
    pub is_outlier: bool,
}

/// Unsupervised multivariate outlier model.
pub trait OutlierModel: Send {
    /// Short model name for logs and status.
    fn name(&self) -> &'static str;

    /// Fit on row-major feature vectors, replacing any previous fit.
    fn fit(&mut self, rows: &[Vec<f64>]) -> Result<()>;

    /// Score one vector. [`FaultError::NotFitted`] before a successful fit.
    fn score(&self, row: &[f64]) -> Result<OutlierScore>;

    fn is_fitted(&self) -> bool;

    /// Unfitted model with the same parameters.
    fn fresh(&self) -> Box<dyn OutlierModel>;

    /// Serializable form of the fitted model.
    fn save(&self) -> Option<SavedModel>;
}

/// Model that never flags anything; leaves the z-score fallback in charge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoopModel {
    fitted: bool,
}

impl NoopModel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutlierModel for NoopModel {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn fit(&mut self, _rows: &[Vec<f64>]) -> Result<()> {
        self.fitted = true;
        Ok(())
    }

    fn score(&self, _row: &[f64]) -> Result<OutlierScore> {
        if !self.fitted {
            return Err(FaultError::NotFitted);
        }
        Ok(OutlierScore {
            score: 0.0,
            is_outlier: false,
        })
    }

    fn is_fitted(&self) -> bool {
        self.fitted
    }

    fn fresh(&self) -> Box<dyn OutlierModel> {
        Box::new(NoopModel::new())
    }

    fn save(&self) -> Option<SavedModel> {
        self.fitted.then_some(SavedModel::Noop)
    }
}

/// Fitted model state as stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SavedModel {
    IsolationForest(IsolationForest),
    Noop,
}

impl SavedModel {
    pub fn into_model(self) -> Box<dyn OutlierModel> {
        match self {
            SavedModel::IsolationForest(forest) => Box::new(forest),
            SavedModel::Noop => Box::new(NoopModel { fitted: true }),
        }
    }
}

/// Persisted detector model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    /// Feature order the model was fitted with.
    pub features: Vec<String>,
    /// Rows used for the fit.
    pub trained_samples: usize,
    pub model: SavedModel,
}

impl ModelSnapshot {
    pub fn new(features: Vec<String>, trained_samples: usize, model: SavedModel) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            features,
            trained_samples,
            model,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write to `path` via a temporary file so a crash never leaves a torn snapshot.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, self.to_json()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
