// CANLink Fault - Predictive fault detection
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! FaultDetector - buffering, training and scoring state machine.
//!
//! ```text
//!            min_training samples, fit ok
//! Buffering ─────────────────────────────► Trained
//!     ▲                                       │
//!     └──────────── model NotFitted ──────────┘
//! ```
//!
//! The z-score fallback runs in both states and is the only signal while
//! buffering.

use crate::config::DetectorConfig;
use crate::error::{FaultError, Result};
use crate::model::{ModelSnapshot, OutlierModel, OutlierScore, SNAPSHOT_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Deviation floor for features whose recent history is constant
const MIN_STD: f64 = 1e-6;

/// Detector lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Buffering,
    Trained,
}

impl DetectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorState::Buffering => "buffering",
            DetectorState::Trained => "trained",
        }
    }
}

/// Largest per-feature deviation found by the fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDeviation {
    pub feature: String,
    pub z_score: f64,
}

/// Result of scoring one feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultVerdict {
    /// Combined decision: model outlier or fallback exceedance.
    pub is_anomaly: bool,
    pub state: DetectorState,
    /// Model output, absent while buffering.
    pub model: Option<OutlierScore>,
    /// Fallback exceeded its threshold.
    pub fallback_flagged: bool,
    /// Feature with the largest |z|, if any feature could be scored.
    pub top_deviation: Option<FeatureDeviation>,
    /// The scored vector keyed by feature.
    pub sample: BTreeMap<String, f64>,
}

impl FaultVerdict {
    /// Model and fallback agree.
    pub fn is_confirmed(&self) -> bool {
        self.fallback_flagged && self.model.map_or(false, |m| m.is_outlier)
    }
}

/// Running counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorStats {
    pub samples_seen: u64,
    pub samples_skipped: u64,
    pub fits: u64,
    pub failed_fits: u64,
    pub anomalies: u64,
}

/// Predictive fault detector.
pub struct FaultDetector {
    config: DetectorConfig,
    state: DetectorState,
    buffer: VecDeque<Vec<f64>>,
    model: Box<dyn OutlierModel>,
    /// Samples seen since the last failed fit; gates the retry.
    since_failed_fit: Option<usize>,
    retrain_requested: bool,
    model_path: Option<PathBuf>,
    stats: DetectorStats,
}

impl FaultDetector {
    /// Create a detector using the model selected in `config`.
    pub fn new(config: DetectorConfig) -> Self {
        let model = config.model.build(&config.forest);
        Self::with_model(config, model)
    }

    /// Create a detector around a caller-supplied model.
    pub fn with_model(config: DetectorConfig, model: Box<dyn OutlierModel>) -> Self {
        let capacity = config.buffer_capacity.max(1);
        Self {
            config,
            state: DetectorState::Buffering,
            buffer: VecDeque::with_capacity(capacity),
            model,
            since_failed_fit: None,
            retrain_requested: false,
            model_path: None,
            stats: DetectorStats::default(),
        }
    }

    /// Persist fitted models to `path`, loading an existing snapshot first.
    ///
    /// A compatible snapshot puts the detector straight into `Trained`. An
    /// unreadable or mismatched one is ignored with a warning.
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.exists() {
            match self.load_model(&path) {
                Ok(()) => info!(path = %path.display(), "Loaded fault model"),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring saved fault model"),
            }
        }
        self.model_path = Some(path);
        self
    }

    /// Install a model snapshot from disk.
    pub fn load_model(&mut self, path: &Path) -> Result<()> {
        let snapshot = ModelSnapshot::load(path)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(FaultError::VersionMismatch {
                saved: snapshot.version,
                supported: SNAPSHOT_VERSION,
            });
        }
        if snapshot.features != self.config.features {
            return Err(FaultError::FeatureSetMismatch {
                saved: snapshot.features,
                configured: self.config.features.clone(),
            });
        }
        let model = snapshot.model.into_model();
        if !model.is_fitted() {
            return Err(FaultError::NotFitted);
        }
        self.model = model;
        self.state = DetectorState::Trained;
        Ok(())
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Refit at the next update that has enough samples, even when trained.
    pub fn request_retrain(&mut self) {
        self.retrain_requested = true;
    }

    pub fn retrain_pending(&self) -> bool {
        self.retrain_requested
    }

    /// Feed one reading set.
    ///
    /// Returns `None` when a configured feature is missing or non-finite, and
    /// while fewer than `min_samples` vectors are buffered.
    pub fn update(&mut self, readings: &BTreeMap<String, f64>) -> Option<FaultVerdict> {
        let Some(vector) = self.extract(readings) else {
            self.stats.samples_skipped += 1;
            return None;
        };
        self.stats.samples_seen += 1;

        let top_deviation = self.fallback_deviation(&vector);

        self.buffer.push_back(vector.clone());
        while self.buffer.len() > self.config.buffer_capacity.max(1) {
            self.buffer.pop_front();
        }
        if let Some(n) = self.since_failed_fit.as_mut() {
            *n += 1;
        }

        self.maybe_fit();

        if self.buffer.len() < self.config.min_samples {
            return None;
        }

        let model = self.score_with_model(&vector);
        let fallback_flagged = top_deviation
            .as_ref()
            .map_or(false, |d| d.z_score.abs() > self.config.fallback.z_threshold);
        let is_anomaly = fallback_flagged || model.map_or(false, |m| m.is_outlier);
        if is_anomaly {
            self.stats.anomalies += 1;
        }

        let sample = self
            .config
            .features
            .iter()
            .cloned()
            .zip(vector.iter().copied())
            .collect();

        Some(FaultVerdict {
            is_anomaly,
            state: self.state,
            model,
            fallback_flagged,
            top_deviation,
            sample,
        })
    }

    /// Fit on historical reading sets, bypassing the buffer.
    ///
    /// Rows missing any feature are dropped. Fails with
    /// [`FaultError::NoValidRows`] when none remain; the detector is left
    /// untouched on any error. Returns the number of rows used.
    pub fn train(&mut self, records: &[BTreeMap<String, f64>]) -> Result<usize> {
        let rows: Vec<Vec<f64>> = records.iter().filter_map(|r| self.extract(r)).collect();
        if rows.is_empty() {
            return Err(FaultError::NoValidRows {
                features: self.config.features.clone(),
            });
        }

        let mut model = self.model.fresh();
        model.fit(&rows)?;
        self.install(model, rows.len());
        Ok(rows.len())
    }

    fn extract(&self, readings: &BTreeMap<String, f64>) -> Option<Vec<f64>> {
        self.config
            .features
            .iter()
            .map(|f| readings.get(f).copied().filter(|v| v.is_finite()))
            .collect()
    }

    /// Per-feature z-score of `vector` against the most recent buffered
    /// samples. A constant history uses [`MIN_STD`], so any change from it
    /// scores far above the threshold.
    fn fallback_deviation(&self, vector: &[f64]) -> Option<FeatureDeviation> {
        let window = self.config.fallback.window.max(1);
        let start = self.buffer.len().saturating_sub(window);
        let history = self.buffer.range(start..);
        let n = self.buffer.len() - start;
        if n < 2 {
            return None;
        }

        let mut top: Option<FeatureDeviation> = None;
        for (i, feature) in self.config.features.iter().enumerate() {
            let mean = history.clone().map(|row| row[i]).sum::<f64>() / n as f64;
            let variance =
                history.clone().map(|row| (row[i] - mean).powi(2)).sum::<f64>() / n as f64;
            let std = variance.sqrt().max(MIN_STD);
            let z = (vector[i] - mean) / std;
            if top.as_ref().map_or(true, |t| z.abs() > t.z_score.abs()) {
                top = Some(FeatureDeviation {
                    feature: feature.clone(),
                    z_score: z,
                });
            }
        }
        top
    }

    fn maybe_fit(&mut self) {
        let min_training = self.config.min_training();
        if self.buffer.len() < min_training {
            return;
        }
        let due = match self.state {
            DetectorState::Buffering => self
                .since_failed_fit
                .map_or(true, |n| n >= min_training),
            DetectorState::Trained => self.retrain_requested,
        };
        if due || self.retrain_requested {
            self.fit_from_buffer();
        }
    }

    fn fit_from_buffer(&mut self) {
        let min_training = self.config.min_training();
        let start = self.buffer.len().saturating_sub(min_training);
        let rows: Vec<Vec<f64>> = self.buffer.range(start..).cloned().collect();

        let mut model = self.model.fresh();
        match model.fit(&rows) {
            Ok(()) => self.install(model, rows.len()),
            Err(e) => {
                self.stats.failed_fits += 1;
                self.since_failed_fit = Some(0);
                self.retrain_requested = false;
                warn!(error = %e, "Fault model fit failed, using statistical fallback");
            }
        }
    }

    fn install(&mut self, model: Box<dyn OutlierModel>, trained_samples: usize) {
        self.model = model;
        self.state = DetectorState::Trained;
        self.since_failed_fit = None;
        self.retrain_requested = false;
        self.stats.fits += 1;
        info!(
            model = self.model.name(),
            samples = trained_samples,
            "Fault model trained"
        );

        if let Some(path) = &self.model_path {
            if let Some(saved) = self.model.save() {
                let snapshot =
                    ModelSnapshot::new(self.config.features.clone(), trained_samples, saved);
                if let Err(e) = snapshot.save(path) {
                    warn!(path = %path.display(), error = %e, "Failed to persist fault model");
                }
            }
        }
    }

    fn score_with_model(&mut self, vector: &[f64]) -> Option<OutlierScore> {
        if self.state != DetectorState::Trained {
            return None;
        }
        match self.model.score(vector) {
            Ok(score) => Some(score),
            Err(FaultError::NotFitted) => {
                debug!("Model reported not fitted, refitting");
                self.state = DetectorState::Buffering;
                if self.buffer.len() >= self.config.min_training() {
                    self.fit_from_buffer();
                }
                if self.state == DetectorState::Trained {
                    self.model.score(vector).ok()
                } else {
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, "Fault model scoring failed");
                None
            }
        }
    }
}

impl std::fmt::Debug for FaultDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultDetector")
            .field("state", &self.state)
            .field("model", &self.model.name())
            .field("buffered", &self.buffer.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelKind;
    use crate::model::NoopModel;

    fn reading_set(rpm: f64, temp: f64) -> BTreeMap<String, f64> {
        let mut set = BTreeMap::new();
        set.insert("Engine_RPM".to_string(), rpm);
        set.insert("Coolant_Temp".to_string(), temp);
        set
    }

    fn two_feature_config() -> DetectorConfig {
        DetectorConfig::with_features(["Engine_RPM", "Coolant_Temp"])
    }

    /// Small deterministic wobble around a fixed operating point.
    fn stable(i: usize) -> BTreeMap<String, f64> {
        let wobble = (i % 7) as f64 - 3.0;
        reading_set(800.0 + wobble * 10.0, 90.0 + wobble * 0.5)
    }

    #[test]
    fn test_none_below_min_samples() {
        let mut detector = FaultDetector::new(two_feature_config());
        for i in 0..19 {
            assert!(detector.update(&stable(i)).is_none());
        }
        assert!(detector.update(&stable(19)).is_some());
    }

    #[test]
    fn test_missing_feature_skipped() {
        let mut detector = FaultDetector::new(two_feature_config());
        let mut partial = BTreeMap::new();
        partial.insert("Engine_RPM".to_string(), 800.0);
        assert!(detector.update(&partial).is_none());
        assert_eq!(detector.buffered(), 0);
        assert_eq!(detector.stats().samples_skipped, 1);
    }

    #[test]
    fn test_trains_at_threshold() {
        let mut detector = FaultDetector::new(two_feature_config());
        for i in 0..59 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.state(), DetectorState::Buffering);
        detector.update(&stable(59));
        assert_eq!(detector.state(), DetectorState::Trained);
        assert_eq!(detector.stats().fits, 1);
    }

    #[test]
    fn test_fallback_flags_outlier_while_buffering() {
        let mut detector = FaultDetector::new(two_feature_config());
        for i in 0..30 {
            let verdict = detector.update(&stable(i));
            if let Some(v) = verdict {
                assert!(!v.is_anomaly);
            }
        }
        let verdict = detector.update(&reading_set(800.0, 140.0)).unwrap();
        assert_eq!(verdict.state, DetectorState::Buffering);
        assert!(verdict.is_anomaly);
        assert!(verdict.fallback_flagged);
        assert!(verdict.model.is_none());
        assert_eq!(verdict.top_deviation.unwrap().feature, "Coolant_Temp");
    }

    #[test]
    fn test_flat_history_flags_change() {
        let mut detector = FaultDetector::new(two_feature_config());
        for _ in 0..100 {
            detector.update(&reading_set(800.0, 90.0));
        }
        assert_eq!(detector.state(), DetectorState::Trained);

        let steady = detector.update(&reading_set(800.0, 90.0)).unwrap();
        assert!(!steady.is_anomaly);

        let verdict = detector.update(&reading_set(800.0, 140.0)).unwrap();
        assert!(verdict.is_anomaly);
        assert!(verdict.fallback_flagged);
        assert_eq!(verdict.top_deviation.unwrap().feature, "Coolant_Temp");
    }

    #[test]
    fn test_outlier_flagged_when_trained() {
        let mut detector = FaultDetector::new(two_feature_config());
        for i in 0..100 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.state(), DetectorState::Trained);

        let verdict = detector.update(&reading_set(5200.0, 128.0)).unwrap();
        assert!(verdict.is_anomaly);
        assert!(verdict.model.is_some());
        assert_eq!(verdict.sample["Engine_RPM"], 5200.0);
    }

    #[test]
    fn test_train_no_valid_rows() {
        let mut detector = FaultDetector::new(two_feature_config());
        let mut partial = BTreeMap::new();
        partial.insert("Engine_RPM".to_string(), 800.0);

        let err = detector.train(&[partial]).unwrap_err();
        assert!(matches!(err, FaultError::NoValidRows { .. }));
        assert_eq!(detector.state(), DetectorState::Buffering);
        assert_eq!(detector.stats().fits, 0);
    }

    #[test]
    fn test_train_explicit() {
        let mut detector = FaultDetector::new(two_feature_config());
        let records: Vec<_> = (0..40).map(stable).collect();
        assert_eq!(detector.train(&records).unwrap(), 40);
        assert_eq!(detector.state(), DetectorState::Trained);
        // Buffer untouched by explicit training
        assert_eq!(detector.buffered(), 0);
    }

    /// Model whose fits always fail.
    struct BrokenModel;

    impl OutlierModel for BrokenModel {
        fn name(&self) -> &'static str {
            "broken"
        }
        fn fit(&mut self, rows: &[Vec<f64>]) -> Result<()> {
            Err(FaultError::InsufficientData {
                needed: usize::MAX,
                got: rows.len(),
            })
        }
        fn score(&self, _row: &[f64]) -> Result<OutlierScore> {
            Err(FaultError::NotFitted)
        }
        fn is_fitted(&self) -> bool {
            false
        }
        fn fresh(&self) -> Box<dyn OutlierModel> {
            Box::new(BrokenModel)
        }
        fn save(&self) -> Option<crate::model::SavedModel> {
            None
        }
    }

    #[test]
    fn test_failed_fit_retried_after_min_training() {
        let mut detector = FaultDetector::with_model(two_feature_config(), Box::new(BrokenModel));
        for i in 0..60 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.stats().failed_fits, 1);

        for i in 60..119 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.stats().failed_fits, 1);

        detector.update(&stable(119));
        assert_eq!(detector.stats().failed_fits, 2);
        assert_eq!(detector.state(), DetectorState::Buffering);
    }

    /// Model that forgets its fit after the first score.
    struct ForgetfulModel {
        inner: NoopModel,
        scored: std::sync::atomic::AtomicBool,
    }

    impl OutlierModel for ForgetfulModel {
        fn name(&self) -> &'static str {
            "forgetful"
        }
        fn fit(&mut self, rows: &[Vec<f64>]) -> Result<()> {
            self.inner.fit(rows)
        }
        fn score(&self, row: &[f64]) -> Result<OutlierScore> {
            if self.scored.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(FaultError::NotFitted);
            }
            self.inner.score(row)
        }
        fn is_fitted(&self) -> bool {
            self.inner.is_fitted()
        }
        fn fresh(&self) -> Box<dyn OutlierModel> {
            Box::new(ForgetfulModel {
                inner: NoopModel::new(),
                scored: std::sync::atomic::AtomicBool::new(false),
            })
        }
        fn save(&self) -> Option<crate::model::SavedModel> {
            None
        }
    }

    #[test]
    fn test_not_fitted_triggers_refit() {
        let model = ForgetfulModel {
            inner: NoopModel::new(),
            scored: std::sync::atomic::AtomicBool::new(false),
        };
        let mut detector = FaultDetector::with_model(two_feature_config(), Box::new(model));
        for i in 0..60 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.stats().fits, 1);

        // Second score on the same model fails, forcing a refit
        let verdict = detector.update(&stable(60)).unwrap();
        assert_eq!(detector.stats().fits, 2);
        assert_eq!(verdict.state, DetectorState::Trained);
        assert!(verdict.model.is_some());
    }

    #[test]
    fn test_request_retrain() {
        let mut detector = FaultDetector::new(two_feature_config());
        for i in 0..60 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.stats().fits, 1);

        detector.request_retrain();
        assert!(detector.retrain_pending());
        detector.update(&stable(60));
        assert_eq!(detector.stats().fits, 2);
        assert!(!detector.retrain_pending());
    }

    #[test]
    fn test_noop_model_kind() {
        let mut config = two_feature_config();
        config.model = ModelKind::Noop;
        let mut detector = FaultDetector::new(config);
        for i in 0..70 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.model_name(), "noop");
        let verdict = detector.update(&stable(70)).unwrap();
        assert!(!verdict.model.unwrap().is_outlier);
    }

    #[test]
    fn test_load_rejects_other_snapshot_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fault-model.json");
        let mut snapshot = ModelSnapshot::new(
            vec!["Engine_RPM".to_string(), "Coolant_Temp".to_string()],
            60,
            crate::model::SavedModel::Noop,
        );
        snapshot.version = SNAPSHOT_VERSION + 1;
        snapshot.save(&path).unwrap();

        let mut detector = FaultDetector::new(two_feature_config());
        let err = detector.load_model(&path).unwrap_err();
        assert!(matches!(err, FaultError::VersionMismatch { .. }));
        assert_eq!(detector.state(), DetectorState::Buffering);

        let detector = FaultDetector::new(two_feature_config()).with_persistence(&path);
        assert_eq!(detector.state(), DetectorState::Buffering);
    }

    #[test]
    fn test_buffer_capacity() {
        let mut config = two_feature_config();
        config.buffer_capacity = 64;
        let mut detector = FaultDetector::new(config);
        for i in 0..200 {
            detector.update(&stable(i));
        }
        assert_eq!(detector.buffered(), 64);
    }
}
