// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Rolling window analytics.
//!
//! Keeps the most recent values of each metric in a fixed-capacity window
//! and answers two cheap questions on every reading: what is the rolling
//! average, and is this value a z-score outlier.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Minimum window population before anomaly checks are meaningful.
pub const MIN_ANOMALY_SAMPLES: usize = 5;

/// Default z-score threshold for [`AnalyticsEngine::detect_anomaly`].
pub const DEFAULT_Z_THRESHOLD: f64 = 3.0;

/// Analytics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Values kept per metric
    pub window_size: usize,
    /// Z-score threshold used by the pipeline
    pub z_threshold: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            z_threshold: DEFAULT_Z_THRESHOLD,
        }
    }
}

/// Population mean and standard deviation of a window.
pub fn mean_std<'a, I>(values: I) -> Option<(f64, f64)>
where
    I: IntoIterator<Item = &'a f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let n = iter.clone().count();
    if n == 0 {
        return None;
    }
    let mean = iter.clone().sum::<f64>() / n as f64;
    let variance = iter.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    Some((mean, variance.sqrt()))
}

/// Per-metric fixed-capacity windows.
#[derive(Debug)]
pub struct AnalyticsEngine {
    windows: HashMap<String, VecDeque<f64>>,
    config: AnalyticsConfig,
}

impl AnalyticsEngine {
    pub fn new() -> Self {
        Self::with_config(AnalyticsConfig::default())
    }

    pub fn with_config(config: AnalyticsConfig) -> Self {
        Self {
            windows: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Append a value, evicting the oldest once the window is full.
    pub fn update(&mut self, metric: &str, value: f64) {
        let capacity = self.config.window_size.max(1);
        let window = self
            .windows
            .entry(metric.to_string())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        window.push_back(value);
        while window.len() > capacity {
            window.pop_front();
        }
    }

    /// Arithmetic mean of the current window.
    pub fn rolling_average(&self, metric: &str) -> Option<f64> {
        self.windows
            .get(metric)
            .and_then(|w| mean_std(w.iter()))
            .map(|(mean, _)| mean)
    }

    /// Flag `value` when it sits more than `threshold` standard deviations
    /// away from the window mean.
    ///
    /// Returns `false` below [`MIN_ANOMALY_SAMPLES`] or when the window is flat.
    pub fn detect_anomaly(&self, metric: &str, value: f64, threshold: f64) -> bool {
        let Some(window) = self.windows.get(metric) else {
            return false;
        };
        if window.len() < MIN_ANOMALY_SAMPLES {
            return false;
        }
        match mean_std(window.iter()) {
            Some((mean, std)) if std > 0.0 => (value - mean).abs() / std > threshold,
            _ => false,
        }
    }

    /// Current window for a metric, oldest first.
    pub fn window(&self, metric: &str) -> Option<&VecDeque<f64>> {
        self.windows.get(metric)
    }

    /// Number of metrics with data.
    pub fn metric_count(&self) -> usize {
        self.windows.len()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}

impl Default for AnalyticsEngine {
    fn default() -> Self {
        Self::new()
    }
}
