// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Predictive maintenance advisor.
//!
//! Keeps a longer window per metric and produces two independent kinds of
//! alerts when [`MaintenanceAdvisor::generate_alerts_at`] is called:
//!
//! - **Threshold**: latest value crosses a critical/warning bound.
//!   At most one per metric per `threshold_cooldown_secs`.
//! - **Trend**: least-squares drift over the last `trend_window` samples,
//!   normalized by the window mean. At most one per metric and direction
//!   per `trend_cooldown_secs`.
//!
//! Meant to run on a fixed cadence, not on every reading.

use crate::canonical::metrics::*;
use crate::protocol::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Numeric bounds for a threshold alert. Any bound may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub critical_high: Option<f64>,
    pub warning_high: Option<f64>,
    pub critical_low: Option<f64>,
    pub warning_low: Option<f64>,
}

impl ThresholdRule {
    pub fn high(warning: f64, critical: f64) -> Self {
        Self {
            warning_high: Some(warning),
            critical_high: Some(critical),
            ..Default::default()
        }
    }

    pub fn low(warning: f64, critical: f64) -> Self {
        Self {
            warning_low: Some(warning),
            critical_low: Some(critical),
            ..Default::default()
        }
    }

    pub fn with_low(mut self, warning: f64, critical: f64) -> Self {
        self.warning_low = Some(warning);
        self.critical_low = Some(critical);
        self
    }

    /// Classify a value. Critical bounds win over warning bounds.
    pub fn evaluate(&self, value: f64) -> Option<(Severity, &'static str, f64)> {
        if let Some(limit) = self.critical_high.filter(|&l| value >= l) {
            return Some((Severity::Critical, "above critical limit", limit));
        }
        if let Some(limit) = self.critical_low.filter(|&l| value <= l) {
            return Some((Severity::Critical, "below critical limit", limit));
        }
        if let Some(limit) = self.warning_high.filter(|&l| value >= l) {
            return Some((Severity::Warning, "above warning limit", limit));
        }
        if let Some(limit) = self.warning_low.filter(|&l| value <= l) {
            return Some((Severity::Warning, "below warning limit", limit));
        }
        None
    }
}

/// Advisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Threshold table keyed by canonical metric
    pub thresholds: BTreeMap<String, ThresholdRule>,
    /// Samples used for trend fitting; windows hold twice this
    pub trend_window: usize,
    /// Minimum |change| (%) for a trend alert
    pub trend_change_pct: f64,
    /// |change| (%) above which a trend alert is a warning
    pub trend_warning_pct: f64,
    /// |normalized slope| below which a metric is stable
    pub stable_slope: f64,
    pub threshold_cooldown_secs: f64,
    pub trend_cooldown_secs: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let thresholds = [
            (COOLANT_TEMP, ThresholdRule::high(110.0, 115.0)),
            (OIL_TEMP, ThresholdRule::high(130.0, 140.0)),
            (OIL_PRESSURE, ThresholdRule::low(20.0, 10.0)),
            (BATTERY_VOLTAGE, ThresholdRule::high(15.0, 15.5).with_low(12.0, 11.5)),
            (ENGINE_RPM, ThresholdRule::high(6000.0, 6500.0)),
            (INTAKE_AIR_TEMP, ThresholdRule::high(60.0, 75.0)),
            (ENGINE_LOAD, ThresholdRule::high(90.0, 98.0)),
            (FUEL_LEVEL, ThresholdRule::low(10.0, 5.0)),
        ]
        .into_iter()
        .map(|(metric, rule)| (metric.to_string(), rule))
        .collect();

        Self {
            thresholds,
            trend_window: 30,
            trend_change_pct: 15.0,
            trend_warning_pct: 25.0,
            stable_slope: 0.01,
            threshold_cooldown_secs: 60.0,
            trend_cooldown_secs: 300.0,
        }
    }
}

/// Direction of a non-stable trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increasing => "increasing",
            Self::Decreasing => "decreasing",
        }
    }
}

impl fmt::Display for TrendDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What raised a maintenance alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertReason {
    Threshold,
    Trend,
}

/// A maintenance alert. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceAlert {
    pub metric: String,
    pub severity: Severity,
    pub reason: AlertReason,
    pub message: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: f64,
    timestamp: f64,
}

/// Least-squares slope of `values` against their index.
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;

    let mut ss_xy = 0.0;
    let mut ss_xx = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        ss_xy += dx * (y - y_mean);
        ss_xx += dx * dx;
    }

    Some(ss_xy / ss_xx)
}

/// Predictive maintenance advisor
#[derive(Debug)]
pub struct MaintenanceAdvisor {
    config: MaintenanceConfig,
    windows: BTreeMap<String, VecDeque<Sample>>,
    /// "metric_reason" -> last fired timestamp
    last_fired: HashMap<String, f64>,
}

impl MaintenanceAdvisor {
    pub fn new() -> Self {
        Self::with_config(MaintenanceConfig::default())
    }

    pub fn with_config(config: MaintenanceConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
            last_fired: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Append a sample; the window holds twice the trend window.
    pub fn update(&mut self, metric: &str, value: f64, timestamp: f64) {
        let capacity = self.config.trend_window.max(2) * 2;
        let window = self.windows.entry(metric.to_string()).or_default();
        window.push_back(Sample { value, timestamp });
        while window.len() > capacity {
            window.pop_front();
        }
    }

    /// Number of samples held for a metric
    pub fn sample_count(&self, metric: &str) -> usize {
        self.windows.get(metric).map(|w| w.len()).unwrap_or(0)
    }

    /// Timestamp of the latest sample for a metric
    pub fn last_update(&self, metric: &str) -> Option<f64> {
        self.windows.get(metric).and_then(|w| w.back()).map(|s| s.timestamp)
    }

    /// Evaluate every rule at `now` (seconds).
    pub fn generate_alerts_at(&mut self, now: f64) -> Vec<MaintenanceAlert> {
        let mut alerts = Vec::new();
        alerts.extend(self.threshold_alerts(now));
        alerts.extend(self.trend_alerts(now));
        alerts
    }

    /// Evaluate every rule at wall-clock time.
    pub fn generate_alerts(&mut self) -> Vec<MaintenanceAlert> {
        self.generate_alerts_at(crate::protocol::unix_now())
    }

    fn threshold_alerts(&mut self, now: f64) -> Vec<MaintenanceAlert> {
        let mut alerts = Vec::new();
        for (metric, rule) in &self.config.thresholds {
            let Some(latest) = self.windows.get(metric).and_then(|w| w.back()) else {
                continue;
            };
            let Some((severity, what, limit)) = rule.evaluate(latest.value) else {
                continue;
            };

            let key = format!("{}_threshold", metric);
            if !Self::cooldown_elapsed(&self.last_fired, &key, now, self.config.threshold_cooldown_secs) {
                continue;
            }
            self.last_fired.insert(key, now);

            alerts.push(MaintenanceAlert {
                metric: metric.clone(),
                severity,
                reason: AlertReason::Threshold,
                message: format!("{} {}: {:.2} (limit {:.2})", metric, what, latest.value, limit),
                value: latest.value,
                trend: None,
                change_pct: None,
            });
        }
        alerts
    }

    fn trend_alerts(&mut self, now: f64) -> Vec<MaintenanceAlert> {
        let n = self.config.trend_window.max(2);
        let mut alerts = Vec::new();

        for (metric, window) in &self.windows {
            if window.len() < n {
                continue;
            }
            let values: Vec<f64> = window.iter().skip(window.len() - n).map(|s| s.value).collect();

            let mean = values.iter().sum::<f64>() / n as f64;
            if mean == 0.0 {
                continue;
            }
            let Some(slope) = linear_slope(&values) else {
                continue;
            };
            let normalized = slope / mean;
            if normalized.abs() < self.config.stable_slope {
                continue;
            }
            let direction = if slope > 0.0 {
                TrendDirection::Increasing
            } else {
                TrendDirection::Decreasing
            };

            let first = values[0];
            let last = values[n - 1];
            if first == 0.0 {
                continue;
            }
            let change_pct = (last - first) / first.abs() * 100.0;
            if change_pct.abs() <= self.config.trend_change_pct {
                continue;
            }

            let key = format!("{}_trend_{}", metric, direction);
            if !Self::cooldown_elapsed(&self.last_fired, &key, now, self.config.trend_cooldown_secs) {
                continue;
            }
            self.last_fired.insert(key, now);

            let severity = if change_pct.abs() > self.config.trend_warning_pct {
                Severity::Warning
            } else {
                Severity::Info
            };

            alerts.push(MaintenanceAlert {
                metric: metric.clone(),
                severity,
                reason: AlertReason::Trend,
                message: format!(
                    "{} {} trend: {:+.1}% over last {} samples",
                    metric, direction, change_pct, n
                ),
                value: last,
                trend: Some(direction),
                change_pct: Some(change_pct),
            });
        }
        alerts
    }

    fn cooldown_elapsed(last_fired: &HashMap<String, f64>, key: &str, now: f64, cooldown: f64) -> bool {
        match last_fired.get(key) {
            Some(&last) => now < last || now - last >= cooldown,
            None => true,
        }
    }

    pub fn clear(&mut self) {
        self.windows.clear();
        self.last_fired.clear();
    }
}

impl Default for MaintenanceAdvisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_slope() {
        assert_relative_eq!(linear_slope(&[1.0, 3.0, 5.0, 7.0]).unwrap(), 2.0);
        assert_relative_eq!(linear_slope(&[4.0, 4.0, 4.0]).unwrap(), 0.0);
        assert!(linear_slope(&[1.0]).is_none());
    }

    #[test]
    fn test_threshold_rule_priority() {
        let rule = ThresholdRule::high(110.0, 115.0);
        assert_eq!(rule.evaluate(100.0), None);
        assert_eq!(rule.evaluate(112.0).unwrap().0, Severity::Warning);
        assert_eq!(rule.evaluate(116.0).unwrap().0, Severity::Critical);

        let battery = ThresholdRule::high(15.0, 15.5).with_low(12.0, 11.5);
        assert_eq!(battery.evaluate(11.0).unwrap().0, Severity::Critical);
        assert_eq!(battery.evaluate(11.9).unwrap().0, Severity::Warning);
    }

    #[test]
    fn test_threshold_rate_limit() {
        let mut advisor = MaintenanceAdvisor::new();
        advisor.update("Coolant_Temp", 112.0, 0.0);

        let first = advisor.generate_alerts_at(0.0);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].severity, Severity::Warning);
        assert_eq!(first[0].reason, AlertReason::Threshold);

        advisor.update("Coolant_Temp", 116.0, 30.0);
        assert!(advisor.generate_alerts_at(30.0).is_empty());

        let later = advisor.generate_alerts_at(61.0);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].severity, Severity::Critical);
    }

    #[test]
    fn test_no_threshold_alert_for_metric_without_rule() {
        let mut advisor = MaintenanceAdvisor::new();
        advisor.update("Boost_Pressure", 1e6, 0.0);
        assert!(advisor.generate_alerts_at(0.0).is_empty());
    }

    #[test]
    fn test_window_holds_twice_trend_window() {
        let mut advisor = MaintenanceAdvisor::new();
        for i in 0..200 {
            advisor.update("Engine_RPM", 800.0, i as f64);
        }
        assert_eq!(advisor.sample_count("Engine_RPM"), 60);
        assert_eq!(advisor.last_update("Engine_RPM"), Some(199.0));
    }

    #[test]
    fn test_trend_needs_full_window() {
        let mut advisor = MaintenanceAdvisor::new();
        for i in 0..29 {
            advisor.update("Fuel_Pressure", 300.0 + i as f64 * 5.0, i as f64);
        }
        assert!(advisor.generate_alerts_at(100.0).is_empty());
    }

    #[test]
    fn test_increasing_trend_alert() {
        let mut advisor = MaintenanceAdvisor::new();
        // 300 -> 445: +48%, normalized slope ~0.013 per sample
        for i in 0..30 {
            advisor.update("Fuel_Pressure", 300.0 + i as f64 * 5.0, i as f64);
        }
        let alerts = advisor.generate_alerts_at(100.0);
        assert_eq!(alerts.len(), 1);

        let alert = &alerts[0];
        assert_eq!(alert.reason, AlertReason::Trend);
        assert_eq!(alert.trend, Some(TrendDirection::Increasing));
        assert_eq!(alert.severity, Severity::Warning);
        assert!(alert.change_pct.unwrap() > 25.0);

        // Same direction suppressed for 300 s
        assert!(advisor.generate_alerts_at(200.0).is_empty());
        assert_eq!(advisor.generate_alerts_at(400.0).len(), 1);
    }

    #[test]
    fn test_decreasing_trend_info_severity() {
        let mut advisor = MaintenanceAdvisor::with_config(MaintenanceConfig {
            trend_window: 10,
            ..Default::default()
        });
        // 100 -> 82: -18%
        for i in 0..10 {
            advisor.update("Fuel_Pressure", 100.0 - i as f64 * 2.0, i as f64);
        }
        let alerts = advisor.generate_alerts_at(0.0);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].trend, Some(TrendDirection::Decreasing));
        assert_eq!(alerts[0].severity, Severity::Info);
    }

    #[test]
    fn test_stable_metric_no_trend_alert() {
        let mut advisor = MaintenanceAdvisor::new();
        for i in 0..30 {
            let jitter = if i % 2 == 0 { 0.5 } else { -0.5 };
            advisor.update("Oil_Temp", 95.0 + jitter, i as f64);
        }
        assert!(advisor.generate_alerts_at(0.0).is_empty());
    }

    #[test]
    fn test_zero_mean_skipped() {
        let mut advisor = MaintenanceAdvisor::with_config(MaintenanceConfig {
            trend_window: 4,
            ..Default::default()
        });
        for v in [-3.0, -1.0, 1.0, 3.0] {
            advisor.update("Lateral_Accel", v, 0.0);
        }
        assert!(advisor.generate_alerts_at(0.0).is_empty());
    }

    #[test]
    fn test_threshold_and_trend_fire_together() {
        let mut advisor = MaintenanceAdvisor::new();
        for i in 0..30 {
            advisor.update("Coolant_Temp", 80.0 + i as f64 * 1.2, i as f64);
        }
        // last value 114.8: warning threshold, +43.5% trend
        let alerts = advisor.generate_alerts_at(0.0);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.reason == AlertReason::Threshold));
        assert!(alerts.iter().any(|a| a.reason == AlertReason::Trend));
    }
}
