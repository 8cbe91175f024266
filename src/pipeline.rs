// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Orchestration
//!
//! [`Pipeline`] owns every stage and is driven by one sequential loop:
//!
//! ```text
//! frame ─► decode ─► canonicalize ─┬─► analytics ─► reading record ─► delivery
//!                                  ├─► health
//!                                  ├─► maintenance
//!                                  └─► detector features ─► predictive alert
//!
//! every score_interval: health score + maintenance alerts
//! every dtc_poll_interval: diagnostic poll ─► DTC alerts
//! ```
//!
//! All cadence decisions use the timestamp passed in, so replaying a log
//! with synthetic timestamps is deterministic.

use crate::analytics::{AnalyticsConfig, AnalyticsEngine};
use crate::canonical::MetricVocabulary;
use crate::decoder::{decode_record, Decoder, MetricRecord};
use crate::delivery::{DeliveryConfig, DeliveryLayer};
use crate::dtc::{decode_dtc_frame, DiagnosticService, DtcKnowledgeBase, DEFAULT_RESPONSE_ID};
use crate::error::{CanLinkError, DeliveryError, Result};
use crate::health::{HealthEngine, HealthRules, HealthScoreResult};
use crate::history::{synthetic_timestamp, HistoricalLog};
use crate::maintenance::{MaintenanceAdvisor, MaintenanceAlert, MaintenanceConfig};
use crate::protocol::{AlertType, CanFrame, Reading, Severity, TelemetryRecord};
use crate::publisher::Publisher;
use canlink_fault::{DetectorConfig, DetectorState, FaultDetector, FaultVerdict};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Identifier stamped on every record
    pub device_id: String,
    /// Seconds between health score / maintenance alert emissions
    pub score_interval_secs: f64,
    /// Seconds between diagnostic service polls
    pub dtc_poll_interval_secs: f64,
    /// Bus identifier carrying diagnostic responses
    pub dtc_response_id: u32,
    /// Minimum seconds between predictive alerts
    pub predictive_cooldown_secs: f64,
    pub vocabulary: MetricVocabulary,
    pub analytics: AnalyticsConfig,
    pub health: HealthRules,
    pub maintenance: MaintenanceConfig,
    pub detector: DetectorConfig,
    pub delivery: DeliveryConfig,
    pub knowledge_base: DtcKnowledgeBase,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_id: "canlink-edge".to_string(),
            score_interval_secs: 5.0,
            dtc_poll_interval_secs: 60.0,
            dtc_response_id: DEFAULT_RESPONSE_ID,
            predictive_cooldown_secs: 60.0,
            vocabulary: MetricVocabulary::default(),
            analytics: AnalyticsConfig::default(),
            health: HealthRules::default(),
            maintenance: MaintenanceConfig::default(),
            detector: DetectorConfig::default(),
            delivery: DeliveryConfig::default(),
            knowledge_base: DtcKnowledgeBase::default(),
        }
    }
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames_seen: u64,
    pub frames_decoded: u64,
    pub unknown_frames: u64,
    pub records_processed: u64,
    pub readings: u64,
    pub anomalies: u64,
    pub records_emitted: u64,
    pub health_scores: u64,
    /// Alerts by type, then severity
    pub alerts: BTreeMap<String, BTreeMap<String, u64>>,
}

impl PipelineStats {
    fn count_alert(&mut self, alert_type: AlertType, severity: Severity) {
        *self
            .alerts
            .entry(alert_type.as_str().to_string())
            .or_default()
            .entry(severity.as_str().to_string())
            .or_default() += 1;
    }

    pub fn alert_total(&self) -> u64 {
        self.alerts.values().flat_map(|s| s.values()).sum()
    }
}

/// The edge pipeline
pub struct Pipeline<P: Publisher> {
    config: PipelineConfig,
    decoder: Decoder,
    analytics: AnalyticsEngine,
    health: HealthEngine,
    maintenance: MaintenanceAdvisor,
    detector: FaultDetector,
    diagnostics: Option<Box<dyn DiagnosticService + Send>>,
    delivery: DeliveryLayer<P>,
    /// Latest value of each detector feature
    features: BTreeMap<String, f64>,
    active_dtcs: BTreeSet<String>,
    last_score_at: Option<f64>,
    last_poll_at: Option<f64>,
    last_predictive_at: Option<f64>,
    last_health: Option<HealthScoreResult>,
    stats: PipelineStats,
}

impl<P: Publisher> Pipeline<P> {
    pub fn new(config: PipelineConfig, decoder: Decoder, delivery: DeliveryLayer<P>) -> Self {
        let detector = FaultDetector::new(config.detector.clone());
        Self {
            analytics: AnalyticsEngine::with_config(config.analytics.clone()),
            health: HealthEngine::with_rules(config.health.clone()),
            maintenance: MaintenanceAdvisor::with_config(config.maintenance.clone()),
            detector,
            diagnostics: None,
            decoder,
            delivery,
            config,
            features: BTreeMap::new(),
            active_dtcs: BTreeSet::new(),
            last_score_at: None,
            last_poll_at: None,
            last_predictive_at: None,
            last_health: None,
            stats: PipelineStats::default(),
        }
    }

    /// Replace the fault detector, e.g. with one that persists its model.
    pub fn with_detector(mut self, detector: FaultDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Attach a diagnostic service, polled every `dtc_poll_interval_secs`.
    pub fn with_diagnostics(mut self, diagnostics: Box<dyn DiagnosticService + Send>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn delivery(&self) -> &DeliveryLayer<P> {
        &self.delivery
    }

    pub fn delivery_mut(&mut self) -> &mut DeliveryLayer<P> {
        &mut self.delivery
    }

    pub fn analytics(&self) -> &AnalyticsEngine {
        &self.analytics
    }

    pub fn health(&self) -> &HealthEngine {
        &self.health
    }

    pub fn detector(&self) -> &FaultDetector {
        &self.detector
    }

    pub fn detector_state(&self) -> DetectorState {
        self.detector.state()
    }

    /// Last health score delivered
    pub fn last_health(&self) -> Option<&HealthScoreResult> {
        self.last_health.as_ref()
    }

    /// Codes reported and not yet cleared
    pub fn active_dtcs(&self) -> &BTreeSet<String> {
        &self.active_dtcs
    }

    /// Process one bus frame observed at `now`.
    pub fn process_frame(&mut self, frame: &CanFrame, now: f64) -> Result<()> {
        self.stats.frames_seen += 1;

        if frame.id == self.config.dtc_response_id {
            match decode_dtc_frame(frame) {
                Ok(Some(codes)) => {
                    self.handle_trouble_codes(codes, now, "bus", false)?;
                    return self.tick(now);
                }
                Ok(None) => {}
                Err(e) => warn!(frame = %frame, error = %e, "Bad diagnostic response"),
            }
        }

        match self.decoder.decode(frame, now) {
            Some(readings) => {
                self.stats.frames_decoded += 1;
                self.handle_readings(readings, now)?;
            }
            None => {
                self.stats.unknown_frames += 1;
                debug!(id = frame.id, "Unknown frame");
            }
        }
        self.tick(now)
    }

    /// Process one pre-parsed metric record at `timestamp`.
    pub fn process_record(&mut self, record: &MetricRecord, timestamp: f64) -> Result<()> {
        self.stats.records_processed += 1;
        let readings = decode_record(record, timestamp, &self.config.vocabulary);
        self.handle_readings(readings, timestamp)?;
        self.tick(timestamp)
    }

    /// Replay a historical log with timestamps `start + i * interval`.
    ///
    /// Each replay starts from clean per-stream state, so replaying the same
    /// log again emits the same records. The fault detector and the active
    /// trouble codes are kept. Returns the number of records replayed.
    pub fn replay(&mut self, log: &HistoricalLog, start: f64, interval: f64) -> Result<usize> {
        info!(
            vendor = %log.vendor,
            protocol = %log.protocol,
            records = log.len(),
            "Replaying historical log"
        );
        self.reset_stream();
        for (i, record) in log.records.iter().enumerate() {
            self.process_record(record, synthetic_timestamp(start, interval, i))?;
        }
        Ok(log.len())
    }

    /// Fit the fault detector on a historical log.
    pub fn train_detector(&mut self, log: &HistoricalLog) -> Result<usize> {
        let rows: Vec<BTreeMap<String, f64>> = log
            .records
            .iter()
            .map(|record| {
                record
                    .iter()
                    .map(|(name, value)| {
                        (self.config.vocabulary.canonical_metric(name).to_string(), *value)
                    })
                    .collect()
            })
            .collect();
        Ok(self.detector.train(&rows)?)
    }

    /// Drop windows, rate limits and cadence anchors built from earlier input.
    pub fn reset_stream(&mut self) {
        self.analytics.clear();
        self.health.clear();
        self.maintenance.clear();
        self.features.clear();
        self.last_score_at = None;
        self.last_poll_at = None;
        self.last_predictive_at = None;
    }

    /// Schedule a detector refit at the next feature update.
    pub fn request_retrain(&mut self) {
        self.detector.request_retrain();
    }

    /// Run time-based work due at `now`.
    ///
    /// A clock that moved backwards makes the work due again.
    pub fn tick(&mut self, now: f64) -> Result<()> {
        let score_due = self
            .last_score_at
            .map_or(true, |last| interval_elapsed(last, now, self.config.score_interval_secs));
        if score_due {
            self.last_score_at = Some(now);
            self.emit_health(now)?;
            for alert in self.maintenance.generate_alerts_at(now) {
                self.emit_maintenance(&alert, now)?;
            }
            if self.delivery.publisher().is_connected() && self.delivery.queue_depth()? > 0 {
                self.delivery.flush_pending()?;
            }
        }

        let poll_due = self.diagnostics.is_some()
            && self
                .last_poll_at
                .map_or(true, |last| {
                    interval_elapsed(last, now, self.config.dtc_poll_interval_secs)
                });
        if poll_due {
            self.last_poll_at = Some(now);
            self.poll_diagnostics(now)?;
        }
        Ok(())
    }

    /// Read stored codes from the diagnostic service.
    pub fn poll_diagnostics(&mut self, now: f64) -> Result<()> {
        let Some(diagnostics) = self.diagnostics.as_mut() else {
            return Ok(());
        };
        match diagnostics.read_trouble_codes() {
            Ok(codes) => self.handle_trouble_codes(codes, now, "diagnostic_poll", true),
            Err(e) => {
                warn!(error = %e, "Diagnostic poll failed");
                Ok(())
            }
        }
    }

    /// Ask the diagnostic service to clear stored codes.
    pub fn clear_trouble_codes(&mut self) -> Result<bool> {
        let diagnostics = self
            .diagnostics
            .as_mut()
            .ok_or_else(|| CanLinkError::Config("no diagnostic service attached".to_string()))?;
        let cleared = diagnostics.clear_trouble_codes()?;
        if cleared {
            info!(codes = self.active_dtcs.len(), "Trouble codes cleared");
            self.active_dtcs.clear();
        }
        Ok(cleared)
    }

    fn handle_readings(&mut self, readings: Vec<Reading>, now: f64) -> Result<()> {
        let mut features_touched = false;

        for reading in readings {
            let metric = self
                .config
                .vocabulary
                .canonical_metric(&reading.metric)
                .to_string();
            let unit = if reading.unit.is_empty() {
                self.config.vocabulary.unit_for(&metric).to_string()
            } else {
                reading.unit
            };
            let reading = Reading::new(metric, reading.value, unit, reading.timestamp);
            let metric = reading.metric.as_str();

            self.analytics.update(metric, reading.value);
            let rolling_avg = self.analytics.rolling_average(metric);
            let anomaly =
                self.analytics
                    .detect_anomaly(metric, reading.value, self.config.analytics.z_threshold);
            if anomaly {
                self.stats.anomalies += 1;
            }

            self.health.update(metric, reading.value);
            self.maintenance.update(metric, reading.value, reading.timestamp);

            if self.config.detector.features.iter().any(|f| f == metric) {
                self.features.insert(metric.to_string(), reading.value);
                features_touched = true;
            }

            self.stats.readings += 1;
            let record = TelemetryRecord::reading(
                self.config.device_id.as_str(),
                &reading,
                rolling_avg,
                anomaly,
            );
            self.deliver(&record)?;
        }

        if features_touched {
            if let Some(verdict) = self.detector.update(&self.features) {
                if verdict.is_anomaly {
                    self.emit_predictive(&verdict, now)?;
                }
            }
        }
        Ok(())
    }

    fn handle_trouble_codes(
        &mut self,
        codes: Vec<String>,
        now: f64,
        source: &str,
        authoritative: bool,
    ) -> Result<()> {
        let reported: BTreeSet<String> = codes.iter().map(|c| c.trim().to_uppercase()).collect();

        for code in reported.difference(&self.active_dtcs).cloned().collect::<Vec<_>>() {
            let insight = self.config.knowledge_base.analyze(&code);
            let mut details = Map::new();
            details.insert("code".to_string(), Value::from(insight.code.as_str()));
            details.insert("description".to_string(), Value::from(insight.description.as_str()));
            details.insert("insight".to_string(), Value::from(insight.insight.as_str()));
            details.insert("known".to_string(), Value::from(insight.known));

            let record = TelemetryRecord::alert(
                self.config.device_id.as_str(),
                now,
                AlertType::Dtc,
                insight.severity,
                format!("{}: {}", insight.code, insight.description),
                source,
                details,
            );
            info!(code = %code, severity = %insight.severity, source, "Trouble code reported");
            self.stats.count_alert(AlertType::Dtc, insight.severity);
            self.deliver(&record)?;
        }

        if authoritative {
            self.active_dtcs = reported;
        } else {
            self.active_dtcs.extend(reported);
        }
        Ok(())
    }

    fn emit_health(&mut self, now: f64) -> Result<()> {
        let Some(result) = self.health.score_at(now) else {
            return Ok(());
        };
        let record = TelemetryRecord::health_score(
            self.config.device_id.as_str(),
            now,
            result.overall,
            result.status.as_str(),
            result.wire_metrics(),
        );
        self.stats.health_scores += 1;
        self.deliver(&record)?;
        self.last_health = Some(result);
        Ok(())
    }

    fn emit_maintenance(&mut self, alert: &MaintenanceAlert, now: f64) -> Result<()> {
        let mut details = Map::new();
        details.insert("metric".to_string(), Value::from(alert.metric.as_str()));
        details.insert("value".to_string(), Value::from(alert.value));
        details.insert(
            "reason".to_string(),
            serde_json::to_value(alert.reason).map_err(DeliveryError::from)?,
        );
        if let Some(trend) = alert.trend {
            details.insert("trend".to_string(), Value::from(trend.as_str()));
        }
        if let Some(change) = alert.change_pct {
            details.insert("change_pct".to_string(), Value::from(change));
        }

        let record = TelemetryRecord::alert(
            self.config.device_id.as_str(),
            now,
            AlertType::Maintenance,
            alert.severity,
            alert.message.as_str(),
            "maintenance_advisor",
            details,
        );
        self.stats.count_alert(AlertType::Maintenance, alert.severity);
        self.deliver(&record)
    }

    fn emit_predictive(&mut self, verdict: &FaultVerdict, now: f64) -> Result<()> {
        if let Some(last) = self.last_predictive_at {
            if !interval_elapsed(last, now, self.config.predictive_cooldown_secs) {
                debug!("Predictive alert suppressed by cooldown");
                return Ok(());
            }
        }
        self.last_predictive_at = Some(now);

        let severity = if verdict.is_confirmed() {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let message = match &verdict.top_deviation {
            Some(d) if verdict.fallback_flagged => format!(
                "Abnormal operating pattern: {} deviates {:.1} sigma",
                d.feature, d.z_score
            ),
            _ => "Abnormal multivariate operating pattern".to_string(),
        };

        let mut details = Map::new();
        let sample: Map<String, Value> = verdict
            .sample
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        details.insert("sample".to_string(), Value::Object(sample));
        details.insert("detector_state".to_string(), Value::from(verdict.state.as_str()));
        if let Some(model) = verdict.model {
            details.insert("model_score".to_string(), Value::from(model.score));
        }
        if let Some(d) = &verdict.top_deviation {
            details.insert("metric".to_string(), Value::from(d.feature.as_str()));
            details.insert("z_score".to_string(), Value::from(d.z_score));
        }

        let record = TelemetryRecord::alert(
            self.config.device_id.as_str(),
            now,
            AlertType::PredictiveFault,
            severity,
            message,
            "fault_detector",
            details,
        );
        warn!(severity = %severity, "Predictive fault alert");
        self.stats.count_alert(AlertType::PredictiveFault, severity);
        self.deliver(&record)
    }

    /// Hand a record to the delivery layer. Only storage failures propagate.
    fn deliver(&mut self, record: &TelemetryRecord) -> Result<()> {
        match self.delivery.publish_or_buffer(record) {
            Ok(_) => {
                self.stats.records_emitted += 1;
                Ok(())
            }
            Err(e @ DeliveryError::Storage(_)) => Err(e.into()),
            Err(e) => {
                warn!(kind = record.kind(), error = %e, "Dropping record");
                Ok(())
            }
        }
    }
}

fn interval_elapsed(last: f64, now: f64, interval: f64) -> bool {
    now < last || now - last >= interval
}
