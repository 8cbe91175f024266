// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Core data types and the telemetry wire payload
//!
//! # Wire payload
//!
//! Every record handed to the delivery layer serializes to a flat JSON object
//! carrying `device_id` and an integer `timestamp` (seconds), plus one of:
//!
//! ```text
//! reading:      {metric, value, unit, rolling_avg, anomaly}
//! health score: {health_score, status, metrics}
//! alert:        {alert_type, message, severity, source, ...type specific}
//! ```
//!
//! Field presence is the contract; consumers must ignore unknown fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Current wall-clock time as fractional UNIX seconds.
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// One frame observed on the vehicle bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanFrame {
    /// Arbitration identifier (11 or 29 bit)
    pub id: u32,
    /// Payload bytes (0-8 for classic CAN, up to 64 for CAN FD)
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a new frame
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#", self.id)?;
        for byte in &self.data {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// A named sensor value produced by the decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub metric: String,
    pub value: f64,
    pub timestamp: f64,
    pub unit: String,
}

impl Reading {
    pub fn new(metric: impl Into<String>, value: f64, unit: impl Into<String>, timestamp: f64) -> Self {
        Self {
            metric: metric.into(),
            value,
            timestamp,
            unit: unit.into(),
        }
    }
}

/// Severity shared by every alert kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of alert record sent upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Diagnostic trouble code reported by a control unit
    Dtc,
    /// Threshold or trend alert from the maintenance advisor
    Maintenance,
    /// Multivariate fault detector verdict
    PredictiveFault,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Dtc => "dtc",
            AlertType::Maintenance => "maintenance",
            AlertType::PredictiveFault => "predictive_fault",
        }
    }
}

/// Per-metric entry of a health score record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScoreEntry {
    pub score: f64,
    pub value: f64,
    pub weight: f64,
    pub status: String,
}

/// Body of a telemetry record, flattened next to `device_id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordBody {
    Reading {
        metric: String,
        value: f64,
        unit: String,
        rolling_avg: Option<f64>,
        anomaly: bool,
    },
    HealthScore {
        health_score: f64,
        status: String,
        metrics: BTreeMap<String, MetricScoreEntry>,
    },
    Alert {
        alert_type: AlertType,
        message: String,
        severity: Severity,
        source: String,
        #[serde(flatten)]
        details: Map<String, Value>,
    },
}

/// A record as delivered to the remote collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    /// UNIX seconds
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: RecordBody,
}

impl TelemetryRecord {
    /// Build a reading record from a decoded reading and its analytics.
    pub fn reading(
        device_id: impl Into<String>,
        reading: &Reading,
        rolling_avg: Option<f64>,
        anomaly: bool,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: reading.timestamp as i64,
            body: RecordBody::Reading {
                metric: reading.metric.clone(),
                value: reading.value,
                unit: reading.unit.clone(),
                rolling_avg,
                anomaly,
            },
        }
    }

    /// Build a health score record.
    pub fn health_score(
        device_id: impl Into<String>,
        timestamp: f64,
        health_score: f64,
        status: impl Into<String>,
        metrics: BTreeMap<String, MetricScoreEntry>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: timestamp as i64,
            body: RecordBody::HealthScore {
                health_score,
                status: status.into(),
                metrics,
            },
        }
    }

    /// Build an alert record. `details` carries type-specific fields.
    pub fn alert(
        device_id: impl Into<String>,
        timestamp: f64,
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        source: impl Into<String>,
        details: Map<String, Value>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: timestamp as i64,
            body: RecordBody::Alert {
                alert_type,
                message: message.into(),
                severity,
                source: source.into(),
                details,
            },
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match &self.body {
            RecordBody::Reading { .. } => "reading",
            RecordBody::HealthScore { .. } => "health_score",
            RecordBody::Alert { alert_type, .. } => alert_type.as_str(),
        }
    }
}
