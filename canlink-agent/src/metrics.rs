// CANLink Agent - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for agent monitoring.
//!
//! Gauges mirror the pipeline's running counters; they are refreshed from a
//! [`StatusSnapshot`] after each processed frame.

use crate::status::StatusSnapshot;
use lazy_static::lazy_static;
use prometheus::{register_gauge, register_gauge_vec, Encoder, Gauge, GaugeVec, TextEncoder};

lazy_static! {
    // ============================================================
    // Ingestion
    // ============================================================

    /// Frames read from the bus source.
    pub static ref FRAMES_SEEN_TOTAL: Gauge = register_gauge!(
        "canlink_frames_seen_total",
        "Frames read from the bus source"
    ).unwrap();

    /// Frames decoded into at least one reading.
    pub static ref FRAMES_DECODED_TOTAL: Gauge = register_gauge!(
        "canlink_frames_decoded_total",
        "Frames decoded into readings"
    ).unwrap();

    /// Frames with no decoding rule.
    pub static ref UNKNOWN_FRAMES_TOTAL: Gauge = register_gauge!(
        "canlink_unknown_frames_total",
        "Frames with no decoding rule"
    ).unwrap();

    /// Readings processed.
    pub static ref READINGS_TOTAL: Gauge = register_gauge!(
        "canlink_readings_total",
        "Readings processed"
    ).unwrap();

    // ============================================================
    // Delivery
    // ============================================================

    /// Records sent on first attempt.
    pub static ref RECORDS_DELIVERED_TOTAL: Gauge = register_gauge!(
        "canlink_records_delivered_total",
        "Records delivered on first attempt"
    ).unwrap();

    /// Records written to the durable queue.
    pub static ref RECORDS_BUFFERED_TOTAL: Gauge = register_gauge!(
        "canlink_records_buffered_total",
        "Records buffered in the durable queue"
    ).unwrap();

    /// Buffered records later flushed.
    pub static ref RECORDS_FLUSHED_TOTAL: Gauge = register_gauge!(
        "canlink_records_flushed_total",
        "Buffered records flushed after reconnect"
    ).unwrap();

    /// Records currently waiting in the queue.
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "canlink_queue_depth",
        "Records waiting in the durable queue"
    ).unwrap();

    /// Uplink state (1 = connected, 0 = down).
    pub static ref UPLINK_CONNECTED: Gauge = register_gauge!(
        "canlink_uplink_connected",
        "Uplink state (1=connected, 0=down)"
    ).unwrap();

    // ============================================================
    // Analysis
    // ============================================================

    /// Latest overall health score.
    pub static ref HEALTH_SCORE: Gauge = register_gauge!(
        "canlink_health_score",
        "Latest overall vehicle health score (0-1)"
    ).unwrap();

    /// Latest per-metric health score.
    pub static ref METRIC_HEALTH_SCORE: GaugeVec = register_gauge_vec!(
        "canlink_metric_health_score",
        "Latest per-metric health score (0-1)",
        &["metric"]
    ).unwrap();

    /// Alerts emitted (labeled by alert type and severity).
    pub static ref ALERTS_TOTAL: GaugeVec = register_gauge_vec!(
        "canlink_alerts_total",
        "Alerts emitted",
        &["alert_type", "severity"]
    ).unwrap();

    /// Fault detector state (0 = buffering, 1 = trained).
    pub static ref DETECTOR_STATE: Gauge = register_gauge!(
        "canlink_detector_state",
        "Fault detector state (0=buffering, 1=trained)"
    ).unwrap();

    /// Active diagnostic trouble codes.
    pub static ref ACTIVE_DTCS: Gauge = register_gauge!(
        "canlink_active_dtcs",
        "Diagnostic trouble codes currently active"
    ).unwrap();
}

/// Refresh every gauge from a snapshot.
pub fn update_from_snapshot(snapshot: &StatusSnapshot) {
    let stats = &snapshot.pipeline;
    FRAMES_SEEN_TOTAL.set(stats.frames_seen as f64);
    FRAMES_DECODED_TOTAL.set(stats.frames_decoded as f64);
    UNKNOWN_FRAMES_TOTAL.set(stats.unknown_frames as f64);
    READINGS_TOTAL.set(stats.readings as f64);

    RECORDS_DELIVERED_TOTAL.set(snapshot.delivered as f64);
    RECORDS_BUFFERED_TOTAL.set(snapshot.buffered as f64);
    RECORDS_FLUSHED_TOTAL.set(snapshot.flushed as f64);
    QUEUE_DEPTH.set(snapshot.queue_depth as f64);
    UPLINK_CONNECTED.set(if snapshot.uplink_connected { 1.0 } else { 0.0 });

    if let Some(score) = snapshot.health_score {
        HEALTH_SCORE.set(score);
    }
    for (metric, score) in &snapshot.metric_scores {
        METRIC_HEALTH_SCORE.with_label_values(&[metric]).set(*score);
    }
    for (alert_type, by_severity) in &stats.alerts {
        for (severity, count) in by_severity {
            ALERTS_TOTAL
                .with_label_values(&[alert_type, severity])
                .set(*count as f64);
        }
    }

    DETECTOR_STATE.set(if snapshot.detector_state == "trained" { 1.0 } else { 0.0 });
    ACTIVE_DTCS.set(snapshot.active_dtcs.len() as f64);
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canlink::PipelineStats;

    #[test]
    fn test_encode_metrics() {
        let mut pipeline = PipelineStats::default();
        pipeline.frames_seen = 12;
        pipeline
            .alerts
            .entry("maintenance".to_string())
            .or_default()
            .insert("warning".to_string(), 2);

        let snapshot = StatusSnapshot {
            pipeline,
            queue_depth: 3,
            health_score: Some(0.92),
            detector_state: "trained".to_string(),
            ..Default::default()
        };
        update_from_snapshot(&snapshot);

        let output = encode_metrics();
        assert!(output.contains("canlink_frames_seen_total"));
        assert!(output.contains("canlink_queue_depth"));
        assert!(output.contains("canlink_alerts_total"));
        assert!(output.contains("alert_type=\"maintenance\""));
        assert!(output.contains("canlink_detector_state"));
    }
}
