// CANLink Agent - Shared status
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! State shared between the ingestion thread and the HTTP handlers.

use canlink::{Pipeline, PipelineStats, Publisher};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub pipeline: PipelineStats,
    pub delivered: u64,
    pub buffered: u64,
    pub flushed: u64,
    pub queue_depth: usize,
    pub uplink_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
    pub metric_scores: BTreeMap<String, f64>,
    pub detector_state: String,
    pub active_dtcs: Vec<String>,
    /// Malformed input lines dropped by the frame source
    pub skipped_lines: usize,
}

impl StatusSnapshot {
    /// Capture the current state of a pipeline.
    pub fn capture<P: Publisher>(pipeline: &Pipeline<P>) -> Self {
        let delivery = pipeline.delivery();
        let health = pipeline.last_health();
        Self {
            device_id: pipeline.config().device_id.clone(),
            pipeline: pipeline.stats().clone(),
            delivered: delivery.stats().delivered,
            buffered: delivery.stats().buffered,
            flushed: delivery.stats().flushed,
            queue_depth: delivery.queue_depth().unwrap_or_default(),
            uplink_connected: delivery.publisher().is_connected(),
            health_score: health.map(|h| h.overall),
            health_status: health.map(|h| h.status.as_str().to_string()),
            metric_scores: health
                .map(|h| {
                    h.per_metric
                        .iter()
                        .map(|(name, m)| (name.clone(), m.score))
                        .collect()
                })
                .unwrap_or_default(),
            detector_state: pipeline.detector_state().as_str().to_string(),
            active_dtcs: pipeline.active_dtcs().iter().cloned().collect(),
            skipped_lines: 0,
        }
    }

    pub fn with_skipped_lines(mut self, skipped_lines: usize) -> Self {
        self.skipped_lines = skipped_lines;
        self
    }
}

/// Shared handle updated by the ingestion loop
#[derive(Debug, Default)]
pub struct AgentStatus {
    /// Pipeline constructed and consuming input
    pub running: AtomicBool,
    /// Input source exhausted
    pub finished: AtomicBool,
    snapshot: Mutex<StatusSnapshot>,
}

impl AgentStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        crate::metrics::update_from_snapshot(&snapshot);
        match self.snapshot.lock() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        match self.snapshot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Ready once ingestion has started, including after the source ended
    pub fn is_ready(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.finished.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canlink::{CanFrame, Decoder, DeliveryLayer, DurableQueue, MemoryPublisher, PipelineConfig};

    #[test]
    fn test_capture_pipeline() {
        let delivery = DeliveryLayer::new(MemoryPublisher::new(), DurableQueue::in_memory().unwrap());
        let mut pipeline = Pipeline::new(PipelineConfig::default(), Decoder::default(), delivery);
        pipeline
            .process_frame(&CanFrame::new(0x102, vec![0x84, 0x03]), 0.0)
            .unwrap();

        let snapshot = StatusSnapshot::capture(&pipeline);
        assert_eq!(snapshot.device_id, "canlink-edge");
        assert_eq!(snapshot.pipeline.frames_decoded, 1);
        assert_eq!(snapshot.queue_depth, 0);
        assert!(snapshot.uplink_connected);
        assert_eq!(snapshot.metric_scores.get("Coolant_Temp"), Some(&1.0));
        assert_eq!(snapshot.detector_state, "buffering");
    }

    #[test]
    fn test_shared_status() {
        let status = AgentStatus::new();
        assert!(!status.is_ready());

        status.running.store(true, Ordering::SeqCst);
        status.publish(StatusSnapshot {
            queue_depth: 7,
            ..Default::default()
        });
        assert!(status.is_ready());
        assert_eq!(status.snapshot().queue_depth, 7);
    }
}
