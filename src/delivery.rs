// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Store-and-forward delivery
//!
//! ```text
//! record ──► publisher ──ok──► flush queue oldest-first (stop on first failure)
//!               │
//!               └─fail──► durable queue
//! ```
//!
//! Delivery is at-least-once: an envelope is deleted only after its own
//! successful re-send, so a crash between send and delete duplicates it.

use crate::error::DeliveryError;
use crate::protocol::TelemetryRecord;
use crate::publisher::Publisher;
use crate::queue::DurableQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, DeliveryError>;

/// Delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Envelopes read from the queue per flush round
    pub flush_batch: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self { flush_batch: 100 }
    }
}

/// What happened to one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent now; `flushed` older envelopes went out behind it
    Delivered { flushed: usize },
    /// Stored in the durable queue under `id`
    Buffered { id: i64 },
}

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub buffered: u64,
    pub flushed: u64,
}

/// Publisher plus durable queue
pub struct DeliveryLayer<P: Publisher> {
    publisher: P,
    queue: DurableQueue,
    config: DeliveryConfig,
    stats: DeliveryStats,
}

impl<P: Publisher> DeliveryLayer<P> {
    pub fn new(publisher: P, queue: DurableQueue) -> Self {
        Self::with_config(publisher, queue, DeliveryConfig::default())
    }

    pub fn with_config(publisher: P, queue: DurableQueue, config: DeliveryConfig) -> Self {
        Self {
            publisher,
            queue,
            config,
            stats: DeliveryStats::default(),
        }
    }

    /// Serialize and deliver a record, buffering it on failure
    pub fn publish_or_buffer(&mut self, record: &TelemetryRecord) -> Result<DeliveryOutcome> {
        let payload = record.to_json()?;
        self.publish_payload(&payload)
    }

    /// Deliver an already serialized payload, buffering it on failure
    pub fn publish_payload(&mut self, payload: &str) -> Result<DeliveryOutcome> {
        if self.publisher.is_connected() {
            match self.publisher.send(payload) {
                Ok(()) => {
                    self.stats.delivered += 1;
                    let flushed = self.flush_pending()?;
                    return Ok(DeliveryOutcome::Delivered { flushed });
                }
                Err(e) if e.is_transient() => {
                    debug!(error = %e, "Publish failed, buffering");
                }
                Err(e) => return Err(e),
            }
        }

        let id = self.queue.append(payload)?;
        self.stats.buffered += 1;
        Ok(DeliveryOutcome::Buffered { id })
    }

    /// Re-send buffered envelopes oldest-first until the queue is empty or
    /// a send fails. Returns the number delivered.
    pub fn flush_pending(&mut self) -> Result<usize> {
        let mut flushed = 0;

        loop {
            let batch = self.queue.pending(self.config.flush_batch.max(1))?;
            if batch.is_empty() {
                break;
            }

            for envelope in batch {
                if !self.publisher.is_connected() {
                    return Ok(self.finish_flush(flushed));
                }
                match self.publisher.send(&envelope.payload) {
                    Ok(()) => {
                        self.queue.delete(envelope.id)?;
                        flushed += 1;
                    }
                    Err(e) if e.is_transient() => {
                        warn!(id = envelope.id, error = %e, "Flush interrupted");
                        return Ok(self.finish_flush(flushed));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(self.finish_flush(flushed))
    }

    fn finish_flush(&mut self, flushed: usize) -> usize {
        if flushed > 0 {
            self.stats.flushed += flushed as u64;
            info!(flushed, "Flushed buffered records");
        }
        flushed
    }

    /// Envelopes waiting in the durable queue
    pub fn queue_depth(&self) -> Result<usize> {
        self.queue.len()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    pub fn queue(&self) -> &DurableQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Reading;
    use crate::publisher::MemoryPublisher;

    fn record(i: usize) -> TelemetryRecord {
        let reading = Reading::new("Engine_RPM", 800.0 + i as f64, "rpm", 1000.0 + i as f64);
        TelemetryRecord::reading("veh-1", &reading, None, false)
    }

    fn layer() -> DeliveryLayer<MemoryPublisher> {
        DeliveryLayer::new(MemoryPublisher::new(), DurableQueue::in_memory().unwrap())
    }

    #[test]
    fn test_immediate_delivery() {
        let mut delivery = layer();
        let outcome = delivery.publish_or_buffer(&record(0)).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { flushed: 0 });
        assert_eq!(delivery.publisher().sent().len(), 1);
        assert_eq!(delivery.queue_depth().unwrap(), 0);
    }

    #[test]
    fn test_failures_buffer_then_flush_in_order() {
        let mut delivery = layer();
        delivery.publisher_mut().on_disconnect("outage");

        for i in 0..5 {
            let outcome = delivery.publish_or_buffer(&record(i)).unwrap();
            assert!(matches!(outcome, DeliveryOutcome::Buffered { .. }));
        }
        assert_eq!(delivery.queue_depth().unwrap(), 5);

        delivery.publisher_mut().on_connect();
        let outcome = delivery.publish_or_buffer(&record(5)).unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered { flushed: 5 });
        assert_eq!(delivery.queue_depth().unwrap(), 0);

        // Fresh record first, then the backlog oldest-first
        let expected: Vec<String> = [5, 0, 1, 2, 3, 4]
            .iter()
            .map(|&i| record(i).to_json().unwrap())
            .collect();
        let sent: Vec<String> = delivery.publisher().sent().iter().cloned().collect();
        assert_eq!(sent, expected);
        assert_eq!(delivery.stats().flushed, 5);
    }

    #[test]
    fn test_flush_stops_at_first_failure() {
        let mut delivery = layer();
        delivery.publisher_mut().on_disconnect("outage");
        for i in 0..3 {
            delivery.publish_or_buffer(&record(i)).unwrap();
        }
        delivery.publisher_mut().on_connect();
        delivery.publisher_mut().fail_next(1);
        assert_eq!(delivery.flush_pending().unwrap(), 0);
        assert_eq!(delivery.queue_depth().unwrap(), 3);

        assert_eq!(delivery.flush_pending().unwrap(), 3);
        assert_eq!(delivery.queue_depth().unwrap(), 0);
    }

    #[test]
    fn test_transport_error_buffers() {
        let mut delivery = layer();
        delivery.publisher_mut().fail_next(1);
        let outcome = delivery.publish_or_buffer(&record(0)).unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Buffered { .. }));
        assert_eq!(delivery.stats().buffered, 1);
    }

    #[test]
    fn test_small_flush_batches() {
        let mut delivery = DeliveryLayer::with_config(
            MemoryPublisher::disconnected(),
            DurableQueue::in_memory().unwrap(),
            DeliveryConfig { flush_batch: 2 },
        );
        for i in 0..7 {
            delivery.publish_or_buffer(&record(i)).unwrap();
        }
        delivery.publisher_mut().on_connect();
        assert_eq!(delivery.flush_pending().unwrap(), 7);
    }
}
