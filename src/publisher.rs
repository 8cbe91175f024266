// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Publisher abstraction
//!
//! A publisher moves one serialized record to the remote collector. It
//! tracks link state through `on_connect` / `on_disconnect` and refuses to
//! send while the link is down, so the delivery layer can buffer instead.

use crate::error::DeliveryError;
use std::collections::VecDeque;

/// Connection state of the uplink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Statistics about publisher usage
#[derive(Debug, Clone, Default)]
pub struct PublisherMetrics {
    /// Payloads accepted by the transport
    pub messages_sent: u64,
    /// Bytes accepted by the transport
    pub bytes_sent: u64,
    /// Send attempts that failed
    pub send_failures: u64,
    /// Number of disconnect transitions
    pub disconnects: u64,
}

/// Trait for uplink transports
pub trait Publisher {
    /// Whether the link is currently believed to be up
    fn is_connected(&self) -> bool;

    /// Link came up
    fn on_connect(&mut self);

    /// Link went down
    fn on_disconnect(&mut self, reason: &str);

    /// Send one serialized record. Must be bounded in time.
    fn send(&mut self, payload: &str) -> Result<(), DeliveryError>;

    /// Get publisher metrics
    fn metrics(&self) -> PublisherMetrics {
        PublisherMetrics::default()
    }
}

impl<P: Publisher + ?Sized> Publisher for Box<P> {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn on_connect(&mut self) {
        (**self).on_connect()
    }

    fn on_disconnect(&mut self, reason: &str) {
        (**self).on_disconnect(reason)
    }

    fn send(&mut self, payload: &str) -> Result<(), DeliveryError> {
        (**self).send(payload)
    }

    fn metrics(&self) -> PublisherMetrics {
        (**self).metrics()
    }
}

/// An in-memory publisher for testing and offline runs
#[derive(Debug)]
pub struct MemoryPublisher {
    sent: VecDeque<String>,
    state: LinkState,
    /// Fail this many upcoming sends even while connected
    fail_next: usize,
    metrics: PublisherMetrics,
}

impl MemoryPublisher {
    /// Create a connected publisher
    pub fn new() -> Self {
        Self {
            sent: VecDeque::new(),
            state: LinkState::Connected,
            fail_next: 0,
            metrics: PublisherMetrics::default(),
        }
    }

    /// Create a publisher whose link starts down
    pub fn disconnected() -> Self {
        Self {
            state: LinkState::Disconnected,
            ..Self::new()
        }
    }

    /// Make the next `n` sends fail with a transport error
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Payloads delivered so far, in delivery order
    pub fn sent(&self) -> &VecDeque<String> {
        &self.sent
    }

    /// Take all delivered payloads
    pub fn drain(&mut self) -> Vec<String> {
        self.sent.drain(..).collect()
    }
}

impl Default for MemoryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for MemoryPublisher {
    fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    fn on_connect(&mut self) {
        self.state = LinkState::Connected;
    }

    fn on_disconnect(&mut self, _reason: &str) {
        if self.state == LinkState::Connected {
            self.metrics.disconnects += 1;
        }
        self.state = LinkState::Disconnected;
    }

    fn send(&mut self, payload: &str) -> Result<(), DeliveryError> {
        if self.state == LinkState::Disconnected {
            return Err(DeliveryError::Disconnected {
                reason: "link is down".to_string(),
            });
        }

        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.metrics.send_failures += 1;
            return Err(DeliveryError::PublishFailed {
                reason: "simulated transport failure".to_string(),
            });
        }

        self.metrics.messages_sent += 1;
        self.metrics.bytes_sent += payload.len() as u64;
        self.sent.push_back(payload.to_string());
        Ok(())
    }

    fn metrics(&self) -> PublisherMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_publisher_send() {
        let mut publisher = MemoryPublisher::new();
        publisher.send("{\"a\":1}").unwrap();
        assert_eq!(publisher.sent().len(), 1);
        assert_eq!(publisher.metrics().bytes_sent, 7);
    }

    #[test]
    fn test_refuses_while_disconnected() {
        let mut publisher = MemoryPublisher::new();
        publisher.on_disconnect("test");
        assert!(!publisher.is_connected());

        let err = publisher.send("x").unwrap_err();
        assert!(matches!(err, DeliveryError::Disconnected { .. }));
        assert!(publisher.sent().is_empty());

        publisher.on_connect();
        publisher.send("x").unwrap();
        assert_eq!(publisher.drain(), vec!["x".to_string()]);
    }

    #[test]
    fn test_simulated_failures() {
        let mut publisher = MemoryPublisher::new();
        publisher.fail_next(2);
        assert!(publisher.send("a").is_err());
        assert!(publisher.send("b").is_err());
        assert!(publisher.send("c").is_ok());
        assert_eq!(publisher.metrics().send_failures, 2);
    }

    #[test]
    fn test_disconnect_counted_once() {
        let mut publisher = MemoryPublisher::disconnected();
        publisher.on_disconnect("again");
        assert_eq!(publisher.metrics().disconnects, 0);
        publisher.on_connect();
        publisher.on_disconnect("drop");
        assert_eq!(publisher.metrics().disconnects, 1);
    }
}
