// CANLink Agent - HTTP uplink
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! HTTP publisher
//!
//! Posts each serialized record as a JSON body to the collector endpoint.
//! Link state follows a half-open pattern: after a failure the link is down
//! until `reconnect_interval_ms` has elapsed, then the next send is let
//! through as a probe. A successful probe reconnects, a failed one restarts
//! the interval.

use crate::error::Result;
use canlink::publisher::PublisherMetrics;
use canlink::{DeliveryError, LinkState, Publisher};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Uplink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Collector URL receiving one JSON record per POST
    pub endpoint: String,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Time the link stays down before the next probe
    pub reconnect_interval_ms: u64,
    /// Optional bearer token
    pub auth_token: Option<String>,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/telemetry".to_string(),
            timeout_ms: 5_000,
            reconnect_interval_ms: 10_000,
            auth_token: None,
        }
    }
}

/// Publisher posting records over HTTP
pub struct HttpPublisher {
    client: reqwest::blocking::Client,
    config: UplinkConfig,
    state: LinkState,
    last_failure: Option<Instant>,
    metrics: PublisherMetrics,
}

impl HttpPublisher {
    pub fn new(config: UplinkConfig) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            state: LinkState::Connected,
            last_failure: None,
            metrics: PublisherMetrics::default(),
        })
    }

    #[cfg(test)]
    fn state(&self) -> LinkState {
        self.state
    }

    fn probe_due(&self) -> bool {
        let interval = Duration::from_millis(self.config.reconnect_interval_ms);
        self.last_failure
            .map_or(true, |failed_at| failed_at.elapsed() >= interval)
    }

    fn post(&self, payload: &str) -> std::result::Result<(), DeliveryError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string());
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }
            } else {
                DeliveryError::PublishFailed {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::PublishFailed {
                reason: format!("collector returned {}", status),
            });
        }
        Ok(())
    }
}

impl Publisher for HttpPublisher {
    fn is_connected(&self) -> bool {
        match self.state {
            LinkState::Connected => true,
            LinkState::Disconnected => self.probe_due(),
        }
    }

    fn on_connect(&mut self) {
        if self.state == LinkState::Disconnected {
            info!(endpoint = %self.config.endpoint, "Uplink reconnected");
        }
        self.state = LinkState::Connected;
        self.last_failure = None;
    }

    fn on_disconnect(&mut self, reason: &str) {
        if self.state == LinkState::Connected {
            self.metrics.disconnects += 1;
            warn!(endpoint = %self.config.endpoint, reason, "Uplink lost");
        }
        self.state = LinkState::Disconnected;
        self.last_failure = Some(Instant::now());
    }

    fn send(&mut self, payload: &str) -> std::result::Result<(), DeliveryError> {
        if !self.is_connected() {
            return Err(DeliveryError::Disconnected {
                reason: "waiting for reconnect interval".to_string(),
            });
        }

        match self.post(payload) {
            Ok(()) => {
                self.metrics.messages_sent += 1;
                self.metrics.bytes_sent += payload.len() as u64;
                self.on_connect();
                debug!(bytes = payload.len(), "Record posted");
                Ok(())
            }
            Err(e) => {
                self.metrics.send_failures += 1;
                self.on_disconnect(&e.to_string());
                Err(e)
            }
        }
    }

    fn metrics(&self) -> PublisherMetrics {
        self.metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serve `count` requests with `status`, returning each request body.
    fn collector(status: u16, count: usize) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();

        thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    let lower = line.to_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut body = vec![0u8; content_length];
                reader.read_exact(&mut body).unwrap();
                tx.send(String::from_utf8(body).unwrap()).unwrap();

                let response = format!(
                    "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });

        (format!("http://{}/telemetry", addr), rx)
    }

    fn publisher(endpoint: String, reconnect_interval_ms: u64) -> HttpPublisher {
        HttpPublisher::new(UplinkConfig {
            endpoint,
            timeout_ms: 2_000,
            reconnect_interval_ms,
            auth_token: None,
        })
        .unwrap()
    }

    fn refused_endpoint() -> String {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}/telemetry", addr)
    }

    #[test]
    fn test_posts_payload() {
        let (endpoint, bodies) = collector(200, 1);
        let mut publisher = publisher(endpoint, 10_000);

        publisher.send(r#"{"device_id":"veh-1"}"#).unwrap();

        assert_eq!(bodies.recv().unwrap(), r#"{"device_id":"veh-1"}"#);
        assert!(publisher.is_connected());
        assert_eq!(publisher.metrics().messages_sent, 1);
    }

    #[test]
    fn test_server_error_disconnects() {
        let (endpoint, _bodies) = collector(503, 1);
        let mut publisher = publisher(endpoint, 60_000);

        let err = publisher.send("{}").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(publisher.state(), LinkState::Disconnected);
        assert!(!publisher.is_connected());
        assert_eq!(publisher.metrics().disconnects, 1);
    }

    #[test]
    fn test_refused_connection_is_transient() {
        let mut publisher = publisher(refused_endpoint(), 60_000);

        let err = publisher.send("{}").unwrap_err();
        assert!(err.is_transient());
        assert!(!publisher.is_connected());

        // Still inside the reconnect interval
        let err = publisher.send("{}").unwrap_err();
        assert!(matches!(err, DeliveryError::Disconnected { .. }));
        assert_eq!(publisher.metrics().send_failures, 1);
    }

    #[test]
    fn test_probe_after_interval_reconnects() {
        let (endpoint, bodies) = collector(200, 1);
        let mut publisher = publisher(endpoint, 0);
        publisher.on_disconnect("test");

        // Zero interval: a probe is due immediately
        assert!(publisher.is_connected());
        publisher.send("{\"probe\":true}").unwrap();
        assert_eq!(publisher.state(), LinkState::Connected);
        assert_eq!(bodies.recv().unwrap(), "{\"probe\":true}");
    }
}
