// CANLink Agent - Configuration
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Agent configuration file.
//!
//! A JSON document; every section is optional and falls back to defaults:
//!
//! ```json
//! {
//!   "pipeline": { "device_id": "truck-17", "score_interval_secs": 5.0 },
//!   "uplink": { "endpoint": "https://collector.example/telemetry" },
//!   "queue_path": "/var/lib/canlink/outbound.db",
//!   "signal_database": "/etc/canlink/vehicle.json"
//! }
//! ```

use crate::error::{AgentError, Result};
use crate::uplink::UplinkConfig;
use canlink::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the persisted detector model, next to the queue database
pub const MODEL_FILE_NAME: &str = "fault-model.json";

/// Replay options for a historical log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayOptions {
    /// Timestamp of the first replayed record
    pub start: Option<f64>,
    /// Seconds between replayed records
    pub interval_secs: f64,
    /// Fit the fault detector on the log before replaying it
    pub train_detector: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            start: None,
            interval_secs: 1.0,
            train_detector: false,
        }
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub pipeline: PipelineConfig,
    pub uplink: UplinkConfig,
    /// SQLite file backing the durable queue
    pub queue_path: PathBuf,
    /// Persisted detector model; defaults to a file next to the queue
    pub model_path: Option<PathBuf>,
    /// JSON signal database; the built-in table is used when absent
    pub signal_database: Option<PathBuf>,
    pub replay: ReplayOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            uplink: UplinkConfig::default(),
            queue_path: PathBuf::from("canlink-outbound.db"),
            model_path: None,
            signal_database: None,
            replay: ReplayOptions::default(),
        }
    }
}

impl AgentConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AgentError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.device_id.trim().is_empty() {
            return Err(AgentError::Config("device_id must not be empty".to_string()));
        }
        if self.pipeline.score_interval_secs <= 0.0 {
            return Err(AgentError::Config(
                "score_interval_secs must be positive".to_string(),
            ));
        }
        if self.replay.interval_secs < 0.0 {
            return Err(AgentError::Config(
                "replay interval_secs must not be negative".to_string(),
            ));
        }
        if self.uplink.endpoint.is_empty() {
            return Err(AgentError::Config("uplink endpoint is required".to_string()));
        }
        Ok(())
    }

    /// Where the detector model is persisted.
    pub fn model_path(&self) -> PathBuf {
        self.model_path.clone().unwrap_or_else(|| {
            self.queue_path
                .parent()
                .map(|dir| dir.join(MODEL_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(MODEL_FILE_NAME))
        })
    }
}
