//! # CANLink - Edge telemetry pipeline for vehicle CAN buses
//!
//! An edge agent core that turns raw bus frames into named readings,
//! analyzes them in real time and forwards everything to a remote collector
//! without losing data across network outages.
//!
//! ## Key Features
//!
//! - **Decoding**: Signal database or static table, vendor names canonicalized
//! - **Rolling analytics**: Per-metric windows, rolling average, z-score flags
//! - **Health score**: Weighted per-metric scoring with status buckets
//! - **Maintenance advisor**: Rate-limited threshold and trend alerts
//! - **Fault detection**: Trainable multivariate detector (`canlink-fault`)
//! - **Store-and-forward**: SQLite-backed queue, at-least-once delivery
//!
//! ## Quick Start
//!
//! ```rust
//! use canlink::{CanFrame, Decoder, DeliveryLayer, DurableQueue, MemoryPublisher, Pipeline, PipelineConfig};
//!
//! let delivery = DeliveryLayer::new(MemoryPublisher::new(), DurableQueue::in_memory().unwrap());
//! let mut pipeline = Pipeline::new(PipelineConfig::default(), Decoder::default(), delivery);
//!
//! // Coolant temperature 0x0384 * 0.1 = 90.0 °C
//! pipeline.process_frame(&CanFrame::new(0x102, vec![0x84, 0x03]), 0.0).unwrap();
//!
//! let health = pipeline.last_health().unwrap();
//! assert_eq!(health.per_metric["Coolant_Temp"].score, 1.0);
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Frames, readings and the telemetry wire payload
//! - [`decoder`]: Frame decoding strategies
//! - [`canonical`]: Metric alias vocabulary
//! - [`analytics`]: Rolling windows
//! - [`health`]: Health scoring
//! - [`maintenance`]: Threshold and trend alerts
//! - [`dtc`]: Trouble code decoding and knowledge base
//! - [`queue`], [`publisher`], [`delivery`]: Store-and-forward
//! - [`pipeline`]: Orchestration

// Modules
pub mod analytics;
pub mod canonical;
pub mod decoder;
pub mod delivery;
pub mod dtc;
pub mod error;
pub mod health;
pub mod history;
pub mod maintenance;
pub mod pipeline;
pub mod protocol;
pub mod publisher;
pub mod queue;

// Re-exports for convenient access
pub use analytics::{AnalyticsConfig, AnalyticsEngine};
pub use canonical::MetricVocabulary;
pub use decoder::{Decoder, MetricRecord, SignalDatabase, StaticTable};
pub use delivery::{DeliveryConfig, DeliveryLayer, DeliveryOutcome, DeliveryStats};
pub use dtc::{DiagnosticService, DtcInsight, DtcKnowledgeBase, MemoryDiagnostics};
pub use error::{CanLinkError, DecodeError, DeliveryError, Result};
pub use health::{HealthEngine, HealthRules, HealthScoreResult, HealthStatus, ScoringRule};
pub use history::{HistoricalLog, HistoricalLogParser};
pub use maintenance::{MaintenanceAdvisor, MaintenanceAlert, MaintenanceConfig, ThresholdRule};
pub use pipeline::{Pipeline, PipelineConfig, PipelineStats};
pub use protocol::{AlertType, CanFrame, Reading, RecordBody, Severity, TelemetryRecord};
pub use publisher::{LinkState, MemoryPublisher, Publisher};
pub use queue::{BufferedEnvelope, DurableQueue};

pub use canlink_fault as fault;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
