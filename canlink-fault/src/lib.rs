// CANLink Fault - Predictive fault detection
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! # CANLink Fault
//!
//! Multivariate fault detection over an ordered set of vehicle metrics.
//!
//! - **Buffering**: feature vectors accumulate in a bounded ring buffer
//! - **Training**: an outlier model is fitted once enough samples exist
//! - **Scoring**: each new vector is scored by the model
//! - **Fallback**: a per-feature z-score check runs on every vector
//!
//! ## Usage
//!
//! ```rust
//! use canlink_fault::{DetectorConfig, FaultDetector};
//! use std::collections::BTreeMap;
//!
//! let mut detector = FaultDetector::new(DetectorConfig::with_features(["Engine_RPM"]));
//!
//! for i in 0..100 {
//!     let mut readings = BTreeMap::new();
//!     readings.insert("Engine_RPM".to_string(), 800.0 + (i % 5) as f64);
//!     if let Some(verdict) = detector.update(&readings) {
//!         assert!(!verdict.is_anomaly || verdict.model.is_some());
//!     }
//! }
//! ```
//!
//! ## Persistence
//!
//! [`FaultDetector::with_persistence`] stores each successful fit as a JSON
//! [`ModelSnapshot`] and loads a compatible snapshot at startup, so a
//! restarted detector begins in the `Trained` state.

pub mod config;
pub mod detector;
pub mod error;
pub mod forest;
pub mod model;

pub use config::{DetectorConfig, FallbackConfig, ForestConfig, ModelKind};
pub use detector::{DetectorState, DetectorStats, FaultDetector, FaultVerdict, FeatureDeviation};
pub use error::{FaultError, Result};
pub use forest::IsolationForest;
pub use model::{ModelSnapshot, NoopModel, OutlierModel, OutlierScore, SavedModel};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
