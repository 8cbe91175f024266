// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Historical log collaborator
//!
//! Vendor log formats are parsed outside the core; the pipeline only sees
//! already-normalized metric/value records.

use crate::decoder::MetricRecord;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A parsed historical log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalLog {
    /// Tool or vendor that produced the log
    pub vendor: String,
    /// Bus protocol the log was captured from
    pub protocol: String,
    /// Records in capture order
    pub records: Vec<MetricRecord>,
}

impl HistoricalLog {
    pub fn new(vendor: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            protocol: protocol.into(),
            records: Vec::new(),
        }
    }

    pub fn with_records(mut self, records: Vec<MetricRecord>) -> Self {
        self.records = records;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parses a vendor log file into a [`HistoricalLog`]
pub trait HistoricalLogParser {
    fn parse(&self, path: &Path) -> Result<HistoricalLog>;
}

/// Synthetic timestamp of the `index`-th replayed record.
pub fn synthetic_timestamp(start: f64, interval: f64, index: usize) -> f64 {
    start + index as f64 * interval
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let mut record = MetricRecord::new();
        record.insert("RPM".to_string(), 800.0);
        let log = HistoricalLog::new("generic-csv", "obd2").with_records(vec![record]);
        assert_eq!(log.len(), 1);
        assert_eq!(log.vendor, "generic-csv");
    }

    #[test]
    fn test_synthetic_timestamps_monotonic() {
        let stamps: Vec<f64> = (0..4).map(|i| synthetic_timestamp(100.0, 0.5, i)).collect();
        assert_eq!(stamps, vec![100.0, 100.5, 101.0, 101.5]);
    }
}
