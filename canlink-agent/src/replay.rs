// CANLink Agent - Historical log replay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! CSV log parsing for historical replay.
//!
//! The header row names the metrics. An optional leading `timestamp` or
//! `timestamp_ms` column is ignored; replay assigns synthetic timestamps.
//! Empty or unparsable cells are skipped.

use crate::error::{AgentError, Result};
use canlink::{HistoricalLog, HistoricalLogParser, MetricRecord};
use std::path::Path;
use tracing::{debug, info};

/// Column names treated as capture time rather than a metric
const TIMESTAMP_COLUMNS: [&str; 3] = ["timestamp", "timestamp_ms", "time"];

/// Parses exported logger CSV files
#[derive(Debug, Clone)]
pub struct CsvLogParser {
    vendor: String,
    protocol: String,
}

impl CsvLogParser {
    pub fn new(vendor: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            protocol: protocol.into(),
        }
    }

    /// Parse a CSV file into a historical log.
    pub fn parse_csv(&self, path: &Path) -> Result<HistoricalLog> {
        if !path.exists() {
            return Err(AgentError::FileNotFound(path.display().to_string()));
        }

        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let header_strs: Vec<&str> = headers.iter().map(str::trim).collect();

        let skip = match header_strs.first() {
            None => {
                return Err(AgentError::InvalidFormat("Missing header row".to_string()));
            }
            Some(first) if TIMESTAMP_COLUMNS.contains(&first.to_lowercase().as_str()) => 1,
            Some(_) => 0,
        };
        let metrics: Vec<String> = header_strs[skip..].iter().map(|s| s.to_string()).collect();
        if metrics.is_empty() {
            return Err(AgentError::InvalidFormat("No metric columns".to_string()));
        }

        let mut records = Vec::new();
        for result in reader.records() {
            let row = result?;
            let mut record = MetricRecord::new();
            for (metric, cell) in metrics.iter().zip(row.iter().skip(skip)) {
                let cell = cell.trim();
                if cell.is_empty() {
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(value) => {
                        record.insert(metric.clone(), value);
                    }
                    Err(_) => debug!(metric = %metric, cell, "Skipping non-numeric cell"),
                }
            }
            if !record.is_empty() {
                records.push(record);
            }
        }

        if records.is_empty() {
            return Err(AgentError::EmptyLog);
        }

        info!(
            "Loaded log: {} metrics, {} records",
            metrics.len(),
            records.len()
        );

        Ok(HistoricalLog::new(self.vendor.clone(), self.protocol.clone()).with_records(records))
    }
}

impl Default for CsvLogParser {
    fn default() -> Self {
        Self::new("generic-csv", "obd2")
    }
}

impl HistoricalLogParser for CsvLogParser {
    fn parse(&self, path: &Path) -> canlink::Result<HistoricalLog> {
        Ok(self.parse_csv(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_csv(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_with_timestamp_column() {
        let file = write_csv(&[
            "timestamp,RPM,ECT",
            "1000,850,88.5",
            "2000,900,89.0",
            "3000,,89.5",
        ]);
        let log = CsvLogParser::default().parse(file.path()).unwrap();

        assert_eq!(log.len(), 3);
        assert_eq!(log.vendor, "generic-csv");
        assert_eq!(log.records[0].get("RPM"), Some(&850.0));
        assert!(!log.records[0].contains_key("timestamp"));
        assert!(!log.records[2].contains_key("RPM"));
        assert_eq!(log.records[2].get("ECT"), Some(&89.5));
    }

    #[test]
    fn test_parse_without_timestamp_column() {
        let file = write_csv(&["Engine_RPM,Fuel_Level", "800,55", "810,54.5"]);
        let log = CsvLogParser::new("torque", "obd2").parse(file.path()).unwrap();

        assert_eq!(log.len(), 2);
        assert_eq!(log.protocol, "obd2");
        assert_eq!(log.records[1].get("Fuel_Level"), Some(&54.5));
    }

    #[test]
    fn test_non_numeric_cells_skipped() {
        let file = write_csv(&["RPM,Gear", "800,N", "1500,2"]);
        let log = CsvLogParser::default().parse_csv(file.path()).unwrap();
        assert!(!log.records[0].contains_key("Gear"));
        assert_eq!(log.records[1].get("Gear"), Some(&2.0));
    }

    #[test]
    fn test_missing_file() {
        let err = CsvLogParser::default()
            .parse_csv(Path::new("/nonexistent/log.csv"))
            .unwrap_err();
        assert!(matches!(err, AgentError::FileNotFound(_)));
    }

    #[test]
    fn test_empty_log() {
        let file = write_csv(&["timestamp,RPM"]);
        let err = CsvLogParser::default().parse_csv(file.path()).unwrap_err();
        assert!(matches!(err, AgentError::EmptyLog));
    }
}
