// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Signal decoder
//!
//! Turns raw bus frames into named [`Reading`]s. Two strategies are
//! available, chosen when the [`Decoder`] is built:
//!
//! - **Database**: a [`SignalDatabase`] describing every signal of every
//!   frame (bit position, length, byte order, scale, offset, unit).
//! - **Static**: a small [`StaticTable`] of frame ids whose first two payload
//!   bytes hold one little-endian `u16` value.
//!
//! Frames with an identifier the strategy does not know yield `None`; most
//! bus traffic is irrelevant to telemetry.
//!
//! # Signal database format
//!
//! ```text
//! {"frames": [{"id": 256, "name": "ENGINE_1", "signals": [
//!     {"name": "Engine_RPM", "start_bit": 0, "length": 16,
//!      "little_endian": true, "signed": false,
//!      "scale": 0.25, "offset": 0.0, "unit": "rpm"}]}]}
//! ```

use crate::canonical::{metrics, MetricVocabulary};
use crate::error::DecodeError;
use crate::protocol::{CanFrame, Reading};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, warn};

/// A pre-parsed log record: metric name -> value
pub type MetricRecord = BTreeMap<String, f64>;

fn default_true() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

/// Layout of one signal inside a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLayout {
    pub name: String,
    /// Intel: LSB position. Motorola: MSB position (DBC sawtooth numbering).
    pub start_bit: u32,
    /// Bit length (1-64)
    pub length: u32,
    #[serde(default = "default_true")]
    pub little_endian: bool,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
}

impl SignalLayout {
    /// Extract the raw integer for this signal from a payload.
    pub fn extract_raw(&self, data: &[u8]) -> Result<i64, DecodeError> {
        if self.length == 0 || self.length > 64 {
            return Err(self.out_of_range(data));
        }

        let mut raw: u64 = 0;
        if self.little_endian {
            let end = self
                .start_bit
                .checked_add(self.length)
                .ok_or_else(|| self.out_of_range(data))?;
            if end as usize > data.len() * 8 {
                return Err(self.out_of_range(data));
            }
            for i in 0..self.length {
                let bit = self.start_bit + i;
                let byte = data[(bit / 8) as usize];
                let value = (byte >> (bit % 8)) & 1;
                raw |= (value as u64) << i;
            }
        } else {
            let mut pos = self.start_bit;
            for _ in 0..self.length {
                let idx = (pos / 8) as usize;
                if idx >= data.len() {
                    return Err(self.out_of_range(data));
                }
                let value = (data[idx] >> (pos % 8)) & 1;
                raw = (raw << 1) | value as u64;
                // Next less significant bit: wrap to bit 7 of the next byte
                pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
            }
        }

        if self.signed && self.length < 64 && (raw >> (self.length - 1)) & 1 == 1 {
            raw |= !0u64 << self.length;
        }

        Ok(raw as i64)
    }

    /// Decode the physical value (`raw * scale + offset`).
    pub fn decode(&self, data: &[u8]) -> Result<f64, DecodeError> {
        let raw = self.extract_raw(data)?;
        let raw = if self.signed { raw as f64 } else { raw as u64 as f64 };
        Ok(raw * self.scale + self.offset)
    }

    fn out_of_range(&self, data: &[u8]) -> DecodeError {
        DecodeError::SignalOutOfRange {
            signal: self.name.clone(),
            start: self.start_bit,
            end: self.start_bit.saturating_add(self.length),
            available: data.len() * 8,
        }
    }
}

/// Description of one frame and its signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLayout {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    pub signals: Vec<SignalLayout>,
}

#[derive(Deserialize)]
struct DatabaseFile {
    frames: Vec<FrameLayout>,
}

/// Signal descriptions keyed by frame identifier.
#[derive(Debug, Clone, Default)]
pub struct SignalDatabase {
    frames: HashMap<u32, FrameLayout>,
}

impl SignalDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON signal database.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let file: DatabaseFile = serde_json::from_str(json)
            .map_err(|e| DecodeError::InvalidDatabase(e.to_string()))?;
        let mut db = Self::new();
        for frame in file.frames {
            db.add_frame(frame);
        }
        Ok(db)
    }

    /// Load a JSON signal database from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| DecodeError::InvalidDatabase(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn add_frame(&mut self, frame: FrameLayout) {
        self.frames.insert(frame.id, frame);
    }

    pub fn frame(&self, id: u32) -> Option<&FrameLayout> {
        self.frames.get(&id)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// One entry of the static fallback table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticSignal {
    pub name: String,
    pub scale: f64,
    pub unit: String,
}

/// Frame id -> single little-endian `u16` signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTable {
    entries: HashMap<u32, StaticSignal>,
}

impl StaticTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, id: u32, name: &str, scale: f64, unit: &str) -> Self {
        self.entries.insert(
            id,
            StaticSignal {
                name: name.to_string(),
                scale,
                unit: unit.to_string(),
            },
        );
        self
    }

    pub fn get(&self, id: u32) -> Option<&StaticSignal> {
        self.entries.get(&id)
    }
}

impl Default for StaticTable {
    fn default() -> Self {
        Self::empty()
            .with_entry(0x100, metrics::ENGINE_RPM, 0.25, "rpm")
            .with_entry(0x101, metrics::VEHICLE_SPEED, 0.01, "km/h")
            .with_entry(0x102, metrics::COOLANT_TEMP, 0.1, "°C")
            .with_entry(0x103, metrics::OIL_PRESSURE, 0.1, "psi")
            .with_entry(0x104, metrics::BATTERY_VOLTAGE, 0.001, "V")
            .with_entry(0x105, metrics::ENGINE_LOAD, 0.01, "%")
            .with_entry(0x106, metrics::INTAKE_AIR_TEMP, 0.1, "°C")
            .with_entry(0x107, metrics::THROTTLE_POSITION, 0.01, "%")
            .with_entry(0x108, metrics::FUEL_LEVEL, 0.01, "%")
            .with_entry(0x109, metrics::OIL_TEMP, 0.1, "°C")
    }
}

/// Decoding strategy, fixed at construction.
#[derive(Debug, Clone)]
pub enum DecodeStrategy {
    Database(SignalDatabase),
    Static(StaticTable),
}

/// Frame decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    strategy: DecodeStrategy,
}

impl Decoder {
    /// Decoder backed by a signal database
    pub fn with_database(db: SignalDatabase) -> Self {
        Self {
            strategy: DecodeStrategy::Database(db),
        }
    }

    /// Decoder backed by a static table
    pub fn with_static_table(table: StaticTable) -> Self {
        Self {
            strategy: DecodeStrategy::Static(table),
        }
    }

    pub fn strategy(&self) -> &DecodeStrategy {
        &self.strategy
    }

    /// Decode a frame into readings. `None` for frames this decoder does not know.
    pub fn decode(&self, frame: &CanFrame, timestamp: f64) -> Option<Vec<Reading>> {
        match &self.strategy {
            DecodeStrategy::Database(db) => {
                let layout = db.frame(frame.id)?;
                let mut readings = Vec::with_capacity(layout.signals.len());
                for signal in &layout.signals {
                    match signal.decode(&frame.data) {
                        Ok(value) => readings.push(Reading::new(
                            signal.name.as_str(),
                            value,
                            signal.unit.as_str(),
                            timestamp,
                        )),
                        Err(e) => warn!(frame = %frame, "Skipping signal: {}", e),
                    }
                }
                Some(readings)
            }
            DecodeStrategy::Static(table) => {
                let entry = table.get(frame.id)?;
                if frame.data.len() < 2 {
                    debug!(frame = %frame, "Payload too short for static signal");
                    return None;
                }
                let raw = u16::from_le_bytes([frame.data[0], frame.data[1]]);
                Some(vec![Reading::new(
                    entry.name.as_str(),
                    raw as f64 * entry.scale,
                    entry.unit.as_str(),
                    timestamp,
                )])
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_static_table(StaticTable::default())
    }
}

/// Turn a pre-parsed log record into readings.
///
/// Metric names are kept as logged; units come from the canonical vocabulary.
pub fn decode_record(
    record: &MetricRecord,
    timestamp: f64,
    vocabulary: &MetricVocabulary,
) -> Vec<Reading> {
    record
        .iter()
        .filter(|(_, value)| value.is_finite())
        .map(|(name, value)| {
            let unit = vocabulary.unit_for(vocabulary.canonical_metric(name));
            Reading::new(name.as_str(), *value, unit, timestamp)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_static_decode_little_endian() {
        let decoder = Decoder::default();
        // 1120 * 0.1 = 112.0
        let frame = CanFrame::new(0x102, vec![0x60, 0x04, 0x00]);
        let readings = decoder.decode(&frame, 5.0).unwrap();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, "Coolant_Temp");
        assert_relative_eq!(readings[0].value, 112.0, epsilon = 1e-9);
        assert_eq!(readings[0].unit, "°C");
        assert_eq!(readings[0].timestamp, 5.0);
    }

    #[test]
    fn test_unknown_frame_is_none() {
        let decoder = Decoder::default();
        assert!(decoder.decode(&CanFrame::new(0x7FF, vec![1, 2]), 0.0).is_none());
    }

    #[test]
    fn test_static_short_payload_is_none() {
        let decoder = Decoder::default();
        assert!(decoder.decode(&CanFrame::new(0x100, vec![1]), 0.0).is_none());
    }

    #[test]
    fn test_database_decode_multiple_signals() {
        let json = r#"{"frames": [{"id": 256, "name": "ENGINE_1", "signals": [
            {"name": "EngineRPM", "start_bit": 0, "length": 16, "scale": 0.25, "unit": "rpm"},
            {"name": "ECT", "start_bit": 16, "length": 8, "offset": -40.0, "unit": "°C"}
        ]}]}"#;
        let decoder = Decoder::with_database(SignalDatabase::from_json(json).unwrap());

        // RPM raw 0x2EE0 = 12000 -> 3000 rpm; ECT raw 130 -> 90 °C
        let frame = CanFrame::new(256, vec![0xE0, 0x2E, 130, 0, 0, 0, 0, 0]);
        let readings = decoder.decode(&frame, 1.0).unwrap();

        assert_eq!(readings.len(), 2);
        assert_relative_eq!(readings[0].value, 3000.0);
        assert_eq!(readings[1].metric, "ECT");
        assert_relative_eq!(readings[1].value, 90.0);
    }

    #[test]
    fn test_motorola_signal() {
        let signal = SignalLayout {
            name: "Speed".to_string(),
            start_bit: 7,
            length: 16,
            little_endian: false,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
        };
        assert_eq!(signal.extract_raw(&[0x12, 0x34]).unwrap(), 0x1234);
    }

    #[test]
    fn test_signed_signal() {
        let signal = SignalLayout {
            name: "Torque".to_string(),
            start_bit: 0,
            length: 8,
            little_endian: true,
            signed: true,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
        };
        assert_relative_eq!(signal.decode(&[0xFE]).unwrap(), -2.0);
    }

    #[test]
    fn test_start_bit_near_max_is_out_of_range() {
        let signal = SignalLayout {
            name: "Garbage".to_string(),
            start_bit: u32::MAX - 3,
            length: 16,
            little_endian: true,
            signed: false,
            scale: 1.0,
            offset: 0.0,
            unit: String::new(),
        };
        let err = signal.extract_raw(&[0; 8]).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::SignalOutOfRange { end: u32::MAX, .. }
        ));

        let motorola = SignalLayout {
            little_endian: false,
            ..signal
        };
        assert!(motorola.extract_raw(&[0; 8]).is_err());
    }

    #[test]
    fn test_signal_out_of_range_is_skipped() {
        let json = r#"{"frames": [{"id": 1, "signals": [
            {"name": "A", "start_bit": 0, "length": 8},
            {"name": "B", "start_bit": 56, "length": 16}
        ]}]}"#;
        let decoder = Decoder::with_database(SignalDatabase::from_json(json).unwrap());
        let readings = decoder.decode(&CanFrame::new(1, vec![7; 8]), 0.0).unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, "A");
    }

    #[test]
    fn test_invalid_database() {
        assert!(matches!(
            SignalDatabase::from_json("{not json"),
            Err(DecodeError::InvalidDatabase(_))
        ));
    }

    #[test]
    fn test_decode_record() {
        let vocab = MetricVocabulary::default();
        let mut record = MetricRecord::new();
        record.insert("OilPressure".to_string(), 42.0);
        record.insert("Bogus".to_string(), f64::NAN);

        let readings = decode_record(&record, 3.0, &vocab);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].metric, "OilPressure");
        assert_eq!(readings[0].unit, "psi");
    }
}
