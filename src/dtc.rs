// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Diagnostic trouble codes
//!
//! Decodes OBD-II mode 03 responses seen on the bus, looks codes up in a
//! small knowledge base and defines the [`DiagnosticService`] collaborator
//! that the pipeline polls for stored codes.
//!
//! # Mode 03 response on CAN
//!
//! ```text
//! [pci_len] [0x43] [count] [A1 B1] [A2 B2] ...
//!
//! A: bits 7-6 system (P, C, B, U), bits 5-4 first digit, bits 3-0 second digit
//! B: last two hex digits
//! ```

use crate::error::{CanLinkError, DecodeError, Result};
use crate::protocol::{CanFrame, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Positive response service id for "show stored DTCs"
pub const MODE_03_RESPONSE: u8 = 0x43;

/// Default ECU response identifier (engine ECU, 11-bit)
pub const DEFAULT_RESPONSE_ID: u32 = 0x7E8;

/// Decode one two-byte DTC. `None` for the `00 00` padding pair.
pub fn decode_dtc(a: u8, b: u8) -> Option<String> {
    if a == 0 && b == 0 {
        return None;
    }
    let system = match a >> 6 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    Some(format!("{}{}{:X}{:02X}", system, (a >> 4) & 0x03, a & 0x0F, b))
}

/// Extract trouble codes from a mode 03 response frame.
///
/// Returns `Ok(None)` for frames that are not mode 03 responses (the same
/// response id carries every OBD service).
pub fn decode_dtc_frame(frame: &CanFrame) -> std::result::Result<Option<Vec<String>>, DecodeError> {
    if frame.data.len() < 2 || frame.data[1] != MODE_03_RESPONSE {
        return Ok(None);
    }
    if frame.data.len() < 3 {
        return Err(DecodeError::MalformedDtc(format!("missing count in {}", frame)));
    }

    let count = frame.data[2] as usize;
    let pairs = &frame.data[3..];
    if pairs.len() % 2 != 0 && pairs.len() / 2 < count {
        return Err(DecodeError::MalformedDtc(format!("truncated pair in {}", frame)));
    }

    let codes = pairs
        .chunks_exact(2)
        .take(count)
        .filter_map(|pair| decode_dtc(pair[0], pair[1]))
        .collect();
    Ok(Some(codes))
}

/// Knowledge base entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtcInfo {
    pub description: String,
    pub severity: Severity,
    pub insight: String,
}

/// Analysis of one trouble code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtcInsight {
    pub code: String,
    pub description: String,
    pub severity: Severity,
    pub insight: String,
    pub known: bool,
}

/// Code -> human readable insight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcKnowledgeBase {
    entries: HashMap<String, DtcInfo>,
}

impl DtcKnowledgeBase {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, code: &str, severity: Severity, description: &str, insight: &str) -> Self {
        self.entries.insert(
            code.to_string(),
            DtcInfo {
                description: description.to_string(),
                severity,
                insight: insight.to_string(),
            },
        );
        self
    }

    pub fn get(&self, code: &str) -> Option<&DtcInfo> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look a code up. Unknown codes get a generic warning-level insight.
    pub fn analyze(&self, code: &str) -> DtcInsight {
        let code = code.trim().to_uppercase();
        match self.entries.get(&code) {
            Some(info) => DtcInsight {
                code,
                description: info.description.clone(),
                severity: info.severity,
                insight: info.insight.clone(),
                known: true,
            },
            None => {
                let system = match code.chars().next() {
                    Some('P') => "powertrain",
                    Some('C') => "chassis",
                    Some('B') => "body",
                    Some('U') => "network",
                    _ => "unknown",
                };
                DtcInsight {
                    description: format!("Unrecognized {} code {}", system, code),
                    insight: "Consult the manufacturer service information for this code.".to_string(),
                    code,
                    severity: Severity::Warning,
                    known: false,
                }
            }
        }
    }
}

impl Default for DtcKnowledgeBase {
    fn default() -> Self {
        Self::empty()
            .with_entry(
                "P0300",
                Severity::Critical,
                "Random/multiple cylinder misfire detected",
                "Check spark plugs, ignition coils and injectors; sustained misfire damages the catalytic converter.",
            )
            .with_entry(
                "P0301",
                Severity::Warning,
                "Cylinder 1 misfire detected",
                "Swap the cylinder 1 coil with a neighbour to see if the misfire follows it.",
            )
            .with_entry(
                "P0171",
                Severity::Warning,
                "System too lean (bank 1)",
                "Look for vacuum leaks, a weak fuel pump or a contaminated MAF sensor.",
            )
            .with_entry(
                "P0172",
                Severity::Warning,
                "System too rich (bank 1)",
                "Inspect for leaking injectors, high fuel pressure or a stuck-open purge valve.",
            )
            .with_entry(
                "P0420",
                Severity::Warning,
                "Catalyst system efficiency below threshold (bank 1)",
                "Verify downstream O2 sensor operation before replacing the catalyst.",
            )
            .with_entry(
                "P0128",
                Severity::Info,
                "Coolant thermostat below regulating temperature",
                "Thermostat is likely stuck open; expect poor fuel economy and slow warm-up.",
            )
            .with_entry(
                "P0217",
                Severity::Critical,
                "Engine coolant over-temperature condition",
                "Stop the engine as soon as it is safe; check coolant level, fan and water pump.",
            )
            .with_entry(
                "P0520",
                Severity::Warning,
                "Engine oil pressure sensor/switch circuit",
                "Confirm actual oil pressure with a mechanical gauge before suspecting the sensor.",
            )
            .with_entry(
                "P0562",
                Severity::Warning,
                "System voltage low",
                "Test battery state of health and alternator output.",
            )
            .with_entry(
                "P0101",
                Severity::Warning,
                "Mass air flow circuit range/performance",
                "Clean or replace the MAF sensor and check the intake for unmetered air.",
            )
            .with_entry(
                "U0100",
                Severity::Critical,
                "Lost communication with ECM/PCM",
                "Inspect CAN wiring, terminations and ECM power and ground.",
            )
    }
}

/// Request/response diagnostic collaborator
pub trait DiagnosticService {
    /// Read stored trouble codes
    fn read_trouble_codes(&mut self) -> Result<Vec<String>>;

    /// Clear stored trouble codes. Returns `true` if the ECU acknowledged.
    fn clear_trouble_codes(&mut self) -> Result<bool>;
}

/// An in-memory diagnostic service for testing and simulation
#[derive(Debug, Default)]
pub struct MemoryDiagnostics {
    codes: Vec<String>,
    available: bool,
}

impl MemoryDiagnostics {
    pub fn new(codes: Vec<String>) -> Self {
        Self {
            codes,
            available: true,
        }
    }

    /// Simulate the transport going away
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn push_code(&mut self, code: impl Into<String>) {
        self.codes.push(code.into());
    }
}

impl DiagnosticService for MemoryDiagnostics {
    fn read_trouble_codes(&mut self) -> Result<Vec<String>> {
        if !self.available {
            return Err(CanLinkError::Diagnostic("transport unavailable".to_string()));
        }
        Ok(self.codes.clone())
    }

    fn clear_trouble_codes(&mut self) -> Result<bool> {
        if !self.available {
            return Err(CanLinkError::Diagnostic("transport unavailable".to_string()));
        }
        self.codes.clear();
        Ok(true)
    }
}
