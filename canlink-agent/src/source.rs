// CANLink Agent - Frame sources
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Frame sources for the ingestion loop.
//!
//! [`CandumpSource`] reads the `candump -L` log format:
//!
//! ```text
//! (1700000000.123456) can0 7E8#0443010301000000
//! (1700000000.223456) can0 18FEEE00#7D00000000000000
//! (1700000000.323456) can1 102##1600400
//! ```
//!
//! Remote frames (`123#R`) and comment lines are skipped.

use crate::error::{AgentError, Result};
use canlink::CanFrame;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::warn;

/// A frame with its capture metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame {
    /// Capture time in UNIX seconds, when the log carries one
    pub timestamp: Option<f64>,
    pub interface: String,
    pub frame: CanFrame,
}

/// Anything that yields bus frames in arrival order
pub trait FrameSource {
    /// Next frame, or `None` at end of input.
    fn next_frame(&mut self) -> Result<Option<TimedFrame>>;

    /// Input lines dropped as malformed so far.
    fn skipped(&self) -> usize {
        0
    }
}

/// Parse one `candump -L` line.
///
/// Returns `Ok(None)` for blank lines, comments and remote frames.
pub fn parse_candump_line(line: &str) -> Result<Option<TimedFrame>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut parts = line.split_whitespace();
    let mut token = parts.next().unwrap_or_default();

    let timestamp = if token.starts_with('(') {
        let inner = token.trim_start_matches('(').trim_end_matches(')');
        let ts = inner
            .parse::<f64>()
            .map_err(|_| AgentError::InvalidFormat(format!("bad timestamp: {}", token)))?;
        token = parts
            .next()
            .ok_or_else(|| AgentError::InvalidFormat(format!("missing interface: {}", line)))?;
        Some(ts)
    } else {
        None
    };

    let interface = token.to_string();
    let body = parts
        .next()
        .ok_or_else(|| AgentError::InvalidFormat(format!("missing frame: {}", line)))?;

    let (id_hex, rest) = body
        .split_once('#')
        .ok_or_else(|| AgentError::InvalidFormat(format!("missing '#': {}", body)))?;

    let id = u32::from_str_radix(id_hex, 16)
        .map_err(|_| AgentError::InvalidFormat(format!("bad identifier: {}", id_hex)))?;

    // CAN FD: `id##<flags><data>`
    let data_hex = match rest.strip_prefix('#') {
        Some(fd) => fd.get(1..).unwrap_or_default(),
        None => rest,
    };
    if data_hex.starts_with('R') {
        return Ok(None);
    }

    Ok(Some(TimedFrame {
        timestamp,
        interface,
        frame: CanFrame::new(id, decode_hex(data_hex)?),
    }))
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    let hex: String = hex.chars().filter(|c| *c != '.').collect();
    if hex.len() % 2 != 0 {
        return Err(AgentError::InvalidFormat(format!("odd-length payload: {}", hex)));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| AgentError::InvalidFormat(format!("bad payload: {}", hex)))
        })
        .collect()
}

/// Reads `candump -L` lines from a file or stdin
pub struct CandumpSource<R: BufRead> {
    reader: R,
    line: String,
    line_no: usize,
    skipped: usize,
}

impl<R: BufRead> CandumpSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
            skipped: 0,
        }
    }
}

impl CandumpSource<BufReader<File>> {
    /// Open a candump log file.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AgentError::FileNotFound(path.display().to_string()));
        }
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> FrameSource for CandumpSource<R> {
    fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_frame(&mut self) -> Result<Option<TimedFrame>> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            match parse_candump_line(&self.line) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => continue,
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, error = %e, "Skipping malformed candump line");
                }
            }
        }
    }
}
