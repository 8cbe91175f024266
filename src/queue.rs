// CANLink - Edge telemetry pipeline for vehicle CAN buses
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Durable outbound queue
//!
//! Serialized records that could not be published are appended to a SQLite
//! table and survive process restarts. Each append and each delete is its
//! own transaction, so a crash loses at most the record in flight.

use crate::error::DeliveryError;
use crate::protocol::unix_now;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

type Result<T> = std::result::Result<T, DeliveryError>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS outbound (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    enqueued_at REAL NOT NULL,
    payload     TEXT NOT NULL
)";

/// A buffered envelope awaiting re-delivery
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEnvelope {
    /// Monotonic identifier, never reused
    pub id: i64,
    /// Wall-clock seconds when the record was buffered
    pub enqueued_at: f64,
    /// Serialized record
    pub payload: String,
}

/// SQLite-backed FIFO of unsent payloads
#[derive(Debug)]
pub struct DurableQueue {
    conn: Connection,
}

impl DurableQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Volatile queue, used by tests and `--no-buffer` runs
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Append a payload, returning its id
    pub fn append(&self, payload: &str) -> Result<i64> {
        self.append_at(payload, unix_now())
    }

    /// Append with an explicit enqueue time
    pub fn append_at(&self, payload: &str, enqueued_at: f64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO outbound (enqueued_at, payload) VALUES (?1, ?2)",
            params![enqueued_at, payload],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Up to `limit` envelopes, oldest first
    pub fn pending(&self, limit: usize) -> Result<Vec<BufferedEnvelope>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, enqueued_at, payload FROM outbound ORDER BY id ASC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(BufferedEnvelope {
                id: row.get(0)?,
                enqueued_at: row.get(1)?,
                payload: row.get(2)?,
            })
        })?;

        let mut envelopes = Vec::new();
        for row in rows {
            envelopes.push(row?);
        }
        Ok(envelopes)
    }

    /// Oldest envelope, if any
    pub fn peek(&self) -> Result<Option<BufferedEnvelope>> {
        let envelope = self
            .conn
            .query_row(
                "SELECT id, enqueued_at, payload FROM outbound ORDER BY id ASC LIMIT 1",
                [],
                |row| {
                    Ok(BufferedEnvelope {
                        id: row.get(0)?,
                        enqueued_at: row.get(1)?,
                        payload: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(envelope)
    }

    /// Delete one envelope after confirmed delivery
    pub fn delete(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM outbound WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Number of envelopes awaiting delivery
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbound", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
