//! SQLite attendance table with once-per-day insertion.

use crate::TIMESTAMP_FORMAT;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Serialize, Serializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    roll_no     INTEGER,
    name        TEXT NOT NULL,
    confidence  REAL NOT NULL,
    image_path  TEXT NOT NULL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_roll ON attendance (roll_no, timestamp);
CREATE INDEX IF NOT EXISTS idx_attendance_name ON attendance (name, timestamp);
";

const LATEST_BY_ROLL: &str =
    "SELECT timestamp FROM attendance WHERE roll_no = ?1 ORDER BY timestamp DESC LIMIT 1";
const LATEST_BY_NAME: &str =
    "SELECT timestamp FROM attendance WHERE name = ?1 ORDER BY timestamp DESC LIMIT 1";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("unparseable stored timestamp: {0:?}")]
    BadTimestamp(String),
}

/// Which column identifies a person for the once-per-day rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupeKey {
    Roll(i64),
    Name(String),
}

impl DedupeKey {
    /// Roll number when it parses as an integer, otherwise the name.
    pub fn resolve(roll_no: Option<&str>, name: &str) -> Self {
        match roll_no.and_then(|r| r.trim().parse::<i64>().ok()) {
            Some(roll) => DedupeKey::Roll(roll),
            None => DedupeKey::Name(name.to_string()),
        }
    }
}

/// A mark request.
#[derive(Debug, Clone)]
pub struct NewAttendance<'a> {
    /// Raw roll number as supplied; non-integer values fall back to name dedupe.
    pub roll_no: Option<&'a str>,
    pub name: &'a str,
    pub confidence: f64,
    pub image_path: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Inserted,
    AlreadyMarked,
}

impl MarkOutcome {
    pub fn inserted(self) -> bool {
        self == MarkOutcome::Inserted
    }
}

/// One stored attendance row.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub roll_no: Option<i64>,
    pub name: String,
    pub confidence: f64,
    pub image_path: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: NaiveDateTime,
}

fn serialize_timestamp<S: Serializer>(
    ts: &NaiveDateTime,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
}

fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|_| StoreError::BadTimestamp(raw.to_string()))
}

/// Clamp into 0–100; NaN becomes 0.
fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 100.0)
    }
}

/// Connection to the attendance database.
pub struct AttendanceStore {
    conn: Connection,
}

impl AttendanceStore {
    /// Open (creating if needed) the database file and its schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a row unless the identity already has one dated `now.date()`.
    ///
    /// The lookup and insert share an IMMEDIATE transaction, so two writers
    /// marking the same identity serialize on the database write lock.
    pub fn mark_unique(
        &mut self,
        entry: &NewAttendance<'_>,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, StoreError> {
        let key = DedupeKey::resolve(entry.roll_no, entry.name);
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last: Option<String> = match &key {
            DedupeKey::Roll(roll) => {
                tx.query_row(LATEST_BY_ROLL, [roll], |row| row.get(0)).optional()?
            }
            DedupeKey::Name(name) => {
                tx.query_row(LATEST_BY_NAME, [name], |row| row.get(0)).optional()?
            }
        };

        if let Some(raw) = last {
            if parse_timestamp(&raw)?.date() == now.date() {
                tracing::debug!(?key, "already marked today");
                return Ok(MarkOutcome::AlreadyMarked);
            }
        }

        let roll_no = match key {
            DedupeKey::Roll(roll) => Some(roll),
            DedupeKey::Name(_) => None,
        };
        tx.execute(
            "INSERT INTO attendance (roll_no, name, confidence, image_path, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                roll_no,
                entry.name,
                clamp_confidence(entry.confidence),
                entry.image_path,
                now.format(TIMESTAMP_FORMAT).to_string(),
            ],
        )?;
        tx.commit()?;

        tracing::info!(name = entry.name, ?roll_no, "attendance marked");
        Ok(MarkOutcome::Inserted)
    }

    /// All rows, newest first.
    pub fn list(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT roll_no, name, confidence, image_path, timestamp
             FROM attendance ORDER BY timestamp DESC, id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (roll_no, name, confidence, image_path, raw_ts) = row?;
            records.push(AttendanceRecord {
                roll_no,
                name,
                confidence,
                image_path,
                timestamp: parse_timestamp(&raw_ts)?,
            });
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM attendance", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}
