//! rollcall-store: attendance persistence.
//!
//! One SQLite table of attendance rows, written at most once per identity
//! per calendar day, and read back as JSON or CSV.

pub mod export;
pub mod store;

pub use store::{
    AttendanceRecord, AttendanceStore, DedupeKey, MarkOutcome, NewAttendance, StoreError,
};

/// Format of the `timestamp` column and of exported timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
