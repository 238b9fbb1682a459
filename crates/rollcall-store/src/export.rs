//! Read-only projections of the attendance table.

use crate::store::AttendanceRecord;
use crate::TIMESTAMP_FORMAT;
use chrono::NaiveDateTime;
use std::borrow::Cow;

const CSV_HEADER: &str = "roll_no,name,confidence,image_path,timestamp";

/// JSON array of records, timestamps as `YYYY-MM-DD HH:MM:SS`.
pub fn to_json(records: &[AttendanceRecord]) -> serde_json::Result<serde_json::Value> {
    serde_json::to_value(records)
}

/// CSV document with a header row; an empty roll number is an empty field.
pub fn to_csv(records: &[AttendanceRecord]) -> String {
    let mut rows = Vec::with_capacity(records.len() + 1);
    rows.push(CSV_HEADER.to_string());

    for r in records {
        let roll_no = r.roll_no.map(|n| n.to_string()).unwrap_or_default();
        rows.push(format!(
            "{},{},{},{},{}",
            roll_no,
            csv_field(&r.name),
            r.confidence,
            csv_field(&r.image_path),
            r.timestamp.format(TIMESTAMP_FORMAT),
        ));
    }

    rows.join("\r\n") + "\r\n"
}

/// Download name for a CSV export generated at `now`.
pub fn csv_filename(now: NaiveDateTime) -> String {
    format!("attendance_{}.csv", now.format("%Y%m%d_%H%M%S"))
}

/// Quote a field containing a delimiter, quote or line break.
fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}
