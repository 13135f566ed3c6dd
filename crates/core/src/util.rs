use chrono::{DateTime, Local};
use ulid::Ulid;

/// Generates a new session identifier.
pub fn new_session_id() -> String {
    Ulid::new().to_string()
}

/// Formats a timestamp the way per-job log files are named (`YYYYMMDD_HHMMSS`).
pub fn log_stamp(at: DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}
