use chrono::{DateTime, Utc};
use serde::Serialize;

/// Metadata for one persisted capture file. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct Capture {
    pub id: i64,
    pub run_id: i64,
    pub device_id: Option<i64>,
    pub device_name: String,
    pub capture_kind: String,
    pub file_path: String,
    pub file_size: i64,
    pub captured_at: DateTime<Utc>,
    pub validation_score: Option<f64>,
}
