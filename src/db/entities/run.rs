use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::enums::RunStatus;

/// History record for one executed job run. Counts satisfy
/// `total = success + failed + skipped` once the status leaves `running`.
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_slug: String,
    pub batch_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_devices: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub skipped_count: i64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}
