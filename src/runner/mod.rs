//! Run orchestration: job execution, discovery, progress and persistence.

pub mod discovery;
pub mod job_runner;
pub mod progress;
pub mod storage;

use std::path::PathBuf;

use serde::Serialize;
use strum_macros::{Display, EnumString};

use crate::db::enums::RunStatus;
use crate::db::SqlitePool;
use crate::ssh::DeviceFailure;

/// The three store handles a run needs. Cloning is cheap (pool handles).
#[derive(Clone)]
pub struct Stores {
    pub inventory: SqlitePool,
    pub collector: SqlitePool,
    pub templates: SqlitePool,
}

/// Which bucket a device landed in for run accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceBucket {
    Success,
    Failed,
    Skipped,
}

/// Final per-device record after validation and persistence.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceReport {
    pub device_id: i64,
    pub device_name: String,
    pub host: String,
    pub bucket: DeviceBucket,
    pub failure: Option<DeviceFailure>,
    pub warnings: Vec<String>,
    pub validation_template: Option<String>,
    pub validation_score: Option<f64>,
    pub capture_path: Option<PathBuf>,
    pub credential: Option<String>,
    pub duration_ms: u64,
}

/// Job-level fatal conditions: the run aborts before any device work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobFatalKind {
    /// Bad definition, bad filter pattern, unknown credential override.
    Config,
    /// The filter matched no devices.
    InventoryEmpty,
    /// Credential material required but the store is locked.
    VaultLocked,
    /// A store became unreachable before devices were contacted.
    Store,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobFatal {
    pub kind: JobFatalKind,
    pub message: String,
}

impl JobFatal {
    pub fn new(kind: JobFatalKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Aggregate result of one job run.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_slug: String,
    pub run_id: Option<i64>,
    pub status: RunStatus,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub captures: usize,
    pub duration_ms: u64,
    pub fatal: Option<JobFatal>,
    pub devices: Vec<DeviceReport>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn error_message(&self) -> Option<&str> {
        self.fatal.as_ref().map(|f| f.message.as_str())
    }
}

/// Caller-supplied knobs for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cap on resolved devices, applied after ordering.
    pub limit: Option<usize>,
    /// Skip capture files entirely (dry collection).
    pub no_save: bool,
    /// Write capture files even when validation fails, regardless of the
    /// job's own save-on-fail policy.
    pub force_save: bool,
    /// Run-wide credential override by name.
    pub credential_override: Option<String>,
    /// Disable history rows (ad-hoc runs from job files).
    pub no_history: bool,
}
