use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde_json::Map;

use super::entities::job::{
    DeviceFilterSpec, ExecutionPolicy, Job, StoragePolicy, ValidationPolicy,
};
use super::{SqlitePool, StoreError};

/// A job may be addressed by its numeric id or its stable slug; the run id
/// is an artifact of the store, the slug is the natural identity.
#[derive(Debug, Clone)]
pub enum JobRef {
    Id(i64),
    Slug(String),
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRef::Id(id) => write!(f, "#{id}"),
            JobRef::Slug(slug) => write!(f, "{slug}"),
        }
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: Some(row.get("id")?),
        version: 1,
        name: row.get("name")?,
        slug: row.get("slug")?,
        description: row.get("description")?,
        capture_kind: row.get("capture_kind")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        command: row.get("command")?,
        paging_disable_command: row.get("paging_disable_command")?,
        filter: DeviceFilterSpec {
            vendor: row.get("filter_vendor")?,
            site_id: row.get("filter_site_id")?,
            platform_id: row.get("filter_platform_id")?,
            role_id: row.get("filter_role_id")?,
            name_pattern: row.get("filter_name_pattern")?,
            status: row.get("filter_status")?,
        },
        validation: ValidationPolicy {
            enabled: row.get::<_, i64>("validate_output")? != 0,
            template_filter: row.get("template_filter")?,
            min_score: row.get("min_score")?,
            save_on_fail: row.get::<_, i64>("save_on_fail")? != 0,
        },
        execution: ExecutionPolicy {
            max_workers: row.get::<_, i64>("max_workers")? as usize,
            timeout_secs: row.get::<_, i64>("timeout_secs")? as u64,
            inter_command_delay_ms: row.get::<_, i64>("inter_command_delay_ms")? as u64,
        },
        storage: StoragePolicy {
            output_subdir: row.get("output_subdir")?,
            filename_pattern: row.get("filename_pattern")?,
        },
        extra: Map::new(),
    })
}

pub async fn get_job(pool: SqlitePool, job_ref: JobRef) -> Result<Option<Job>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Option<Job>, StoreError> {
        let conn = pool.get()?;
        let job = match &job_ref {
            JobRef::Id(id) => conn
                .query_row("SELECT * FROM jobs WHERE id = ?", params![id], row_to_job)
                .optional()?,
            JobRef::Slug(slug) => conn
                .query_row("SELECT * FROM jobs WHERE slug = ?", params![slug], row_to_job)
                .optional()?,
        };
        Ok(job)
    })
    .await?
}

pub async fn list_jobs(pool: SqlitePool, enabled_only: bool) -> Result<Vec<Job>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<Job>, StoreError> {
        let conn = pool.get()?;
        let sql = if enabled_only {
            "SELECT * FROM jobs WHERE enabled = 1 ORDER BY name"
        } else {
            "SELECT * FROM jobs ORDER BY name"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], row_to_job)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    })
    .await?
}

/// Set of slugs currently defined, used by the batch loader to validate
/// batch files without loading full definitions.
pub async fn existing_slugs(pool: SqlitePool) -> Result<Vec<String>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>, StoreError> {
        let conn = pool.get()?;
        let mut stmt = conn.prepare("SELECT slug FROM jobs ORDER BY slug")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    })
    .await?
}

pub async fn update_last_run(
    pool: SqlitePool,
    job_id: i64,
    status: super::enums::RunStatus,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let conn = pool.get()?;
        conn.execute(
            "UPDATE jobs SET last_run_at = ?, last_run_status = ? WHERE id = ?",
            params![at, status, job_id],
        )?;
        Ok(())
    })
    .await?
}

/// Inserts a job definition row. Used by import tooling and tests; the
/// collector itself never creates jobs.
pub async fn insert_job(pool: SqlitePool, job: Job) -> Result<i64, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO jobs (name, slug, description, capture_kind, enabled, command, \
             paging_disable_command, filter_vendor, filter_site_id, filter_platform_id, \
             filter_role_id, filter_name_pattern, filter_status, validate_output, \
             template_filter, min_score, save_on_fail, max_workers, timeout_secs, \
             inter_command_delay_ms, output_subdir, filename_pattern) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                job.name,
                job.slug,
                job.description,
                job.capture_kind,
                job.enabled as i64,
                job.command,
                job.paging_disable_command,
                job.filter.vendor,
                job.filter.site_id,
                job.filter.platform_id,
                job.filter.role_id,
                job.filter.name_pattern,
                job.filter.status,
                job.validation.enabled as i64,
                job.validation.template_filter,
                job.validation.min_score,
                job.validation.save_on_fail as i64,
                job.execution.max_workers as i64,
                job.execution.timeout_secs as i64,
                job.execution.inter_command_delay_ms as i64,
                job.storage.output_subdir,
                job.storage.filename_pattern,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await?
}
