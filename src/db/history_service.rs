use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::entities::capture::Capture;
use super::entities::run::JobRun;
use super::enums::RunStatus;
use super::{SqlitePool, StoreError};

fn row_to_run(row: &Row) -> rusqlite::Result<JobRun> {
    Ok(JobRun {
        id: row.get("id")?,
        job_slug: row.get("job_slug")?,
        batch_id: row.get("batch_id")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        total_devices: row.get("total_devices")?,
        success_count: row.get("success_count")?,
        failed_count: row.get("failed_count")?,
        skipped_count: row.get("skipped_count")?,
        status: row.get("status")?,
        error_message: row.get("error_message")?,
    })
}

fn row_to_capture(row: &Row) -> rusqlite::Result<Capture> {
    Ok(Capture {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        device_id: row.get("device_id")?,
        device_name: row.get("device_name")?,
        capture_kind: row.get("capture_kind")?,
        file_path: row.get("file_path")?,
        file_size: row.get("file_size")?,
        captured_at: row.get("captured_at")?,
        validation_score: row.get("validation_score")?,
    })
}

/// Opens a run in state `running`. Returns the new run id. During a run the
/// owning controller is the only caller of the write paths here; a run row
/// is mutated exactly twice (insert, then one completion update).
pub async fn create_run(
    pool: SqlitePool,
    job_slug: String,
    batch_id: Option<String>,
    total_devices: i64,
    started_at: DateTime<Utc>,
) -> Result<i64, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO job_runs (job_slug, batch_id, started_at, total_devices, status) \
             VALUES (?, ?, ?, ?, ?)",
            params![job_slug, batch_id, started_at, total_devices, RunStatus::Running],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await?
}

/// Commits the final state of a run. Counts must sum to the total.
#[allow(clippy::too_many_arguments)]
pub async fn complete_run(
    pool: SqlitePool,
    run_id: i64,
    total_devices: i64,
    success_count: i64,
    failed_count: i64,
    skipped_count: i64,
    status: RunStatus,
    error_message: Option<String>,
) -> Result<(), StoreError> {
    debug_assert_eq!(total_devices, success_count + failed_count + skipped_count);
    tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
        let conn = pool.get()?;
        let updated = conn.execute(
            "UPDATE job_runs SET completed_at = ?, total_devices = ?, success_count = ?, \
             failed_count = ?, skipped_count = ?, status = ?, error_message = ? WHERE id = ?",
            params![
                Utc::now(),
                total_devices,
                success_count,
                failed_count,
                skipped_count,
                status,
                error_message,
                run_id
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        Ok(())
    })
    .await?
}

/// Records a run that was cancelled before any device work (batch
/// stop-on-failure). The row is terminal from the start.
pub async fn record_cancelled_run(
    pool: SqlitePool,
    job_slug: String,
    batch_id: Option<String>,
    reason: String,
) -> Result<i64, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
        let conn = pool.get()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO job_runs (job_slug, batch_id, started_at, completed_at, status, \
             error_message) VALUES (?, ?, ?, ?, ?, ?)",
            params![job_slug, batch_id, now, now, RunStatus::Cancelled, reason],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await?
}

/// One row per persisted capture file, linked to its run.
#[allow(clippy::too_many_arguments)]
pub async fn insert_capture(
    pool: SqlitePool,
    run_id: i64,
    device_id: Option<i64>,
    device_name: String,
    capture_kind: String,
    file_path: String,
    file_size: i64,
    validation_score: Option<f64>,
) -> Result<i64, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
        let conn = pool.get()?;
        conn.execute(
            "INSERT INTO captures (run_id, device_id, device_name, capture_kind, file_path, \
             file_size, captured_at, validation_score) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                run_id,
                device_id,
                device_name,
                capture_kind,
                file_path,
                file_size,
                Utc::now(),
                validation_score
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
    .await?
}

pub async fn get_run(pool: SqlitePool, run_id: i64) -> Result<Option<JobRun>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Option<JobRun>, StoreError> {
        let conn = pool.get()?;
        conn.query_row("SELECT * FROM job_runs WHERE id = ?", [run_id], row_to_run)
            .optional()
            .map_err(Into::into)
    })
    .await?
}

/// History listing, newest first, optionally narrowed to one job slug.
pub async fn list_runs(
    pool: SqlitePool,
    job_slug: Option<String>,
    limit: usize,
) -> Result<Vec<JobRun>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<JobRun>, StoreError> {
        let conn = pool.get()?;
        let rows = match &job_slug {
            Some(slug) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM job_runs WHERE job_slug = ? \
                     ORDER BY started_at DESC, id DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![slug, limit as i64], row_to_run)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM job_runs ORDER BY started_at DESC, id DESC LIMIT ?",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_run)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
    .await?
}

pub async fn captures_for_run(pool: SqlitePool, run_id: i64) -> Result<Vec<Capture>, StoreError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<Capture>, StoreError> {
        let conn = pool.get()?;
        let mut stmt =
            conn.prepare("SELECT * FROM captures WHERE run_id = ? ORDER BY device_name")?;
        let rows = stmt.query_map([run_id], row_to_capture)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::open_test_stores;

    #[tokio::test]
    async fn run_lifecycle_create_then_complete_once() {
        let stores = open_test_stores();
        let run_id = create_run(
            stores.collector.clone(),
            "cisco-ios-arp".into(),
            None,
            5,
            Utc::now(),
        )
        .await
        .unwrap();

        let run = get_run(stores.collector.clone(), run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.completed_at.is_none());

        complete_run(
            stores.collector.clone(),
            run_id,
            5,
            3,
            1,
            1,
            RunStatus::Partial,
            None,
        )
        .await
        .unwrap();

        let run = get_run(stores.collector.clone(), run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Partial);
        assert!(run.completed_at.is_some());
        assert!(run.started_at <= run.completed_at.unwrap());
        assert_eq!(
            run.total_devices,
            run.success_count + run.failed_count + run.skipped_count
        );
    }

    #[tokio::test]
    async fn one_capture_per_device_per_run() {
        let stores = open_test_stores();
        let run_id = create_run(stores.collector.clone(), "j".into(), None, 1, Utc::now())
            .await
            .unwrap();
        insert_capture(
            stores.collector.clone(),
            run_id,
            Some(1),
            "sw1".into(),
            "arp".into(),
            "/tmp/sw1.txt".into(),
            100,
            Some(42.0),
        )
        .await
        .unwrap();

        let duplicate = insert_capture(
            stores.collector.clone(),
            run_id,
            Some(1),
            "sw1".into(),
            "arp".into(),
            "/tmp/sw1-again.txt".into(),
            100,
            None,
        )
        .await;
        assert!(duplicate.is_err());

        let captures = captures_for_run(stores.collector.clone(), run_id).await.unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].device_name, "sw1");
    }

    #[tokio::test]
    async fn cancelled_runs_are_terminal() {
        let stores = open_test_stores();
        let id = record_cancelled_run(
            stores.collector.clone(),
            "j2".into(),
            Some("batch-1".into()),
            "stop-on-failure".into(),
        )
        .await
        .unwrap();
        let run = get_run(stores.collector.clone(), id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());
        assert_eq!(run.batch_id.as_deref(), Some("batch-1"));
    }

    #[tokio::test]
    async fn list_runs_newest_first_filtered_by_slug() {
        let stores = open_test_stores();
        for slug in ["a", "a", "b"] {
            let id = create_run(stores.collector.clone(), slug.into(), None, 1, Utc::now())
                .await
                .unwrap();
            complete_run(
                stores.collector.clone(),
                id,
                1,
                1,
                0,
                0,
                RunStatus::Success,
                None,
            )
            .await
            .unwrap();
        }
        let all = list_runs(stores.collector.clone(), None, 10).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].id > all[1].id);

        let only_a = list_runs(stores.collector.clone(), Some("a".into()), 10)
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
    }
}
