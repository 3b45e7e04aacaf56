//! Batch execution with bounded job-level parallelism and stop-on-failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::BatchDefinition;
use crate::db::enums::RunStatus;
use crate::db::history_service;
use crate::db::jobs_service::JobRef;
use crate::db::SqlitePool;
use crate::runner::job_runner::JobRunner;
use crate::runner::progress::ProgressBroadcaster;
use crate::runner::JobReport;
use crate::ssh::transport::Transport;

/// Aggregate result of one batch execution.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub name: String,
    pub jobs_attempted: usize,
    pub jobs_succeeded: usize,
    pub jobs_partial: usize,
    pub jobs_failed: usize,
    pub jobs_cancelled: usize,
    pub total_devices: usize,
    pub device_success: usize,
    pub device_failed: usize,
    pub device_skipped: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub job_reports: Vec<JobReport>,
}

impl BatchReport {
    fn new(batch_id: String, name: String) -> Self {
        Self {
            batch_id,
            name,
            jobs_attempted: 0,
            jobs_succeeded: 0,
            jobs_partial: 0,
            jobs_failed: 0,
            jobs_cancelled: 0,
            total_devices: 0,
            device_success: 0,
            device_failed: 0,
            device_skipped: 0,
            duration_ms: 0,
            error: None,
            job_reports: Vec::new(),
        }
    }

    /// True only when every device across every job succeeded.
    pub fn clean(&self) -> bool {
        self.error.is_none()
            && self.jobs_failed == 0
            && self.jobs_partial == 0
            && self.jobs_cancelled == 0
    }
}

pub struct BatchRunner<T> {
    job_runner: Arc<JobRunner<T>>,
    collector: SqlitePool,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl<T: Transport + 'static> BatchRunner<T> {
    pub fn new(
        job_runner: Arc<JobRunner<T>>,
        collector: SqlitePool,
        broadcaster: Arc<ProgressBroadcaster>,
    ) -> Self {
        Self {
            job_runner,
            collector,
            broadcaster,
        }
    }

    pub async fn run(&self, batch: &BatchDefinition, cancel: CancellationToken) -> BatchReport {
        let started = Instant::now();
        let batch_id = Uuid::new_v4().to_string();
        let mut report = BatchReport::new(batch_id.clone(), batch.name.clone());

        if batch.jobs.is_empty() {
            report.error = Some("batch names no jobs".into());
            return report;
        }

        info!(
            batch = %batch.name,
            batch_id = %batch_id,
            jobs = batch.jobs.len(),
            parallelism = batch.max_concurrent_jobs.max(1),
            "starting batch"
        );
        self.broadcaster
            .publish_batch_started(&batch_id, &batch.name, batch.jobs.len());

        let cap = batch.max_concurrent_jobs.max(1);
        let semaphore = Arc::new(Semaphore::new(cap));
        // Internal trip wire for stop-on-failure; external cancellation also
        // flows through the per-job token.
        let stop = CancellationToken::new();
        let mut join_set: JoinSet<(usize, JobReport)> = JoinSet::new();
        let mut cancelled: Vec<(usize, String)> = Vec::new();

        for (idx, slug) in batch.jobs.iter().enumerate() {
            if cap == 1
                && idx > 0
                && batch.pause_between_jobs_secs > 0
                && !stop.is_cancelled()
                && !cancel.is_cancelled()
            {
                tokio::time::sleep(Duration::from_secs(batch.pause_between_jobs_secs)).await;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                _ = stop.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => {
                    Some(permit.expect("batch semaphore closed"))
                }
            };
            let Some(permit) = permit else {
                cancelled.push((idx, slug.clone()));
                continue;
            };

            let runner = self.job_runner.clone();
            let slug = slug.clone();
            let batch_ref = batch_id.clone();
            let job_cancel = cancel.clone();
            let stop_trigger = stop.clone();
            let stop_on_failure = batch.stop_on_failure;
            join_set.spawn(async move {
                let job_report = runner
                    .run_ref(JobRef::Slug(slug), Some(batch_ref), job_cancel)
                    .await;
                // Partial results do not trip the wire; a fully failed job does.
                if stop_on_failure && job_report.status == RunStatus::Failed {
                    stop_trigger.cancel();
                }
                drop(permit);
                (idx, job_report)
            });
        }

        let mut slots: Vec<Option<JobReport>> = Vec::with_capacity(batch.jobs.len());
        slots.resize_with(batch.jobs.len(), || None);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, job_report)) => slots[idx] = Some(job_report),
                Err(e) => warn!(error = %e, "batch job task failed"),
            }
        }

        for (idx, slug) in &cancelled {
            info!(batch = %batch.name, job = %slug, "job cancelled before start");
            self.broadcaster.publish_job_cancelled(&batch_id, slug);
            match history_service::record_cancelled_run(
                self.collector.clone(),
                slug.clone(),
                Some(batch_id.clone()),
                "cancelled by batch stop-on-failure".into(),
            )
            .await
            {
                Ok(run_id) => {
                    slots[*idx] = Some(cancelled_report(slug, run_id));
                }
                Err(e) => {
                    warn!(job = %slug, error = %e, "failed to record cancelled run");
                    slots[*idx] = Some(cancelled_report(slug, -1));
                }
            }
        }

        for job_report in slots.into_iter().flatten() {
            match job_report.status {
                RunStatus::Success => {
                    report.jobs_attempted += 1;
                    report.jobs_succeeded += 1;
                }
                RunStatus::Partial => {
                    report.jobs_attempted += 1;
                    report.jobs_partial += 1;
                }
                RunStatus::Failed | RunStatus::Running => {
                    report.jobs_attempted += 1;
                    report.jobs_failed += 1;
                }
                RunStatus::Cancelled => report.jobs_cancelled += 1,
            }
            report.total_devices += job_report.total;
            report.device_success += job_report.success;
            report.device_failed += job_report.failed;
            report.device_skipped += job_report.skipped;
            report.job_reports.push(job_report);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        let status = if report.clean() { "success" } else { "failed" };
        self.broadcaster.publish_batch_completed(&batch_id, status);
        info!(
            batch = %batch.name,
            attempted = report.jobs_attempted,
            succeeded = report.jobs_succeeded,
            partial = report.jobs_partial,
            failed = report.jobs_failed,
            cancelled = report.jobs_cancelled,
            "batch complete"
        );
        report
    }
}

fn cancelled_report(slug: &str, run_id: i64) -> JobReport {
    JobReport {
        job_slug: slug.to_string(),
        run_id: (run_id >= 0).then_some(run_id),
        status: RunStatus::Cancelled,
        total: 0,
        success: 0,
        failed: 0,
        skipped: 0,
        captures: 0,
        duration_ms: 0,
        fatal: None,
        devices: Vec::new(),
    }
}
