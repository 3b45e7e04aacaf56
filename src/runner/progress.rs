//! Lossy progress fan-out; slow subscribers never block the pool.

use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::db::enums::RunStatus;
use crate::ssh::pool::CompletionEvent;

pub type ProgressMessage = String;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressMessage>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.tx.subscribe()
    }

    fn send_message(&self, message_type: &str, payload: serde_json::Value) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let message = json!({
            "type": message_type,
            "payload": payload,
        });
        match serde_json::to_string(&message) {
            Ok(encoded) => {
                let _ = self.tx.send(encoded);
            }
            Err(e) => {
                error!(message_type, error = %e, "failed to encode progress message");
            }
        }
    }

    pub fn publish_run_started(&self, job_slug: &str, run_id: Option<i64>, total: usize) {
        debug!(job = job_slug, total, "broadcasting run start");
        self.send_message(
            "RUN_STARTED",
            json!({
                "job_slug": job_slug,
                "run_id": run_id,
                "total_devices": total,
            }),
        );
    }

    pub fn publish_device_completion(&self, job_slug: &str, event: &CompletionEvent) {
        self.send_message(
            "DEVICE_COMPLETED",
            json!({
                "job_slug": job_slug,
                "index": event.index,
                "total": event.total,
                "device_name": event.outcome.device_name,
                "host": event.outcome.host,
                "success": event.outcome.success,
                "skipped": event.outcome.skipped,
                "failure": event.outcome.failure,
                "duration_ms": event.outcome.duration_ms,
            }),
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish_run_completed(
        &self,
        job_slug: &str,
        run_id: Option<i64>,
        status: RunStatus,
        success: usize,
        failed: usize,
        skipped: usize,
    ) {
        debug!(job = job_slug, %status, "broadcasting run completion");
        self.send_message(
            "RUN_COMPLETED",
            json!({
                "job_slug": job_slug,
                "run_id": run_id,
                "status": status,
                "success": success,
                "failed": failed,
                "skipped": skipped,
            }),
        );
    }

    pub fn publish_batch_started(&self, batch_id: &str, name: &str, jobs: usize) {
        self.send_message(
            "BATCH_STARTED",
            json!({
                "batch_id": batch_id,
                "name": name,
                "jobs": jobs,
            }),
        );
    }

    pub fn publish_job_cancelled(&self, batch_id: &str, job_slug: &str) {
        self.send_message(
            "JOB_CANCELLED",
            json!({
                "batch_id": batch_id,
                "job_slug": job_slug,
            }),
        );
    }

    pub fn publish_batch_completed(&self, batch_id: &str, status: &str) {
        self.send_message(
            "BATCH_COMPLETED",
            json!({
                "batch_id": batch_id,
                "status": status,
            }),
        );
    }
}
