//! Single-job orchestration from device resolution through history commit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::progress::ProgressBroadcaster;
use super::storage;
use super::{
    DeviceBucket, DeviceReport, JobFatal, JobFatalKind, JobReport, RunOptions, Stores,
};
use crate::db::entities::device::DeviceDetail;
use crate::db::entities::job::Job;
use crate::db::enums::RunStatus;
use crate::db::inventory_service::{self, ResolveError};
use crate::db::jobs_service::{self, JobRef};
use crate::db::history_service;
use crate::ssh::pool::{
    event_channel_capacity, ExecutionOutcome, PoolTarget, SshExecutorPool,
};
use crate::ssh::transport::Transport;
use crate::ssh::{DeviceFailure, DeviceTarget, ExecutorOptions, FailureKind};
use crate::validate::{ValidationEngine, ValidationOutcome};
use crate::vault::Vault;

pub struct JobRunner<T> {
    stores: Stores,
    vault: Arc<Vault>,
    transport: Arc<T>,
    broadcaster: Arc<ProgressBroadcaster>,
    capture_root: PathBuf,
    options: RunOptions,
}

impl<T: Transport + 'static> JobRunner<T> {
    pub fn new(
        stores: Stores,
        vault: Arc<Vault>,
        transport: Arc<T>,
        broadcaster: Arc<ProgressBroadcaster>,
        capture_root: PathBuf,
        options: RunOptions,
    ) -> Self {
        Self {
            stores,
            vault,
            transport,
            broadcaster,
            capture_root,
            options,
        }
    }

    /// Loads a job from the store and runs it.
    pub async fn run_ref(
        &self,
        job_ref: JobRef,
        batch_id: Option<String>,
        cancel: CancellationToken,
    ) -> JobReport {
        match jobs_service::get_job(self.stores.collector.clone(), job_ref.clone()).await {
            Ok(Some(job)) => self.run(&job, batch_id, cancel).await,
            Ok(None) => {
                self.fatal_report(
                    &job_ref.to_string(),
                    batch_id,
                    JobFatalKind::Config,
                    format!("job not found: {job_ref}"),
                    Instant::now(),
                )
                .await
            }
            Err(e) => {
                self.fatal_report(
                    &job_ref.to_string(),
                    batch_id,
                    JobFatalKind::Store,
                    e.to_string(),
                    Instant::now(),
                )
                .await
            }
        }
    }

    /// Runs one job to completion. Device-level failures never abort the
    /// run; job-level errors abort before any device is contacted.
    pub async fn run(
        &self,
        job: &Job,
        batch_id: Option<String>,
        cancel: CancellationToken,
    ) -> JobReport {
        let started = Instant::now();
        info!(job = %job.slug, "starting job run");

        if let Err(e) = job.validate() {
            return self
                .fatal_report(&job.slug, batch_id, JobFatalKind::Config, e.to_string(), started)
                .await;
        }
        if !job.enabled {
            return self
                .fatal_report(
                    &job.slug,
                    batch_id,
                    JobFatalKind::Config,
                    "job is disabled",
                    started,
                )
                .await;
        }
        if !self.vault.is_unlocked() {
            return self
                .fatal_report(
                    &job.slug,
                    batch_id,
                    JobFatalKind::VaultLocked,
                    "secret store is locked",
                    started,
                )
                .await;
        }
        if let Some(name) = self.options.credential_override.as_deref() {
            match self.vault.credential_by_name(name) {
                Ok(Some(_)) => {}
                _ => {
                    return self
                        .fatal_report(
                            &job.slug,
                            batch_id,
                            JobFatalKind::Config,
                            format!("unknown credential override `{name}`"),
                            started,
                        )
                        .await;
                }
            }
        }

        let devices = match inventory_service::resolve_devices(
            self.stores.inventory.clone(),
            &job.filter,
            self.options.limit,
        )
        .await
        {
            Ok(devices) => devices,
            Err(e @ ResolveError::BadNamePattern { .. }) => {
                return self
                    .fatal_report(&job.slug, batch_id, JobFatalKind::Config, e.to_string(), started)
                    .await;
            }
            Err(ResolveError::Store(e)) => {
                return self
                    .fatal_report(&job.slug, batch_id, JobFatalKind::Store, e.to_string(), started)
                    .await;
            }
        };
        if devices.is_empty() {
            return self
                .fatal_report(
                    &job.slug,
                    batch_id,
                    JobFatalKind::InventoryEmpty,
                    "no devices match the job filter",
                    started,
                )
                .await;
        }

        let total = devices.len();
        info!(job = %job.slug, devices = total, "device set resolved");

        let run_id = if self.options.no_history {
            None
        } else {
            match history_service::create_run(
                self.stores.collector.clone(),
                job.slug.clone(),
                batch_id.clone(),
                total as i64,
                Utc::now(),
            )
            .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(job = %job.slug, error = %e, "failed to open history record");
                    None
                }
            }
        };
        self.broadcaster.publish_run_started(&job.slug, run_id, total);

        let exec_options = ExecutorOptions {
            max_workers: job.execution.max_workers,
            timeout: Duration::from_secs(job.execution.timeout_secs),
            connect_timeout: Duration::from_secs(job.execution.timeout_secs.clamp(1, 15)),
            inter_command_delay: Duration::from_millis(job.execution.inter_command_delay_ms),
            ..ExecutorOptions::default()
        };

        let commands = job.command_sequence();
        let mut targets = Vec::with_capacity(total);
        for device in &devices {
            let credentials = self
                .vault
                .resolve_for_device(device, self.options.credential_override.as_deref())
                .unwrap_or_default();
            targets.push(PoolTarget {
                target: DeviceTarget {
                    device_id: device.id,
                    device_name: device.name.clone(),
                    host: device.address().unwrap_or_default().to_string(),
                    port: device.ssh_port,
                    driver_hint: device.driver_hint.clone(),
                    paging_prelude: job
                        .paging_disable_command
                        .clone()
                        .or_else(|| device.paging_disable_command.clone()),
                    commands: commands.clone(),
                },
                credentials,
            });
        }
        let device_index: HashMap<i64, DeviceDetail> =
            devices.into_iter().map(|d| (d.id, d)).collect();

        let (events_tx, mut events_rx) =
            mpsc::channel(event_channel_capacity(job.execution.max_workers));
        let pool = SshExecutorPool::new(self.transport.clone(), exec_options);
        let pool_cancel = cancel.clone();
        let pool_task =
            tokio::spawn(async move { pool.execute(targets, events_tx, pool_cancel).await });

        let engine = ValidationEngine::new(self.stores.templates.clone());
        let mut reports: HashMap<i64, DeviceReport> = HashMap::new();
        while let Some(event) = events_rx.recv().await {
            self.broadcaster.publish_device_completion(&job.slug, &event);
            let report = self
                .process_outcome(job, run_id, &engine, &device_index, event.outcome)
                .await;
            reports.insert(report.device_id, report);
        }

        let ordered = match pool_task.await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!(job = %job.slug, error = %e, "device pool task failed");
                Vec::new()
            }
        };
        let mut device_reports = Vec::with_capacity(ordered.len());
        for outcome in &ordered {
            if let Some(report) = reports.remove(&outcome.device_id) {
                device_reports.push(report);
            }
        }

        let success = device_reports
            .iter()
            .filter(|r| r.bucket == DeviceBucket::Success)
            .count();
        let failed = device_reports
            .iter()
            .filter(|r| r.bucket == DeviceBucket::Failed)
            .count();
        let skipped = device_reports
            .iter()
            .filter(|r| r.bucket == DeviceBucket::Skipped)
            .count();
        let captures = device_reports
            .iter()
            .filter(|r| r.capture_path.is_some())
            .count();
        let status = final_status(success, failed, skipped);

        if let Some(id) = run_id {
            if let Err(e) = history_service::complete_run(
                self.stores.collector.clone(),
                id,
                total as i64,
                success as i64,
                failed as i64,
                skipped as i64,
                status,
                None,
            )
            .await
            {
                warn!(job = %job.slug, run_id = id, error = %e, "failed to close history record");
            }
        }
        self.broadcaster
            .publish_run_completed(&job.slug, run_id, status, success, failed, skipped);

        if let Some(job_id) = job.id {
            if let Err(e) = jobs_service::update_last_run(
                self.stores.collector.clone(),
                job_id,
                status,
                Utc::now(),
            )
            .await
            {
                warn!(job = %job.slug, error = %e, "failed to update job last-run state");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            job = %job.slug,
            %status,
            success,
            failed,
            skipped,
            captures,
            duration_ms,
            "job run complete"
        );

        JobReport {
            job_slug: job.slug.clone(),
            run_id,
            status,
            total,
            success,
            failed,
            skipped,
            captures,
            duration_ms,
            fatal: None,
            devices: device_reports,
        }
    }

    async fn process_outcome(
        &self,
        job: &Job,
        run_id: Option<i64>,
        engine: &ValidationEngine,
        devices: &HashMap<i64, DeviceDetail>,
        outcome: ExecutionOutcome,
    ) -> DeviceReport {
        let mut report = DeviceReport {
            device_id: outcome.device_id,
            device_name: outcome.device_name.clone(),
            host: outcome.host.clone(),
            bucket: DeviceBucket::Failed,
            failure: outcome.failure.clone(),
            warnings: outcome.warnings.clone(),
            validation_template: None,
            validation_score: None,
            capture_path: None,
            credential: outcome.credential.clone(),
            duration_ms: outcome.duration_ms,
        };

        if outcome.skipped {
            report.bucket = DeviceBucket::Skipped;
            report.failure = None;
            return report;
        }
        if !outcome.success {
            return report;
        }

        let cleaned =
            storage::clean_transcript(&outcome.transcript, job.primary_data_command().as_deref());

        let mut validation: Option<ValidationOutcome> = None;
        if job.validation.enabled {
            let filter = job.validation.template_filter.clone().unwrap_or_default();
            match engine
                .validate(cleaned.clone(), filter, job.validation.min_score)
                .await
            {
                Ok(v) => validation = Some(v),
                Err(e) => {
                    // Continue without validation rather than failing the
                    // device over a template-store hiccup.
                    warn!(device = %report.device_name, error = %e, "validation unavailable");
                }
            }
        }
        if let Some(v) = &validation {
            report.validation_template = v.template.clone();
            report.validation_score = Some(v.score);
        }

        let validation_failed = validation.as_ref().map_or(false, |v| !v.passed());
        let keep_failed_output = job.validation.save_on_fail || self.options.force_save;

        if validation_failed && !keep_failed_output {
            report.bucket = DeviceBucket::Skipped;
            report.failure = Some(validation_failure(validation.as_ref().expect("checked")));
            return report;
        }

        if !self.options.no_save {
            match self
                .persist_capture(job, run_id, &report, &cleaned, validation.as_ref())
                .await
            {
                Ok(path) => report.capture_path = Some(path),
                Err(message) => {
                    warn!(device = %report.device_name, message, "capture persistence failed");
                    report.bucket = DeviceBucket::Failed;
                    report.failure =
                        Some(DeviceFailure::new(FailureKind::Persistence, message));
                    return report;
                }
            }
        }

        if validation_failed {
            // Saved because the job keeps failing output, but still counted
            // as skipped, not success.
            report.bucket = DeviceBucket::Skipped;
            report.failure = Some(validation_failure(validation.as_ref().expect("checked")));
            return report;
        }

        report.bucket = DeviceBucket::Success;
        report.failure = None;

        if devices.contains_key(&report.device_id) {
            if let Err(e) = inventory_service::touch_last_collected(
                self.stores.inventory.clone(),
                report.device_id,
                Utc::now(),
            )
            .await
            {
                warn!(device = %report.device_name, error = %e, "failed to stamp last collection");
            }
        }
        report
    }

    async fn persist_capture(
        &self,
        job: &Job,
        run_id: Option<i64>,
        report: &DeviceReport,
        cleaned: &str,
        validation: Option<&ValidationOutcome>,
    ) -> Result<PathBuf, String> {
        let subdir = job
            .storage
            .output_subdir
            .clone()
            .unwrap_or_else(|| job.capture_kind.clone());
        let dir = self.capture_root.join(subdir);
        let filename = storage::expand_filename(
            &job.storage.filename_pattern,
            &report.device_name,
            report.device_id,
            Utc::now(),
        );

        let write_dir = dir.clone();
        let write_name = filename.clone();
        let contents = cleaned.as_bytes().to_vec();
        let path = tokio::task::spawn_blocking(move || {
            storage::write_capture(&write_dir, &write_name, &contents)
        })
        .await
        .map_err(|e| format!("write task failed: {e}"))?
        .map_err(|e| format!("write {filename}: {e}"))?;

        if let Some(id) = run_id {
            history_service::insert_capture(
                self.stores.collector.clone(),
                id,
                Some(report.device_id),
                report.device_name.clone(),
                job.capture_kind.clone(),
                path.display().to_string(),
                cleaned.len() as i64,
                validation.map(|v| v.score),
            )
            .await
            .map_err(|e| format!("capture metadata: {e}"))?;
        }
        Ok(path)
    }

    /// Aborts before device work: the run is still recorded, as failed.
    async fn fatal_report(
        &self,
        job_slug: &str,
        batch_id: Option<String>,
        kind: JobFatalKind,
        message: impl Into<String>,
        started: Instant,
    ) -> JobReport {
        let message = message.into();
        error!(job = job_slug, %kind, message, "job aborted before device work");

        let run_id = if self.options.no_history {
            None
        } else {
            match history_service::create_run(
                self.stores.collector.clone(),
                job_slug.to_string(),
                batch_id,
                0,
                Utc::now(),
            )
            .await
            {
                Ok(id) => {
                    if let Err(e) = history_service::complete_run(
                        self.stores.collector.clone(),
                        id,
                        0,
                        0,
                        0,
                        0,
                        RunStatus::Failed,
                        Some(message.clone()),
                    )
                    .await
                    {
                        warn!(job = job_slug, error = %e, "failed to close failed run record");
                    }
                    Some(id)
                }
                Err(e) => {
                    warn!(job = job_slug, error = %e, "failed to record failed run");
                    None
                }
            }
        };

        JobReport {
            job_slug: job_slug.to_string(),
            run_id,
            status: RunStatus::Failed,
            total: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            captures: 0,
            duration_ms: started.elapsed().as_millis() as u64,
            fatal: Some(JobFatal::new(kind, message)),
            devices: Vec::new(),
        }
    }
}

fn final_status(success: usize, failed: usize, skipped: usize) -> RunStatus {
    if success > 0 && failed == 0 && skipped == 0 {
        RunStatus::Success
    } else if success > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Failed
    }
}

fn validation_failure(outcome: &ValidationOutcome) -> DeviceFailure {
    let message = match &outcome.template {
        Some(template) => format!(
            "score {:.1} below threshold (best template {template})",
            outcome.score
        ),
        None => "no template matched the output".to_string(),
    };
    DeviceFailure::new(FailureKind::Validation, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::enums::CredentialTestResult;
    use crate::db::entities::job::{Job, ValidationPolicy};
    use crate::db::inventory_service::testutil::{seed_device, seed_lookups};
    use crate::db::template_service::testutil::seed_template;
    use crate::db::testutil::{open_test_stores, TestStores};
    use crate::ssh::transport::testutil::{MockTransport, Script};
    use crate::ssh::SshError;
    use crate::vault::testutil::{add_credential, init_store};
    use serde_json::Map;
    use tempfile::TempDir;

    const ARP_TEMPLATE: &str = "\
Value ADDRESS (\\d+\\.\\d+\\.\\d+\\.\\d+)
Value AGE (\\d+|-)
Value MAC ([0-9a-f.]+)
Value INTERFACE (\\S+)

Start
  ^Internet\\s+${ADDRESS}\\s+${AGE}\\s+${MAC}\\s+ARPA\\s+${INTERFACE} -> Record
";

    const ARP_TRANSCRIPT: &str = "\
sw1#show ip arp
Protocol  Address          Age (min)  Hardware Addr   Type   Interface
Internet  10.0.0.1         12         aabb.cc00.0100  ARPA   Gi0/1
Internet  10.0.0.2         33         aabb.cc00.0200  ARPA   Gi0/2
Internet  10.0.0.3         -          aabb.cc00.0300  ARPA   Gi0/3
sw1#
";

    struct Harness {
        stores: TestStores,
        vault: Arc<Vault>,
        transport: Arc<MockTransport>,
        captures: TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            let stores = open_test_stores();
            seed_lookups(&stores.inventory);
            init_store(&stores.collector, "pw");
            add_credential(&stores.collector, "pw", "lab", "netops", Some("lab-pw"), true);

            let vault = Arc::new(Vault::new(stores.collector.clone()));
            vault.unlock("pw").await.unwrap();

            Self {
                stores,
                vault,
                transport: Arc::new(MockTransport::new()),
                captures: TempDir::new().unwrap(),
            }
        }

        fn stores(&self) -> Stores {
            Stores {
                inventory: self.stores.inventory.clone(),
                collector: self.stores.collector.clone(),
                templates: self.stores.templates.clone(),
            }
        }

        fn runner(&self, options: RunOptions) -> JobRunner<MockTransport> {
            JobRunner::new(
                self.stores(),
                self.vault.clone(),
                self.transport.clone(),
                Arc::new(ProgressBroadcaster::default()),
                self.captures.path().to_path_buf(),
                options,
            )
        }
    }

    fn arp_job() -> Job {
        Job {
            id: None,
            version: 1,
            name: "ARP collection".into(),
            slug: "cisco-ios-arp".into(),
            description: None,
            capture_kind: "arp".into(),
            enabled: true,
            command: "show ip arp".into(),
            paging_disable_command: Some("terminal length 0".into()),
            filter: Default::default(),
            validation: ValidationPolicy {
                enabled: true,
                template_filter: Some("cisco_ios_show_ip_arp".into()),
                min_score: 30.0,
                save_on_fail: false,
            },
            execution: Default::default(),
            storage: Default::default(),
            extra: Map::new(),
        }
    }

    fn script_success(h: &Harness, host: &str) {
        h.transport.script(
            host,
            Script::Succeed {
                transcript: ARP_TRANSCRIPT.into(),
            },
        );
    }

    #[tokio::test]
    async fn happy_path_three_devices() {
        let h = Harness::new().await;
        seed_template(&h.stores.templates, "cisco_ios_show_ip_arp", ARP_TEMPLATE);
        for (name, ip) in [
            ("sw1", "10.0.0.1"),
            ("sw2", "10.0.0.2"),
            ("sw3", "10.0.0.3"),
        ] {
            seed_device(&h.stores.inventory, name, 1, 1, "active", Some(ip));
            script_success(&h, ip);
        }

        let report = h
            .runner(RunOptions::default())
            .run(&arp_job(), None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!((report.success, report.failed, report.skipped), (3, 0, 0));
        assert_eq!(report.captures, 3);
        assert!(report
            .devices
            .iter()
            .all(|d| d.validation_score.unwrap() >= 30.0));

        // Capture files exist, hold the cleaned transcript, and match the
        // recorded metadata sizes.
        let run_id = report.run_id.unwrap();
        let rows = history_service::captures_for_run(h.stores.collector.clone(), run_id)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        for row in &rows {
            let bytes = std::fs::read(&row.file_path).unwrap();
            assert_eq!(bytes.len() as i64, row.file_size);
            let text = String::from_utf8(bytes).unwrap();
            assert!(text.contains("Internet  10.0.0.1"));
            assert!(!text.contains("show ip arp"));
            assert!(!text.contains("sw1#"));
        }

        let run = history_service::get_run(h.stores.collector.clone(), run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.success_count, 3);
        assert_eq!(run.total_devices, 3);
    }

    #[tokio::test]
    async fn mixed_outcomes_yield_partial() {
        let h = Harness::new().await;
        seed_template(&h.stores.templates, "cisco_ios_show_ip_arp", ARP_TEMPLATE);
        for (name, ip) in [
            ("sw1", "10.0.1.1"),
            ("sw2", "10.0.1.2"),
            ("sw3", "10.0.1.3"),
        ] {
            seed_device(&h.stores.inventory, name, 1, 1, "active", Some(ip));
            script_success(&h, ip);
        }
        seed_device(&h.stores.inventory, "sw4", 1, 1, "active", Some("10.0.1.4"));
        h.transport
            .script("10.0.1.4", Script::Fail(|| SshError::ConnectTimeout));
        seed_device(&h.stores.inventory, "sw5", 1, 1, "active", Some("10.0.1.5"));
        h.transport
            .script("10.0.1.5", Script::Fail(|| SshError::Auth("denied".into())));

        let report = h
            .runner(RunOptions::default())
            .run(&arp_job(), None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!((report.success, report.failed, report.skipped), (3, 2, 0));
        assert_eq!(report.captures, 3);

        let kinds: Vec<_> = report
            .devices
            .iter()
            .filter_map(|d| d.failure.as_ref().map(|f| f.kind))
            .collect();
        assert!(kinds.contains(&FailureKind::Timeout));
        assert!(kinds.contains(&FailureKind::AuthFailed));

        let rows =
            history_service::captures_for_run(h.stores.collector.clone(), report.run_id.unwrap())
                .await
                .unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.device_name != "sw4" && r.device_name != "sw5"));
    }

    #[tokio::test]
    async fn validation_miss_skips_devices() {
        let h = Harness::new().await;
        // No templates seeded: every validation is a no-template miss.
        for (name, ip) in [("sw1", "10.0.2.1"), ("sw2", "10.0.2.2")] {
            seed_device(&h.stores.inventory, name, 1, 1, "active", Some(ip));
            script_success(&h, ip);
        }

        let mut job = arp_job();
        job.validation.min_score = 20.0;

        let report = h
            .runner(RunOptions::default())
            .run(&job, None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!((report.success, report.failed, report.skipped), (0, 0, 2));
        assert_eq!(report.captures, 0);
        assert!(report
            .devices
            .iter()
            .all(|d| d.failure.as_ref().unwrap().kind == FailureKind::Validation));

        // Same run with save-on-fail: files are written, devices still skip.
        let mut job = job.clone();
        job.validation.save_on_fail = true;
        let report = h
            .runner(RunOptions::default())
            .run(&job, None, CancellationToken::new())
            .await;
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!((report.success, report.failed, report.skipped), (0, 0, 2));
        assert_eq!(report.captures, 2);
        assert!(report.devices.iter().all(|d| d.capture_path.is_some()));
    }

    #[tokio::test]
    async fn pinned_and_default_credentials_resolve_per_device() {
        let h = Harness::new().await;
        let legacy = add_credential(&h.stores.collector, "pw", "legacy", "old", Some("x"), false);
        // Refresh the vault cache with the new credential.
        h.vault.unlock("pw").await.unwrap();

        let a = seed_device(&h.stores.inventory, "sw-a", 1, 1, "active", Some("10.0.3.1"));
        seed_device(&h.stores.inventory, "sw-b", 1, 1, "active", Some("10.0.3.2"));
        inventory_service::record_credential_test(
            h.stores.inventory.clone(),
            a,
            Some(legacy),
            CredentialTestResult::Success,
            Utc::now(),
        )
        .await
        .unwrap();

        h.transport.script(
            "10.0.3.1",
            Script::AuthOnly {
                accept: "legacy".into(),
            },
        );
        h.transport.script(
            "10.0.3.2",
            Script::AuthOnly {
                accept: "lab".into(),
            },
        );

        let mut job = arp_job();
        job.validation.enabled = false;
        job.validation.template_filter = None;

        let report = h
            .runner(RunOptions::default())
            .run(&job, None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        let by_name: HashMap<_, _> = report
            .devices
            .iter()
            .map(|d| (d.device_name.as_str(), d.credential.as_deref()))
            .collect();
        assert_eq!(by_name["sw-a"], Some("legacy"));
        assert_eq!(by_name["sw-b"], Some("lab"));
    }

    #[tokio::test]
    async fn empty_filter_result_is_job_fatal() {
        let h = Harness::new().await;
        let mut job = arp_job();
        job.filter.name_pattern = Some("^matches-nothing$".into());

        let report = h
            .runner(RunOptions::default())
            .run(&job, None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.fatal.as_ref().unwrap().kind, JobFatalKind::InventoryEmpty);
        assert_eq!(report.total, 0);
        assert_eq!(report.captures, 0);

        let run = history_service::get_run(h.stores.collector.clone(), report.run_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("no devices match the job filter"));
    }

    #[tokio::test]
    async fn config_errors_abort_before_device_work() {
        let h = Harness::new().await;
        seed_device(&h.stores.inventory, "sw1", 1, 1, "active", Some("10.0.4.1"));

        let mut disabled = arp_job();
        disabled.enabled = false;
        let report = h
            .runner(RunOptions::default())
            .run(&disabled, None, CancellationToken::new())
            .await;
        assert_eq!(report.fatal.as_ref().unwrap().kind, JobFatalKind::Config);

        let mut zero_timeout = arp_job();
        zero_timeout.execution.timeout_secs = 0;
        let report = h
            .runner(RunOptions::default())
            .run(&zero_timeout, None, CancellationToken::new())
            .await;
        assert_eq!(report.fatal.as_ref().unwrap().kind, JobFatalKind::Config);

        let options = RunOptions {
            credential_override: Some("ghost".into()),
            ..Default::default()
        };
        let report = h
            .runner(options)
            .run(&arp_job(), None, CancellationToken::new())
            .await;
        assert_eq!(report.fatal.as_ref().unwrap().kind, JobFatalKind::Config);

        assert_eq!(
            h.transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn locked_vault_is_fatal() {
        let h = Harness::new().await;
        seed_device(&h.stores.inventory, "sw1", 1, 1, "active", Some("10.0.5.1"));
        h.vault.lock();

        let mut job = arp_job();
        job.validation.enabled = false;
        let report = h
            .runner(RunOptions::default())
            .run(&job, None, CancellationToken::new())
            .await;
        assert_eq!(report.fatal.as_ref().unwrap().kind, JobFatalKind::VaultLocked);
        assert_eq!(report.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn no_save_suppresses_files_but_not_success() {
        let h = Harness::new().await;
        seed_template(&h.stores.templates, "cisco_ios_show_ip_arp", ARP_TEMPLATE);
        seed_device(&h.stores.inventory, "sw1", 1, 1, "active", Some("10.0.6.1"));
        script_success(&h, "10.0.6.1");

        let options = RunOptions {
            no_save: true,
            ..Default::default()
        };
        let report = h
            .runner(options)
            .run(&arp_job(), None, CancellationToken::new())
            .await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.captures, 0);
        let rows =
            history_service::captures_for_run(h.stores.collector.clone(), report.run_id.unwrap())
                .await
                .unwrap();
        assert!(rows.is_empty());
    }
}
