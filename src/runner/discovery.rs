//! Bulk credential discovery via connect-only probes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::db::entities::device::DeviceDetail;
use crate::db::enums::CredentialTestResult;
use crate::db::inventory_service;
use crate::db::SqlitePool;
use crate::ssh::transport::Transport;
use crate::ssh::{DeviceFailure, ExecutorOptions, SshCredentials};
use crate::vault::Vault;

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Candidate credential names; `None` tests the full store.
    pub credential_names: Option<Vec<String>>,
    /// Concurrent probe cap.
    pub max_workers: usize,
    /// Skip devices already pinned to a working credential.
    pub skip_pinned: bool,
    /// Skip devices probed within `recent_threshold_hours`.
    pub skip_recently_tested: bool,
    pub recent_threshold_hours: i64,
    /// Write results back onto device rows.
    pub update_devices: bool,
    pub probe_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            credential_names: None,
            max_workers: 8,
            skip_pinned: false,
            skip_recently_tested: true,
            recent_threshold_hours: 24,
            update_devices: true,
            probe_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceDiscoveryOutcome {
    pub device_id: i64,
    pub device_name: String,
    pub host: String,
    pub matched_credential_id: Option<i64>,
    pub matched_credential_name: Option<String>,
    pub attempts: usize,
    /// Last failure when nothing matched.
    pub failure: Option<DeviceFailure>,
    /// Candidates were abandoned on a non-auth failure.
    pub unreachable: bool,
    pub duration_ms: u64,
}

impl DeviceDiscoveryOutcome {
    pub fn matched(&self) -> bool {
        self.matched_credential_id.is_some()
    }
}

#[derive(Debug, Default, Serialize)]
pub struct DiscoveryReport {
    pub total_devices: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub matches_by_credential: BTreeMap<String, usize>,
    pub devices: Vec<DeviceDiscoveryOutcome>,
}

pub struct CredentialDiscovery<T> {
    inventory: SqlitePool,
    vault: Arc<Vault>,
    transport: Arc<T>,
    options: DiscoveryOptions,
}

impl<T: Transport + 'static> CredentialDiscovery<T> {
    pub fn new(
        inventory: SqlitePool,
        vault: Arc<Vault>,
        transport: Arc<T>,
        options: DiscoveryOptions,
    ) -> Self {
        Self {
            inventory,
            vault,
            transport,
            options,
        }
    }

    pub async fn discover(&self, devices: Vec<DeviceDetail>) -> Result<DiscoveryReport, crate::vault::VaultError> {
        let started = Instant::now();
        let mut report = DiscoveryReport::default();

        let mut candidates = self.vault.unlocked_credentials()?;
        if let Some(names) = &self.options.credential_names {
            candidates.retain(|c| {
                c.credential_name
                    .as_deref()
                    .map_or(false, |n| names.iter().any(|w| w == n))
            });
        }
        if candidates.is_empty() {
            warn!("no candidate credentials to test");
            return Ok(report);
        }

        let mut to_test = Vec::new();
        for device in devices {
            if device.address().is_none() {
                debug!(device = %device.name, "skipping device without address");
                report.skipped += 1;
                continue;
            }
            if self.options.skip_pinned
                && device.credential_id.is_some()
                && device.credential_test_result == CredentialTestResult::Success
            {
                report.skipped += 1;
                continue;
            }
            if self.options.skip_recently_tested {
                if let Some(tested_at) = device.credential_tested_at {
                    let age = Utc::now() - tested_at;
                    if age < chrono::Duration::hours(self.options.recent_threshold_hours) {
                        debug!(device = %device.name, "skipping recently tested device");
                        report.skipped += 1;
                        continue;
                    }
                }
            }
            to_test.push(device);
        }

        info!(
            devices = to_test.len(),
            candidates = candidates.len(),
            skipped = report.skipped,
            "starting credential discovery"
        );

        let probe_options = ExecutorOptions {
            timeout: self.options.probe_timeout,
            connect_timeout: self.options.probe_timeout,
            ..ExecutorOptions::default()
        };

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut join_set: JoinSet<DeviceDiscoveryOutcome> = JoinSet::new();
        let candidates = Arc::new(candidates);

        for device in to_test {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("discovery semaphore closed");
            let transport = self.transport.clone();
            let candidates = candidates.clone();
            let options = probe_options.clone();
            join_set.spawn(async move {
                let outcome = probe_device(transport.as_ref(), &device, &candidates, &options).await;
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "discovery probe task failed");
                    continue;
                }
            };

            if self.options.update_devices {
                let result = if outcome.matched() {
                    CredentialTestResult::Success
                } else {
                    CredentialTestResult::Failed
                };
                if let Err(e) = inventory_service::record_credential_test(
                    self.inventory.clone(),
                    outcome.device_id,
                    outcome.matched_credential_id,
                    result,
                    Utc::now(),
                )
                .await
                {
                    warn!(device = %outcome.device_name, error = %e, "failed to record probe result");
                }
            }

            report.total_devices += 1;
            if outcome.matched() {
                report.matched += 1;
                let name = outcome
                    .matched_credential_name
                    .clone()
                    .unwrap_or_else(|| "unknown".into());
                *report.matches_by_credential.entry(name).or_insert(0) += 1;
            } else {
                report.unmatched += 1;
            }
            report.devices.push(outcome);
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            matched = report.matched,
            unmatched = report.unmatched,
            skipped = report.skipped,
            "credential discovery complete"
        );
        Ok(report)
    }
}

/// Probes one device: any previously working credential first, then the
/// remaining candidates in order.
async fn probe_device<T: Transport>(
    transport: &T,
    device: &DeviceDetail,
    candidates: &[SshCredentials],
    options: &ExecutorOptions,
) -> DeviceDiscoveryOutcome {
    let started = Instant::now();
    let host = device.address().unwrap_or_default().to_string();
    let mut outcome = DeviceDiscoveryOutcome {
        device_id: device.id,
        device_name: device.name.clone(),
        host: host.clone(),
        matched_credential_id: None,
        matched_credential_name: None,
        attempts: 0,
        failure: None,
        unreachable: false,
        duration_ms: 0,
    };

    let mut ordered: Vec<&SshCredentials> = Vec::with_capacity(candidates.len());
    if let Some(pinned) = device.credential_id {
        if let Some(previous) = candidates.iter().find(|c| c.credential_id == Some(pinned)) {
            ordered.push(previous);
        }
    }
    for candidate in candidates {
        if ordered
            .iter()
            .all(|c| c.credential_id != candidate.credential_id)
        {
            ordered.push(candidate);
        }
    }

    for candidate in ordered {
        outcome.attempts += 1;
        match transport.probe(&host, device.ssh_port, candidate, options).await {
            Ok(prompt) => {
                debug!(
                    device = %device.name,
                    credential = candidate.credential_name.as_deref().unwrap_or("?"),
                    prompt = %prompt,
                    "credential probe succeeded"
                );
                outcome.matched_credential_id = candidate.credential_id;
                outcome.matched_credential_name = candidate.credential_name.clone();
                outcome.failure = None;
                break;
            }
            Err(e) => {
                outcome.failure = Some(e.failure());
                if !e.is_auth() {
                    debug!(device = %device.name, error = %e, "aborting remaining candidates");
                    outcome.unreachable = true;
                    break;
                }
            }
        }
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    outcome
}
