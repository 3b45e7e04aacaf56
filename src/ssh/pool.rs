//! Bounded concurrent executor. Completion events flow over a bounded
//! channel; a full channel blocks workers, which is the intended
//! backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::Transport;
use super::{
    DeviceFailure, DeviceTarget, ExecutorOptions, FailureKind, SshCredentials, SshError,
};

/// Hard ceiling on device-level parallelism, whatever the job asks for.
pub const MAX_POOL_WORKERS: usize = 64;

/// Channel capacity that keeps workers busy without unbounded buffering.
pub fn event_channel_capacity(max_workers: usize) -> usize {
    max_workers.clamp(1, MAX_POOL_WORKERS) * 2
}

#[derive(Debug, Clone)]
pub struct PoolTarget {
    pub target: DeviceTarget,
    /// Resolved per-device credential; `None` fails the device with
    /// `no_credential` without touching the network.
    pub credentials: Option<SshCredentials>,
}

/// Per-device outcome as required by the reporting layer: identity, success
/// flag, duration, raw transcript, failure tag and the credential used.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub device_id: i64,
    pub device_name: String,
    pub host: String,
    pub success: bool,
    /// Cancelled before the device was started.
    pub skipped: bool,
    pub transcript: String,
    pub prompt: Option<String>,
    pub warnings: Vec<String>,
    pub failure: Option<DeviceFailure>,
    pub credential: Option<String>,
    pub duration_ms: u64,
    pub attempts: u32,
}

impl ExecutionOutcome {
    fn base(target: &DeviceTarget) -> Self {
        Self {
            device_id: target.device_id,
            device_name: target.device_name.clone(),
            host: target.host.clone(),
            success: false,
            skipped: false,
            transcript: String::new(),
            prompt: None,
            warnings: Vec::new(),
            failure: None,
            credential: None,
            duration_ms: 0,
            attempts: 0,
        }
    }

    fn skipped(target: &DeviceTarget) -> Self {
        Self {
            skipped: true,
            ..Self::base(target)
        }
    }
}

/// Completion event published after each device finishes. `index` counts
/// completions, not starts.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub index: usize,
    pub total: usize,
    pub outcome: ExecutionOutcome,
}

pub struct SshExecutorPool<T> {
    transport: Arc<T>,
    options: ExecutorOptions,
}

impl<T: Transport + 'static> SshExecutorPool<T> {
    pub fn new(transport: Arc<T>, options: ExecutorOptions) -> Self {
        Self { transport, options }
    }

    /// Runs the target set to completion and returns outcomes in target
    /// order. Cancellation skips devices not yet started; in-flight devices
    /// run to their own deadline (hard-capped at twice the device timeout).
    pub async fn execute(
        &self,
        targets: Vec<PoolTarget>,
        events: mpsc::Sender<CompletionEvent>,
        cancel: CancellationToken,
    ) -> Vec<ExecutionOutcome> {
        let total = targets.len();
        let workers = self.options.max_workers.clamp(1, MAX_POOL_WORKERS);
        let semaphore = Arc::new(Semaphore::new(workers));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut join_set: JoinSet<(usize, ExecutionOutcome)> = JoinSet::new();
        let mut results: Vec<Option<ExecutionOutcome>> = Vec::with_capacity(total);
        results.resize_with(total, || None);

        info!(total, workers, "starting device pool");

        let mut cancelled = cancel.is_cancelled();
        for (idx, item) in targets.into_iter().enumerate() {
            if !cancelled {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        cancelled = true;
                    }
                    permit = semaphore.clone().acquire_owned() => {
                        let permit = permit.expect("pool semaphore closed");
                        let transport = self.transport.clone();
                        let options = self.options.clone();
                        let events = events.clone();
                        let completed = completed.clone();
                        join_set.spawn(async move {
                            let outcome = run_one(transport.as_ref(), &item, &options).await;
                            drop(permit);
                            let index = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let event = CompletionEvent {
                                index,
                                total,
                                outcome: outcome.clone(),
                            };
                            let _ = events.send(event).await;
                            (idx, outcome)
                        });
                        continue;
                    }
                }
            }

            // Not started: counts as skipped, still produces an event so
            // progress always reaches `total`.
            let outcome = ExecutionOutcome::skipped(&item.target);
            let index = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = events
                .send(CompletionEvent {
                    index,
                    total,
                    outcome: outcome.clone(),
                })
                .await;
            results[idx] = Some(outcome);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => results[idx] = Some(outcome),
                Err(e) => warn!(error = %e, "pool worker panicked"),
            }
        }

        results
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    // Only reachable if a worker panicked; report it as a
                    // command failure rather than losing the device.
                    ExecutionOutcome {
                        failure: Some(DeviceFailure::new(
                            FailureKind::Command,
                            "worker aborted unexpectedly",
                        )),
                        ..ExecutionOutcome::base(&DeviceTarget {
                            device_id: -1,
                            device_name: format!("target-{idx}"),
                            host: String::new(),
                            port: 22,
                            driver_hint: None,
                            paging_prelude: None,
                            commands: Vec::new(),
                        })
                    }
                })
            })
            .collect()
    }
}

async fn run_one<T: Transport>(
    transport: &T,
    item: &PoolTarget,
    options: &ExecutorOptions,
) -> ExecutionOutcome {
    let started = Instant::now();
    let mut outcome = ExecutionOutcome::base(&item.target);

    let Some(credentials) = item.credentials.as_ref() else {
        outcome.failure = Some(DeviceFailure::new(
            FailureKind::NoCredential,
            "no credential available",
        ));
        return outcome;
    };
    outcome.credential = credentials.credential_name.clone();

    // Workers are abandoned rather than interrupted: past twice the device
    // timeout the session is written off even if the client-side deadline
    // failed to fire.
    let hard_deadline = options.timeout * 2;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = match timeout(
            hard_deadline,
            transport.run_commands(&item.target, credentials, options),
        )
        .await
        {
            Ok(inner) => inner,
            Err(_) => Err(SshError::DeadlineExceeded(hard_deadline)),
        };

        match result {
            Ok(output) => {
                outcome.success = true;
                outcome.transcript = output.transcript;
                outcome.prompt = Some(output.prompt);
                outcome.warnings = output.warnings;
                outcome.attempts = attempt;
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                debug!(
                    device = %outcome.device_name,
                    duration_ms = outcome.duration_ms,
                    "device completed"
                );
                return outcome;
            }
            Err(e) => {
                if attempt <= options.retry_count && e.is_retryable() {
                    debug!(
                        device = %outcome.device_name,
                        attempt,
                        error = %e,
                        "retrying after failure"
                    );
                    tokio::time::sleep(options.retry_delay).await;
                    continue;
                }
                warn!(device = %outcome.device_name, error = %e, "device failed");
                outcome.failure = Some(e.failure());
                outcome.attempts = attempt;
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                return outcome;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::transport::testutil::{MockTransport, Script};
    use std::time::Duration;

    fn target(name: &str, host: &str) -> PoolTarget {
        PoolTarget {
            target: DeviceTarget {
                device_id: 1,
                device_name: name.into(),
                host: host.into(),
                port: 22,
                driver_hint: Some("cisco_ios".into()),
                paging_prelude: None,
                commands: vec!["show ip arp".into()],
            },
            credentials: Some(creds("lab")),
        }
    }

    fn creds(name: &str) -> SshCredentials {
        SshCredentials {
            credential_id: Some(1),
            credential_name: Some(name.into()),
            username: "netops".into(),
            password: Some("pw".into()),
            private_key: None,
            key_passphrase: None,
        }
    }

    fn options(workers: usize) -> ExecutorOptions {
        ExecutorOptions {
            max_workers: workers,
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(1),
            inter_command_delay: Duration::ZERO,
            retry_count: 0,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Drains events on the side and hands them back at the end.
    fn spawn_drain(
        mut rx: mpsc::Receiver<CompletionEvent>,
    ) -> tokio::task::JoinHandle<Vec<CompletionEvent>> {
        tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                events.push(event);
            }
            events
        })
    }

    #[tokio::test]
    async fn outcomes_come_back_in_target_order() {
        let transport = Arc::new(MockTransport::new());
        transport.script(
            "10.0.0.1",
            Script::Slow {
                delay: Duration::from_millis(80),
                transcript: "slow".into(),
            },
        );
        let pool = SshExecutorPool::new(transport, options(4));

        let (tx, rx) = mpsc::channel(event_channel_capacity(4));
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(
                vec![
                    target("sw1", "10.0.0.1"),
                    target("sw2", "10.0.0.2"),
                    target("sw3", "10.0.0.3"),
                ],
                tx,
                CancellationToken::new(),
            )
            .await;

        let names: Vec<_> = outcomes.iter().map(|o| o.device_name.as_str()).collect();
        assert_eq!(names, vec!["sw1", "sw2", "sw3"]);
        assert!(outcomes.iter().all(|o| o.success));

        let events = drain.await.unwrap();
        assert_eq!(events.len(), 3);
        // Indices count completions 1..=total regardless of start order.
        let mut indices: Vec<_> = events.iter().map(|e| e.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2, 3]);
        // The slow first target finishes last.
        assert_eq!(events.last().unwrap().outcome.device_name, "sw1");
        assert!(events.iter().all(|e| e.total == 3));
    }

    #[tokio::test]
    async fn single_worker_serializes_but_still_reports() {
        let transport = Arc::new(MockTransport::new());
        let pool = SshExecutorPool::new(transport, options(1));

        let (tx, rx) = mpsc::channel(event_channel_capacity(1));
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(
                vec![target("sw1", "10.0.0.1"), target("sw2", "10.0.0.2")],
                tx,
                CancellationToken::new(),
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        let events = drain.await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].index, 1);
        assert_eq!(events[1].index, 2);
    }

    #[tokio::test]
    async fn failures_carry_kind_and_reason() {
        let transport = Arc::new(MockTransport::new());
        transport.script("10.0.0.1", Script::Fail(|| SshError::Auth("denied".into())));
        transport.script("10.0.0.2", Script::Fail(|| SshError::ConnectTimeout));
        let pool = SshExecutorPool::new(transport, options(2));

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(
                vec![
                    target("sw1", "10.0.0.1"),
                    target("sw2", "10.0.0.2"),
                    target("sw3", "10.0.0.3"),
                ],
                tx,
                CancellationToken::new(),
            )
            .await;
        drain.await.unwrap();

        assert_eq!(
            outcomes[0].failure.as_ref().unwrap().kind,
            FailureKind::AuthFailed
        );
        assert_eq!(
            outcomes[1].failure.as_ref().unwrap().kind,
            FailureKind::Timeout
        );
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_network_calls() {
        let transport = Arc::new(MockTransport::new());
        let pool = SshExecutorPool::new(transport.clone(), options(2));

        let mut item = target("sw1", "10.0.0.1");
        item.credentials = None;

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);
        let outcomes = pool.execute(vec![item], tx, CancellationToken::new()).await;
        drain.await.unwrap();

        assert!(!outcomes[0].success);
        assert_eq!(
            outcomes[0].failure.as_ref().unwrap().kind,
            FailureKind::NoCredential
        );
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn retry_applies_to_transient_failures_only() {
        // Timeout is retryable: with one retry the transport is hit twice.
        let transport = Arc::new(MockTransport::new());
        transport.script("10.0.0.1", Script::Fail(|| SshError::ConnectTimeout));
        let mut opts = options(1);
        opts.retry_count = 1;
        let pool = SshExecutorPool::new(transport.clone(), opts);

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(vec![target("sw1", "10.0.0.1")], tx, CancellationToken::new())
            .await;
        drain.await.unwrap();
        assert_eq!(outcomes[0].attempts, 2);
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            2
        );

        // Auth failures are never retried.
        let transport = Arc::new(MockTransport::new());
        transport.script("10.0.0.1", Script::Fail(|| SshError::Auth("denied".into())));
        let mut opts = options(1);
        opts.retry_count = 3;
        let pool = SshExecutorPool::new(transport.clone(), opts);

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(vec![target("sw1", "10.0.0.1")], tx, CancellationToken::new())
            .await;
        drain.await.unwrap();
        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[tokio::test]
    async fn cancellation_skips_unstarted_devices() {
        let transport = Arc::new(MockTransport::new());
        transport.script(
            "10.0.0.1",
            Script::Slow {
                delay: Duration::from_millis(150),
                transcript: "slow".into(),
            },
        );
        let pool = Arc::new(SshExecutorPool::new(transport, options(1)));
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);

        let targets = vec![
            target("sw1", "10.0.0.1"),
            target("sw2", "10.0.0.2"),
            target("sw3", "10.0.0.3"),
        ];
        let pool_clone = pool.clone();
        let cancel_clone = cancel.clone();
        let handle =
            tokio::spawn(async move { pool_clone.execute(targets, tx, cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();

        let outcomes = handle.await.unwrap();
        drain.await.unwrap();

        // The in-flight device finishes; the queued ones are skipped.
        assert!(outcomes[0].success);
        assert!(outcomes[1].skipped && !outcomes[1].success);
        assert!(outcomes[2].skipped);
        assert!(outcomes[1].failure.is_none());
    }

    #[tokio::test]
    async fn pre_cancelled_pool_skips_everything() {
        let transport = Arc::new(MockTransport::new());
        let pool = SshExecutorPool::new(transport.clone(), options(4));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, rx) = mpsc::channel(8);
        let drain = spawn_drain(rx);
        let outcomes = pool
            .execute(
                vec![target("sw1", "10.0.0.1"), target("sw2", "10.0.0.2")],
                tx,
                cancel,
            )
            .await;
        let events = drain.await.unwrap();

        assert!(outcomes.iter().all(|o| o.skipped));
        assert_eq!(events.len(), 2);
        assert_eq!(
            transport.calls.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
