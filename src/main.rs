use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netcollector::batch::runner::BatchRunner;
use netcollector::batch::BatchLoader;
use netcollector::config::AppConfig;
use netcollector::db::entities::job::Job;
use netcollector::db::jobs_service::{self, JobRef};
use netcollector::db::{self, history_service};
use netcollector::runner::discovery::{CredentialDiscovery, DiscoveryOptions};
use netcollector::runner::job_runner::JobRunner;
use netcollector::runner::progress::ProgressBroadcaster;
use netcollector::runner::{JobFatalKind, JobReport, RunOptions, Stores};
use netcollector::db::entities::job::DeviceFilterSpec;
use netcollector::db::inventory_service;
use netcollector::ssh::transport::SshTransport;
use netcollector::vault::Vault;

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(
    name = "netcollector",
    version,
    about = "Concurrent SSH collection engine for network device fleets"
)]
struct Cli {
    /// Path to a TOML config file (default: data dir, or NETCOLLECTOR_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Read the secret-store password from this file instead of the
    /// configured environment variable.
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single job by slug.
    RunJob {
        slug: String,
        /// Cap the resolved device set.
        #[arg(long)]
        limit: Option<usize>,
        /// Run-wide credential override by name.
        #[arg(long)]
        credential: Option<String>,
        /// Skip writing capture files.
        #[arg(long)]
        no_save: bool,
        /// Write capture files even when validation fails.
        #[arg(long)]
        force_save: bool,
    },
    /// Run a job definition straight from a JSON file.
    RunJobFile {
        path: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        credential: Option<String>,
        #[arg(long)]
        no_save: bool,
        #[arg(long)]
        force_save: bool,
    },
    /// Run a batch of jobs from a YAML definition.
    RunBatch { name: String },
    /// Probe devices to find which stored credential works for each.
    Discover {
        /// Candidate credential names (default: every credential).
        #[arg(long)]
        credential: Vec<String>,
        #[arg(long, default_value_t = 8)]
        workers: usize,
        /// Probe devices even if they were tested recently.
        #[arg(long)]
        include_recent: bool,
        #[arg(long)]
        vendor: Option<String>,
        #[arg(long)]
        site: Option<i64>,
        #[arg(long)]
        platform: Option<i64>,
        #[arg(long)]
        role: Option<i64>,
        #[arg(long)]
        name_pattern: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// List run history.
    History {
        #[arg(long)]
        job: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// List job definitions.
    Jobs,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    ExitCode::from(run(cli).await)
}

async fn run(cli: Cli) -> u8 {
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };
    if let Err(e) = config.ensure_directories() {
        error!(error = %e, "failed to create data directories");
        return EXIT_CONFIG;
    }

    let stores = match open_stores(&config) {
        Ok(stores) => stores,
        Err(e) => {
            error!(error = %e, "store unreachable");
            return EXIT_CONFIG;
        }
    };

    let vault = Arc::new(Vault::new(stores.collector.clone()));
    let broadcaster = Arc::new(ProgressBroadcaster::default());
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Command::RunJob {
            slug,
            limit,
            credential,
            no_save,
            force_save,
        } => {
            if let Err(code) = unlock_vault(&vault, &config, cli.password_file.as_deref()).await {
                return code;
            }
            let options = RunOptions {
                limit,
                no_save,
                force_save,
                credential_override: credential,
                no_history: false,
            };
            let runner = job_runner(&stores, &vault, &broadcaster, &config, options);
            let report = runner
                .run_ref(JobRef::Slug(slug), None, cancel.clone())
                .await;
            print_job_report(&report);
            job_exit_code(&report)
        }
        Command::RunJobFile {
            path,
            limit,
            credential,
            no_save,
            force_save,
        } => {
            if let Err(code) = unlock_vault(&vault, &config, cli.password_file.as_deref()).await {
                return code;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot read job file");
                    return EXIT_CONFIG;
                }
            };
            let job = match Job::from_json(&raw) {
                Ok(job) => job,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "invalid job definition");
                    return EXIT_CONFIG;
                }
            };
            let options = RunOptions {
                limit,
                no_save,
                force_save,
                credential_override: credential,
                no_history: false,
            };
            let runner = job_runner(&stores, &vault, &broadcaster, &config, options);
            let report = runner.run(&job, None, cancel.clone()).await;
            print_job_report(&report);
            job_exit_code(&report)
        }
        Command::RunBatch { name } => {
            if let Err(code) = unlock_vault(&vault, &config, cli.password_file.as_deref()).await {
                return code;
            }
            let loader = BatchLoader::new(config.batch_dir.clone());
            let batch = match loader.load(&name) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(batch = name, error = %e, "cannot load batch");
                    return EXIT_CONFIG;
                }
            };
            match jobs_service::existing_slugs(stores.collector.clone()).await {
                Ok(slugs) => {
                    let (_, unknown) = batch.partition_jobs(&slugs);
                    for slug in unknown {
                        warn!(batch = %batch.name, job = slug, "batch references unknown job");
                    }
                }
                Err(e) => warn!(error = %e, "could not validate batch job slugs"),
            }

            let runner = Arc::new(job_runner(
                &stores,
                &vault,
                &broadcaster,
                &config,
                RunOptions::default(),
            ));
            let batch_runner =
                BatchRunner::new(runner, stores.collector.clone(), broadcaster.clone());
            let report = batch_runner.run(&batch, cancel.clone()).await;

            println!(
                "batch {}: {} attempted, {} succeeded, {} partial, {} failed, {} cancelled ({} devices, {} ok)",
                report.name,
                report.jobs_attempted,
                report.jobs_succeeded,
                report.jobs_partial,
                report.jobs_failed,
                report.jobs_cancelled,
                report.total_devices,
                report.device_success,
            );
            for job in &report.job_reports {
                print_job_report(job);
            }
            if report.error.is_some() {
                EXIT_CONFIG
            } else if report.clean() {
                EXIT_OK
            } else {
                EXIT_FAILED
            }
        }
        Command::Discover {
            credential,
            workers,
            include_recent,
            vendor,
            site,
            platform,
            role,
            name_pattern,
            limit,
        } => {
            if let Err(code) = unlock_vault(&vault, &config, cli.password_file.as_deref()).await {
                return code;
            }
            let filter = DeviceFilterSpec {
                vendor,
                site_id: site,
                platform_id: platform,
                role_id: role,
                name_pattern,
                status: "active".into(),
            };
            let devices = match inventory_service::resolve_devices(
                stores.inventory.clone(),
                &filter,
                limit,
            )
            .await
            {
                Ok(devices) => devices,
                Err(e) => {
                    error!(error = %e, "device filter failed");
                    return EXIT_CONFIG;
                }
            };
            info!(devices = devices.len(), "probing devices");

            let options = DiscoveryOptions {
                credential_names: (!credential.is_empty()).then_some(credential),
                max_workers: workers,
                skip_recently_tested: !include_recent,
                ..Default::default()
            };
            let discovery = CredentialDiscovery::new(
                stores.inventory.clone(),
                vault.clone(),
                Arc::new(SshTransport),
                options,
            );
            match discovery.discover(devices).await {
                Ok(report) => {
                    println!(
                        "discovery: {} matched, {} unmatched, {} skipped",
                        report.matched, report.unmatched, report.skipped
                    );
                    for (name, count) in &report.matches_by_credential {
                        println!("  {name}: {count} devices");
                    }
                    for device in report.devices.iter().filter(|d| !d.matched()) {
                        let reason = device
                            .failure
                            .as_ref()
                            .map(|f| f.to_string())
                            .unwrap_or_else(|| "no candidates tried".into());
                        println!("  {} ({}): {}", device.device_name, device.host, reason);
                    }
                    EXIT_OK
                }
                Err(e) => {
                    error!(error = %e, "discovery failed");
                    EXIT_CONFIG
                }
            }
        }
        Command::History { job, limit } => {
            match history_service::list_runs(stores.collector.clone(), job, limit).await {
                Ok(runs) => {
                    for run in runs {
                        println!(
                            "[{}] {} {} started={} total={} ok={} failed={} skipped={}{}",
                            run.id,
                            run.job_slug,
                            run.status,
                            run.started_at.format("%Y-%m-%d %H:%M:%S"),
                            run.total_devices,
                            run.success_count,
                            run.failed_count,
                            run.skipped_count,
                            run.error_message
                                .map(|e| format!(" error={e}"))
                                .unwrap_or_default(),
                        );
                    }
                    EXIT_OK
                }
                Err(e) => {
                    error!(error = %e, "history unavailable");
                    EXIT_CONFIG
                }
            }
        }
        Command::Jobs => {
            match jobs_service::list_jobs(stores.collector.clone(), false).await {
                Ok(jobs) => {
                    for job in jobs {
                        println!(
                            "{} [{}] {} -> {}{}",
                            job.slug,
                            job.capture_kind,
                            job.command,
                            job.storage
                                .output_subdir
                                .as_deref()
                                .unwrap_or(&job.capture_kind),
                            if job.enabled { "" } else { " (disabled)" },
                        );
                    }
                    EXIT_OK
                }
                Err(e) => {
                    error!(error = %e, "job store unavailable");
                    EXIT_CONFIG
                }
            }
        }
    }
}

fn open_stores(config: &AppConfig) -> Result<Stores, db::StoreError> {
    let inventory = db::open_pool(&config.inventory_db, 8)?;
    let collector = db::open_pool(&config.collector_db, 8)?;
    let templates = db::open_pool(&config.template_db, 8)?;
    db::initialize_inventory(&inventory)?;
    db::initialize_collector(&collector)?;
    db::initialize_templates(&templates)?;
    Ok(Stores {
        inventory,
        collector,
        templates,
    })
}

fn job_runner(
    stores: &Stores,
    vault: &Arc<Vault>,
    broadcaster: &Arc<ProgressBroadcaster>,
    config: &AppConfig,
    options: RunOptions,
) -> JobRunner<SshTransport> {
    JobRunner::new(
        stores.clone(),
        vault.clone(),
        Arc::new(SshTransport),
        broadcaster.clone(),
        config.capture_root.clone(),
        options,
    )
}

/// Unlocks the secret store from `--password-file` or the configured
/// environment variable fallback.
async fn unlock_vault(
    vault: &Arc<Vault>,
    config: &AppConfig,
    password_file: Option<&std::path::Path>,
) -> Result<(), u8> {
    let result = match password_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(contents) => vault.unlock(contents.trim_end()).await,
            Err(e) => {
                error!(path = %path.display(), error = %e, "cannot read password file");
                return Err(EXIT_CONFIG);
            }
        },
        None => vault.unlock_from_env(&config.vault_password_env).await,
    };
    result.map_err(|e| {
        error!(error = %e, "secret store unlock failed");
        EXIT_CONFIG
    })
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run (in-flight devices finish)");
            cancel.cancel();
        }
    });
}

fn print_job_report(report: &JobReport) {
    let summary = format!(
        "job {}: {} ({}/{} ok, {} failed, {} skipped, {} captures, {} ms)",
        report.job_slug,
        report.status,
        report.success,
        report.total,
        report.failed,
        report.skipped,
        report.captures,
        report.duration_ms,
    );
    println!("{summary}");
    if let Some(fatal) = &report.fatal {
        println!("  aborted: {}", fatal.message);
    }
    for device in report.devices.iter().filter(|d| d.failure.is_some()) {
        let failure = device.failure.as_ref().expect("filtered");
        println!("  {} ({}): {}", device.device_name, device.host, failure);
    }
}

fn job_exit_code(report: &JobReport) -> u8 {
    if let Some(fatal) = &report.fatal {
        return match fatal.kind {
            // An empty device set is a failed run, not an operator error.
            JobFatalKind::InventoryEmpty => EXIT_FAILED,
            _ => EXIT_CONFIG,
        };
    }
    if report.succeeded() {
        EXIT_OK
    } else {
        EXIT_FAILED
    }
}
