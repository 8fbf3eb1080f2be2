//! `mountwatch`: NAS mount monitor for a workstation fleet

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mountwatch_kernel::config::{self, MonitorConfig};
use mountwatch_kernel::daemon::Daemon;
use mountwatch_kernel::notify::{LogMailer, Mailer, NotificationScheduler, SmtpMailer};
use mountwatch_kernel::report;
use mountwatch_kernel::store::{self, SqliteStore, StateStore};
use mountwatch_kernel::{FlushOutcome, WorkstationMonitor};
use mountwatch_probe::SshProber;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Verify NAS mounts across workstations, remount what is safe to remount,
/// and mail operators
#[derive(Parser, Debug)]
#[command(name = "mountwatch", version, about)]
struct Cli {
    /// Config file (default: $MOUNTWATCH_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor the fleet
    Run {
        /// Run one cycle, print the report and exit
        #[arg(long)]
        once: bool,
    },
    /// Send the off-hours summary now
    Flush,
    /// Show the last known state of every workstation
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// List unresolved issues
    Issues,
    /// Workstations with failed mount checks in a recent window
    Recent {
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Share of healthy mount checks per workstation
    Reliability {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// How often each required artifact was reachable
    Software {
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Mount history of one workstation
    Detail {
        #[arg(short, long)]
        workstation: String,
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Show the retention in force, or save an override in the database
    Config {
        /// New retention window, e.g. "72h" or "14days"
        #[arg(long, value_parser = humantime::parse_duration)]
        retention: Option<Duration>,
        /// Make the periodic purge aggressive
        #[arg(long, requires = "retention")]
        aggressive: bool,
    },
    /// Delete records older than the retention window
    Cleanup {
        /// Also drop stale open issues and hosts, then vacuum
        #[arg(long)]
        aggressive: bool,
    },
}

fn hours(count: u32) -> Duration {
    Duration::from_secs(u64::from(count) * 3600)
}

fn init_tracing(verbose: u8, default_level: &str) {
    let level = match verbose {
        0 => default_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Runtime {
    config: MonitorConfig,
    store: Arc<SqliteStore>,
    scheduler: Arc<NotificationScheduler>,
}

async fn bootstrap(path: Option<PathBuf>) -> Result<Runtime> {
    let path = match path {
        Some(path) => path,
        None => config::default_path()?,
    };
    let config = config::load(&path)
        .await
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    info!(path = %path.display(), workstations = config.workstations.len(), "config loaded");

    let database = &config.monitor.database;
    let store = Arc::new(
        SqliteStore::open(database)
            .with_context(|| format!("failed to open database {}", database.display()))?,
    );

    let mailer: Arc<dyn Mailer> = if config.notifications.enabled {
        let mailer =
            SmtpMailer::new(&config.notifications).context("failed to set up SMTP delivery")?;
        Arc::new(mailer)
    } else {
        warn!("notifications disabled, messages will only be logged");
        Arc::new(LogMailer)
    };

    let scheduler = Arc::new(NotificationScheduler::new(
        store.clone(),
        mailer,
        config.suppression,
        config.notifications.recipients.clone(),
        config.notifications.subject_prefix.clone(),
    ));

    Ok(Runtime {
        config,
        store,
        scheduler,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Run { .. } => "info",
        _ => "warn",
    };
    init_tracing(cli.verbose, default_level);

    let runtime = bootstrap(cli.config).await?;

    match cli.command {
        Command::Run { once } => {
            let prober = Arc::new(SshProber::new(runtime.config.probe.clone()));
            let monitor = Arc::new(WorkstationMonitor::new(
                &runtime.config,
                prober,
                runtime.store.clone(),
                runtime.scheduler.clone(),
            ));
            let daemon = Daemon::new(monitor);

            if once {
                let outcome = daemon.run_once().await;
                let text = report::render_cycle_report(
                    &outcome.reports,
                    Utc::now(),
                    runtime.scheduler.control_host(),
                );
                println!("{}", text);
            } else {
                daemon.run().await;
            }
        }
        Command::Flush => match runtime.scheduler.flush_summary(Utc::now()).await? {
            FlushOutcome::Empty => println!("No queued issues."),
            FlushOutcome::Sent { groups, entries } => {
                println!("Sent off-hours summary: {} group(s), {} entries.", groups, entries)
            }
            FlushOutcome::DeliveryFailed { reason } => {
                println!("Summary not sent, entries stay queued: {}", reason)
            }
        },
        Command::Status { json } => {
            let statuses = runtime.store.host_statuses()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else if statuses.is_empty() {
                println!("No workstation has been checked yet.");
            } else {
                println!(
                    "{:<20} {:<7} {:<12} {:>5} {:>8}  {}",
                    "WORKSTATION", "ONLINE", "CONNECTIVITY", "USERS", "FAILURES", "LAST CHECKED"
                );
                for s in statuses {
                    println!(
                        "{:<20} {:<7} {:<12} {:>5} {:>8}  {}",
                        s.workstation,
                        if s.online { "yes" } else { "no" },
                        s.connectivity.as_str(),
                        s.active_users,
                        s.consecutive_failures,
                        s.last_checked.format("%Y-%m-%d %H:%M:%S UTC")
                    );
                }
            }
        }
        Command::Issues => {
            let issues = runtime.store.unresolved_issues()?;
            if issues.is_empty() {
                println!("No unresolved issues.");
            }
            for issue in issues {
                println!(
                    "{} [{}] {}: {} (x{}, since {})",
                    issue.key.workstation,
                    issue.severity,
                    issue.kind(),
                    issue.description,
                    issue.occurrences,
                    issue.first_seen.format("%Y-%m-%d %H:%M UTC")
                );
            }
        }
        Command::Recent { hours: window } => {
            let since = store::window_start(Utc::now(), hours(window))?;
            let rows = runtime.store.recent_failures(since)?;
            println!("{}", report::render_recent_failures(&rows, window));
        }
        Command::Reliability { days } => {
            let since = store::window_start(Utc::now(), hours(days.saturating_mul(24)))?;
            let rows = runtime.store.reliability(since)?;
            println!("{}", report::render_reliability(&rows, days));
        }
        Command::Software { days } => {
            let since = store::window_start(Utc::now(), hours(days.saturating_mul(24)))?;
            let rows = runtime.store.software_summary(since)?;
            println!("{}", report::render_software_summary(&rows, days));
        }
        Command::Detail {
            workstation,
            hours: window,
        } => {
            if runtime.config.host(&workstation).is_none() {
                warn!(workstation = %workstation, "not in the configured fleet");
            }
            let since = store::window_start(Utc::now(), hours(window))?;
            let rows = runtime.store.mount_history(&workstation, since)?;
            println!("{}", report::render_mount_history(&workstation, &rows, window));
        }
        Command::Config {
            retention: Some(retention),
            aggressive,
        } => {
            anyhow::ensure!(
                retention <= config::MAX_RETENTION,
                "retention {} exceeds {}",
                humantime::format_duration(retention),
                humantime::format_duration(config::MAX_RETENTION)
            );
            runtime
                .store
                .set_retention_override(retention, aggressive, Utc::now())
                .context("failed to save retention")?;
            println!(
                "Retention set to {} (aggressive cleanup: {}).",
                humantime::format_duration(retention),
                aggressive
            );
        }
        Command::Config {
            retention: None, ..
        } => {
            let monitor = &runtime.config.monitor;
            println!(
                "Config file: retention {}, aggressive cleanup {}",
                humantime::format_duration(monitor.retention),
                monitor.aggressive_cleanup
            );
            match runtime.store.retention_override()? {
                Some(saved) => println!(
                    "In force:    retention {}, aggressive cleanup {} (saved {})",
                    humantime::format_duration(saved.retention),
                    saved.aggressive,
                    saved.updated_at.format("%Y-%m-%d %H:%M UTC")
                ),
                None => println!("In force:    config file values"),
            }
        }
        Command::Cleanup { aggressive } => {
            let monitor = &runtime.config.monitor;
            let (retention, saved_aggressive) = store::effective_retention(
                &*runtime.store,
                monitor.retention,
                monitor.aggressive_cleanup,
            );
            let stats = runtime.store.purge_older_than(
                retention,
                aggressive || saved_aggressive,
                Utc::now(),
            )?;
            println!(
                "Removed {} observation(s), {} software check(s), {} issue(s), \
                 {} queued entr(ies), {} host(s).",
                stats.observations, stats.software_checks, stats.issues, stats.queued, stats.hosts
            );
        }
    }

    Ok(())
}
