use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use anomalyguard::config::{AppConfig, LoggingConfig, CONFIG_ENV};
use anomalyguard::monitor::ReportNotice;
use anomalyguard::report::{OutboxDispatcher, Recipient, RecipientBook};
use anomalyguard::storage::{self, ReportArchive};
use anomalyguard::Service;

#[derive(Parser)]
#[command(
    name = "anomalyguard",
    about = "Rolling Z-score anomaly detection with automatic incident reports",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + report worker)
    Serve {
        /// Bind address, overrides [server].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Feed a CSV of readings (key,value[,unit[,timestamp]]) through the detector
    Replay {
        /// Input file
        #[arg(long)]
        file: PathBuf,

        /// One JSON result per line instead of a table
        #[arg(long)]
        json: bool,

        /// Write anomalies, reports and mail to the configured database
        #[arg(long)]
        persist: bool,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage report recipients
    Recipients {
        #[command(subcommand)]
        action: RecipientAction,
    },

    /// Show archived reports
    Reports {
        #[command(subcommand)]
        action: ReportAction,
    },

    /// Inspect and acknowledge queued report mail
    Outbox {
        #[command(subcommand)]
        action: OutboxAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config as TOML
    Show,
    /// Load and validate the config, then exit
    Validate,
}

#[derive(Subcommand)]
enum RecipientAction {
    /// List all recipients
    List,

    /// Add or update a recipient
    Add {
        #[arg(long)]
        email: String,

        #[arg(long, default_value = "")]
        name: String,

        /// Also notify on medium-risk reports
        #[arg(long)]
        medium: bool,

        /// Also notify on low-risk reports
        #[arg(long)]
        low: bool,

        /// Do not notify on high-risk reports
        #[arg(long)]
        no_high: bool,
    },

    /// Remove a recipient
    Remove {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum ReportAction {
    /// List the most recent reports
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum OutboxAction {
    /// Show undispatched messages
    Pending {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Mark messages as handed to the mail relay
    Ack {
        /// Outbox entry ids
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            tracing::info!(bind = %config.server.bind, "starting anomalyguard daemon");
            anomalyguard::serve(config).await?;
        }
        Commands::Replay { file, json, persist } => {
            let readings = anomalyguard::replay::load_file(&file)?;
            let pool = if persist {
                storage::open_pool(&config.storage.db_path)?
            } else {
                storage::open_memory_pool()?
            };
            let service = Service::assemble(&config, pool)?;

            if !json {
                println!(
                    "{:<20} | {:>12} | {:>8} | {:<8} | Report",
                    "Key", "Value", "Z", "Severity"
                );
                println!("{:-<20}-|-{:->12}-|-{:->8}-|-{:-<8}-|-{:-<10}", "", "", "", "", "");
            }
            let summary = anomalyguard::replay::replay(&service.monitor, &readings, |outcome| {
                if json {
                    match serde_json::to_string(outcome) {
                        Ok(line) => println!("{}", line),
                        Err(e) => tracing::error!(error = %e, "failed to encode result"),
                    }
                    return;
                }
                let report = match &outcome.report {
                    Some(ReportNotice::Triggered { trigger, .. }) => format!("triggered ({})", trigger),
                    Some(ReportNotice::Skipped { reason }) => format!("skipped ({:?})", reason),
                    Some(ReportNotice::Buffered) => "buffered".to_string(),
                    Some(ReportNotice::Disabled) => "disabled".to_string(),
                    None => String::new(),
                };
                let r = &outcome.result;
                println!(
                    "{:<20} | {:>12.3} | {:>8.2} | {:<8} | {}",
                    r.key, r.value, r.z_score, r.severity.as_str(), report
                );
            })
            .await;

            let dispatch = service.monitor.dispatch_stats().await;
            service.shutdown().await?;
            if json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!(
                    "\n{} readings, {} rejected, {} anomalies, {} reports triggered, {} skipped, {} dropped",
                    summary.readings,
                    summary.rejected,
                    summary.anomalies,
                    summary.reports_triggered,
                    summary.reports_skipped,
                    dispatch.requests_dropped
                );
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigAction::Validate => {
                config.validate()?;
                println!("Configuration OK.");
            }
        },
        Commands::Recipients { action } => {
            let book = RecipientBook::new(storage::open_pool(&config.storage.db_path)?);
            match action {
                RecipientAction::List => {
                    let list = book.list()?;
                    if list.is_empty() {
                        println!("No recipients configured.");
                    } else {
                        println!("{:<32} | {:<20} | Crit | High | Med | Low", "Email", "Name");
                        println!("{:-<32}-|-{:-<20}-|------|------|-----|----", "", "");
                        for r in list {
                            println!(
                                "{:<32} | {:<20} | {:<4} | {:<4} | {:<3} | {}",
                                r.email,
                                r.name,
                                r.notify_on_critical,
                                r.notify_on_high,
                                r.notify_on_medium,
                                r.notify_on_low
                            );
                        }
                    }
                }
                RecipientAction::Add {
                    email,
                    name,
                    medium,
                    low,
                    no_high,
                } => {
                    let mut recipient = Recipient::new(email, name);
                    recipient.notify_on_medium = medium;
                    recipient.notify_on_low = low;
                    recipient.notify_on_high = !no_high;
                    book.add(&recipient)?;
                    println!("Recipient '{}' saved.", recipient.email);
                }
                RecipientAction::Remove { email } => {
                    if !book.remove(&email)? {
                        bail!("no recipient '{}'", email);
                    }
                    println!("Recipient '{}' removed.", email);
                }
            }
        }
        Commands::Reports { action } => match action {
            ReportAction::List { limit } => {
                let archive = ReportArchive::new(storage::open_pool(&config.storage.db_path)?);
                let reports = archive.list_recent(limit)?;
                if reports.is_empty() {
                    println!("No reports yet.");
                }
                for r in reports {
                    let c = &r.content;
                    println!(
                        "{}  {:<8}  {:<13}  {:>3} anomalies  [{}]  {}",
                        c.generated_at.format("%Y-%m-%d %H:%M:%S"),
                        c.risk_level.as_str().to_uppercase(),
                        c.trigger.to_string(),
                        c.total_anomalies,
                        c.affected_keys.join(","),
                        c.summary
                    );
                }
            }
        },
        Commands::Outbox { action } => {
            let outbox = OutboxDispatcher::new(storage::open_pool(&config.storage.db_path)?);
            match action {
                OutboxAction::Pending { limit } => {
                    let pending = outbox.pending(limit)?;
                    if pending.is_empty() {
                        println!("Outbox empty.");
                    }
                    for entry in pending {
                        println!(
                            "#{:<6} {}  {:<32} {}",
                            entry.id, entry.created_at, entry.recipient, entry.message.subject
                        );
                    }
                }
                OutboxAction::Ack { ids } => {
                    let n = outbox.mark_dispatched(&ids)?;
                    println!("{} message(s) marked dispatched.", n);
                }
            }
        }
    }

    Ok(())
}
