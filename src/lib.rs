//! anomalyguard -- rolling Z-score anomaly detection with automatic,
//! cooldown-limited incident reports.
//!
//! Readings flow through [`monitor::Monitor`]: the [`detect`] engine scores
//! each one against its key's recent history, flagged readings feed the
//! [`scheduler`], and triggered report requests are generated and queued
//! for mail by the [`report`] collaborators on a background worker.

pub mod api;
pub mod config;
pub mod detect;
pub mod monitor;
pub mod replay;
pub mod report;
pub mod scheduler;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::monitor::Monitor;
use crate::report::{OutboxDispatcher, RecipientBook, SummaryGenerator};
use crate::scheduler::{DispatchStats, ReportPipeline};
use crate::storage::{AnomalyLog, Pool, ReportArchive};

/// A monitor wired to its dispatch worker.
pub struct Service {
    pub monitor: Arc<Monitor>,
    pub pool: Pool,
    pub worker: JoinHandle<()>,
}

impl Service {
    /// Build the monitor, report pipeline and worker on `pool`. Must be
    /// called from within a tokio runtime.
    pub fn assemble(config: &AppConfig, pool: Pool) -> Result<Self> {
        let stats = Arc::new(RwLock::new(DispatchStats::default()));
        let pipeline = ReportPipeline {
            generator: report::build_generator(&config.llm)?,
            fallback: config.llm.fallback_to_summary.then_some(SummaryGenerator),
            dispatcher: Arc::new(OutboxDispatcher::new(pool.clone())),
            recipients: RecipientBook::new(pool.clone()),
            archive: ReportArchive::new(pool.clone()),
            stats: stats.clone(),
        };

        let (tx, rx) = mpsc::channel(config.server.report_queue_depth.max(1));
        let worker = tokio::spawn(scheduler::run_dispatch_loop(rx, pipeline));

        let mut monitor = Monitor::new(config.detection.clone(), config.reporting.clone())
            .context("invalid detection or reporting config")?
            .with_report_channel(tx, stats);
        if config.storage.archive_anomalies {
            monitor = monitor.with_anomaly_log(AnomalyLog::new(pool.clone()));
        }

        Ok(Self {
            monitor: Arc::new(monitor),
            pool,
            worker,
        })
    }

    /// Drop the monitor and wait for queued reports to finish.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.monitor);
        self.worker.await.context("dispatch worker panicked")?;
        Ok(())
    }
}

/// Start the daemon: storage, dispatch worker and API server.
pub async fn serve(config: AppConfig) -> Result<()> {
    let db_path = config.storage.db_path.clone();
    tracing::info!(db_path = %db_path.display(), "initializing database");
    let pool = storage::open_pool(&db_path)?;

    let service = Service::assemble(&config, pool)?;
    let state = api::state::AppState::new(service.monitor.clone(), service.pool.clone());
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    tracing::info!(%addr, "anomalyguard listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped, draining report queue");
    service.shutdown().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
}
