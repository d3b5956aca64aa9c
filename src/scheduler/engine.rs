use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};

use crate::report::{
    RecipientBook, ReportContent, ReportDispatcher, ReportError, ReportGenerator, SummaryGenerator,
};
use crate::scheduler::{DispatchOutcome, DispatchStats, ReportRequest};
use crate::storage::ReportArchive;

/// Everything needed to turn a request into queued mail.
#[derive(Clone)]
pub struct ReportPipeline {
    pub generator: Arc<dyn ReportGenerator>,
    /// Rule-based stand-in when the generator fails.
    pub fallback: Option<SummaryGenerator>,
    pub dispatcher: Arc<dyn ReportDispatcher>,
    pub recipients: RecipientBook,
    pub archive: ReportArchive,
    pub stats: Arc<RwLock<DispatchStats>>,
}

impl ReportPipeline {
    async fn generate(&self, request: &ReportRequest) -> Result<ReportContent, ReportError> {
        match self.generator.generate_report(request).await {
            Ok(content) => Ok(content),
            Err(e) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        report_id = %request.id,
                        generator = self.generator.name(),
                        error = %e,
                        "generator failed, using rule-based report"
                    );
                    self.stats.write().await.fallback_reports += 1;
                    Ok(fallback.build(request))
                }
                None => Err(e),
            },
        }
    }

    /// Generate, archive and deliver one request. Failures are logged and
    /// reported in the outcome, never retried.
    pub async fn handle(&self, request: ReportRequest) -> DispatchOutcome {
        self.stats.write().await.requests_received += 1;
        let report_id = request.id;

        let outcome = match self.generate(&request).await {
            Err(e) => {
                error!(%report_id, error = %e, "report generation failed");
                DispatchOutcome::GenerationFailed {
                    report_id,
                    error: e.to_string(),
                }
            }
            Ok(content) => self.archive_and_deliver(content).await,
        };

        self.stats.write().await.record(outcome.clone());
        outcome
    }

    async fn archive_and_deliver(&self, content: ReportContent) -> DispatchOutcome {
        let report_id = content.report_id;

        let archive = self.archive.clone();
        let book = self.recipients.clone();
        let stored = content.clone();
        let recipients = tokio::task::spawn_blocking(move || {
            if let Err(e) = archive.record(&stored) {
                error!(report_id = %stored.report_id, error = %e, "failed to archive report");
            }
            book.list()
        })
        .await;

        let recipients = match recipients {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => return delivery_failed(report_id, ReportError::Storage(e.to_string())),
            Err(e) => return delivery_failed(report_id, ReportError::Delivery(e.to_string())),
        };

        match self.dispatcher.send_report(&content, &recipients).await {
            Ok(receipt) => {
                info!(
                    %report_id,
                    risk = %content.risk_level,
                    queued = receipt.queued,
                    "report delivered"
                );
                DispatchOutcome::Delivered {
                    report_id,
                    trigger: content.trigger,
                    risk_level: content.risk_level,
                    generator: content.generator,
                    queued: receipt.queued,
                }
            }
            Err(e) => delivery_failed(report_id, e),
        }
    }
}

fn delivery_failed(report_id: uuid::Uuid, e: ReportError) -> DispatchOutcome {
    error!(%report_id, error = %e, "report delivery failed");
    DispatchOutcome::DeliveryFailed {
        report_id,
        error: e.to_string(),
    }
}

/// Dispatch worker. Handles requests one at a time and exits once every
/// sender is dropped.
pub async fn run_dispatch_loop(mut rx: mpsc::Receiver<ReportRequest>, pipeline: ReportPipeline) {
    info!(generator = pipeline.generator.name(), "report dispatch worker started");

    while let Some(request) = rx.recv().await {
        info!(
            report_id = %request.id,
            trigger = %request.trigger,
            anomalies = request.events.len(),
            "report request received"
        );
        pipeline.handle(request).await;
    }

    info!("report dispatch worker stopped");
}
