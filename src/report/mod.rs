//! Report generation and delivery collaborators.
//!
//! The dispatch worker only sees the two traits below; the concrete
//! generator is chosen from `[llm]` config at startup.

pub mod gemini;
pub mod outbox;
pub mod recipients;
pub mod summary;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{LlmConfig, LlmProvider};
use crate::detect::Severity;
use crate::scheduler::{AnomalyEvent, ReportRequest, TriggerKind};

pub use self::gemini::GeminiGenerator;
pub use self::outbox::OutboxDispatcher;
pub use self::recipients::{Recipient, RecipientBook};
pub use self::summary::SummaryGenerator;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report generation failed: {0}")]
    Generation(String),
    #[error("report delivery failed: {0}")]
    Delivery(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ReportError {
    fn from(e: rusqlite::Error) -> Self {
        ReportError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for ReportError {
    fn from(e: r2d2::Error) -> Self {
        ReportError::Storage(e.to_string())
    }
}

/// Overall risk of a report, derived from its anomalies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Weighted score: high/critical events count 3, warnings 1, the peak
    /// |z| (capped at 10) and 2 per distinct key.
    pub fn assess(events: &[AnomalyEvent]) -> Self {
        let high = events
            .iter()
            .filter(|e| e.severity >= Severity::High)
            .count();
        let medium = events
            .iter()
            .filter(|e| e.severity == Severity::Warning)
            .count();
        let max_z = events
            .iter()
            .map(|e| e.z_score.abs())
            .fold(0.0_f64, f64::max);
        let keys = events
            .iter()
            .map(|e| e.key.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        let score = high as f64 * 3.0 + medium as f64 + max_z.min(10.0) + keys as f64 * 2.0;

        if score >= 20.0 || high >= 5 {
            RiskLevel::Critical
        } else if score >= 12.0 || high >= 2 {
            RiskLevel::High
        } else if score >= 6.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generated report, as archived and mailed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportContent {
    pub report_id: Uuid,
    pub trigger: TriggerKind,
    pub reason: String,
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_anomalies: usize,
    pub affected_keys: Vec<String>,
    pub risk_level: RiskLevel,
    pub summary: String,
    pub analysis: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    pub recommended_actions: Vec<String>,
    /// Which generator produced the text.
    pub generator: String,
}

impl ReportContent {
    /// Skeleton with everything but the prose filled in from the request.
    pub fn skeleton(request: &ReportRequest, generator: &str) -> Self {
        let period_start = request
            .events
            .iter()
            .map(|e| e.timestamp)
            .min()
            .unwrap_or(request.requested_at);
        let period_end = request
            .events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(request.requested_at);

        Self {
            report_id: request.id,
            trigger: request.trigger,
            reason: request.reason.clone(),
            generated_at: Utc::now(),
            period_start,
            period_end,
            total_anomalies: request.events.len(),
            affected_keys: request.affected_keys.clone(),
            risk_level: RiskLevel::assess(&request.events),
            summary: String::new(),
            analysis: String::new(),
            root_cause: None,
            recommended_actions: Vec::new(),
            generator: generator.to_string(),
        }
    }

    pub fn subject(&self) -> String {
        format!(
            "[{}] Anomaly report: {} anomalies on {} key(s)",
            self.risk_level.as_str().to_uppercase(),
            self.total_anomalies,
            self.affected_keys.len()
        )
    }

    /// Plain-text mail body.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Report {}\n", self.report_id));
        out.push_str(&format!("Risk level: {}\n", self.risk_level.as_str().to_uppercase()));
        out.push_str(&format!("Trigger: {} ({})\n", self.trigger, self.reason));
        out.push_str(&format!(
            "Period: {} .. {}\n",
            self.period_start.to_rfc3339(),
            self.period_end.to_rfc3339()
        ));
        out.push_str(&format!("Affected keys: {}\n\n", self.affected_keys.join(", ")));
        out.push_str("SUMMARY\n");
        out.push_str(&self.summary);
        out.push_str("\n\nANALYSIS\n");
        out.push_str(&self.analysis);
        if let Some(root_cause) = &self.root_cause {
            out.push_str("\n\nROOT CAUSE\n");
            out.push_str(root_cause);
        }
        out.push_str("\n\nRECOMMENDED ACTIONS\n");
        for (i, action) in self.recommended_actions.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, action));
        }
        out.push_str(&format!("\nGenerated by {} at {}\n", self.generator, self.generated_at.to_rfc3339()));
        out
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub report_id: Uuid,
    pub queued: usize,
    pub recipients: Vec<String>,
}

/// Turns a report request into report text.
#[async_trait::async_trait]
pub trait ReportGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate_report(&self, request: &ReportRequest) -> Result<ReportContent, ReportError>;
}

/// Delivers a generated report to the recipients that want it.
#[async_trait::async_trait]
pub trait ReportDispatcher: Send + Sync {
    async fn send_report(
        &self,
        report: &ReportContent,
        recipients: &[Recipient],
    ) -> Result<DeliveryReceipt, ReportError>;
}

/// Build the configured generator. Gemini without an API key in the
/// environment degrades to the rule-based generator.
pub fn build_generator(config: &LlmConfig) -> anyhow::Result<Arc<dyn ReportGenerator>> {
    match config.provider {
        LlmProvider::Summary => Ok(Arc::new(SummaryGenerator)),
        LlmProvider::Gemini => match std::env::var(&config.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(Arc::new(GeminiGenerator::new(config, key)?)),
            _ => {
                tracing::warn!(
                    env = %config.api_key_env,
                    "gemini selected but no API key set, using rule-based reports"
                );
                Ok(Arc::new(SummaryGenerator))
            }
        },
    }
}
