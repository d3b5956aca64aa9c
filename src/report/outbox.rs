//! Outgoing report mail, queued in SQLite for an external SMTP relay.
//!
//! One row per (report, recipient). The relay polls [`OutboxDispatcher::pending`]
//! and acknowledges with [`OutboxDispatcher::mark_dispatched`].

use anyhow::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::report::{DeliveryReceipt, Recipient, ReportContent, ReportDispatcher, ReportError};
use crate::storage::Pool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub to: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub report_id: String,
    pub recipient: String,
    pub message: OutboxMessage,
    pub created_at: String,
}

#[derive(Clone)]
pub struct OutboxDispatcher {
    pool: Pool,
}

impl OutboxDispatcher {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    fn enqueue(&self, report: &ReportContent, recipients: &[Recipient]) -> Result<Vec<String>> {
        let subject = report.subject();
        let body = report.render_text();
        let report_id = report.report_id.to_string();

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut queued = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO outbox (report_id, recipient, subject, payload_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in recipients.iter().filter(|r| r.should_notify(report.risk_level)) {
                let message = OutboxMessage {
                    to: r.email.clone(),
                    to_name: r.name.clone(),
                    subject: subject.clone(),
                    body: body.clone(),
                };
                let payload = serde_json::to_string(&message)?;
                stmt.execute(params![report_id, r.email, subject, payload])?;
                queued.push(r.email.clone());
            }
        }
        tx.commit()?;
        Ok(queued)
    }

    /// Undispatched messages, oldest first.
    pub fn pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, report_id, recipient, payload_json, created_at
             FROM outbox WHERE dispatched = 0 ORDER BY id LIMIT ?1",
        )?;
        let rows: Vec<(i64, String, String, String, String)> = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (id, report_id, recipient, json, created_at) in rows {
            match serde_json::from_str::<OutboxMessage>(&json) {
                Ok(message) => entries.push(OutboxEntry {
                    id,
                    report_id,
                    recipient,
                    message,
                    created_at,
                }),
                Err(e) => tracing::error!(id, error = %e, "unreadable outbox entry skipped"),
            }
        }
        Ok(entries)
    }

    /// Flag messages as handed to the relay.
    pub fn mark_dispatched(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let mut n = 0;
        {
            let mut stmt = tx.prepare("UPDATE outbox SET dispatched = 1 WHERE id = ?1")?;
            for id in ids {
                n += stmt.execute(params![id])?;
            }
        }
        tx.commit()?;
        debug!(count = n, "outbox entries marked dispatched");
        Ok(n)
    }
}

#[async_trait::async_trait]
impl ReportDispatcher for OutboxDispatcher {
    async fn send_report(
        &self,
        report: &ReportContent,
        recipients: &[Recipient],
    ) -> Result<DeliveryReceipt, ReportError> {
        let this = self.clone();
        let report = report.clone();
        let recipients = recipients.to_vec();
        let report_id = report.report_id;

        let queued = tokio::task::spawn_blocking(move || this.enqueue(&report, &recipients))
            .await
            .map_err(|e| ReportError::Delivery(e.to_string()))?
            .map_err(|e| ReportError::Storage(e.to_string()))?;

        info!(%report_id, queued = queued.len(), "report queued for delivery");
        Ok(DeliveryReceipt {
            report_id,
            queued: queued.len(),
            recipients: queued,
        })
    }
}
