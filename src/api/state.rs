use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::monitor::Monitor;
use crate::report::RecipientBook;
use crate::storage::{AnomalyLog, Pool, ReportArchive};

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<Monitor>,
    pub recipients: RecipientBook,
    pub reports: ReportArchive,
    pub anomalies: AnomalyLog,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(monitor: Arc<Monitor>, pool: Pool) -> Self {
        Self {
            monitor,
            recipients: RecipientBook::new(pool.clone()),
            reports: ReportArchive::new(pool.clone()),
            anomalies: AnomalyLog::new(pool),
            started_at: Utc::now(),
        }
    }
}
