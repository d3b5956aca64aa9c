//! Append-only archives: the anomaly log and generated reports.

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;

use crate::detect::DetectionResult;
use crate::report::ReportContent;
use crate::storage::Pool;

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedAnomaly {
    pub id: i64,
    pub result: DetectionResult,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivedReport {
    pub id: i64,
    pub content: ReportContent,
    pub created_at: String,
}

/// Flagged detections, newest first on read.
#[derive(Clone)]
pub struct AnomalyLog {
    pool: Pool,
}

impl AnomalyLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, result: &DetectionResult) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO anomalies (key, value, z_score, severity, result_json, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.key,
                result.value,
                result.z_score,
                result.severity.as_str(),
                serde_json::to_string(result)?,
                result.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize, key: Option<&str>) -> Result<Vec<ArchivedAnomaly>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, result_json, created_at FROM anomalies
             WHERE (?1 IS NULL OR key = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows: Vec<(i64, String, String)> = stmt
            .query_map(params![key, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, json, created_at) in rows {
            out.push(ArchivedAnomaly {
                id,
                result: serde_json::from_str(&json)?,
                created_at,
            });
        }
        Ok(out)
    }
}

/// Generated reports, stored whole as JSON.
#[derive(Clone)]
pub struct ReportArchive {
    pool: Pool,
}

impl ReportArchive {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, report: &ReportContent) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO reports (report_id, trigger_kind, risk_level, total_anomalies, generator, content_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.report_id.to_string(),
                report.trigger.to_string(),
                report.risk_level.as_str(),
                report.total_anomalies as i64,
                report.generator,
                serde_json::to_string(report)?
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, limit: usize) -> Result<Vec<ArchivedReport>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, content_json, created_at FROM reports ORDER BY id DESC LIMIT ?1",
        )?;
        let rows: Vec<(i64, String, String)> = stmt
            .query_map(params![limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, json, created_at) in rows {
            out.push(ArchivedReport {
                id,
                content: serde_json::from_str(&json)?,
                created_at,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionStatus, Severity};
    use crate::report::test_support::{event, request};
    use crate::report::SummaryGenerator;
    use crate::storage::open_memory_pool;
    use chrono::Utc;

    fn detection(key: &str, z: f64) -> DetectionResult {
        DetectionResult {
            key: key.to_string(),
            value: 99.0,
            unit: Some("C".into()),
            mean: 20.0,
            std_dev: 2.0,
            z_score: z,
            is_anomaly: true,
            severity: Severity::Critical,
            status: DetectionStatus::Evaluated,
            threshold: 3.0,
            timestamp: Utc::now(),
            message: "ANOMALY".into(),
        }
    }

    #[test]
    fn test_anomaly_log_newest_first_and_filter() {
        let log = AnomalyLog::new(open_memory_pool().unwrap());
        log.record(&detection("temp", 5.0)).unwrap();
        log.record(&detection("rpm", 6.0)).unwrap();
        log.record(&detection("temp", 7.0)).unwrap();

        let all = log.list_recent(10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].result.z_score, 7.0);

        let temp = log.list_recent(10, Some("temp")).unwrap();
        assert_eq!(temp.len(), 2);
        assert!(temp.iter().all(|a| a.result.key == "temp"));

        assert_eq!(log.list_recent(1, None).unwrap().len(), 1);
    }

    #[test]
    fn test_report_archive_round_trip() {
        let archive = ReportArchive::new(open_memory_pool().unwrap());
        let req = request(vec![event("temp", Severity::High, 3.3, 0)]);
        let report = SummaryGenerator.build(&req);
        archive.record(&report).unwrap();

        let listed = archive.list_recent(5).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].content, report);
    }

    #[test]
    fn test_duplicate_report_id_rejected() {
        let archive = ReportArchive::new(open_memory_pool().unwrap());
        let req = request(vec![event("temp", Severity::High, 3.3, 0)]);
        let report = SummaryGenerator.build(&req);
        archive.record(&report).unwrap();
        assert!(archive.record(&report).is_err());
    }
}
