//! Offline replay of recorded readings from CSV.
//!
//! One reading per record: `key,value[,unit[,timestamp]]`, RFC 4180 quoting
//! allowed. Blank lines and `#` comments are skipped. A first record whose
//! leading columns are `key,value` is taken as the header; any other record
//! that does not parse is an error carrying its line number. Timestamps are
//! RFC 3339; without one the reading is stamped at parse time.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use tracing::{info, warn};

use crate::detect::Reading;
use crate::monitor::{Monitor, ReadingOutcome, ReportNotice};

/// Build a reading from one CSV record.
pub fn parse_record(record: &StringRecord) -> Result<Reading> {
    if record.len() < 2 || record.len() > 4 {
        bail!("expected key,value[,unit[,timestamp]], got {} fields", record.len());
    }
    let raw_value = &record[1];
    let value: f64 = raw_value
        .parse()
        .with_context(|| format!("invalid value '{}'", raw_value))?;
    let mut reading = Reading::new(&record[0], value);
    if let Some(unit) = record.get(2).filter(|u| !u.is_empty()) {
        reading = reading.with_unit(unit);
    }
    if let Some(ts) = record.get(3).filter(|t| !t.is_empty()) {
        let ts = DateTime::parse_from_rfc3339(ts)
            .with_context(|| format!("invalid timestamp '{}'", ts))?
            .with_timezone(&Utc);
        reading = reading.at(ts);
    }
    Ok(reading)
}

pub fn parse_csv(content: &str) -> Result<Vec<Reading>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .comment(Some(b'#'))
        .from_reader(content.as_bytes());

    let mut readings = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record.context("malformed CSV")?;
        let line = record.position().map(|p| p.line()).unwrap_or(idx as u64 + 1);
        if idx == 0 && is_header(&record) {
            continue;
        }
        let reading = parse_record(&record).with_context(|| format!("line {}", line))?;
        readings.push(reading);
    }
    Ok(readings)
}

fn is_header(record: &StringRecord) -> bool {
    matches!(
        (record.get(0), record.get(1)),
        (Some(k), Some(v)) if k.eq_ignore_ascii_case("key") && v.eq_ignore_ascii_case("value")
    )
}

pub fn load_file(path: &Path) -> Result<Vec<Reading>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_csv(&content).with_context(|| format!("failed to parse {}", path.display()))
}

#[derive(Debug, Default, Serialize)]
pub struct ReplaySummary {
    pub readings: usize,
    pub rejected: usize,
    pub anomalies: usize,
    pub reports_triggered: usize,
    pub reports_skipped: usize,
}

/// Feed readings through the monitor in order, calling `on_outcome` for each.
pub async fn replay<F>(monitor: &Monitor, readings: &[Reading], mut on_outcome: F) -> ReplaySummary
where
    F: FnMut(&ReadingOutcome),
{
    let mut summary = ReplaySummary::default();
    for reading in readings {
        summary.readings += 1;
        let outcome = match monitor.process_reading(reading).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %reading.key, error = %e, "reading rejected");
                summary.rejected += 1;
                continue;
            }
        };
        if outcome.result.is_anomaly {
            summary.anomalies += 1;
        }
        match outcome.report {
            Some(ReportNotice::Triggered { .. }) => summary.reports_triggered += 1,
            Some(ReportNotice::Skipped { .. }) => summary.reports_skipped += 1,
            _ => {}
        }
        on_outcome(&outcome);
    }
    info!(
        readings = summary.readings,
        anomalies = summary.anomalies,
        reports = summary.reports_triggered,
        "replay finished"
    );
    summary
}
