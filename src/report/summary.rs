//! Rule-based report text. Needs no network and never fails, so it also
//! serves as the fallback when an LLM call does.

use std::collections::BTreeMap;

use crate::detect::Severity;
use crate::report::{ReportContent, ReportError, ReportGenerator, RiskLevel};
use crate::scheduler::{AnomalyEvent, ReportRequest};

/// Per-key aggregate used by the report text and the LLM prompt.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct KeyDigest {
    pub key: String,
    pub unit: Option<String>,
    pub anomaly_count: usize,
    pub min_value: f64,
    pub max_value: f64,
    pub avg_value: f64,
    pub max_abs_z: f64,
    pub avg_abs_z: f64,
    pub worst: Severity,
}

pub fn digest(events: &[AnomalyEvent]) -> Vec<KeyDigest> {
    let mut grouped: BTreeMap<&str, Vec<&AnomalyEvent>> = BTreeMap::new();
    for e in events {
        grouped.entry(e.key.as_str()).or_default().push(e);
    }

    grouped
        .into_iter()
        .map(|(key, items)| {
            let n = items.len() as f64;
            let values = items.iter().map(|e| e.value);
            let zs = items.iter().map(|e| e.z_score.abs());
            KeyDigest {
                key: key.to_string(),
                unit: items.iter().find_map(|e| e.unit.clone()),
                anomaly_count: items.len(),
                min_value: values.clone().fold(f64::INFINITY, f64::min),
                max_value: values.clone().fold(f64::NEG_INFINITY, f64::max),
                avg_value: values.sum::<f64>() / n,
                max_abs_z: zs.clone().fold(0.0, f64::max),
                avg_abs_z: zs.sum::<f64>() / n,
                worst: items.iter().map(|e| e.severity).max().unwrap_or(Severity::Normal),
            }
        })
        .collect()
}

pub fn basic_summary(events: &[AnomalyEvent]) -> String {
    if events.is_empty() {
        return "No anomalies were detected in the reporting period.".to_string();
    }
    let digests = digest(events);
    let keys: Vec<&str> = digests.iter().map(|d| d.key.as_str()).collect();
    let high = events.iter().filter(|e| e.severity >= Severity::High).count();
    let critical = events.iter().filter(|e| e.severity == Severity::Critical).count();
    format!(
        "{} anomalies detected. Affected keys: {}. High-severity anomalies: {} ({} critical).",
        events.len(),
        keys.join(", "),
        high,
        critical
    )
}

pub fn basic_actions(events: &[AnomalyEvent], risk: RiskLevel) -> Vec<String> {
    let mut actions: Vec<String> = digest(events)
        .iter()
        .map(|d| {
            format!(
                "Inspect '{}': {} anomalies, values {:.2}..{:.2}, peak |z| {:.2}",
                d.key, d.anomaly_count, d.min_value, d.max_value, d.max_abs_z
            )
        })
        .collect();

    if events.iter().any(|e| e.severity >= Severity::High) {
        actions.insert(0, "URGENT: check the systems behind high-severity anomalies".to_string());
    }
    if risk >= RiskLevel::High && digest(events).len() > 1 {
        actions.push("Look for a shared cause across the affected keys".to_string());
    }
    actions
}

fn analysis_text(events: &[AnomalyEvent]) -> String {
    digest(events)
        .iter()
        .map(|d| {
            let unit = d.unit.as_deref().unwrap_or("");
            format!(
                "- {}: {} anomalies ({}), avg value {:.2}{}, range {:.2}..{:.2}{}, avg |z| {:.2}, peak |z| {:.2}",
                d.key,
                d.anomaly_count,
                d.worst,
                d.avg_value,
                unit,
                d.min_value,
                d.max_value,
                unit,
                d.avg_abs_z,
                d.max_abs_z
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Rule-based generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryGenerator;

impl SummaryGenerator {
    pub fn build(&self, request: &ReportRequest) -> ReportContent {
        let mut content = ReportContent::skeleton(request, self.name());
        content.summary = basic_summary(&request.events);
        content.analysis = analysis_text(&request.events);
        content.recommended_actions = basic_actions(&request.events, content.risk_level);
        content
    }
}

#[async_trait::async_trait]
impl ReportGenerator for SummaryGenerator {
    fn name(&self) -> &'static str {
        "summary"
    }

    async fn generate_report(&self, request: &ReportRequest) -> Result<ReportContent, ReportError> {
        Ok(self.build(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::test_support::{event, request};

    #[test]
    fn test_digest_groups_by_key() {
        let events = vec![
            event("temp", Severity::High, 3.0, 0),
            event("temp", Severity::Critical, -5.0, 1),
            event("rpm", Severity::High, 3.5, 2),
        ];
        let d = digest(&events);
        assert_eq!(d.len(), 2);
        assert_eq!(d[0].key, "rpm");
        assert_eq!(d[1].key, "temp");
        assert_eq!(d[1].anomaly_count, 2);
        assert_eq!(d[1].max_abs_z, 5.0);
        assert_eq!(d[1].avg_abs_z, 4.0);
        assert_eq!(d[1].worst, Severity::Critical);
        assert_eq!(d[1].unit.as_deref(), Some("C"));
    }

    #[test]
    fn test_empty_summary() {
        assert!(basic_summary(&[]).contains("No anomalies"));
        assert!(basic_actions(&[], RiskLevel::Low).is_empty());
    }

    #[test]
    fn test_high_severity_adds_urgent_action_first() {
        let events = vec![event("temp", Severity::High, 3.2, 0)];
        let actions = basic_actions(&events, RiskLevel::Medium);
        assert!(actions[0].starts_with("URGENT"));
        assert!(actions[1].contains("'temp'"));
    }

    #[tokio::test]
    async fn test_generate_fills_all_sections() {
        let req = request(vec![
            event("temp", Severity::High, 3.2, 0),
            event("rpm", Severity::Critical, 6.0, 1),
        ]);
        let content = SummaryGenerator.generate_report(&req).await.unwrap();
        assert_eq!(content.generator, "summary");
        assert!(content.summary.starts_with("2 anomalies detected"));
        assert!(content.analysis.contains("- rpm: 1 anomalies (critical)"));
        assert!(!content.recommended_actions.is_empty());
    }
}
