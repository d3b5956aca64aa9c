//! Report text from the Gemini `generateContent` REST endpoint.

use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::report::summary::{basic_actions, basic_summary, digest};
use crate::report::{ReportContent, ReportError, ReportGenerator};
use crate::scheduler::ReportRequest;

const SUMMARY_LIMIT: usize = 500;
const ANALYSIS_LIMIT: usize = 4000;

pub struct GeminiGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

/// Sections pulled out of the model's markdown answer.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedAnalysis {
    pub summary: String,
    pub root_cause: String,
    pub actions: Vec<String>,
}

impl GeminiGenerator {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        info!(model = %config.model, "gemini report generator ready");
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

/// Prompt with per-key aggregates as JSON and a fixed answer layout.
pub fn build_prompt(request: &ReportRequest) -> String {
    let digests = digest(&request.events);
    let digest_json = serde_json::to_string_pretty(&digests).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are an anomaly analysis assistant for monitored telemetry.\n\
         Analyse the anomalies below and write a professional report.\n\n\
         ## ANOMALY DATA\n\
         Total anomalies: {}\n\
         Trigger: {} ({})\n\n\
         ### Per-key summary\n{}\n\n\
         ## TASK\n\
         Answer using exactly these sections:\n\
         ### 1. EXECUTIVE SUMMARY\nTwo or three sentences.\n\
         ### 2. RISK LEVEL\nOne of LOW, MEDIUM, HIGH, CRITICAL.\n\
         ### 3. DETAILED ANALYSIS\nWhat happened per key, why it matters, likely causes.\n\
         ### 4. ROOT CAUSE ANALYSIS\nProbable root causes and cross-key correlations.\n\
         ### 5. RECOMMENDED ACTIONS\nA bulleted list, each with a priority (URGENT, HIGH, MEDIUM, LOW).\n\
         ### 6. FOLLOW-UP\nMetrics and checkpoints to watch.\n",
        request.events.len(),
        request.trigger,
        request.reason,
        digest_json
    )
}

fn section<'a>(text: &'a str, heading: &str) -> Option<&'a str> {
    let start = text.find(heading)? + heading.len();
    let rest = &text[start..];
    let end = rest.find("###").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn truncate(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

pub fn parse_analysis(text: &str) -> ParsedAnalysis {
    let summary = section(text, "EXECUTIVE SUMMARY")
        .map(|s| truncate(s, SUMMARY_LIMIT))
        .unwrap_or_default();
    let root_cause = section(text, "ROOT CAUSE")
        .map(|s| truncate(s.trim_start_matches("ANALYSIS").trim(), 1000))
        .unwrap_or_default();
    let actions = section(text, "RECOMMENDED ACTIONS")
        .map(|s| {
            s.lines()
                .map(str::trim)
                .filter(|l| l.starts_with('-') || l.starts_with('*') || l.starts_with('•'))
                .map(|l| l.trim_start_matches(['-', '*', '•', ' ']).trim().to_string())
                .filter(|a| a.len() > 5)
                .collect()
        })
        .unwrap_or_default();

    ParsedAnalysis {
        summary,
        root_cause,
        actions,
    }
}

#[async_trait::async_trait]
impl ReportGenerator for GeminiGenerator {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate_report(&self, request: &ReportRequest) -> Result<ReportContent, ReportError> {
        let prompt = build_prompt(request);
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: &prompt }],
            }],
        };

        debug!(report_id = %request.id, model = %self.model, "requesting gemini analysis");
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ReportError::Generation(format!(
                "gemini returned {}: {}",
                status,
                truncate(&detail, 200)
            )));
        }

        let parsed: GenerateResponse = response.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(ReportError::Generation("gemini returned no text".into()));
        }

        let content = content_from_answer(request, &text, self.name());
        info!(report_id = %request.id, risk = %content.risk_level, "gemini analysis complete");
        Ok(content)
    }
}

/// Fill a report from the model's answer, falling back to the rule-based
/// text for any section the model left out.
pub fn content_from_answer(request: &ReportRequest, text: &str, generator: &str) -> ReportContent {
    let analysis = parse_analysis(text);
    let mut content = ReportContent::skeleton(request, generator);
    content.summary = if analysis.summary.is_empty() {
        basic_summary(&request.events)
    } else {
        analysis.summary
    };
    content.recommended_actions = if analysis.actions.is_empty() {
        basic_actions(&request.events, content.risk_level)
    } else {
        analysis.actions
    };
    content.root_cause = Some(analysis.root_cause).filter(|r| !r.is_empty());
    content.analysis = truncate(text, ANALYSIS_LIMIT);
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Severity;
    use crate::report::test_support::{event, request};

    const ANSWER: &str = "### 1. EXECUTIVE SUMMARY\n\
        Temperature spiked well above baseline on two probes.\n\
        ### 2. RISK LEVEL\nHIGH\n\
        ### 4. ROOT CAUSE ANALYSIS\nA cooling fan failure is likely.\n\
        ### 5. RECOMMENDED ACTIONS\n\
        - URGENT: inspect the cooling fan\n\
        * HIGH: recalibrate probe 2\n\
        - ok\n\
        plain line ignored\n\
        ### 6. FOLLOW-UP\nWatch temp.";

    #[test]
    fn test_parse_sections() {
        let parsed = parse_analysis(ANSWER);
        assert_eq!(parsed.summary, "Temperature spiked well above baseline on two probes.");
        assert_eq!(parsed.root_cause, "A cooling fan failure is likely.");
        assert_eq!(
            parsed.actions,
            vec!["URGENT: inspect the cooling fan", "HIGH: recalibrate probe 2"]
        );
    }

    #[test]
    fn test_answer_fills_report() {
        let req = request(vec![event("temp", Severity::Critical, 5.5, 0)]);
        let content = content_from_answer(&req, ANSWER, "gemini");
        assert_eq!(content.root_cause.as_deref(), Some("A cooling fan failure is likely."));
        assert_eq!(content.recommended_actions.len(), 2);
        assert_eq!(content.generator, "gemini");

        let bare = content_from_answer(&req, "nothing useful", "gemini");
        assert!(bare.root_cause.is_none());
        assert!(!bare.summary.is_empty());
        assert!(!bare.recommended_actions.is_empty());
    }

    #[test]
    fn test_parse_missing_sections() {
        assert_eq!(parse_analysis("nothing useful"), ParsedAnalysis::default());
    }

    #[test]
    fn test_summary_is_truncated() {
        let long = format!("EXECUTIVE SUMMARY\n{}", "x".repeat(900));
        assert_eq!(parse_analysis(&long).summary.len(), SUMMARY_LIMIT);
    }

    #[test]
    fn test_prompt_embeds_digest() {
        let req = request(vec![event("temp", Severity::Critical, 5.5, 0)]);
        let prompt = build_prompt(&req);
        assert!(prompt.contains("Total anomalies: 1"));
        assert!(prompt.contains("\"key\": \"temp\""));
        assert!(prompt.contains("RECOMMENDED ACTIONS"));
    }

    #[test]
    fn test_response_deserialises() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}],"role":"model"}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        let text: String = parsed.candidates[0]
            .content
            .as_ref()
            .unwrap()
            .parts
            .iter()
            .map(|p| p.text.as_str())
            .collect();
        assert_eq!(text, "ab");
    }

    #[test]
    fn test_url_strips_trailing_slash() {
        let cfg = LlmConfig {
            endpoint: "http://localhost:9/v1beta/".into(),
            ..LlmConfig::default()
        };
        let g = GeminiGenerator::new(&cfg, "k".into()).unwrap();
        assert_eq!(g.url(), "http://localhost:9/v1beta/models/gemini-2.5-flash:generateContent");
    }
}
