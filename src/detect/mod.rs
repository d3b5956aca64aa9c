//! Rolling Z-score anomaly detection.

pub mod classifier;
pub mod engine;
pub mod window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::engine::AnomalyEngine;
pub use self::window::StatisticsWindow;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DetectError {
    #[error("reading key must not be empty")]
    EmptyKey,
    #[error("reading value for '{key}' is not finite: {value}")]
    NonFiniteValue { key: String, value: f64 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("insufficient data: need {needed} samples, have {have}")]
    InsufficientData { needed: usize, have: usize },
}

/// Severity bands derived from the absolute Z-score.
///
/// Ordered so that `Severity::High < Severity::Critical` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Normal,
    Warning,
    High,
    Critical,
}

impl Severity {
    /// High and Critical are the anomalous bands.
    pub fn is_anomalous(self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Severity::Normal),
            "warning" | "medium" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Where the window for a key was in its lifecycle when a reading arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    /// Fewer than `min_data_points` samples; no statistics computed.
    InsufficientData,
    /// Statistics computed but anomaly flagging not yet armed.
    Training,
    Evaluated,
}

/// A single observation from a sensor or metric source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub key: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
            unit: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Classification of one reading against its key's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub key: String,
    pub value: f64,
    pub unit: Option<String>,
    /// Mean of the history; the value itself when the history is empty.
    pub mean: f64,
    /// Never below `MIN_STD_DEV`.
    pub std_dev: f64,
    pub z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
    pub status: DetectionStatus,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_flags() {
        assert!(Severity::Normal < Severity::Warning);
        assert!(Severity::High < Severity::Critical);
        assert!(!Severity::Warning.is_anomalous());
        assert!(Severity::High.is_anomalous());
        assert!(Severity::Critical.is_anomalous());
    }

    #[test]
    fn test_severity_parse_accepts_legacy_names() {
        assert_eq!("MEDIUM".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("Critical".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("severe".parse::<Severity>().is_err());
    }

    #[test]
    fn test_reading_json_defaults() {
        let r: Reading = serde_json::from_str(r#"{"key":"temp","value":21.5}"#).unwrap();
        assert_eq!(r.key, "temp");
        assert!(r.unit.is_none());
    }
}
