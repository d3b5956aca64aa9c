//! Z-score classification of a value against a window's history.

use chrono::{DateTime, Utc};

use crate::config::DetectionConfig;
use crate::detect::window::StatisticsWindow;
use crate::detect::{DetectionResult, DetectionStatus, Severity};

/// Map an absolute Z-score to a severity band.
pub fn severity_for(z_score: f64, config: &DetectionConfig) -> Severity {
    let z = z_score.abs();
    let threshold = config.z_score_threshold;
    if z >= threshold * config.critical_ratio {
        Severity::Critical
    } else if z >= threshold {
        Severity::High
    } else if z >= threshold * config.warning_ratio {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

/// Classify `value` against `window` as it stands *before* `value` is added.
pub fn classify(
    key: &str,
    window: &StatisticsWindow,
    value: f64,
    unit: Option<&str>,
    timestamp: DateTime<Utc>,
    config: &DetectionConfig,
) -> DetectionResult {
    let have = window.size();
    let threshold = config.z_score_threshold;

    let base = DetectionResult {
        key: key.to_string(),
        value,
        unit: unit.map(str::to_string),
        mean: window.mean().unwrap_or(value),
        std_dev: window.std_dev(),
        z_score: 0.0,
        is_anomaly: false,
        severity: Severity::Normal,
        status: DetectionStatus::InsufficientData,
        threshold,
        timestamp,
        message: String::new(),
    };

    let mean = match window.mean() {
        Ok(mean) if have >= config.min_data_points => mean,
        _ => {
            return DetectionResult {
                message: format!(
                    "Insufficient data for '{}': {}/{} samples, value {} accepted as baseline",
                    key, have, config.min_data_points, value
                ),
                ..base
            };
        }
    };

    let std_dev = window.std_dev();
    let z_score = (value - mean) / std_dev;
    let severity = severity_for(z_score, config);

    if have < config.min_training_size {
        return DetectionResult {
            mean,
            std_dev,
            z_score,
            severity,
            status: DetectionStatus::Training,
            message: format!(
                "Training '{}' ({}/{} samples): value {:.2}, expected {:.2} ± {:.2}, z-score {:.2}",
                key, have, config.min_training_size, value, mean, std_dev, z_score
            ),
            ..base
        };
    }

    let is_anomaly = z_score.abs() >= threshold;
    let message = if is_anomaly {
        format!(
            "ANOMALY on '{}': value {:.2}, expected {:.2} ± {:.2}, z-score {:.2} ({})",
            key, value, mean, std_dev, z_score, severity
        )
    } else {
        format!(
            "Normal behaviour on '{}': value {:.2}, expected {:.2} ± {:.2}, z-score {:.2}",
            key, value, mean, std_dev, z_score
        )
    };

    DetectionResult {
        mean,
        std_dev,
        z_score,
        is_anomaly,
        severity,
        status: DetectionStatus::Evaluated,
        message,
        ..base
    }
}
