//! TOML configuration for the anomalyguard daemon.
//!
//! Layered model: compiled-in defaults, an optional TOML file (path from
//! `ANOMALYGUARD_CONFIG` or the standard system location), then a handful of
//! environment variable overrides for the detection parameters.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::DetectError;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "ANOMALYGUARD_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/anomalyguard/anomalyguard.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: `ANOMALYGUARD_CONFIG`, the system location, defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "ANOMALYGUARD_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Resolve the config for a process: explicit path if given, else the
    /// layered lookup. Env overrides are applied and the result validated.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(),
        };
        cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `ANOMALY_WINDOW_SIZE`, `ANOMALY_Z_THRESHOLD` and
    /// `ANOMALY_MIN_POINTS`. The lookup is injected so tests need not touch
    /// the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ANOMALY_WINDOW_SIZE") {
            self.detection.window_size = v
                .trim()
                .parse()
                .with_context(|| format!("ANOMALY_WINDOW_SIZE is not an integer: {}", v))?;
        }
        if let Some(v) = lookup("ANOMALY_Z_THRESHOLD") {
            self.detection.z_score_threshold = v
                .trim()
                .parse()
                .with_context(|| format!("ANOMALY_Z_THRESHOLD is not a number: {}", v))?;
        }
        if let Some(v) = lookup("ANOMALY_MIN_POINTS") {
            self.detection.min_data_points = v
                .trim()
                .parse()
                .with_context(|| format!("ANOMALY_MIN_POINTS is not an integer: {}", v))?;
        }
        Ok(())
    }

    /// Validate every section. Non-fatal conflicts are logged.
    pub fn validate(&self) -> Result<()> {
        for warning in self.detection.validate()? {
            warn!(%warning, "detection config accepted with warning");
        }
        self.reporting.validate()?;
        self.llm.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the HTTP API.
    pub bind: String,
    /// Capacity of the channel between detection and the report worker.
    pub report_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            report_queue_depth: 32,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    /// Write every anomalous detection to the `anomalies` table.
    pub archive_anomalies: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/anomalyguard.db"),
            archive_anomalies: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Parameters of the rolling Z-score model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Number of most recent values kept per key.
    pub window_size: usize,
    /// `|z|` at or above this is an anomaly.
    pub z_score_threshold: f64,
    /// Samples needed before statistics are computed at all.
    pub min_data_points: usize,
    /// Samples needed before anomalies are flagged.
    pub min_training_size: usize,
    /// Fraction of the threshold where the warning band starts.
    pub warning_ratio: f64,
    /// Multiple of the threshold where the critical band starts.
    pub critical_ratio: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            window_size: 30,
            z_score_threshold: 3.0,
            min_data_points: 7,
            min_training_size: 20,
            warning_ratio: 0.7,
            critical_ratio: 1.5,
        }
    }
}

impl DetectionConfig {
    /// Reject invalid ranges; return warnings for combinations that are
    /// consistent but leave detection inert.
    pub fn validate(&self) -> Result<Vec<String>, DetectError> {
        if self.window_size < 1 {
            return Err(DetectError::InvalidConfig(
                "window_size must be at least 1".into(),
            ));
        }
        if !self.z_score_threshold.is_finite() || self.z_score_threshold <= 0.0 {
            return Err(DetectError::InvalidConfig(format!(
                "z_score_threshold must be a positive number, got {}",
                self.z_score_threshold
            )));
        }
        if self.min_data_points < 1 {
            return Err(DetectError::InvalidConfig(
                "min_data_points must be at least 1".into(),
            ));
        }
        if self.min_training_size < self.min_data_points {
            return Err(DetectError::InvalidConfig(format!(
                "min_training_size ({}) must not be smaller than min_data_points ({})",
                self.min_training_size, self.min_data_points
            )));
        }
        if !(self.warning_ratio > 0.0 && self.warning_ratio < 1.0) {
            return Err(DetectError::InvalidConfig(format!(
                "warning_ratio must be in (0, 1), got {}",
                self.warning_ratio
            )));
        }
        if !self.critical_ratio.is_finite() || self.critical_ratio < 1.0 {
            return Err(DetectError::InvalidConfig(format!(
                "critical_ratio must be at least 1, got {}",
                self.critical_ratio
            )));
        }

        let mut warnings = Vec::new();
        if self.window_size < self.min_data_points {
            warnings.push(format!(
                "window_size ({}) is smaller than min_data_points ({}); statistics will never be computed",
                self.window_size, self.min_data_points
            ));
        } else if self.window_size < self.min_training_size {
            warnings.push(format!(
                "window_size ({}) is smaller than min_training_size ({}); anomalies will never be flagged",
                self.window_size, self.min_training_size
            ));
        }
        Ok(warnings)
    }

    /// Merge a partial update over this config.
    pub fn merged(&self, update: &DetectionConfigUpdate) -> Self {
        Self {
            window_size: update.window_size.unwrap_or(self.window_size),
            z_score_threshold: update.z_score_threshold.unwrap_or(self.z_score_threshold),
            min_data_points: update.min_data_points.unwrap_or(self.min_data_points),
            min_training_size: update.min_training_size.unwrap_or(self.min_training_size),
            warning_ratio: update.warning_ratio.unwrap_or(self.warning_ratio),
            critical_ratio: update.critical_ratio.unwrap_or(self.critical_ratio),
        }
    }
}

/// Partial detection config, as accepted by `PUT /api/v1/config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionConfigUpdate {
    pub window_size: Option<usize>,
    pub z_score_threshold: Option<f64>,
    pub min_data_points: Option<usize>,
    pub min_training_size: Option<usize>,
    pub warning_ratio: Option<f64>,
    pub critical_ratio: Option<f64>,
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Auto-report trigger and cooldown policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub enabled: bool,
    /// Buffered anomalies (within the window) needed for a batch report.
    pub min_anomalies_for_report: usize,
    /// Anomalies older than this, relative to the newest, are pruned.
    pub anomaly_window_minutes: i64,
    /// A critical anomaly triggers a report on its own.
    pub instant_report_on_critical: bool,
    pub cooldown_minutes: i64,
    pub critical_cooldown_minutes: i64,
    /// Distinct keys in the buffer needed for a correlation report.
    pub multi_sensor_threshold: usize,
    /// Defer reports outside `[working_hours_start, working_hours_end)` UTC.
    pub working_hours_only: bool,
    pub working_hours_start: u32,
    pub working_hours_end: u32,
    /// Upper bound on the events handed to one report.
    pub max_events_per_report: usize,
    /// Hard bound on the anomaly buffer.
    pub buffer_capacity: usize,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_anomalies_for_report: 3,
            anomaly_window_minutes: 5,
            instant_report_on_critical: true,
            cooldown_minutes: 15,
            critical_cooldown_minutes: 5,
            multi_sensor_threshold: 2,
            working_hours_only: false,
            working_hours_start: 8,
            working_hours_end: 18,
            max_events_per_report: 100,
            buffer_capacity: 1000,
        }
    }
}

/// Longest accepted window or cooldown: one year.
pub const MAX_REPORTING_MINUTES: i64 = 366 * 24 * 60;

impl ReportingConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        let invalid = |msg: String| Err(DetectError::InvalidConfig(msg));
        if self.min_anomalies_for_report < 1 {
            return invalid("min_anomalies_for_report must be at least 1".into());
        }
        if self.anomaly_window_minutes < 1 {
            return invalid("anomaly_window_minutes must be at least 1".into());
        }
        if self.cooldown_minutes < 0 || self.critical_cooldown_minutes < 0 {
            return invalid("cooldown durations must not be negative".into());
        }
        for (name, minutes) in [
            ("anomaly_window_minutes", self.anomaly_window_minutes),
            ("cooldown_minutes", self.cooldown_minutes),
            ("critical_cooldown_minutes", self.critical_cooldown_minutes),
        ] {
            if minutes > MAX_REPORTING_MINUTES {
                return invalid(format!(
                    "{} must be at most {} (one year), got {}",
                    name, MAX_REPORTING_MINUTES, minutes
                ));
            }
        }
        if self.multi_sensor_threshold < 1 {
            return invalid("multi_sensor_threshold must be at least 1".into());
        }
        if self.working_hours_end > 24 || self.working_hours_start >= self.working_hours_end {
            return invalid(format!(
                "working hours must satisfy start < end <= 24, got {}..{}",
                self.working_hours_start, self.working_hours_end
            ));
        }
        if self.max_events_per_report < 1 || self.buffer_capacity < 1 {
            return invalid("max_events_per_report and buffer_capacity must be at least 1".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LLM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Rule-based report text, no network access.
    Summary,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub endpoint: String,
    pub timeout_secs: u64,
    /// Replace a failed LLM call with the rule-based report.
    pub fallback_to_summary: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Summary,
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_secs: 30,
            fallback_to_summary: true,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), DetectError> {
        if self.timeout_secs == 0 {
            return Err(DetectError::InvalidConfig("llm.timeout_secs must be positive".into()));
        }
        if self.provider == LlmProvider::Gemini && self.model.trim().is_empty() {
            return Err(DetectError::InvalidConfig("llm.model must be set for gemini".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
