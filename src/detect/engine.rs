//! Per-key window bookkeeping around the classifier.
//!
//! The window map lives behind a `tokio::sync::RwLock`; each window has its
//! own `Mutex` so readings for different keys proceed in parallel while
//! readings for the same key are serialized (classify then append).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{DetectionConfig, DetectionConfigUpdate};
use crate::detect::classifier::classify;
use crate::detect::window::StatisticsWindow;
use crate::detect::{DetectError, DetectionResult};

/// Mutable state for one key.
struct KeyState {
    window: StatisticsWindow,
    anomalies: u64,
    last_seen: Option<DateTime<Utc>>,
    unit: Option<String>,
}

impl KeyState {
    fn new(capacity: usize) -> Self {
        Self {
            window: StatisticsWindow::new(capacity),
            anomalies: 0,
            last_seen: None,
            unit: None,
        }
    }
}

/// Statistics for one key, as returned by [`AnomalyEngine::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyStats {
    pub key: String,
    pub count: usize,
    pub window_size: usize,
    pub mean: Option<f64>,
    pub std_dev: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest: Option<f64>,
    pub unit: Option<String>,
    pub total_seen: u64,
    pub anomalies: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub threshold: f64,
}

/// Engine-wide counters and configuration.
#[derive(Debug, Clone, Serialize)]
pub struct EngineOverview {
    pub total_readings: u64,
    pub total_anomalies: u64,
    pub tracked_keys: usize,
    pub config: DetectionConfig,
}

/// Result of a successful config swap.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigUpdate {
    pub config: DetectionConfig,
    pub warnings: Vec<String>,
}

pub struct AnomalyEngine {
    config: RwLock<DetectionConfig>,
    windows: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
    total_readings: AtomicU64,
    total_anomalies: AtomicU64,
}

impl AnomalyEngine {
    /// Create an engine. The config must already be valid.
    pub fn new(config: DetectionConfig) -> Result<Self, DetectError> {
        for warning in config.validate()? {
            warn!(%warning, "detection config accepted with warning");
        }
        info!(
            window_size = config.window_size,
            threshold = config.z_score_threshold,
            min_data_points = config.min_data_points,
            min_training_size = config.min_training_size,
            "anomaly engine initialised"
        );
        Ok(Self {
            config: RwLock::new(config),
            windows: RwLock::new(HashMap::new()),
            total_readings: AtomicU64::new(0),
            total_anomalies: AtomicU64::new(0),
        })
    }

    /// Classify a reading against its key's history, then add it to the
    /// history. Invalid input is rejected without touching any state.
    pub async fn process_reading(
        &self,
        key: &str,
        value: f64,
        unit: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<DetectionResult, DetectError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(DetectError::EmptyKey);
        }
        if !value.is_finite() {
            return Err(DetectError::NonFiniteValue {
                key: key.to_string(),
                value,
            });
        }

        // Held for the whole classify+append so a config swap cannot land
        // between the two.
        let config = self.config.read().await;
        let slot = self.slot(key, config.window_size).await;
        let mut state = slot.lock().await;

        let result = classify(key, &state.window, value, unit, timestamp, &config);
        state.window.append(value)?;
        state.last_seen = Some(timestamp);
        if let Some(unit) = unit {
            state.unit = Some(unit.to_string());
        }
        if result.is_anomaly {
            state.anomalies += 1;
            self.total_anomalies.fetch_add(1, Ordering::Relaxed);
        }
        self.total_readings.fetch_add(1, Ordering::Relaxed);

        if result.is_anomaly {
            warn!(
                key,
                value,
                z_score = result.z_score,
                severity = %result.severity,
                threshold = config.z_score_threshold,
                "anomaly detected"
            );
        } else {
            debug!(
                key,
                value,
                z_score = result.z_score,
                severity = %result.severity,
                status = ?result.status,
                "reading classified"
            );
        }
        Ok(result)
    }

    async fn slot(&self, key: &str, capacity: usize) -> Arc<Mutex<KeyState>> {
        if let Some(slot) = self.windows.read().await.get(key) {
            return slot.clone();
        }
        let mut windows = self.windows.write().await;
        windows
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, capacity, "tracking new key");
                Arc::new(Mutex::new(KeyState::new(capacity)))
            })
            .clone()
    }

    /// Current statistics for `key`, or `None` if the key is unknown.
    pub async fn get_stats(&self, key: &str) -> Option<KeyStats> {
        let slot = self.windows.read().await.get(key).cloned()?;
        let threshold = self.config.read().await.z_score_threshold;
        let state = slot.lock().await;
        let summary = state.window.summary();
        Some(KeyStats {
            key: key.to_string(),
            count: summary.count,
            window_size: summary.capacity,
            mean: summary.mean,
            std_dev: summary.std_dev,
            min: summary.min,
            max: summary.max,
            latest: summary.latest,
            unit: state.unit.clone(),
            total_seen: summary.total_seen,
            anomalies: state.anomalies,
            last_seen: state.last_seen,
            threshold,
        })
    }

    pub async fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.windows.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn overview(&self) -> EngineOverview {
        // config before windows, same order as process_reading and update_config
        let config = self.config.read().await.clone();
        let tracked_keys = self.windows.read().await.len();
        EngineOverview {
            total_readings: self.total_readings.load(Ordering::Relaxed),
            total_anomalies: self.total_anomalies.load(Ordering::Relaxed),
            tracked_keys,
            config,
        }
    }

    pub async fn config(&self) -> DetectionConfig {
        self.config.read().await.clone()
    }

    /// Validate and swap the configuration. Existing windows keep their
    /// data; only their bound changes (shrinking trims the oldest values).
    pub async fn update_config(&self, new: DetectionConfig) -> Result<ConfigUpdate, DetectError> {
        let warnings = new.validate()?;

        let mut config = self.config.write().await;
        if config.window_size != new.window_size {
            let windows = self.windows.read().await;
            for slot in windows.values() {
                slot.lock().await.window.set_capacity(new.window_size);
            }
        }
        *config = new.clone();

        for warning in &warnings {
            warn!(%warning, "detection config accepted with warning");
        }
        info!(
            window_size = new.window_size,
            threshold = new.z_score_threshold,
            min_data_points = new.min_data_points,
            min_training_size = new.min_training_size,
            "detection config updated"
        );
        Ok(ConfigUpdate {
            config: new,
            warnings,
        })
    }

    /// Merge a partial update over the current config and apply it.
    pub async fn apply_update(&self, update: &DetectionConfigUpdate) -> Result<ConfigUpdate, DetectError> {
        let merged = self.config.read().await.merged(update);
        self.update_config(merged).await
    }

    /// Forget every key and zero the counters.
    pub async fn reset(&self) {
        let _config = self.config.read().await;
        let mut windows = self.windows.write().await;
        let keys = windows.len();
        windows.clear();
        self.total_readings.store(0, Ordering::Relaxed);
        self.total_anomalies.store(0, Ordering::Relaxed);
        info!(keys, "anomaly engine reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{DetectionStatus, Severity};

    fn engine(window: usize, threshold: f64, min_points: usize) -> AnomalyEngine {
        AnomalyEngine::new(DetectionConfig {
            window_size: window,
            z_score_threshold: threshold,
            min_data_points: min_points,
            min_training_size: min_points,
            ..DetectionConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_constant_stream_then_spike() {
        let engine = engine(100, 3.0, 10);
        let now = Utc::now();
        for _ in 0..20 {
            engine.process_reading("temp", 50.0, Some("C"), now).await.unwrap();
        }
        let steady = engine.process_reading("temp", 50.0, Some("C"), now).await.unwrap();
        assert!(!steady.is_anomaly);
        assert_eq!(steady.z_score, 0.0);

        let spike = engine.process_reading("temp", 500.0, Some("C"), now).await.unwrap();
        assert!(spike.is_anomaly);
        assert!(spike.z_score > 3.0);
        assert_eq!(spike.severity, Severity::Critical);

        let overview = engine.overview().await;
        assert_eq!(overview.total_readings, 22);
        assert_eq!(overview.total_anomalies, 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_input_without_state_change() {
        let engine = engine(10, 3.0, 2);
        let now = Utc::now();
        assert_eq!(
            engine.process_reading("  ", 1.0, None, now).await,
            Err(DetectError::EmptyKey)
        );
        assert!(matches!(
            engine.process_reading("k", f64::NAN, None, now).await,
            Err(DetectError::NonFiniteValue { .. })
        ));
        assert!(engine.get_stats("k").await.is_none());
        assert_eq!(engine.overview().await.total_readings, 0);
    }

    #[tokio::test]
    async fn test_get_stats_is_idempotent() {
        let engine = engine(10, 3.0, 2);
        let now = Utc::now();
        for v in [1.0, 2.0, 3.0] {
            engine.process_reading("k", v, None, now).await.unwrap();
        }
        let a = engine.get_stats("k").await.unwrap();
        let b = engine.get_stats("k").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.count, 3);
        assert_eq!(a.mean, Some(2.0));
        assert_eq!(a.min, Some(1.0));
        assert_eq!(a.max, Some(3.0));
        assert!(engine.get_stats("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let engine = engine(10, 3.0, 2);
        let now = Utc::now();
        engine.process_reading("a", 1.0, None, now).await.unwrap();
        engine.process_reading("b", 1.0, None, now).await.unwrap();
        engine.process_reading("b", 1.0, None, now).await.unwrap();
        assert_eq!(engine.get_stats("a").await.unwrap().count, 1);
        assert_eq!(engine.get_stats("b").await.unwrap().count, 2);
        assert_eq!(engine.tracked_keys().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_window_shrink_keeps_newest() {
        let engine = engine(10, 3.0, 2);
        let now = Utc::now();
        for v in 1..=10 {
            engine.process_reading("k", v as f64, None, now).await.unwrap();
        }
        let cfg = DetectionConfig {
            window_size: 4,
            min_data_points: 2,
            min_training_size: 2,
            ..engine.config().await
        };
        let update = engine.update_config(cfg).await.unwrap();
        assert!(update.warnings.is_empty());

        let stats = engine.get_stats("k").await.unwrap();
        assert_eq!(stats.count, 4);
        assert_eq!(stats.min, Some(7.0));
        assert_eq!(stats.max, Some(10.0));
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_config_untouched() {
        let engine = engine(10, 3.0, 2);
        let before = engine.config().await;
        let res = engine
            .apply_update(&DetectionConfigUpdate {
                z_score_threshold: Some(-1.0),
                ..Default::default()
            })
            .await;
        assert!(matches!(res, Err(DetectError::InvalidConfig(_))));
        assert_eq!(engine.config().await, before);
    }

    #[tokio::test]
    async fn test_conflicting_update_is_flagged() {
        let engine = engine(10, 3.0, 2);
        let update = engine
            .apply_update(&DetectionConfigUpdate {
                min_training_size: Some(50),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(update.warnings.len(), 1);
        assert_eq!(engine.config().await.min_training_size, 50);
    }

    #[tokio::test]
    async fn test_reset_returns_to_insufficient_data() {
        let engine = engine(10, 3.0, 3);
        let now = Utc::now();
        for v in [1.0, 2.0, 3.0, 4.0] {
            engine.process_reading("k", v, None, now).await.unwrap();
        }
        engine.reset().await;
        assert_eq!(engine.overview().await.total_readings, 0);
        assert_eq!(engine.overview().await.tracked_keys, 0);

        let r = engine.process_reading("k", 100.0, None, now).await.unwrap();
        assert_eq!(r.status, DetectionStatus::InsufficientData);
        assert!(!r.is_anomaly);
    }

    #[tokio::test]
    async fn test_concurrent_readings_same_key() {
        let engine = Arc::new(engine(1000, 3.0, 5));
        let now = Utc::now();
        let mut handles = Vec::new();
        for i in 0..8 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    let v = ((i * 50 + j) % 7) as f64;
                    engine.process_reading("shared", v, None, now).await.unwrap();
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let stats = engine.get_stats("shared").await.unwrap();
        assert_eq!(stats.count, 400);
        assert_eq!(stats.total_seen, 400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overview_and_updates_alongside_new_keys() {
        let engine = Arc::new(engine(50, 3.0, 5));
        let now = Utc::now();
        let mut handles = Vec::new();
        for i in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..200 {
                    let key = format!("k-{}-{}", i, j);
                    engine.process_reading(&key, j as f64, None, now).await.unwrap();
                }
            }));
        }
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    engine.overview().await;
                }
            }));
        }
        for i in 0..2 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..100 {
                    let cfg = DetectionConfig {
                        window_size: 40 + (i * 100 + j) % 20,
                        min_data_points: 5,
                        min_training_size: 5,
                        ..DetectionConfig::default()
                    };
                    engine.update_config(cfg).await.unwrap();
                }
            }));
        }

        let all = async {
            for h in handles {
                h.await.unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(30), all)
            .await
            .expect("engine stalled");
        let overview = engine.overview().await;
        assert_eq!(overview.total_readings, 800);
        assert_eq!(overview.tracked_keys, 800);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_anomaly_is_logged_at_warn() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let engine = engine(100, 3.0, 5);
                let now = Utc::now();
                for v in [10.0, 11.0, 9.0, 10.0, 10.0, 11.0] {
                    engine.process_reading("temp", v, None, now).await.unwrap();
                }
                let spike = engine.process_reading("temp", 500.0, None, now).await.unwrap();
                assert!(spike.is_anomaly);
            });
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert_eq!(logs.matches("anomaly detected").count(), 1);
        assert!(logs.contains("WARN"));
        assert!(logs.contains("key=\"temp\"") || logs.contains("key=temp"));
    }
}
