//! End-to-end behaviour through the public API: detection, report
//! triggering with cooldowns, and reset.

use anomalyguard::config::{AppConfig, DetectionConfig, ReportingConfig};
use anomalyguard::detect::{AnomalyEngine, DetectionStatus, Reading, Severity};
use anomalyguard::monitor::{Monitor, ReportNotice};
use anomalyguard::report::{OutboxDispatcher, Recipient, RecipientBook};
use anomalyguard::scheduler::{AnomalyEvent, AutoReportScheduler, SkipReason, TriggerDecision};
use anomalyguard::storage::{open_pool, AnomalyLog, ReportArchive};
use anomalyguard::Service;
use chrono::{DateTime, Duration, TimeZone, Utc};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 5, 10, 0, 0).unwrap()
}

fn anomaly(key: &str, severity: Severity, at: DateTime<Utc>) -> AnomalyEvent {
    AnomalyEvent {
        key: key.to_string(),
        value: 99.0,
        unit: None,
        z_score: 4.0,
        severity,
        timestamp: at,
    }
}

#[tokio::test]
async fn constant_history_then_spike() {
    let engine = AnomalyEngine::new(DetectionConfig {
        window_size: 100,
        z_score_threshold: 3.0,
        min_data_points: 10,
        min_training_size: 10,
        ..DetectionConfig::default()
    })
    .unwrap();

    for i in 0..20 {
        let r = engine
            .process_reading("temp", 50.0, None, t0() + Duration::seconds(i))
            .await
            .unwrap();
        assert!(!r.is_anomaly);
    }

    let same = engine.process_reading("temp", 50.0, None, t0()).await.unwrap();
    assert!(!same.is_anomaly);
    assert!(same.z_score.abs() < 1e-9);

    let spike = engine.process_reading("temp", 500.0, None, t0()).await.unwrap();
    assert!(spike.is_anomaly);
    assert!(spike.z_score > 1e6);
    assert_eq!(spike.severity, Severity::Critical);
}

#[tokio::test]
async fn batch_trigger_respects_cooldown() {
    let scheduler = AutoReportScheduler::new(ReportingConfig {
        min_anomalies_for_report: 3,
        anomaly_window_minutes: 5,
        cooldown_minutes: 15,
        multi_sensor_threshold: 5,
        ..ReportingConfig::default()
    })
    .unwrap();
    let at = |m: i64| t0() + Duration::minutes(m);

    let mut triggered = 0;
    for (i, key) in ["temp", "rpm", "flow"].iter().enumerate() {
        if scheduler.on_anomaly(anomaly(key, Severity::High, at(i as i64))).await.is_triggered() {
            triggered += 1;
        }
    }
    assert_eq!(triggered, 1);

    // a 4th anomaly a minute later does not trigger
    let fourth = scheduler.on_anomaly(anomaly("temp", Severity::High, at(3))).await;
    assert!(!fourth.is_triggered());

    // a full cluster inside the cooldown is suppressed
    scheduler.on_anomaly(anomaly("rpm", Severity::High, at(4))).await;
    let suppressed = scheduler.on_anomaly(anomaly("flow", Severity::High, at(5))).await;
    assert!(matches!(suppressed, TriggerDecision::Skipped(SkipReason::Cooldown)));

    // 16 minutes after the first report the cooldown has expired
    scheduler.on_anomaly(anomaly("temp", Severity::High, at(18))).await;
    scheduler.on_anomaly(anomaly("rpm", Severity::High, at(18))).await;
    let again = scheduler.on_anomaly(anomaly("flow", Severity::High, at(18))).await;
    assert!(again.is_triggered());

    let status = scheduler.status().await;
    assert_eq!(status.state.reports_sent, 2);
    assert_eq!(status.state.reports_skipped_cooldown, 1);
    assert_eq!(status.state.total_anomalies_processed, 9);
}

#[tokio::test]
async fn critical_anomaly_reports_instantly() {
    let scheduler = AutoReportScheduler::new(ReportingConfig {
        instant_report_on_critical: true,
        critical_cooldown_minutes: 5,
        min_anomalies_for_report: 50,
        ..ReportingConfig::default()
    })
    .unwrap();

    let first = scheduler.on_anomaly(anomaly("temp", Severity::Critical, t0())).await;
    assert!(first.is_triggered());

    let second = scheduler
        .on_anomaly(anomaly("temp", Severity::Critical, t0() + Duration::minutes(2)))
        .await;
    assert!(matches!(second, TriggerDecision::Skipped(SkipReason::CriticalCooldown)));

    let status = scheduler.status().await;
    assert_eq!(status.state.reports_sent, 1);
    assert_eq!(status.state.reports_skipped_cooldown, 1);
}

#[tokio::test]
async fn reset_starts_from_scratch() {
    let monitor = Monitor::new(
        DetectionConfig {
            min_data_points: 5,
            min_training_size: 5,
            ..DetectionConfig::default()
        },
        ReportingConfig::default(),
    )
    .unwrap();

    for i in 0..10 {
        monitor
            .process_reading(&Reading::new("temp", 20.0 + (i % 2) as f64))
            .await
            .unwrap();
    }
    monitor.process_reading(&Reading::new("temp", 400.0)).await.unwrap();

    monitor.reset().await;

    let overview = monitor.engine().overview().await;
    assert_eq!(overview.total_readings, 0);
    assert_eq!(overview.total_anomalies, 0);
    assert_eq!(overview.tracked_keys, 0);
    let status = monitor.scheduler().status().await;
    assert_eq!(status.state.total_anomalies_processed, 0);
    assert_eq!(status.buffer_size, 0);

    let first = monitor.process_reading(&Reading::new("temp", 400.0)).await.unwrap();
    assert_eq!(first.result.status, DetectionStatus::InsufficientData);
    assert!(!first.result.is_anomaly);
    assert!(first.report.is_none());
}

#[tokio::test]
async fn triggered_report_lands_in_archive_and_outbox() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.storage.db_path = dir.path().join("guard.db");
    config.detection.min_data_points = 5;
    config.detection.min_training_size = 5;
    let pool = open_pool(&config.storage.db_path).unwrap();
    RecipientBook::new(pool.clone())
        .add(&Recipient::new("ops@example.com", "Ops"))
        .unwrap();

    let service = Service::assemble(&config, pool.clone()).unwrap();
    for i in 0..10 {
        let r = Reading::new("temp", 20.0 + (i % 3) as f64 * 0.2).at(t0() + Duration::seconds(i));
        service.monitor.process_reading(&r).await.unwrap();
    }
    let out = service
        .monitor
        .process_reading(&Reading::new("temp", 900.0).at(t0() + Duration::minutes(1)))
        .await
        .unwrap();
    assert!(matches!(out.report, Some(ReportNotice::Triggered { queued: true, .. })));
    service.shutdown().await.unwrap();

    let anomalies = AnomalyLog::new(pool.clone()).list_recent(10, Some("temp")).unwrap();
    assert_eq!(anomalies.len(), 1);

    let reports = ReportArchive::new(pool.clone()).list_recent(10).unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].content.generator, "summary");

    let pending = OutboxDispatcher::new(pool).pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].recipient, "ops@example.com");
}
