//! API route definitions.

use axum::{
    extract::{Path, Query, State},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::config::DetectionConfigUpdate;
use crate::detect::Reading;
use crate::report::Recipient;

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/readings", post(submit_reading))
        .route("/stats", get(stats_overview))
        .route("/stats/{key}", get(key_stats))
        .route("/config", get(get_config).put(update_config))
        .route("/reset", post(reset))
        .route("/auto-report/status", get(auto_report_status))
        .route("/auto-report/toggle", post(auto_report_toggle))
        .route("/auto-report/config", put(auto_report_config))
        .route("/anomalies", get(list_anomalies))
        .route("/reports", get(list_reports))
        .route("/recipients", get(list_recipients).post(add_recipient))
        .route("/recipients/{email}", delete(remove_recipient))
}

fn envelope(data: impl Serialize, meta: Value) -> ApiResult {
    let data = serde_json::to_value(data).map_err(|e| ApiError::internal(e.to_string()))?;
    let mut meta = meta;
    if let Value::Object(map) = &mut meta {
        map.insert("timestamp".into(), json!(chrono::Utc::now().to_rfc3339()));
        map.insert("version".into(), json!(env!("CARGO_PKG_VERSION")));
    }
    Ok(Json(json!({ "data": data, "meta": meta })))
}

/// Run a blocking storage call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .map_err(ApiError::from)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    key: Option<String>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(50).clamp(1, 1000)
    }
}

async fn health(State(state): State<AppState>) -> ApiResult {
    let overview = state.monitor.engine().overview().await;
    let enabled = state.monitor.scheduler().config().await.enabled;
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "tracked_keys": overview.tracked_keys,
            "auto_report_enabled": enabled,
            "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        }),
        json!({}),
    )
}

async fn submit_reading(State(state): State<AppState>, Json(reading): Json<Reading>) -> ApiResult {
    let outcome = state.monitor.process_reading(&reading).await?;
    envelope(outcome, json!({}))
}

async fn stats_overview(State(state): State<AppState>) -> ApiResult {
    let engine = state.monitor.engine();
    let overview = engine.overview().await;
    let keys = engine.tracked_keys().await;
    envelope(json!({ "overview": overview, "keys": keys }), json!({ "total": keys.len() }))
}

async fn key_stats(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult {
    match state.monitor.engine().get_stats(&key).await {
        Some(stats) => envelope(stats, json!({})),
        None => Err(ApiError::not_found("key", &key)),
    }
}

async fn get_config(State(state): State<AppState>) -> ApiResult {
    envelope(state.monitor.engine().config().await, json!({}))
}

async fn update_config(
    State(state): State<AppState>,
    Json(update): Json<DetectionConfigUpdate>,
) -> ApiResult {
    let applied = state.monitor.engine().apply_update(&update).await?;
    envelope(applied, json!({}))
}

async fn reset(State(state): State<AppState>) -> ApiResult {
    state.monitor.reset().await;
    envelope(json!({ "reset": true }), json!({}))
}

async fn auto_report_status(State(state): State<AppState>) -> ApiResult {
    let scheduler = state.monitor.scheduler().status().await;
    let dispatch = state.monitor.dispatch_stats().await;
    envelope(json!({ "scheduler": scheduler, "dispatch": dispatch }), json!({}))
}

#[derive(Debug, Deserialize)]
struct ToggleBody {
    enabled: bool,
}

async fn auto_report_toggle(State(state): State<AppState>, Json(body): Json<ToggleBody>) -> ApiResult {
    state.monitor.scheduler().toggle(body.enabled).await;
    envelope(json!({ "enabled": body.enabled }), json!({}))
}

/// Fields present in the body replace the current values; the rest are kept.
async fn auto_report_config(State(state): State<AppState>, Json(patch): Json<Value>) -> ApiResult {
    let Value::Object(fields) = patch else {
        return Err(ApiError::bad_request("expected a JSON object"));
    };
    let config = state.monitor.scheduler().apply_patch(fields).await?;
    envelope(config, json!({}))
}

async fn list_anomalies(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    let limit = q.limit();
    let log = state.anomalies.clone();
    let key = q.key.clone();
    let rows = blocking(move || log.list_recent(limit, key.as_deref())).await?;
    let total = rows.len();
    envelope(rows, json!({ "total": total, "limit": limit }))
}

async fn list_reports(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult {
    let limit = q.limit();
    let archive = state.reports.clone();
    let rows = blocking(move || archive.list_recent(limit)).await?;
    let total = rows.len();
    envelope(rows, json!({ "total": total, "limit": limit }))
}

async fn list_recipients(State(state): State<AppState>) -> ApiResult {
    let book = state.recipients.clone();
    let rows = blocking(move || book.list()).await?;
    let total = rows.len();
    envelope(rows, json!({ "total": total }))
}

async fn add_recipient(State(state): State<AppState>, Json(recipient): Json<Recipient>) -> ApiResult {
    recipient
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let book = state.recipients.clone();
    let saved = recipient.clone();
    blocking(move || book.add(&saved)).await?;
    envelope(recipient, json!({}))
}

async fn remove_recipient(State(state): State<AppState>, Path(email): Path<String>) -> ApiResult {
    let book = state.recipients.clone();
    let target = email.clone();
    if blocking(move || book.remove(&target)).await? {
        envelope(json!({ "removed": email }), json!({}))
    } else {
        Err(ApiError::not_found("recipient", &email))
    }
}
