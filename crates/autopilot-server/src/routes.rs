use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use autopilot_core::{pipeline::dedup_key, sentry::parse_webhook};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::signature::{self, SENTRY_SIGNATURE_HEADER};
use crate::AppState;

// ── Error helper ──────────────────────────────────────────────────────────

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

pub(crate) fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Ingestion
        .route("/sentry-webhook", post(sentry_webhook))
        .route("/gh-webhook", post(github_webhook))
        // Health
        .route("/health", get(health))
        // Run ledger
        .route("/api/runs", get(list_runs))
        .route("/api/runs/:id", get(get_run))
        .route("/api/runs/:id/log", get(get_run_log))
        // SSE logs
        .route("/api/logs", get(sse_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Webhooks ──────────────────────────────────────────────────────────────

pub(crate) async fn sentry_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if state.webhook_secret.is_empty() {
        tracing::error!("sentry webhook received but SENTRY_WEBHOOK_SECRET is not set");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let sig = headers
        .get(SENTRY_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signature::verify(state.webhook_secret.as_bytes(), &body, sig) {
        warn!("rejecting sentry webhook with invalid signature");
        return Err(StatusCode::FORBIDDEN);
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!("sentry webhook body is not JSON: {e}");
        StatusCode::BAD_REQUEST
    })?;

    let Some(defect) = parse_webhook(&payload).into_defect() else {
        return Ok(Json(json!({
            "status": "ignored",
            "reason": "Could not parse Sentry payload",
        })));
    };

    info!(
        defect_id = %defect.id,
        culprit = %defect.culprit,
        level = defect.level.as_str(),
        "received sentry alert: {}",
        defect.title
    );

    let title = defect.title.clone();
    match state.pipeline.dispatch(dedup_key(&defect), defect) {
        Some(_) => Ok(Json(json!({
            "status": "accepted",
            "error_title": title,
            "message": "Pipeline started",
        }))),
        None => Ok(Json(json!({
            "status": "duplicate",
            "error_title": title,
            "message": "Pipeline already running for this error",
        }))),
    }
}

pub(crate) async fn github_webhook(
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    serde_json::from_slice::<Value>(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
    info!(event = %event, "received github webhook");
    Ok(Json(json!({ "status": "acknowledged", "event": event })))
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "autopilot",
        "repo_path": state.repo_path,
        "active_runs": state.pipeline.dedup().active_count(),
    }))
}

// ── Runs ──────────────────────────────────────────────────────────────────

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let runs = state.pipeline.ledger().list().await.map_err(internal)?;
    Ok(Json(json!(runs)))
}

pub(crate) async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.pipeline.ledger().load(&id).await {
        Ok(Some(record)) => Ok(Json(json!(record))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(run_id = %id, "load run failed: {e:#}");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

pub(crate) async fn get_run_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<String, StatusCode> {
    match state.pipeline.ledger().read_log(&id).await {
        Ok(Some(log)) => Ok(log),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(run_id = %id, "read run log failed: {e:#}");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

// ── SSE logs ──────────────────────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting the ring so nothing falls in between
    let live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        let mut live_rx = live_rx;
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
