use std::convert::Infallible;
use std::future::ready;
use std::sync::Arc;

use audit::{
    Actor, AuditAction, AuditEvent, AuditRecorder, AuditResult, ReportGate, ViolationReport,
};
use axum::body::Bytes;
use axum::extract::{Path, Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_client_ip::InsecureClientIp;
use futures::Stream;
use health::HealthRegistry;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;

use crate::api::{RotateResponse, RotorError};
use crate::controller::{RotationController, StatusSnapshot};
use crate::prometheus::setup_metrics_recorder;

#[derive(Clone)]
pub struct State {
    pub controller: RotationController,
    pub audit: AuditRecorder,
    pub reports: Arc<ReportGate>,
}

async fn index() -> &'static str {
    "rotor"
}

pub fn router(
    controller: RotationController,
    audit: AuditRecorder,
    reports: Arc<ReportGate>,
    liveness: HealthRegistry,
    metrics: bool,
) -> Router {
    let state = State {
        controller,
        audit,
        reports,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/rotate", post(rotate))
        .route("/containers/:name/stop", post(stop))
        .route("/status", get(status))
        .route("/audit", get(audit_recent))
        .route("/events", get(events))
        .route("/reports", post(submit_report))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

async fn rotate(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
) -> Result<Json<RotateResponse>, RotorError> {
    let cycle_id = state.controller.trigger_manual(Actor::Operator {
        identity: ip.to_string(),
    })?;
    Ok(Json(RotateResponse { cycle_id }))
}

async fn stop(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
    Path(name): Path<String>,
) -> Result<StatusCode, RotorError> {
    state
        .controller
        .manual_stop(
            Actor::Operator {
                identity: ip.to_string(),
            },
            &name,
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn status(AxumState(state): AxumState<State>) -> Json<StatusSnapshot> {
    Json(state.controller.status())
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn audit_recent(
    AxumState(state): AxumState<State>,
    Query(query): Query<AuditQuery>,
) -> Json<Vec<AuditEvent>> {
    Json(state.audit.recent(query.limit.unwrap_or(50)))
}

/// Live audit feed as server-sent events. A subscriber that falls behind
/// misses events instead of slowing recording down; `/audit` is the
/// catch-up path.
async fn events(
    AxumState(state): AxumState<State>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.audit.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    return Some((Ok(SseEvent::default().event("audit").data(payload)), rx));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Violation/anomaly submissions from the protected workload. Size and
/// rate caps are enforced before the body is even parsed.
async fn submit_report(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
    body: Bytes,
) -> Result<StatusCode, RotorError> {
    let source = ip.to_string();
    state.reports.admit(&source, body.len())?;

    let report: ViolationReport =
        serde_json::from_slice(&body).map_err(|e| RotorError::ReportInvalid(e.to_string()))?;

    state.audit.record(
        AuditEvent::draft(
            Actor::Operator { identity: source },
            AuditAction::ViolationReport,
            report.category,
            AuditResult::Ok,
        )
        .with_reason(report.detail),
    );
    Ok(StatusCode::ACCEPTED)
}
