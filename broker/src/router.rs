use std::future::ready;
use std::net::IpAddr;
use std::sync::Arc;

use audit::{Actor, AuditAction, AuditEvent, AuditRecorder, AuditResult};
use axum::extract::{Path, Query, State as AxumState};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_client_ip::InsecureClientIp;
use health::HealthRegistry;
use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::allowlist::{Allowlist, Operation};
use crate::api::{BrokerError, LifecycleResponse};
use crate::auth::verify_bearer;
use crate::cache::InspectCache;
use crate::prometheus::{
    report_inspect_cache, report_rejection, report_runtime_call, setup_metrics_recorder,
};
use crate::runtime::ContainerRuntime;

#[derive(Clone)]
pub struct State {
    pub token: String,
    pub allowlist: Arc<Allowlist>,
    pub runtime: Arc<dyn ContainerRuntime + Send + Sync>,
    pub cache: Arc<InspectCache>,
    pub audit: AuditRecorder,
}

async fn index() -> &'static str {
    "lifecycle-broker"
}

pub fn router(
    token: String,
    allowlist: Allowlist,
    runtime: Arc<dyn ContainerRuntime + Send + Sync>,
    cache: InspectCache,
    audit: AuditRecorder,
    liveness: HealthRegistry,
    metrics: bool,
) -> Router {
    let state = State {
        token,
        allowlist: Arc::new(allowlist),
        runtime,
        cache: Arc::new(cache),
        audit,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/containers/:name/start", post(start))
        .route("/containers/:name/stop", post(stop))
        .route("/containers/json", get(inspect))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

/// Token first, allowlist second; both rejections are audited with the
/// rejected name and caller identity and never reach the runtime.
fn authorize(
    state: &State,
    headers: &HeaderMap,
    ip: IpAddr,
    name: &str,
    op: Operation,
) -> Result<(), BrokerError> {
    let actor = Actor::Operator {
        identity: ip.to_string(),
    };

    if let Err(err) = verify_bearer(headers, &state.token) {
        report_rejection("authentication");
        state.audit.record(
            AuditEvent::draft(actor, AuditAction::AuthReject, name, AuditResult::Rejected)
                .with_reason(err.to_string()),
        );
        return Err(err);
    }

    if !state.allowlist.permits(name, op) {
        report_rejection("allowlist");
        warn!(container = name, %op, "rejected non-allowlisted request");
        state.audit.record(
            AuditEvent::draft(
                actor,
                AuditAction::AllowlistReject,
                name,
                AuditResult::Rejected,
            )
            .with_reason(format!("operation {op} not allowlisted")),
        );
        return Err(BrokerError::AllowlistViolation {
            name: name.to_string(),
            op,
        });
    }

    Ok(())
}

async fn start(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<LifecycleResponse>, BrokerError> {
    authorize(&state, &headers, ip, &name, Operation::Start)?;
    lifecycle_call(&state, ip, name, Operation::Start).await
}

async fn stop(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<LifecycleResponse>, BrokerError> {
    authorize(&state, &headers, ip, &name, Operation::Stop)?;
    lifecycle_call(&state, ip, name, Operation::Stop).await
}

async fn lifecycle_call(
    state: &State,
    ip: IpAddr,
    name: String,
    op: Operation,
) -> Result<Json<LifecycleResponse>, BrokerError> {
    let (result, op_tag, action) = match op {
        Operation::Start => (
            state.runtime.start(&name).await,
            "start",
            AuditAction::ContainerStart,
        ),
        Operation::Stop => (
            state.runtime.stop(&name).await,
            "stop",
            AuditAction::ContainerStop,
        ),
        Operation::Inspect => unreachable!("inspect goes through the cache path"),
    };

    let actor = Actor::Operator {
        identity: ip.to_string(),
    };
    match result {
        Ok(()) => {
            report_runtime_call(op_tag, "ok");
            state
                .audit
                .record(AuditEvent::draft(actor, action, &name, AuditResult::Ok));
            Ok(Json(LifecycleResponse {
                container: name,
                op,
            }))
        }
        Err(err) => {
            report_runtime_call(op_tag, "error");
            state.audit.record(
                AuditEvent::draft(actor, action, &name, AuditResult::Failed)
                    .with_reason(err.to_string()),
            );
            Err(BrokerError::RuntimeCall(err))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct InspectQuery {
    pub name: Option<String>,
}

async fn inspect(
    AxumState(state): AxumState<State>,
    InsecureClientIp(ip): InsecureClientIp,
    headers: HeaderMap,
    Query(query): Query<InspectQuery>,
) -> Result<Json<Value>, BrokerError> {
    match query.name.as_deref() {
        Some(name) => authorize(&state, &headers, ip, name, Operation::Inspect)?,
        None => {
            // An unfiltered list is narrowed to allowlisted names below, so
            // only the token gets checked here.
            if let Err(err) = verify_bearer(&headers, &state.token) {
                report_rejection("authentication");
                state.audit.record(
                    AuditEvent::draft(
                        Actor::Operator {
                            identity: ip.to_string(),
                        },
                        AuditAction::AuthReject,
                        "*",
                        AuditResult::Rejected,
                    )
                    .with_reason(err.to_string()),
                );
                return Err(err);
            }
        }
    }

    let key = query.name.clone().unwrap_or_else(|| "*".to_string());
    let now = OffsetDateTime::now_utc();
    if let Some(cached) = state.cache.get(&key, now) {
        report_inspect_cache("hit");
        return Ok(Json(cached));
    }
    report_inspect_cache("miss");

    let payload = state.runtime.list(query.name.as_deref()).await?;
    report_runtime_call("inspect", "ok");
    let visible = match query.name {
        Some(_) => payload,
        None => narrow_to_allowlisted(payload, &state.allowlist),
    };
    state.cache.insert(key, visible.clone(), now);
    Ok(Json(visible))
}

/// Containers the allowlist does not permit `inspect` on are invisible in
/// unfiltered listings.
fn narrow_to_allowlisted(payload: Value, allowlist: &Allowlist) -> Value {
    match payload {
        Value::Array(containers) => Value::Array(
            containers
                .into_iter()
                .filter(|container| {
                    container_names(container)
                        .iter()
                        .any(|name| allowlist.permits(name, Operation::Inspect))
                })
                .collect(),
        ),
        other => other,
    }
}

fn container_names(container: &Value) -> Vec<String> {
    container
        .get("Names")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(|name| name.trim_start_matches('/').to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::allowlist::Allowlist;

    use super::narrow_to_allowlisted;

    #[test]
    fn unfiltered_listing_hides_non_allowlisted_names() {
        let allowlist: Allowlist = "web[0-9]+:inspect".parse().unwrap();
        let payload = json!([
            {"Id": "a", "Names": ["/web1"]},
            {"Id": "b", "Names": ["/etcd-prod"]},
            {"Id": "c", "Names": ["/web2"]},
        ]);

        let narrowed = narrow_to_allowlisted(payload, &allowlist);
        let names: Vec<&str> = narrowed
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["Names"][0].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["/web1", "/web2"]);
    }
}
