use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;
use uuid::Uuid;

use crate::errors::{EngineError, ErrorKind};
use crate::events::CloudEvent;
use crate::events::io::ErrorData;
use crate::metrics_registry::StdMetricsRecorder;
use crate::orchestrator::{CommandReply, Orchestrator, ReplyOutcome, http_status_for};

/// Shared state behind both listeners.
pub struct IngressState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<StdMetricsRecorder>,
}

/// The single CloudEvent endpoint. Health/readiness/metrics live on the ops
/// router, bound to a separate port.
pub fn event_router(state: Arc<IngressState>) -> Router {
    Router::new().route("/", post(handle_event)).with_state(state)
}

pub fn ops_router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Deserialize)]
struct EventQuery {
    #[serde(default)]
    sync: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReply {
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
    error: ErrorData,
}

async fn handle_event(
    State(state): State<Arc<IngressState>>,
    Query(query): Query<EventQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut event = match decode_event(&headers, &body) {
        Ok(event) => event,
        Err(reason) => {
            let err = EngineError::new_from_safe(ErrorKind::Validation, reason);
            return error_response(&err, None);
        }
    };

    if event.correlationid.is_none() {
        event.correlationid = Some(Uuid::new_v4());
    }
    let correlation_id = event.correlationid;

    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let traceparent = header_value("traceparent");
    let tracestate = header_value("tracestate");

    let span = info_span!(
        "cloudevent",
        event_type = %event.event_type,
        event_id = %event.id,
        correlation_id = %correlation_id.unwrap_or_default(),
        traceparent = %traceparent,
        tracestate = %tracestate,
    );

    let orchestrator = state.orchestrator.clone();
    let outcome = async move { orchestrator.handle(event, query.sync).await }
        .instrument(span)
        .await;

    match outcome {
        Ok(reply) => reply_response(reply),
        Err(err) => error_response(&err, correlation_id),
    }
}

/// Accepts a CloudEvent in structured JSON mode (`application/cloudevents+json`
/// or plain JSON) or binary mode (`ce-*` headers plus a data body).
fn decode_event(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, String> {
    if headers.contains_key("ce-specversion") {
        return decode_binary(headers, body);
    }

    serde_json::from_slice::<CloudEvent>(body).map_err(|err| format!("malformed CloudEvent envelope: {err}"))
}

fn decode_binary(headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, String> {
    let attr = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let required = |name: &str| attr(name).ok_or_else(|| format!("missing required attribute header `{name}`"));

    let time: DateTime<Utc> = required("ce-time")?
        .parse()
        .map_err(|err| format!("invalid ce-time: {err}"))?;

    let data = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(body).map_err(|err| format!("binary-mode data must be JSON: {err}"))?
    };

    Ok(CloudEvent {
        specversion: required("ce-specversion")?,
        id: required("ce-id")?,
        source: required("ce-source")?,
        event_type: required("ce-type")?,
        subject: attr("ce-subject"),
        time,
        datacontenttype: attr("content-type"),
        dataschema: attr("ce-dataschema"),
        data,
        idempotencykey: attr("ce-idempotencykey"),
        correlationid: attr("ce-correlationid").and_then(|raw| Uuid::parse_str(&raw).ok()),
        causationid: attr("ce-causationid"),
    })
}

fn reply_response(reply: CommandReply) -> Response {
    let status = match reply.outcome {
        ReplyOutcome::Accepted => StatusCode::ACCEPTED,
        ReplyOutcome::Completed => StatusCode::OK,
    };
    (status, axum::Json(reply)).into_response()
}

fn error_response(err: &EngineError, correlation_id: Option<Uuid>) -> Response {
    let status = StatusCode::from_u16(http_status_for(err)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorReply {
        outcome: "rejected",
        correlation_id,
        error: ErrorData::from(err),
    };

    let mut response = (status, axum::Json(body)).into_response();
    if matches!(err.kind(), ErrorKind::Transient | ErrorKind::ResourceExhausted) {
        if let Ok(value) = header::HeaderValue::from_str("1") {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<IngressState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode_text(),
    )
        .into_response()
}
