// HTTP route handlers for the Arbiter API

use arbiter_common::types::SubmissionRequest;
use arbiter_engine::EngineError;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn engine_error_response(e: EngineError) -> Response {
    let (status, reason) = match &e {
        EngineError::UnknownLanguage(_) => (StatusCode::BAD_REQUEST, "unknown_language"),
        EngineError::InvalidSubmission(_) => (StatusCode::BAD_REQUEST, "invalid_submission"),
        EngineError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    if e.is_caller_error() {
        warn!(error = %e, "Submission rejected");
    } else {
        error!(error = %e, "Submission failed");
    }
    metrics::record_rejection(reason);
    error_response(status, e.to_string())
}

/// Malformed or incomplete JSON is a 400; an oversized body stays a 413.
fn rejection_response(rejection: JsonRejection) -> Response {
    let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        metrics::record_rejection("too_large");
        StatusCode::PAYLOAD_TOO_LARGE
    } else {
        metrics::record_rejection("invalid_payload");
        StatusCode::BAD_REQUEST
    };
    warn!(status = %status, error = %rejection.body_text(), "Request body rejected");
    error_response(status, rejection.body_text())
}

/// POST /execute - Run a submission and wait for its result
///
/// The submission is cancelled and cleaned up if the client goes away
/// before the result is ready.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmissionRequest>, JsonRejection>,
) -> Response {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return rejection_response(rejection),
    };
    let submission = match payload.into_submission() {
        Ok(submission) => submission,
        Err(e) => {
            warn!(error = %e, "Invalid payload");
            metrics::record_rejection("invalid_payload");
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    };

    let ticket = match state.orchestrator.submit(submission) {
        Ok(ticket) => ticket,
        Err(e) => return engine_error_response(e),
    };
    let submission_id = ticket.id();
    let _cancel_on_disconnect = ticket.cancel_on_drop();

    match ticket.wait().await {
        Ok(result) => {
            info!(
                submission_id = %submission_id,
                language = %result.language,
                verdict = %result.verdict,
                elapsed_ms = result.elapsed_ms,
                "Execution completed"
            );
            metrics::record_result(&result);
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

/// GET /languages - Registered language ids
pub async fn languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let languages = state.orchestrator.registry().list();
    (StatusCode::OK, Json(serde_json::json!({ "languages": languages })))
}

/// GET /status - Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "in_flight": orchestrator.in_flight(),
            "available_slots": orchestrator.available_slots(),
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        })),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> Response {
    metrics::IN_FLIGHT.set(state.orchestrator.in_flight() as i64);
    match metrics::render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
