// HTTP route handlers for the Codepad API

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use codepad_common::{Language, RunRequest};
use codepad_engine::ExecError;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

/// GET / - Service banner
pub async fn root() -> impl IntoResponse {
    Json(json!({ "message": "Online Compiler" }))
}

/// POST /run - Compile and run a program, answering with its outcome
///
/// Blocks until the job reaches a terminal state. A client that hangs up
/// drops this future, which kills the job and disposes its directory.
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    // Bodies that never become a request still get the JSON error shape
    let payload = match payload {
        Ok(Json(payload)) => payload,
        Err(rejection) => {
            metrics::record_job_rejected("malformed_body");
            warn!(status = %rejection.status(), error = %rejection.body_text(), "Rejected job: unreadable body");
            return error_response(rejection.status(), &rejection.body_text());
        }
    };

    // Unknown tags share one label to keep metric cardinality bounded
    let language_label = Language::from_str(&payload.language)
        .map(|l| l.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    metrics::record_job_submitted(&language_label);

    if payload.code.trim().is_empty() {
        metrics::record_job_rejected("empty_code");
        warn!(language = %payload.language, "Rejected job: empty code");
        return error_response(StatusCode::BAD_REQUEST, "Code is required");
    }

    let start = Instant::now();
    match state
        .engine
        .execute(&payload.language, &payload.code, &payload.input)
        .await
    {
        Ok(outcome) => {
            metrics::record_job_completed(
                &outcome.language.to_string(),
                &outcome.status.to_string(),
                start.elapsed().as_millis() as f64,
            );
            info!(
                job_id = %outcome.job_id,
                language = %outcome.language,
                status = %outcome.status,
                "Job finished"
            );
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => {
            let status = status_for(&e);
            metrics::record_job_rejected(rejection_reason(&e));
            if status.is_server_error() {
                error!(language = %payload.language, error = %e, "Job failed");
            } else {
                warn!(language = %payload.language, error = %e, "Rejected job");
            }
            error_response(status, &e.to_string())
        }
    }
}

/// Caller mistakes are 400; everything else is the server's fault
fn status_for(err: &ExecError) -> StatusCode {
    if err.is_internal() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    }
}

fn rejection_reason(err: &ExecError) -> &'static str {
    match err {
        ExecError::UnsupportedLanguage(_) => "unsupported_language",
        ExecError::InvalidRequest(_) => "invalid_request",
        ExecError::ToolchainMissing { .. } => "toolchain_missing",
        _ => "internal_error",
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus scrape endpoint
pub async fn metrics() -> Response {
    match metrics::render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}
