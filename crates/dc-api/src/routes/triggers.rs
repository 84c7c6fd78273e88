use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use dc_issuance::{IssuanceError, TriggerPayload};
use tracing::{error, info};

use super::{message, not_found};
use crate::state::ApiState;

/// Manual and external triggers for the poll and finalize steps
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/check-text-record", post(check_text_record))
        .route("/create-cert", post(create_cert))
}

fn trigger_error(e: IssuanceError) -> Response {
    match e {
        IssuanceError::NotFound { .. } => not_found(),
        IssuanceError::NotReady { .. } => message(StatusCode::CONFLICT, e.to_string()),
        e if e.is_benign() => {
            info!(domain = %e.domain(), error = %e, "Trigger lost a race");
            message(StatusCode::CONFLICT, e.to_string())
        }
        e => {
            error!(domain = %e.domain(), error = %e, "Trigger failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn check_text_record(
    State(state): State<ApiState>,
    body: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.orchestrator.check_text_record(payload).await {
        Ok(payload) => Json(payload).into_response(),
        Err(e) => trigger_error(e),
    }
}

async fn create_cert(
    State(state): State<ApiState>,
    body: Result<Json<TriggerPayload>, JsonRejection>,
) -> Response {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.orchestrator.create_certificate(payload).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => trigger_error(e),
    }
}
