use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use dc_issuance::{IntakeRequest, IssuanceError};
use tracing::{error, info, warn};

use super::{message, not_found};
use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", post(request_certificate))
        .route("/{domain}", get(domain_status))
}

async fn request_certificate(
    State(state): State<ApiState>,
    body: Result<Json<IntakeRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return message(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.orchestrator.intake(request).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(IssuanceError::DuplicateDomain { domain }) => {
            info!(domain = %domain, "Certificate already requested");
            StatusCode::BAD_REQUEST.into_response()
        }
        Err(e) if e.is_input_error() => {
            warn!(domain = %e.domain(), error = %e, "Certificate request rejected");
            message(StatusCode::BAD_REQUEST, e.to_string())
        }
        Err(e) => {
            error!(domain = %e.domain(), error = %e, "Certificate request failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn domain_status(State(state): State<ApiState>, Path(domain): Path<String>) -> Response {
    match state.orchestrator.status(&domain) {
        Ok(status) => Json(status).into_response(),
        Err(IssuanceError::NotFound { .. }) => not_found(),
        Err(e) => {
            error!(domain = %domain, error = %e, "Status lookup failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
