use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "acme_directory": state.env.directory_url(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
