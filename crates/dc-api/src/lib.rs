pub mod routes;
pub mod state;

use axum::Router;
use state::ApiState;
use tower_http::trace::TraceLayer;

/// Build the complete API router with all `/api/*` routes.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .nest("/certificates", routes::certificates::router())
        .nest("/triggers", routes::triggers::router())
        .merge(routes::health::router())
}
