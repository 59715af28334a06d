use axum::{
    routing::{get, post},
    Router,
};

use crate::proxy::handlers;
use crate::proxy::state::AppState;

pub fn build_proxy_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(crate::proxy::health::health_check_handler))
        .route(
            "/v1beta/models/:model_action",
            post(handlers::gemini::handle_stream_generate),
        )
        .with_state(state)
}
