use axum::{
    body::Body,
    extract::{Json, Path, State},
    http::StatusCode,
    response::Response,
};
use serde_json::Value;
use tracing::info;

use crate::proxy::handlers::errors;
use crate::proxy::handlers::retry::run_resilient_stream;
use crate::proxy::handlers::streaming::build_sse_response;
use crate::proxy::mappers::gemini::history::{apply_injections, normalize_history};
use crate::proxy::state::AppState;

pub async fn handle_stream_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Response, (StatusCode, String)> {
    let (model_name, method) = if let Some((model, action)) = model_action.rsplit_once(':') {
        (model.to_string(), action.to_string())
    } else {
        (model_action, "streamGenerateContent".to_string())
    };
    if method != "streamGenerateContent" {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Unsupported method: {}", method),
        ));
    }

    let Some(Json(body)) = body else {
        return Ok(errors::invalid_body_response());
    };
    if body
        .get("contents")
        .map_or(true, |contents| !contents.is_array())
    {
        return Ok(errors::invalid_body_response());
    }

    info!("Received stream request for model {}", model_name);

    // All rewriting happens on this working copy; the client payload
    // itself is never mutated.
    let mut request = body;
    let config = state.config.clone();
    let mut prefix = None;
    if let Some(contents) = request.get_mut("contents").and_then(Value::as_array_mut) {
        normalize_history(contents, &config);
        prefix = apply_injections(contents, &config);
    }

    let stream = run_resilient_stream(state.upstream.clone(), model_name, request, prefix, config);
    Ok(build_sse_response(Body::from_stream(stream)))
}
