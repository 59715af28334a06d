use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;

pub fn invalid_body_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "Request body must be valid JSON with a contents array."})),
    )
        .into_response()
}

/// One structured in-stream event for a non-success upstream status.
pub fn upstream_status_frame(status: u16, details: &str) -> Bytes {
    let event = json!({
        "error": "Upstream API error",
        "status_code": status,
        "details": details,
    });
    Bytes::from(format!("data: {}\n\n", event))
}

/// Transport failure surfaced to the client (retries disabled).
pub fn transport_error_frame(details: &str) -> Bytes {
    let event = json!({
        "error": "Upstream request failed",
        "details": details,
    });
    Bytes::from(format!("data: {}\n\n", event))
}

/// Final event when the retry budget ran out without a clean end.
pub fn retry_exhausted_frame(attempts: u32, details: &str) -> Bytes {
    let event = json!({
        "error": "Retry budget exhausted",
        "attempts": attempts,
        "details": details,
    });
    Bytes::from(format!("data: {}\n\n", event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(frame: &Bytes) -> Value {
        let text = std::str::from_utf8(frame).expect("utf8 frame");
        let json_part = text
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .expect("well-formed SSE frame");
        serde_json::from_str(json_part).expect("valid JSON event")
    }

    #[test]
    fn error_frames_are_valid_sse_events() {
        let status = parse(&upstream_status_frame(503, "unavailable"));
        assert_eq!(status["status_code"], 503);
        assert_eq!(status["details"], "unavailable");

        let transport = parse(&transport_error_frame("connection reset"));
        assert_eq!(transport["error"], "Upstream request failed");

        let exhausted = parse(&retry_exhausted_frame(3, "connection reset"));
        assert_eq!(exhausted["attempts"], 3);
    }
}
