use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::proxy::config::{ProxyConfig, RetryConfig};
use crate::proxy::handlers::errors;
use crate::proxy::handlers::streaming::BytesResultStream;
use crate::proxy::mappers::gemini::history::overwrite_last_model_text;
use crate::proxy::mappers::gemini::{
    extract_candidate_text, EnvelopeTemplate, SegmentSplitter, StreamMode,
};
use crate::proxy::upstream::GenerateBackend;

/// Per-request stream state, owned by the controller and carried across
/// upstream attempts. `accumulated` is append-only and gap-free: it is the
/// exact concatenation of everything the logical stream has produced.
#[derive(Debug)]
pub struct StreamState {
    pub mode: StreamMode,
    pub accumulated: String,
    pub retries_left: u32,
    pub backoff: Duration,
    pub last_disconnect: Option<Instant>,
    pub prefix_delivered: bool,
}

impl StreamState {
    pub fn new(retry: &RetryConfig) -> Self {
        Self {
            mode: StreamMode::Answering,
            accumulated: String::new(),
            retries_left: retry.max_retries,
            backoff: Duration::from_millis(retry.initial_backoff_ms),
            last_disconnect: None,
            prefix_delivered: false,
        }
    }
}

#[derive(Debug)]
pub enum AttemptOutcome {
    CleanEnd,
    UpstreamStatus(u16),
    ConnectionLost(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::CleanEnd => write!(f, "stream ended without end marker"),
            AttemptOutcome::UpstreamStatus(status) => write!(f, "upstream HTTP {}", status),
            AttemptOutcome::ConnectionLost(e) => write!(f, "connection lost: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Terminate; nothing further to surface.
    Stop,
    /// Decremented the budget, run another attempt.
    Again,
    /// Budget exhausted; surface one final error event and terminate.
    GiveUp,
}

/// Records a disconnect and returns the sleep to apply before the next
/// attempt. A disconnect arriving sooner than the rapid-disconnect
/// threshold signals a persistent failure: sleep the current backoff and
/// grow it geometrically (capped). A slower disconnect resets the backoff
/// and warrants no sleep.
pub fn backoff_after_disconnect(
    state: &mut StreamState,
    now: Instant,
    retry: &RetryConfig,
) -> Option<Duration> {
    let threshold = Duration::from_millis(retry.rapid_disconnect_threshold_ms);
    let rapid = state
        .last_disconnect
        .is_some_and(|prev| now.duration_since(prev) < threshold);
    state.last_disconnect = Some(now);

    if rapid {
        let delay = state.backoff;
        let grown = (state.backoff.as_millis() as f64 * retry.backoff_factor) as u64;
        state.backoff = Duration::from_millis(grown.min(retry.max_backoff_ms));
        Some(delay)
    } else {
        state.backoff = Duration::from_millis(retry.initial_backoff_ms);
        None
    }
}

pub fn decide_retry(
    outcome: &AttemptOutcome,
    state: &mut StreamState,
    retry: &RetryConfig,
) -> RetryDecision {
    if !retry.enabled {
        return RetryDecision::Stop;
    }
    if matches!(outcome, AttemptOutcome::CleanEnd) && stream_is_complete(state, retry) {
        return RetryDecision::Stop;
    }
    if state.retries_left > 0 {
        state.retries_left -= 1;
        RetryDecision::Again
    } else {
        RetryDecision::GiveUp
    }
}

/// A clean end counts as complete when the accumulated text ends with the
/// configured end-of-stream marker. Without a configured marker there is
/// nothing to check against, so every clean end completes the stream.
fn stream_is_complete(state: &StreamState, retry: &RetryConfig) -> bool {
    retry.eos_marker.is_empty() || state.accumulated.trim_end().ends_with(&retry.eos_marker)
}

fn strip_eos_marker<'a>(text: &'a str, retry: &RetryConfig) -> Cow<'a, str> {
    if !retry.eos_marker.is_empty() && text.contains(&retry.eos_marker) {
        Cow::Owned(text.replace(&retry.eos_marker, ""))
    } else {
        Cow::Borrowed(text)
    }
}

/// Splits one run of text at marker boundaries and renders each segment
/// through the envelope template. The end-of-stream marker never reaches
/// the client; the mode advances in `state` for the next run.
fn emit_segments(
    text: &str,
    state: &mut StreamState,
    template: &mut EnvelopeTemplate,
    config: &ProxyConfig,
) -> Vec<Bytes> {
    let cleaned = strip_eos_marker(text, &config.retry);
    let mut splitter = SegmentSplitter::new(&cleaned, state.mode, &config.markers);
    let mut frames = Vec::new();
    for segment in splitter.by_ref() {
        if let Some(frame) = template.render(&segment) {
            frames.push(Bytes::from(frame));
        }
    }
    state.mode = splitter.mode();
    frames
}

async fn read_error_body(mut body: BytesResultStream) -> String {
    let mut collected = Vec::new();
    while let Some(next) = body.next().await {
        match next {
            Ok(bytes) => collected.extend_from_slice(&bytes),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Drives one logical client stream across as many upstream attempts as
/// the retry policy allows: ATTEMPT -> STREAMING -> retry decision ->
/// ATTEMPT or terminate. Yields fully framed SSE bytes; dropping the
/// returned stream aborts the in-flight attempt at its next await point.
pub fn run_resilient_stream<B>(
    backend: Arc<B>,
    model: String,
    base_request: Value,
    prefix: Option<String>,
    config: Arc<ProxyConfig>,
) -> impl Stream<Item = Result<Bytes, String>> + Send
where
    B: GenerateBackend + 'static,
{
    async_stream::stream! {
        let retry = &config.retry;
        let mut state = StreamState::new(retry);
        // The injected prefix is already part of the conversation history
        // (as the primed model turn), so resumption snapshots must include
        // it or the upstream would lose its priming on retry.
        if let Some(prefix_text) = prefix.as_deref() {
            state.accumulated.push_str(prefix_text);
        }
        let mut pending_sleep: Option<Duration> = None;
        let mut attempt: u32 = 0;

        loop {
            // ATTEMPT
            if let Some(delay) = pending_sleep.take() {
                debug!(
                    "Backing off {}ms before attempt {}",
                    delay.as_millis(),
                    attempt + 1
                );
                sleep(delay).await;
            }
            let mut request = base_request.clone();
            if attempt > 0 && !state.accumulated.is_empty() {
                if let Some(contents) = request.get_mut("contents").and_then(Value::as_array_mut) {
                    overwrite_last_model_text(contents, &state.accumulated);
                }
                info!(
                    "Resuming generation with {} accumulated chars (attempt {})",
                    state.accumulated.chars().count(),
                    attempt + 1
                );
            }

            // STREAMING
            let outcome = match backend.open_stream(&model, &request).await {
                Err(e) => {
                    warn!("Upstream connection failed: {}", e);
                    AttemptOutcome::ConnectionLost(e)
                }
                Ok(response) if response.status != 200 => {
                    let details = read_error_body(response.body).await;
                    warn!("Upstream responded with status {}", response.status);
                    yield Ok(errors::upstream_status_frame(response.status, &details));
                    AttemptOutcome::UpstreamStatus(response.status)
                }
                Ok(response) => {
                    let mut body = response.body;
                    let mut buffer = BytesMut::new();
                    let mut transport_error: Option<String> = None;

                    'attempt: loop {
                        let mut ended = false;
                        match body.next().await {
                            Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                            Some(Err(e)) => {
                                // A partial buffered line is untrustworthy
                                // after a transport failure; drop it.
                                transport_error = Some(e);
                                break 'attempt;
                            }
                            None => {
                                ended = true;
                                // Flush a trailing line that lacked its
                                // newline before the stream closed.
                                if !buffer.is_empty() && buffer[buffer.len() - 1] != b'\n' {
                                    buffer.extend_from_slice(b"\n");
                                }
                            }
                        }

                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line_raw = buffer.split_to(pos + 1);
                            let Ok(line_str) = std::str::from_utf8(&line_raw) else {
                                yield Ok(line_raw.freeze());
                                continue;
                            };
                            let line = line_str.trim();
                            if line.is_empty() {
                                continue;
                            }

                            let Some(json_part) = line.strip_prefix("data: ") else {
                                yield Ok(Bytes::from(format!("{}\n", line)));
                                continue;
                            };
                            let Ok(chunk_json) = serde_json::from_str::<Value>(json_part.trim())
                            else {
                                debug!("Passing through unparsable data line");
                                yield Ok(Bytes::from(format!("{}\n\n", line)));
                                continue;
                            };

                            if !state.prefix_delivered {
                                state.prefix_delivered = true;
                                if let Some(prefix_text) = prefix.as_deref() {
                                    let mut template = EnvelopeTemplate::synthetic();
                                    for frame in
                                        emit_segments(prefix_text, &mut state, &mut template, &config)
                                    {
                                        yield Ok(frame);
                                    }
                                }
                            }

                            match extract_candidate_text(&chunk_json) {
                                Some(text) => {
                                    let text = text.to_string();
                                    state.accumulated.push_str(&text);
                                    let mut template = EnvelopeTemplate::new(chunk_json);
                                    for frame in
                                        emit_segments(&text, &mut state, &mut template, &config)
                                    {
                                        yield Ok(frame);
                                    }
                                }
                                None => {
                                    // Envelope without candidate text (e.g. a
                                    // bare usage chunk): forward untouched.
                                    yield Ok(Bytes::from(format!("{}\n\n", line)));
                                }
                            }
                        }

                        if ended {
                            break 'attempt;
                        }
                    }

                    match transport_error {
                        Some(e) => {
                            warn!("Upstream connection lost mid-stream: {}", e);
                            AttemptOutcome::ConnectionLost(e)
                        }
                        None => AttemptOutcome::CleanEnd,
                    }
                }
            };

            // RETRY_DECISION
            match decide_retry(&outcome, &mut state, retry) {
                RetryDecision::Again => {
                    pending_sleep = backoff_after_disconnect(&mut state, Instant::now(), retry);
                    attempt += 1;
                    debug!(
                        "Retrying after {} ({} retries left)",
                        outcome, state.retries_left
                    );
                }
                RetryDecision::Stop => {
                    if let AttemptOutcome::ConnectionLost(e) = &outcome {
                        // Only reachable with retries disabled; surface it.
                        yield Ok(errors::transport_error_frame(e));
                    }
                    info!("Stream finished after {} attempt(s)", attempt + 1);
                    break;
                }
                RetryDecision::GiveUp => {
                    warn!("Retry budget exhausted after {} attempts", attempt + 1);
                    yield Ok(errors::retry_exhausted_frame(
                        retry.max_retries,
                        &outcome.to_string(),
                    ));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_retries: 3,
            eos_marker: "_end".to_string(),
            initial_backoff_ms: 100,
            backoff_factor: 2.0,
            rapid_disconnect_threshold_ms: 5000,
            max_backoff_ms: 30_000,
        }
    }

    #[test]
    fn rapid_disconnects_grow_backoff_geometrically() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        let start = Instant::now();
        state.last_disconnect = Some(start);

        let first = backoff_after_disconnect(&mut state, start + Duration::from_millis(10), &retry);
        let second =
            backoff_after_disconnect(&mut state, start + Duration::from_millis(20), &retry);
        let third = backoff_after_disconnect(&mut state, start + Duration::from_millis(30), &retry);

        assert_eq!(first, Some(Duration::from_millis(100)));
        assert_eq!(second, Some(Duration::from_millis(200)));
        assert_eq!(third, Some(Duration::from_millis(400)));
    }

    #[test]
    fn slow_disconnect_resets_backoff_and_sleeps_nothing() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        let start = Instant::now();
        state.last_disconnect = Some(start);

        let _ = backoff_after_disconnect(&mut state, start + Duration::from_millis(10), &retry);
        let _ = backoff_after_disconnect(&mut state, start + Duration::from_millis(20), &retry);
        assert_eq!(state.backoff, Duration::from_millis(400));

        let slow = backoff_after_disconnect(&mut state, start + Duration::from_secs(60), &retry);
        assert_eq!(slow, None);
        assert_eq!(state.backoff, Duration::from_millis(100));
    }

    #[test]
    fn first_disconnect_is_never_rapid() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        let sleep = backoff_after_disconnect(&mut state, Instant::now(), &retry);
        assert_eq!(sleep, None);
        assert!(state.last_disconnect.is_some());
    }

    #[test]
    fn backoff_growth_is_capped() {
        let mut retry = retry_config();
        retry.max_backoff_ms = 250;
        let mut state = StreamState::new(&retry);
        let start = Instant::now();
        state.last_disconnect = Some(start);

        for i in 1..5 {
            let _ =
                backoff_after_disconnect(&mut state, start + Duration::from_millis(i), &retry);
        }
        assert_eq!(state.backoff, Duration::from_millis(250));
    }

    #[test]
    fn disabled_retries_always_stop() {
        let mut retry = retry_config();
        retry.enabled = false;
        let mut state = StreamState::new(&retry);
        assert_eq!(
            decide_retry(
                &AttemptOutcome::ConnectionLost("reset".to_string()),
                &mut state,
                &retry
            ),
            RetryDecision::Stop
        );
        assert_eq!(state.retries_left, retry.max_retries);
    }

    #[test]
    fn clean_end_with_eos_marker_stops() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        state.accumulated = "the answer_end".to_string();
        assert_eq!(
            decide_retry(&AttemptOutcome::CleanEnd, &mut state, &retry),
            RetryDecision::Stop
        );
    }

    #[test]
    fn clean_end_with_trailing_whitespace_after_eos_stops() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        state.accumulated = "the answer_end\n".to_string();
        assert_eq!(
            decide_retry(&AttemptOutcome::CleanEnd, &mut state, &retry),
            RetryDecision::Stop
        );
    }

    #[test]
    fn truncated_clean_end_retries_until_exhaustion() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        state.accumulated = "cut off mid".to_string();

        assert_eq!(
            decide_retry(&AttemptOutcome::CleanEnd, &mut state, &retry),
            RetryDecision::Again
        );
        assert_eq!(state.retries_left, 2);

        state.retries_left = 0;
        assert_eq!(
            decide_retry(&AttemptOutcome::CleanEnd, &mut state, &retry),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn status_errors_consume_the_budget() {
        let retry = retry_config();
        let mut state = StreamState::new(&retry);
        assert_eq!(
            decide_retry(&AttemptOutcome::UpstreamStatus(503), &mut state, &retry),
            RetryDecision::Again
        );
        assert_eq!(state.retries_left, 2);
    }

    #[test]
    fn empty_eos_marker_completes_any_clean_end() {
        let mut retry = retry_config();
        retry.eos_marker = String::new();
        let mut state = StreamState::new(&retry);
        state.accumulated = "anything".to_string();
        assert_eq!(
            decide_retry(&AttemptOutcome::CleanEnd, &mut state, &retry),
            RetryDecision::Stop
        );
    }

    #[test]
    fn eos_marker_is_stripped_before_emission() {
        let retry = retry_config();
        assert_eq!(strip_eos_marker("done_end", &retry), "done");
        assert_eq!(strip_eos_marker("no marker here", &retry), "no marker here");
    }
}
