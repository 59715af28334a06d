use serde_json::{json, Value};

use super::splitter::{Segment, StreamMode};

/// Rebuilds protocol-compliant stream chunks from one parsed upstream
/// envelope. The envelope is taken over as a working template: per segment
/// only the candidate text, the thought flag and the finish reason are
/// touched, everything else passes through untouched. This avoids a deep
/// clone per emitted segment.
pub struct EnvelopeTemplate {
    chunk: Value,
    finish_reason: Option<Value>,
}

impl EnvelopeTemplate {
    pub fn new(mut chunk: Value) -> Self {
        // finishReason only belongs on the last segment of this chunk;
        // park it until then.
        let finish_reason = chunk
            .get_mut("candidates")
            .and_then(|c| c.get_mut(0))
            .and_then(Value::as_object_mut)
            .and_then(|c| c.remove("finishReason"));
        Self {
            chunk,
            finish_reason,
        }
    }

    /// Minimal envelope for text that has no upstream chunk to clone,
    /// such as the injected generation prefix.
    pub fn synthetic() -> Self {
        Self::new(json!({
            "candidates": [{"content": {"parts": [{"text": ""}], "role": "model"}}]
        }))
    }

    /// Renders one segment as a complete `data: <json>\n\n` frame.
    /// Returns `None` when the envelope does not carry the expected
    /// candidate shape.
    pub fn render(&mut self, segment: &Segment) -> Option<String> {
        let part = self
            .chunk
            .get_mut("candidates")?
            .get_mut(0)?
            .get_mut("content")?
            .get_mut("parts")?
            .get_mut(0)?
            .as_object_mut()?;

        part.insert("text".to_string(), Value::String(segment.text.clone()));
        match segment.mode {
            StreamMode::Thinking => {
                part.insert("thought".to_string(), Value::Bool(true));
            }
            StreamMode::Answering => {
                part.remove("thought");
            }
        }

        if segment.terminal {
            if let Some(reason) = self.finish_reason.take() {
                if let Some(candidate) = self
                    .chunk
                    .get_mut("candidates")
                    .and_then(|c| c.get_mut(0))
                    .and_then(Value::as_object_mut)
                {
                    candidate.insert("finishReason".to_string(), reason);
                }
            }
        }

        Some(format!("data: {}\n\n", self.chunk))
    }
}

/// Pulls the candidate text out of a parsed upstream chunk.
pub fn extract_candidate_text(chunk: &Value) -> Option<&str> {
    chunk
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(text: &str, mode: StreamMode, terminal: bool) -> Segment {
        Segment {
            text: text.to_string(),
            mode,
            terminal,
        }
    }

    fn upstream_chunk() -> Value {
        json!({
            "candidates": [{
                "content": {"parts": [{"text": "original"}], "role": "model"},
                "finishReason": "STOP",
                "index": 0
            }],
            "usageMetadata": {"candidatesTokenCount": 42},
            "modelVersion": "gemini-exp"
        })
    }

    fn parse_frame(frame: &str) -> Value {
        let json_part = frame
            .strip_prefix("data: ")
            .and_then(|f| f.strip_suffix("\n\n"))
            .expect("well-formed SSE frame");
        serde_json::from_str(json_part).expect("frame carries valid JSON")
    }

    #[test]
    fn thinking_segment_sets_thought_flag() {
        let mut template = EnvelopeTemplate::new(upstream_chunk());
        let frame = template
            .render(&segment("pondering", StreamMode::Thinking, false))
            .expect("render");
        let chunk = parse_frame(&frame);
        let part = &chunk["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["text"], "pondering");
        assert_eq!(part["thought"], true);
    }

    #[test]
    fn answering_segment_removes_stale_thought_flag() {
        let mut template = EnvelopeTemplate::new(json!({
            "candidates": [{"content": {"parts": [{"text": "t", "thought": true}], "role": "model"}}]
        }));
        let frame = template
            .render(&segment("answer", StreamMode::Answering, true))
            .expect("render");
        let chunk = parse_frame(&frame);
        let part = &chunk["candidates"][0]["content"]["parts"][0];
        assert_eq!(part["text"], "answer");
        assert!(part.get("thought").is_none());
    }

    #[test]
    fn finish_reason_is_withheld_until_the_terminal_segment() {
        let mut template = EnvelopeTemplate::new(upstream_chunk());

        let first = parse_frame(
            &template
                .render(&segment("a", StreamMode::Answering, false))
                .expect("render"),
        );
        assert!(first["candidates"][0].get("finishReason").is_none());

        let last = parse_frame(
            &template
                .render(&segment("b", StreamMode::Answering, true))
                .expect("render"),
        );
        assert_eq!(last["candidates"][0]["finishReason"], "STOP");
    }

    #[test]
    fn unknown_upstream_fields_pass_through() {
        let mut template = EnvelopeTemplate::new(upstream_chunk());
        let chunk = parse_frame(
            &template
                .render(&segment("x", StreamMode::Answering, true))
                .expect("render"),
        );
        assert_eq!(chunk["usageMetadata"]["candidatesTokenCount"], 42);
        assert_eq!(chunk["modelVersion"], "gemini-exp");
        assert_eq!(chunk["candidates"][0]["index"], 0);
    }

    #[test]
    fn malformed_envelope_renders_nothing() {
        let mut template = EnvelopeTemplate::new(json!({"candidates": []}));
        assert!(template
            .render(&segment("x", StreamMode::Answering, true))
            .is_none());
    }

    #[test]
    fn synthetic_template_renders_prefix_frames() {
        let mut template = EnvelopeTemplate::synthetic();
        let chunk = parse_frame(
            &template
                .render(&segment("prefix", StreamMode::Answering, true))
                .expect("render"),
        );
        assert_eq!(chunk["candidates"][0]["content"]["parts"][0]["text"], "prefix");
        assert_eq!(chunk["candidates"][0]["content"]["role"], "model");
    }

    #[test]
    fn candidate_text_extraction() {
        assert_eq!(extract_candidate_text(&upstream_chunk()), Some("original"));
        assert_eq!(extract_candidate_text(&json!({"other": 1})), None);
    }
}
