use serde_json::{json, Value};
use tracing::debug;

use crate::proxy::config::ProxyConfig;

fn role_of(turn: &Value) -> Option<&str> {
    turn.get("role").and_then(Value::as_str)
}

fn first_part_text_mut(turn: &mut Value) -> Option<&mut Value> {
    turn.get_mut("parts")?.get_mut(0)?.get_mut("text")
}

/// Rewrites prior model turns so their textual form matches the marker
/// convention the live stream is split with: the upstream model sees its
/// own history exactly as it is expected to produce it. The chronologically
/// last model turn is the resumption slot and is left untouched.
pub fn normalize_history(contents: &mut [Value], config: &ProxyConfig) {
    if !config.history_rewrite.enabled {
        return;
    }
    let last_model_idx = contents.iter().rposition(|t| role_of(t) == Some("model"));
    let mut rewritten = 0usize;

    for (idx, turn) in contents.iter_mut().enumerate() {
        if Some(idx) == last_model_idx || role_of(turn) != Some("model") {
            continue;
        }
        let Some(text_slot) = first_part_text_mut(turn) else {
            continue;
        };
        let Some(original) = text_slot.as_str() else {
            continue;
        };
        if original.is_empty() {
            continue;
        }
        *text_slot = Value::String(format!(
            "{}\n\n{}\n\n{}\n\n{}\n\n{}",
            config.markers.thought,
            config.history_rewrite.thought_placeholder,
            config.markers.answer,
            original,
            config.retry.eos_marker,
        ));
        rewritten += 1;
    }

    if rewritten > 0 {
        debug!("Rewrote {} prior model turn(s) to marker form", rewritten);
    }
}

/// Inserts the configured synthetic turns next to the chronologically last
/// user turn. Returns the generation prefix text when one was injected, so
/// the stream controller can replay it to the client. Roles other than
/// `user`/`model` are opaque: they never anchor an insertion.
pub fn apply_injections(contents: &mut Vec<Value>, config: &ProxyConfig) -> Option<String> {
    let mut anchor = contents.iter().rposition(|t| role_of(t) == Some("user"))?;

    if config.prompt_injection.enabled && !config.prompt_injection.user_suffix.is_empty() {
        contents.insert(
            anchor + 1,
            json!({"role": "user", "parts": [{"text": config.prompt_injection.user_suffix}]}),
        );
        anchor += 1;
        debug!("Injected user suffix turn");
    }

    if config.generation_prefix.enabled && !config.generation_prefix.model_prefix.is_empty() {
        contents.insert(
            anchor + 1,
            json!({"role": "model", "parts": [{"text": config.generation_prefix.model_prefix}]}),
        );
        debug!("Injected model prefix turn");
        return Some(config.generation_prefix.model_prefix.clone());
    }

    None
}

/// Resumption: the partially generated answer becomes conversation history
/// that primes the upstream to continue rather than restart. Overwrites the
/// last model turn's text, appending a fresh model turn when the history
/// carries none.
pub fn overwrite_last_model_text(contents: &mut Vec<Value>, text: &str) {
    let slot = contents
        .iter_mut()
        .rev()
        .find(|t| t.get("role").and_then(Value::as_str) == Some("model"))
        .and_then(first_part_text_mut);

    match slot {
        Some(slot) => *slot = Value::String(text.to_string()),
        None => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
    }
}
