use serde::{Deserialize, Serialize};

/// Process-wide proxy configuration. Built once at startup and shared
/// read-only across request workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub markers: MarkerConfig,
    #[serde(default)]
    pub prompt_injection: PromptInjectionConfig,
    #[serde(default)]
    pub generation_prefix: GenerationPrefixConfig,
    #[serde(default)]
    pub history_rewrite: HistoryRewriteConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: default_api_base_url(),
            host: default_host(),
            port: default_port(),
            markers: MarkerConfig::default(),
            prompt_injection: PromptInjectionConfig::default(),
            generation_prefix: GenerationPrefixConfig::default(),
            history_rewrite: HistoryRewriteConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// In-band markers that switch the stream between thinking and answering.
/// Must be non-empty and distinct; `validate_markers` enforces this at load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkerConfig {
    #[serde(default = "default_thought_marker")]
    pub thought: String,
    #[serde(default = "default_answer_marker")]
    pub answer: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            thought: default_thought_marker(),
            answer: default_answer_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PromptInjectionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub user_suffix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GenerationPrefixConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRewriteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_thought_placeholder")]
    pub thought_placeholder: String,
}

impl Default for HistoryRewriteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            thought_placeholder: default_thought_placeholder(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Marker the model is expected to emit when an answer is complete.
    /// Stripped from everything forwarded to the client.
    #[serde(default = "default_eos_marker")]
    pub eos_marker: String,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Disconnects closer together than this are treated as a persistent
    /// failure and grow the backoff instead of resetting it.
    #[serde(default = "default_rapid_disconnect_threshold_ms")]
    pub rapid_disconnect_threshold_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: default_max_retries(),
            eos_marker: default_eos_marker(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            rapid_disconnect_threshold_ms: default_rapid_disconnect_threshold_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_api_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_thought_marker() -> String {
    "_thought".to_string()
}

fn default_answer_marker() -> String {
    "_answer".to_string()
}

fn default_thought_placeholder() -> String {
    "...".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_eos_marker() -> String {
    "_end".to_string()
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_rapid_disconnect_threshold_ms() -> u64 {
    5000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_deserializes_to_full_defaults() {
        let cfg: ProxyConfig = serde_json::from_str("{}").expect("valid empty config");
        assert_eq!(cfg.api_base_url, "https://generativelanguage.googleapis.com");
        assert_eq!(cfg.markers.thought, "_thought");
        assert_eq!(cfg.markers.answer, "_answer");
        assert!(!cfg.retry.enabled);
        assert_eq!(cfg.retry.max_backoff_ms, 30_000);
    }

    #[test]
    fn partial_retry_block_keeps_remaining_defaults() {
        let cfg: ProxyConfig = serde_json::from_value(serde_json::json!({
            "retry": { "enabled": true, "max_retries": 7 }
        }))
        .expect("valid partial config");
        assert!(cfg.retry.enabled);
        assert_eq!(cfg.retry.max_retries, 7);
        assert_eq!(cfg.retry.eos_marker, "_end");
        assert_eq!(cfg.retry.initial_backoff_ms, 1000);
    }

    #[test]
    fn marker_overrides_are_honored() {
        let cfg: ProxyConfig = serde_json::from_value(serde_json::json!({
            "markers": { "thought": "<think>", "answer": "<speak>" }
        }))
        .expect("valid marker config");
        assert_eq!(cfg.markers.thought, "<think>");
        assert_eq!(cfg.markers.answer, "<speak>");
    }
}
