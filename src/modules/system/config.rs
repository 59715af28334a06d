use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::proxy::config::{MarkerConfig, ProxyConfig};

const CONFIG_FILE: &str = "config.json";

/// Loads the proxy configuration from `config.json` in the working
/// directory. A missing or unparsable file yields defaults, never a
/// startup failure.
pub fn load_proxy_config() -> ProxyConfig {
    let mut config = read_config_file(Path::new(CONFIG_FILE));
    apply_env_overrides(&mut config);
    validate_markers(&mut config);
    config
}

fn read_config_file(path: &Path) -> ProxyConfig {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Could not read {} ({}), using defaults", path.display(), e);
            return ProxyConfig::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(config) => {
            info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            warn!("Failed to parse {} ({}), using defaults", path.display(), e);
            ProxyConfig::default()
        }
    }
}

fn apply_env_overrides(config: &mut ProxyConfig) {
    if config.api_key.is_empty() {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                info!("Using API key from environment");
                config.api_key = key;
            }
        }
    }
}

fn validate_markers(config: &mut ProxyConfig) {
    let markers = &config.markers;
    if markers.thought.is_empty() || markers.answer.is_empty() || markers.thought == markers.answer
    {
        warn!(
            "Invalid marker configuration (thought: {:?}, answer: {:?}), falling back to defaults",
            markers.thought, markers.answer
        );
        config.markers = MarkerConfig::default();
    }
}
