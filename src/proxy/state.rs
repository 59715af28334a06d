use std::sync::Arc;

use crate::proxy::config::ProxyConfig;
use crate::proxy::upstream::UpstreamClient;

// Axum application state. Workers share nothing mutable: configuration is
// read-only and the upstream client is internally synchronized.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub upstream: Arc<UpstreamClient>,
}
