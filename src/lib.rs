pub mod error;
pub mod modules;
pub mod proxy;

use std::sync::Arc;
use tracing::{error, info};

use crate::error::AppResult;
use modules::system::logger;

async fn start_proxy_runtime() -> AppResult<()> {
    let config = modules::system::config::load_proxy_config();
    info!(
        "Configuration loaded (endpoint: {}, markers: {} / {}, retry: {})",
        config.api_base_url,
        config.markers.thought,
        config.markers.answer,
        if config.retry.enabled { "on" } else { "off" }
    );
    if config.api_key.is_empty() {
        info!("No API key configured; upstream requests will be sent without a key");
    }

    proxy::server::AxumServer::start(Arc::new(config)).await
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = start_proxy_runtime().await {
            error!("{}", e);
            std::process::exit(1);
        }
    });
}
