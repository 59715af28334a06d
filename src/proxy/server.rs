use std::sync::Arc;

use tracing::info;

use crate::error::AppResult;
use crate::proxy::config::ProxyConfig;
use crate::proxy::routes::build_proxy_routes;
use crate::proxy::state::AppState;
use crate::proxy::upstream::UpstreamClient;

pub struct AxumServer;

impl AxumServer {
    /// Binds and serves until ctrl-c. Blocks the calling task.
    pub async fn start(config: Arc<ProxyConfig>) -> AppResult<()> {
        let upstream = Arc::new(UpstreamClient::new(&config)?);
        let state = AppState {
            config: config.clone(),
            upstream,
        };
        let app = build_proxy_routes(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!("Proxy server started at http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down proxy server");
            })
            .await?;
        Ok(())
    }
}
