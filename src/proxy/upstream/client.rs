use std::future::Future;

use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use tokio::time::Duration;
use tracing::debug;

use crate::error::AppResult;
use crate::proxy::config::ProxyConfig;
use crate::proxy::handlers::streaming::BytesResultStream;

/// One opened upstream attempt: the response status plus a fallible byte
/// stream of its body.
pub struct UpstreamResponse {
    pub status: u16,
    pub body: BytesResultStream,
}

/// Seam between the retry controller and the outbound transport. The
/// production implementation is [`UpstreamClient`]; tests script attempts
/// through mock backends.
pub trait GenerateBackend: Send + Sync {
    fn open_stream(
        &self,
        model: &str,
        body: &Value,
    ) -> impl Future<Output = Result<UpstreamResponse, String>> + Send;
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> AppResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(concat!("thoughtgate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn stream_url(&self, model: &str) -> String {
        let mut url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        if !self.api_key.is_empty() {
            url.push_str("&key=");
            url.push_str(&self.api_key);
        }
        url
    }
}

impl GenerateBackend for UpstreamClient {
    fn open_stream(
        &self,
        model: &str,
        body: &Value,
    ) -> impl Future<Output = Result<UpstreamResponse, String>> + Send {
        let url = self.stream_url(model);
        debug!("Connecting to upstream for model {}", model);
        let request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(body);

        async move {
            let response = request
                .send()
                .await
                .map_err(|e| format!("Upstream request failed: {}", e))?;
            let status = response.status().as_u16();
            let body: BytesResultStream =
                Box::pin(response.bytes_stream().map(|r| r.map_err(|e| e.to_string())));
            Ok(UpstreamResponse { status, body })
        }
    }
}
