use crate::error::ProxyError;
use crate::models::openai::{OpenAIRequest, OpenAIResponse};
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;
use tracing::debug;

pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const CONTEXT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One `data:` payload from an upstream SSE stream, markers included.
pub type SseDataStream = Pin<Box<dyn Stream<Item = Result<String, ProxyError>> + Send>>;

/// HTTP client for OpenAI-compatible backends. No overall request
/// timeout: generation can legitimately run for minutes, and the ping
/// keep-alive covers the client side.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new() -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ProxyError::from_transport)?;
        Ok(Self { client })
    }

    /// Send a chat-completions request and return the raw response.
    /// Status checking and error mapping stay with the caller, which
    /// knows the provider context.
    pub async fn post_chat(
        &self,
        url: &str,
        api_key: Option<&str>,
        request: &OpenAIRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        if let Some(key) = api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
            .json(request)
            .send()
            .await
            .map_err(ProxyError::from_transport)
    }

    /// Parse a non-streaming chat-completions response body.
    pub async fn read_completion(
        &self,
        response: reqwest::Response,
    ) -> Result<OpenAIResponse, ProxyError> {
        response
            .json::<OpenAIResponse>()
            .await
            .map_err(ProxyError::from_transport)
    }

    /// GET a probe path; any 2xx counts as healthy.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!(url, %err, "health probe failed");
                false
            }
        }
    }

    /// Ollama's /api/show reports the model's context window in its
    /// model_info map as `<arch>.context_length`.
    pub async fn ollama_context_window(&self, base_url: &str, model: &str) -> Option<u32> {
        let url = format!("{}/api/show", base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .timeout(CONTEXT_PROBE_TIMEOUT)
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        let model_info = body.get("model_info")?.as_object()?;
        model_info
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, value)| value.as_u64())
            .map(|v| v as u32)
    }
}

/// Turn an SSE response body into a stream of `data:` payloads.
///
/// Non-data lines (comments, event names, blanks) are filtered out;
/// the `[DONE]` sentinel is passed through for the caller to act on.
pub fn sse_data_stream(response: reqwest::Response) -> SseDataStream {
    let bytes = response.bytes_stream();
    let reader = StreamReader::new(
        bytes.map(|result| result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))),
    );
    let lines = LinesStream::new(tokio::io::BufReader::new(reader).lines());

    Box::pin(lines.filter_map(|line| async move {
        match line {
            Ok(line) => {
                let trimmed = line.trim_end_matches('\r');
                trimmed
                    .strip_prefix("data:")
                    .map(|data| Ok(data.trim().to_string()))
            }
            Err(err) => Some(Err(ProxyError::Connection(format!(
                "upstream stream read failed: {}",
                err
            )))),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds() {
        UpstreamClient::new().unwrap();
    }
}
