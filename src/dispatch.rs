use crate::adapters::adapter_for;
use crate::error::ProxyError;
use crate::models::anthropic::{
    MessagesRequest, MessagesResponse, ResponseContentBlock, Usage,
};
use crate::models::openai::{
    Message, MessageContent, OpenAIErrorBody, OpenAIResponse, OpenAIStreamResponse,
};
use crate::providers::{ProviderDescriptor, ProviderRegistry};
use crate::streaming::{map_finish_reason, ReasoningPolicy, StreamTranslator};
use crate::transform::to_openai_request;
use crate::upstream::{sse_data_stream, UpstreamClient, HEALTH_PROBE_TIMEOUT};
use crate::usage::{cacheable_tokens, conversation_key, ConversationCache, TokenLedger};
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

pub type SseFrameStream = ReceiverStream<Result<Bytes, Infallible>>;

/// Either a complete JSON reply or a live SSE frame stream.
pub enum MessagesOutcome {
    Complete(MessagesResponse),
    Stream(SseFrameStream),
}

#[derive(Debug, Clone, Copy)]
struct ProbeRecord {
    context_window: u32,
}

/// Per-request entry point: resolves the backend, gates capabilities,
/// forwards the transformed request and drives the stream translation.
pub struct Dispatcher {
    registry: ProviderRegistry,
    client: UpstreamClient,
    cache: Arc<ConversationCache>,
    ledger: Arc<TokenLedger>,
    reasoning_policy: ReasoningPolicy,
    /// Local providers probed this process, keyed by name + base URL.
    probed: tokio::sync::Mutex<HashMap<String, ProbeRecord>>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<ConversationCache>,
        ledger: Arc<TokenLedger>,
        reasoning_policy: ReasoningPolicy,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            registry: ProviderRegistry::new(),
            client: UpstreamClient::new()?,
            cache,
            ledger,
            reasoning_policy,
            probed: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn ledger(&self) -> &Arc<TokenLedger> {
        &self.ledger
    }

    pub async fn handle_messages(
        &self,
        request: MessagesRequest,
    ) -> Result<MessagesOutcome, ProxyError> {
        let (provider, upstream_model) = self.registry.resolve(&request.model);
        info!(
            provider = %provider.name,
            model = %upstream_model,
            stream = request.stream.unwrap_or(false),
            "dispatching request"
        );

        let api_key = self.registry.api_key(&provider);
        if !provider.is_local && api_key.is_none() {
            let env = provider.api_key_env.as_deref().unwrap_or("the API key");
            return Err(ProxyError::Authentication(format!(
                "{} is not set; required for {}",
                env, provider.name
            )));
        }

        if provider.is_local {
            self.ensure_provider_ready(&provider, &upstream_model)
                .await?;
        }

        // Cache phase is decided up front from the request alone; the
        // split rides on the final usage record.
        let cache_outcome = self.cache.classify(
            &conversation_key(&request),
            cacheable_tokens(&request),
            Instant::now(),
        );

        let streaming = request.stream.unwrap_or(false);
        let client_model = request.model.clone();

        let transformed = to_openai_request(&request)?;
        if !transformed.dropped_params.is_empty() {
            debug!(dropped = ?transformed.dropped_params, "dropped unsupported parameters");
        }
        let mut openai_request = transformed.request;
        openai_request.model = upstream_model.clone();

        if openai_request.tools.is_some() && !provider.capabilities.supports_tools {
            warn!(provider = %provider.name, "backend lacks tool support, stripping tools");
            openai_request.tools = None;
            openai_request.tool_choice = None;
        }
        if !provider.capabilities.supports_vision && request_has_images(&openai_request) {
            return Err(ProxyError::Capability(format!(
                "{} does not support image input; remove images or pick a vision-capable model",
                provider.name
            )));
        }

        let adapter = adapter_for(&upstream_model);
        adapter.prepare_request(&mut openai_request);
        crate::metrics::record_request(&provider.name, streaming);

        if !streaming {
            openai_request.stream = Some(false);
            openai_request.stream_options = None;
            let response = self
                .client
                .post_chat(&provider.chat_url(), api_key.as_deref(), &openai_request)
                .await?;
            if !response.status().is_success() {
                return Err(read_upstream_error(&provider, &upstream_model, response).await);
            }
            let completion = self.client.read_completion(response).await?;
            let messages_response =
                complete_response(completion, &client_model, cache_outcome);
            self.ledger.record_turn(
                messages_response.usage.input_tokens,
                messages_response.usage.output_tokens,
            );
            return Ok(MessagesOutcome::Complete(messages_response));
        }

        let response = self
            .client
            .post_chat(&provider.chat_url(), api_key.as_deref(), &openai_request)
            .await?;
        if !response.status().is_success() {
            return Err(read_upstream_error(&provider, &upstream_model, response).await);
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
        let translator =
            StreamTranslator::new(client_model, self.reasoning_policy, cache_outcome);
        let ledger = Arc::clone(&self.ledger);
        let provider_name = provider.name.clone();

        tokio::spawn(async move {
            let mut translator = translator;
            let mut adapter = adapter;
            let mut timings = crate::models::common::StreamTimings::new();
            let mut lines = sse_data_stream(response);
            let mut ping = tokio::time::interval(PING_INTERVAL);
            ping.tick().await; // the first tick fires immediately

            // Reads and writes are serialized on this one task; when the
            // client goes away the send fails, we return, and dropping
            // the body stream aborts the upstream fetch.
            loop {
                tokio::select! {
                    next = lines.next() => {
                        match next {
                            Some(Ok(data)) => {
                                if data == "[DONE]" {
                                    if !send_events(&tx, translator.finish()).await {
                                        return;
                                    }
                                    break;
                                }
                                let mut chunk: OpenAIStreamResponse =
                                    match serde_json::from_str(&data) {
                                        Ok(chunk) => chunk,
                                        Err(err) => {
                                            warn!(%err, data = %data, "skipping malformed stream chunk");
                                            continue;
                                        }
                                    };
                                if let Some(choice) = chunk.choices.first_mut() {
                                    adapter.transform_delta(&mut choice.delta);
                                }
                                let events = translator.step(&chunk);
                                if !events.is_empty() {
                                    timings.record_first_event();
                                }
                                if !send_events(&tx, events).await {
                                    return;
                                }
                                if translator.is_finished() {
                                    break;
                                }
                            }
                            Some(Err(err)) => {
                                warn!(provider = %provider_name, %err, "upstream stream failed");
                                crate::metrics::record_error(err.error_type());
                                let _ = send_events(
                                    &tx,
                                    vec![
                                        err.to_stream_event(),
                                        crate::models::anthropic::StreamEvent::MessageStop,
                                    ],
                                )
                                .await;
                                return;
                            }
                            None => {
                                // Upstream closed without [DONE]; finish
                                // out the protocol anyway.
                                let _ = send_events(&tx, translator.finish()).await;
                                break;
                            }
                        }
                    }
                    _ = ping.tick() => {
                        if let Some(ping_event) = translator.ping() {
                            if !send_events(&tx, vec![ping_event]).await {
                                return;
                            }
                        }
                    }
                }
            }

            ledger.record_turn(translator.input_tokens(), translator.output_tokens());
            crate::metrics::record_tokens(
                &provider_name,
                translator.input_tokens(),
                translator.output_tokens(),
            );
            if let Some(ttft_ms) = timings.ttft_ms {
                crate::metrics::record_ttft(ttft_ms as f64 / 1000.0);
            }
        });

        Ok(MessagesOutcome::Stream(ReceiverStream::new(rx)))
    }

    /// Health probe and context-window discovery, once per provider.
    async fn ensure_provider_ready(
        &self,
        provider: &ProviderDescriptor,
        model: &str,
    ) -> Result<(), ProxyError> {
        let key = format!("{}@{}", provider.name, provider.base_url);
        let mut probed = self.probed.lock().await;
        if let Some(record) = probed.get(&key) {
            self.ledger.set_context_window(record.context_window);
            return Ok(());
        }

        let mut healthy = provider.health_paths.is_empty();
        for path in &provider.health_paths {
            let url = format!("{}{}", provider.base_url.trim_end_matches('/'), path);
            if self.client.probe(&url, HEALTH_PROBE_TIMEOUT).await {
                healthy = true;
                break;
            }
        }
        if !healthy {
            let hint = provider
                .start_command
                .as_deref()
                .map(|cmd| format!(" Start it with: {}", cmd))
                .unwrap_or_default();
            return Err(ProxyError::Connection(format!(
                "{} is not reachable at {}.{}",
                provider.name, provider.base_url, hint
            )));
        }

        let context_window = if provider.name == "ollama" {
            self.client
                .ollama_context_window(&provider.base_url, model)
                .await
                .unwrap_or(DEFAULT_CONTEXT_WINDOW)
        } else {
            DEFAULT_CONTEXT_WINDOW
        };
        info!(provider = %provider.name, context_window, "provider ready");
        self.ledger.set_context_window(context_window);
        probed.insert(key, ProbeRecord { context_window });
        Ok(())
    }
}

async fn send_events(
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    events: Vec<crate::models::anthropic::StreamEvent>,
) -> bool {
    for event in events {
        if tx.send(Ok(Bytes::from(event.to_sse()))).await.is_err() {
            debug!("client disconnected, suppressing further events");
            return false;
        }
    }
    true
}

fn request_has_images(request: &crate::models::openai::OpenAIRequest) -> bool {
    request.messages.iter().any(|message| match message {
        Message::User {
            content: MessageContent::Array(parts),
            ..
        } => parts
            .iter()
            .any(|p| matches!(p, crate::models::openai::ContentPart::ImageUrl { .. })),
        _ => false,
    })
}

/// Map a non-2xx upstream reply onto the client-facing taxonomy.
async fn read_upstream_error(
    provider: &ProviderDescriptor,
    model: &str,
    response: reqwest::Response,
) -> ProxyError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    map_upstream_error(provider, model, status, &body)
}

pub fn map_upstream_error(
    provider: &ProviderDescriptor,
    model: &str,
    status: u16,
    body: &str,
) -> ProxyError {
    let message = serde_json::from_str::<OpenAIErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    let lowered = message.to_ascii_lowercase();

    if status == 401 || status == 403 {
        return ProxyError::Authentication(message);
    }
    if status == 429 {
        return ProxyError::RateLimit(message);
    }
    if lowered.contains("not found") && (status == 404 || lowered.contains("model")) {
        let hint = if provider.name == "ollama" {
            format!(" Try: ollama pull {}", model)
        } else {
            String::new()
        };
        return ProxyError::ModelNotFound(format!(
            "model '{}' not found on {}.{}",
            model, provider.name, hint
        ));
    }
    if lowered.contains("does not support tools")
        || lowered.contains("tools are not supported")
        || lowered.contains("tool use is not supported")
        || lowered.contains("no tool support")
    {
        return ProxyError::Capability(format!(
            "{} cannot run this model with tools: {}. Pick a tool-capable model or retry without tools.",
            provider.name, message
        ));
    }
    if status == 503 || status == 529 || lowered.contains("overloaded") {
        return ProxyError::Overloaded(message);
    }
    ProxyError::Api { status, message }
}

/// Assemble a complete (non-streaming) reply from a finished completion.
fn complete_response(
    completion: OpenAIResponse,
    model: &str,
    cache: crate::usage::CacheOutcome,
) -> MessagesResponse {
    let mut content = Vec::new();
    let mut stop_reason = "end_turn".to_string();

    if let Some(choice) = completion.choices.into_iter().next() {
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            content.push(ResponseContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            let input = serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({}));
            content.push(ResponseContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input,
            });
        }
        if let Some(finish) = &choice.finish_reason {
            stop_reason = map_finish_reason(finish).to_string();
        }
    }

    let usage = completion.usage.unwrap_or_default();
    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: cache.cache_creation_input_tokens,
            cache_read_input_tokens: cache.cache_read_input_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderRegistry;

    fn ollama_provider() -> ProviderDescriptor {
        ProviderRegistry::new().resolve("ollama/qwen3:8b").0
    }

    #[test]
    fn model_not_found_gets_pull_hint() {
        let err = map_upstream_error(
            &ollama_provider(),
            "qwen3:8b",
            404,
            r#"{"error":{"message":"model 'qwen3:8b' not found"}}"#,
        );
        assert_eq!(err.error_type(), "model_not_found");
        assert!(err.to_string().contains("ollama pull qwen3:8b"));
    }

    #[test]
    fn tool_support_error_becomes_capability() {
        let err = map_upstream_error(
            &ollama_provider(),
            "llama2",
            400,
            r#"{"error":{"message":"registry.ollama.ai/library/llama2 does not support tools"}}"#,
        );
        assert_eq!(err.error_type(), "capability_error");
    }

    #[test]
    fn auth_and_rate_limit_statuses() {
        let provider = ollama_provider();
        assert_eq!(
            map_upstream_error(&provider, "m", 401, "nope").error_type(),
            "authentication_error"
        );
        assert_eq!(
            map_upstream_error(&provider, "m", 429, "slow down").error_type(),
            "rate_limit_error"
        );
        assert_eq!(
            map_upstream_error(&provider, "m", 503, "busy").error_type(),
            "overloaded_error"
        );
    }

    #[test]
    fn unknown_errors_keep_upstream_status() {
        let err = map_upstream_error(&ollama_provider(), "m", 418, "teapot");
        match err {
            ProxyError::Api { status, .. } => assert_eq!(status, 418),
            other => panic!("expected api error, got {:?}", other),
        }
    }

    #[test]
    fn complete_response_translates_tool_calls() {
        let completion: OpenAIResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "model": "m",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Checking.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "Read", "arguments": "{\"file_path\":\"x.rs\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
        }))
        .unwrap();

        let response = complete_response(
            completion,
            "claude-proxy",
            crate::usage::CacheOutcome::default(),
        );
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.usage.input_tokens, 12);
        match &response.content[1] {
            ResponseContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "Read");
                assert_eq!(input["file_path"], "x.rs");
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
    }
}
