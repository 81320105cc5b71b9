use crate::dispatch::{Dispatcher, MessagesOutcome, SseFrameStream};
use crate::error::ProxyError;
use crate::models::anthropic::{CountTokensResponse, MessagesRequest, ModelInfo, ModelList};
use crate::monitor::MonitorProxy;
use crate::usage::estimate_tokens_from_bytes;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// When set, every request is rerouted to this model regardless of
    /// what the client asked for.
    pub model: Option<String>,
    pub monitor: Option<Arc<MonitorProxy>>,
    pub metrics_handle: Option<Arc<PrometheusHandle>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .route("/v1/models", get(models))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    if let Some(beta) = headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) {
        debug!(beta, "anthropic-beta header present");
    }

    if let Some(monitor) = &state.monitor {
        return monitor.forward(&headers, body).await;
    }

    let mut request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::Validation(format!("invalid request body: {}", e)))?;
    if let Some(model) = &state.model {
        request.model = model.clone();
    }

    match state.dispatcher.handle_messages(request).await? {
        MessagesOutcome::Complete(response) => Ok(Json(response).into_response()),
        MessagesOutcome::Stream(stream) => Ok(sse_response(stream)),
    }
}

fn sse_response(stream: SseFrameStream) -> Response {
    (
        StatusCode::OK,
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

/// The client only needs a ballpark here; 4 bytes per token over the raw
/// request body matches the estimate used everywhere else.
async fn count_tokens(body: Bytes) -> Json<CountTokensResponse> {
    Json(CountTokensResponse {
        input_tokens: estimate_tokens_from_bytes(body.len()),
    })
}

async fn models(State(state): State<AppState>) -> Json<ModelList> {
    let id = state.model.unwrap_or_else(|| "claudish".to_string());
    Json(ModelList {
        data: vec![ModelInfo {
            r#type: "model".to_string(),
            display_name: id.clone(),
            id,
            created_at: chrono::Utc::now().to_rfc3339(),
        }],
        has_more: false,
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
