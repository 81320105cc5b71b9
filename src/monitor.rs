use crate::error::ProxyError;
use crate::logging::JsonLinesLogger;
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use regex::Regex;
use std::convert::Infallible;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

const VENDOR_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Pass-through to the real vendor endpoint with both directions captured
/// for fixture extraction. The translator is bypassed entirely.
pub struct MonitorProxy {
    client: reqwest::Client,
    logger: Option<Arc<JsonLinesLogger>>,
    endpoint: String,
}

impl MonitorProxy {
    pub fn new(logger: Option<Arc<JsonLinesLogger>>) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(ProxyError::from_transport)?;
        Ok(Self {
            client,
            logger,
            endpoint: VENDOR_MESSAGES_URL.to_string(),
        })
    }

    pub async fn forward(&self, headers: &HeaderMap, body: Bytes) -> Result<Response, ProxyError> {
        let request_id = format!("req_{}", uuid::Uuid::new_v4().simple());

        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| header_value(headers, "x-api-key"))
            .or_else(|| {
                header_value(headers, "authorization")
                    .and_then(|v| v.strip_prefix("Bearer ").map(|t| t.to_string()))
            })
            .ok_or_else(|| {
                ProxyError::Authentication(
                    "ANTHROPIC_API_KEY is not set; monitor mode forwards to the real endpoint"
                        .to_string(),
                )
            })?;
        let version = header_value(headers, "anthropic-version")
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string());

        if let Some(logger) = &self.logger {
            let body_json: serde_json::Value =
                serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
            logger.log_client_request(
                "/v1/messages",
                &redact_value(body_json),
                &request_id,
                true,
            );
        }

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", version);
        if let Some(beta) = header_value(headers, "anthropic-beta") {
            builder = builder.header("anthropic-beta", beta);
        }
        let upstream = builder
            .body(body)
            .send()
            .await
            .map_err(ProxyError::from_transport)?;

        let status = upstream.status();
        info!(%status, request_id = %request_id, "monitor pass-through");

        let content_type = upstream
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/json")
            .to_string();

        if !content_type.starts_with("text/event-stream") {
            let body = upstream
                .bytes()
                .await
                .map_err(ProxyError::from_transport)?;
            if let Some(logger) = &self.logger {
                if status.is_success() {
                    let body_json: serde_json::Value =
                        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
                    logger.log_upstream_response(
                        "/v1/messages",
                        status.as_u16(),
                        &redact_value(body_json),
                        &request_id,
                    );
                } else {
                    logger.log_error(
                        "/v1/messages",
                        &redact(&String::from_utf8_lossy(&body)),
                        error_type_for_status(status.as_u16()),
                        &request_id,
                    );
                }
            }
            return Ok((
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                [("content-type", content_type)],
                body,
            )
                .into_response());
        }

        // Tee the SSE bytes: forward untouched, capture redacted.
        let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(16);
        let logger = self.logger.clone();
        let mut stream = upstream.bytes_stream();
        tokio::spawn(async move {
            let mut capture = String::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        capture.push_str(&String::from_utf8_lossy(&bytes));
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "monitor upstream stream failed");
                        break;
                    }
                }
            }
            if let Some(logger) = logger {
                logger.log_stream_events(
                    "/v1/messages",
                    extract_event_lines(&capture),
                    &request_id,
                );
            }
        });

        Ok((
            StatusCode::OK,
            [
                ("content-type", "text/event-stream".to_string()),
                ("cache-control", "no-cache".to_string()),
            ],
            Body::from_stream(ReceiverStream::new(rx)),
        )
            .into_response())
    }
}

fn error_type_for_status(status: u16) -> &'static str {
    match status {
        401 | 403 => "authentication_error",
        404 => "model_not_found",
        429 => "rate_limit_error",
        529 => "overloaded_error",
        _ => "api_error",
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Replace dynamic identifiers with stable placeholders so captured
/// fixtures compare reproducibly across runs.
pub fn redact(text: &str) -> String {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            (Regex::new(r"msg_[A-Za-z0-9]+").unwrap(), "msg_REDACTED"),
            (Regex::new(r"toolu_[A-Za-z0-9]+").unwrap(), "toolu_REDACTED"),
            (Regex::new(r"req_[A-Za-z0-9]+").unwrap(), "req_REDACTED"),
        ]
    });
    let mut result = text.to_string();
    for (pattern, placeholder) in patterns {
        result = pattern.replace_all(&result, *placeholder).to_string();
    }
    result
}

fn redact_value(value: serde_json::Value) -> serde_json::Value {
    let text = serde_json::to_string(&value).unwrap_or_default();
    serde_json::from_str(&redact(&text)).unwrap_or(value)
}

/// Pull redacted `event: ...\ndata: ...` records out of a captured body.
fn extract_event_lines(capture: &str) -> Vec<String> {
    capture
        .split("\n\n")
        .filter(|frame| !frame.trim().is_empty())
        .map(|frame| redact(frame.trim()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_stabilizes_dynamic_ids() {
        let input = r#"{"id":"msg_01AbC123","content":[{"type":"tool_use","id":"toolu_9XyZ"}]}"#;
        let redacted = redact(input);
        assert!(redacted.contains("msg_REDACTED"));
        assert!(redacted.contains("toolu_REDACTED"));
        assert!(!redacted.contains("msg_01AbC123"));
    }

    #[test]
    fn upstream_statuses_map_to_error_types() {
        assert_eq!(error_type_for_status(401), "authentication_error");
        assert_eq!(error_type_for_status(404), "model_not_found");
        assert_eq!(error_type_for_status(429), "rate_limit_error");
        assert_eq!(error_type_for_status(500), "api_error");
    }

    #[test]
    fn event_extraction_splits_frames() {
        let capture = "event: message_start\ndata: {\"id\":\"msg_123\"}\n\nevent: ping\ndata: {}\n\n";
        let events = extract_event_lines(capture);
        assert_eq!(events.len(), 2);
        assert!(events[0].starts_with("event: message_start"));
        assert!(events[0].contains("msg_REDACTED"));
    }
}
