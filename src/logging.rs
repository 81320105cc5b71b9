use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;

/// One captured exchange direction, appended as a JSON line. Monitor mode
/// writes these for offline fixture extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResponseLog {
    pub timestamp: String,
    pub direction: String, // "client_request", "upstream_response", "stream_events", "error"
    pub endpoint: String,
    pub body: serde_json::Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_events: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl RequestResponseLog {
    fn new(direction: &str, endpoint: &str, body: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            direction: direction.to_string(),
            endpoint: endpoint.to_string(),
            body,
            status_code: None,
            error: None,
            error_type: None,
            is_streaming: None,
            stream_events: None,
            request_id: None,
        }
    }
}

pub struct JsonLinesLogger {
    file_path: String,
}

impl JsonLinesLogger {
    pub fn new(file_path: String) -> Self {
        Self { file_path }
    }

    pub fn log(&self, entry: RequestResponseLog) -> Result<(), std::io::Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let json_line = serde_json::to_string(&entry)?;
        writeln!(file, "{}", json_line)?;
        Ok(())
    }

    pub fn log_client_request(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        request_id: &str,
        is_streaming: bool,
    ) {
        let mut entry = RequestResponseLog::new("client_request", endpoint, body.clone());
        entry.request_id = Some(request_id.to_string());
        entry.is_streaming = Some(is_streaming);
        if let Err(e) = self.log(entry) {
            tracing::warn!(%e, "failed to log client request");
        }
    }

    pub fn log_upstream_response(
        &self,
        endpoint: &str,
        status_code: u16,
        body: &serde_json::Value,
        request_id: &str,
    ) {
        let mut entry = RequestResponseLog::new("upstream_response", endpoint, body.clone());
        entry.status_code = Some(status_code);
        entry.request_id = Some(request_id.to_string());
        if let Err(e) = self.log(entry) {
            tracing::warn!(%e, "failed to log upstream response");
        }
    }

    /// The reconstructed SSE event sequence of one streamed reply.
    pub fn log_stream_events(&self, endpoint: &str, events: Vec<String>, request_id: &str) {
        let mut entry = RequestResponseLog::new(
            "stream_events",
            endpoint,
            serde_json::json!({ "event_count": events.len() }),
        );
        entry.is_streaming = Some(true);
        entry.stream_events = Some(events);
        entry.request_id = Some(request_id.to_string());
        if let Err(e) = self.log(entry) {
            tracing::warn!(%e, "failed to log stream events");
        }
    }

    pub fn log_error(
        &self,
        endpoint: &str,
        error_message: &str,
        error_type: &str,
        request_id: &str,
    ) {
        let mut entry = RequestResponseLog::new("error", endpoint, serde_json::json!({}));
        entry.error = Some(error_message.to_string());
        entry.error_type = Some(error_type.to_string());
        entry.request_id = Some(request_id.to_string());
        if let Err(e) = self.log(entry) {
            tracing::warn!(%e, "failed to log error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");
        let logger = JsonLinesLogger::new(path.to_string_lossy().to_string());

        logger.log_client_request(
            "/v1/messages",
            &serde_json::json!({"model": "m"}),
            "req-1",
            true,
        );
        logger.log_stream_events(
            "/v1/messages",
            vec!["message_start".to_string(), "message_stop".to_string()],
            "req-1",
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: RequestResponseLog = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.direction, "client_request");
        assert_eq!(first.request_id.as_deref(), Some("req-1"));

        let second: RequestResponseLog = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.stream_events.as_ref().unwrap().len(), 2);
    }
}
