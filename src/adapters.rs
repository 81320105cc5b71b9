use crate::models::openai::{
    DeltaMessage, OpenAIRequest, StreamingFunctionCall, StreamingToolCall,
};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Per-model-family hooks around the wire conversion.
///
/// `prepare_request` mutates the outbound payload before it is sent;
/// `transform_delta` inspects and rewrites inbound stream deltas;
/// `reset` clears any buffered state between requests.
pub trait ModelAdapter: Send {
    fn name(&self) -> &'static str;

    fn prepare_request(&self, _request: &mut OpenAIRequest) {}

    fn transform_delta(&mut self, _delta: &mut DeltaMessage) {}

    fn reset(&mut self) {}
}

/// Pick an adapter by model-family pattern.
pub fn adapter_for(model: &str) -> Box<dyn ModelAdapter> {
    let lowered = model.to_ascii_lowercase();
    let tail = lowered.rsplit('/').next().unwrap_or(&lowered);

    if (lowered.contains("qwen") && lowered.contains("coder")) || lowered.contains("hermes") {
        return Box::new(XmlToolCallAdapter::new());
    }
    if tail.starts_with("o1") || tail.starts_with("o3") || tail.starts_with("o4")
        || lowered.contains("gpt-5")
    {
        return Box::new(ReasoningParamsAdapter);
    }
    Box::new(DefaultAdapter)
}

pub struct DefaultAdapter;

impl ModelAdapter for DefaultAdapter {
    fn name(&self) -> &'static str {
        "default"
    }
}

/// o-series and gpt-5 family: `max_tokens` is rejected in favor of
/// `max_completion_tokens`, and only the default temperature is accepted.
pub struct ReasoningParamsAdapter;

impl ModelAdapter for ReasoningParamsAdapter {
    fn name(&self) -> &'static str {
        "reasoning-params"
    }

    fn prepare_request(&self, request: &mut OpenAIRequest) {
        if request.max_completion_tokens.is_none() {
            request.max_completion_tokens = request.max_tokens.take();
        }
        request.temperature = Some(1.0);
    }
}

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Qwen-coder style models emit tool calls as XML markup inside the text
/// stream instead of native tool_calls deltas:
///
/// `<tool_call><function=NAME><parameter=KEY>VALUE</parameter></function></tool_call>`
///
/// This adapter buffers text deltas, cuts the markup out, and replaces it
/// with synthetic native tool-call fragments.
pub struct XmlToolCallAdapter {
    pending: String,
    in_tool_call: bool,
    next_slot: usize,
}

impl XmlToolCallAdapter {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            in_tool_call: false,
            next_slot: 0,
        }
    }
}

impl Default for XmlToolCallAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelAdapter for XmlToolCallAdapter {
    fn name(&self) -> &'static str {
        "xml-tool-call"
    }

    fn transform_delta(&mut self, delta: &mut DeltaMessage) {
        let Some(content) = delta.content.take() else {
            return;
        };
        self.pending.push_str(&content);

        let mut passthrough = String::new();
        let mut synthetic: Vec<StreamingToolCall> = Vec::new();

        loop {
            if self.in_tool_call {
                match self.pending.find(TOOL_CALL_CLOSE) {
                    Some(end) => {
                        let segment_end = end + TOOL_CALL_CLOSE.len();
                        let segment = self.pending[..segment_end].to_string();
                        self.pending.drain(..segment_end);
                        self.in_tool_call = false;
                        if let Some(call) = parse_tool_call_segment(&segment, self.next_slot) {
                            debug!(slot = self.next_slot, "extracted tool call from text");
                            self.next_slot += 1;
                            synthetic.push(call);
                        } else {
                            warn!("unparseable tool-call markup, passing through as text");
                            passthrough.push_str(&segment);
                        }
                    }
                    None => break,
                }
            } else {
                match self.pending.find(TOOL_CALL_OPEN) {
                    Some(start) => {
                        passthrough.push_str(&self.pending[..start]);
                        self.pending.drain(..start);
                        self.in_tool_call = true;
                    }
                    None => {
                        // Hold back any suffix that could be the start of
                        // a marker split across chunks.
                        let hold = partial_marker_len(&self.pending);
                        let emit_to = self.pending.len() - hold;
                        passthrough.push_str(&self.pending[..emit_to]);
                        self.pending.drain(..emit_to);
                        break;
                    }
                }
            }
        }

        if !passthrough.is_empty() {
            delta.content = Some(passthrough);
        }
        if !synthetic.is_empty() {
            delta
                .tool_calls
                .get_or_insert_with(Vec::new)
                .extend(synthetic);
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.in_tool_call = false;
        self.next_slot = 0;
    }
}

/// Longest suffix of `s` that is a proper prefix of the opening marker.
fn partial_marker_len(s: &str) -> usize {
    let max = TOOL_CALL_OPEN.len().min(s.len());
    for len in (1..=max).rev() {
        if !s.is_char_boundary(s.len() - len) {
            continue;
        }
        if TOOL_CALL_OPEN.starts_with(&s[s.len() - len..]) {
            return len;
        }
    }
    0
}

fn parse_tool_call_segment(segment: &str, slot: usize) -> Option<StreamingToolCall> {
    static FUNCTION_RE: OnceLock<Regex> = OnceLock::new();
    static PARAM_RE: OnceLock<Regex> = OnceLock::new();
    let function_re = FUNCTION_RE.get_or_init(|| Regex::new(r"<function=([^>]+)>").unwrap());
    let param_re = PARAM_RE
        .get_or_init(|| Regex::new(r"(?s)<parameter=([^>]+)>(.*?)</parameter>").unwrap());

    let name = function_re.captures(segment)?[1].trim().to_string();

    let mut args = serde_json::Map::new();
    for capture in param_re.captures_iter(segment) {
        let key = capture[1].trim().to_string();
        let raw = capture[2].trim();
        // Parameters are untyped in the markup: take JSON when it parses,
        // otherwise a string.
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        args.insert(key, value);
    }

    let arguments = serde_json::to_string(&serde_json::Value::Object(args)).ok()?;
    Some(StreamingToolCall {
        index: Some(slot),
        id: None,
        tool_type: Some("function".to_string()),
        function: StreamingFunctionCall {
            name: Some(name),
            arguments,
        },
    })
}
