use crate::models::anthropic::{
    CacheCreation, Delta, DeltaUsage, MessageDeltaData, StreamContentBlock, StreamEvent,
};
use crate::models::openai::OpenAIStreamResponse;
use crate::usage::CacheOutcome;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where chain-of-thought fragments go when a backend streams them in a
/// separate delta field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningPolicy {
    /// Route through the text block; visible to the user. Default.
    AsText,
    /// Dedicated thinking block, closed before any text or tool block.
    AsThinking,
    /// Drop the fragments.
    Suppress,
}

impl ReasoningPolicy {
    pub fn from_env() -> Self {
        match std::env::var("CLAUDISH_REASONING_POLICY").as_deref() {
            Ok("as_thinking") => ReasoningPolicy::AsThinking,
            Ok("suppress") => ReasoningPolicy::Suppress,
            _ => ReasoningPolicy::AsText,
        }
    }
}

#[derive(Debug)]
struct ToolBlockState {
    block_index: usize,
    id: String,
    name: String,
    arg_chars: String,
    closed: bool,
}

/// Translates an OpenAI delta stream into the block-oriented event
/// sequence the client validates.
///
/// Modeled as a step function: each upstream chunk produces zero or more
/// events, in the exact order they must reach the wire. The caller owns
/// the writer; nothing here suspends.
pub struct StreamTranslator {
    message_id: String,
    model: String,
    reasoning_policy: ReasoningPolicy,
    cache: CacheOutcome,

    started: bool,
    finished: bool,
    next_block_index: usize,
    text_block: Option<usize>,
    thinking_block: Option<usize>,
    /// Keyed by the backend's tool slot, not by block index.
    tool_blocks: HashMap<usize, ToolBlockState>,
    last_tool_slot: usize,

    input_tokens_seen: u32,
    output_tokens_seen: u32,
    output_chars: usize,
    stop_reason: Option<String>,
}

impl StreamTranslator {
    pub fn new(model: impl Into<String>, policy: ReasoningPolicy, cache: CacheOutcome) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.into(),
            reasoning_policy: policy,
            cache,
            started: false,
            finished: false,
            next_block_index: 0,
            text_block: None,
            thinking_block: None,
            tool_blocks: HashMap::new(),
            last_tool_slot: 0,
            input_tokens_seen: 0,
            output_tokens_seen: 0,
            output_chars: 0,
            stop_reason: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Token counts for accounting: backend-reported where available,
    /// otherwise output estimated from character count.
    pub fn input_tokens(&self) -> u32 {
        self.input_tokens_seen
    }

    pub fn output_tokens(&self) -> u32 {
        if self.output_tokens_seen > 0 {
            self.output_tokens_seen
        } else {
            (self.output_chars / 4) as u32
        }
    }

    /// Keep-alive, valid only between message_start and message_stop.
    pub fn ping(&self) -> Option<StreamEvent> {
        (self.started && !self.finished).then_some(StreamEvent::Ping)
    }

    /// Feed one upstream chunk; returns the events to write, in order.
    pub fn step(&mut self, chunk: &OpenAIStreamResponse) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }

        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(usage) = &chunk.usage {
            if usage.prompt_tokens > 0 {
                self.input_tokens_seen = usage.prompt_tokens;
            }
            if usage.completion_tokens > 0 {
                self.output_tokens_seen = usage.completion_tokens;
            }
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        let delta = &choice.delta;

        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            self.emit_text(content, &mut events);
        } else if let Some(reasoning) = delta.reasoning_fragment() {
            let reasoning = reasoning.to_string();
            match self.reasoning_policy {
                ReasoningPolicy::AsText => self.emit_text(&reasoning, &mut events),
                ReasoningPolicy::AsThinking => self.emit_thinking(&reasoning, &mut events),
                ReasoningPolicy::Suppress => {}
            }
        }

        if let Some(tool_calls) = &delta.tool_calls {
            for entry in tool_calls {
                let slot = entry.index.unwrap_or(self.last_tool_slot);
                self.last_tool_slot = slot;

                if !self.tool_blocks.contains_key(&slot) {
                    self.close_text_block(&mut events);
                    self.close_thinking_block(&mut events);

                    let block_index = self.next_block_index;
                    self.next_block_index += 1;
                    let id = entry
                        .id
                        .clone()
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("toolu_{}", Uuid::new_v4().simple()));
                    let name = entry.function.name.clone().unwrap_or_default();

                    events.push(StreamEvent::ContentBlockStart {
                        index: block_index,
                        content_block: StreamContentBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: serde_json::json!({}),
                        },
                    });
                    self.tool_blocks.insert(
                        slot,
                        ToolBlockState {
                            block_index,
                            id,
                            name,
                            arg_chars: String::new(),
                            closed: false,
                        },
                    );
                } else if let Some(name) = &entry.function.name {
                    // Fragmented names concatenate into the record.
                    if let Some(state) = self.tool_blocks.get_mut(&slot) {
                        state.name.push_str(name);
                    }
                }

                if !entry.function.arguments.is_empty() {
                    if let Some(state) = self.tool_blocks.get_mut(&slot) {
                        if !state.closed {
                            state.arg_chars.push_str(&entry.function.arguments);
                            self.output_chars += entry.function.arguments.len();
                            events.push(StreamEvent::ContentBlockDelta {
                                index: state.block_index,
                                delta: Delta::InputJsonDelta {
                                    partial_json: entry.function.arguments.clone(),
                                },
                            });
                        }
                    }
                }
            }
        }

        if let Some(finish) = &choice.finish_reason {
            self.stop_reason = Some(map_finish_reason(finish).to_string());
            self.emit_terminal(&mut events);
        }

        events
    }

    /// Terminal sequence for a stream that ended with `[DONE]` before any
    /// finish_reason arrived. Idempotent.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.ensure_started(&mut events);
        self.emit_terminal(&mut events);
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<StreamEvent>) {
        if !self.started {
            self.started = true;
            events.push(StreamEvent::message_start(
                self.message_id.clone(),
                self.model.clone(),
            ));
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        self.output_chars += text.len();
        let index = match self.text_block {
            Some(index) => index,
            None => {
                // A thinking block never stays open past the first text,
                // and deltas for distinct blocks must not interleave.
                self.close_thinking_block(events);
                self.close_tool_blocks(events);
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.text_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: StreamContentBlock::Text {
                        text: String::new(),
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_thinking(&mut self, thinking: &str, events: &mut Vec<StreamEvent>) {
        // Once visible text has started, late reasoning fragments join it
        // rather than opening an out-of-order thinking block.
        if self.text_block.is_some() {
            self.emit_text(thinking, events);
            return;
        }
        self.output_chars += thinking.len();
        let index = match self.thinking_block {
            Some(index) => index,
            None => {
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.thinking_block = Some(index);
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: StreamContentBlock::Thinking {
                        thinking: String::new(),
                    },
                });
                index
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    fn close_text_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.text_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_thinking_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.thinking_block.take() {
            events.push(StreamEvent::ContentBlockStop { index });
        }
    }

    fn close_tool_blocks(&mut self, events: &mut Vec<StreamEvent>) {
        let mut tool_blocks: Vec<&mut ToolBlockState> = self.tool_blocks.values_mut().collect();
        tool_blocks.sort_by_key(|state| state.block_index);
        for state in tool_blocks {
            if state.closed {
                continue;
            }
            if !state.arg_chars.is_empty() {
                if let Err(err) = serde_json::from_str::<serde_json::Value>(&state.arg_chars) {
                    warn!(
                        tool = %state.name,
                        id = %state.id,
                        %err,
                        "tool arguments did not assemble into valid JSON"
                    );
                }
            }
            events.push(StreamEvent::ContentBlockStop {
                index: state.block_index,
            });
            state.closed = true;
        }
    }

    fn emit_terminal(&mut self, events: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        self.finished = true;

        self.close_tool_blocks(events);
        self.close_thinking_block(events);
        self.close_text_block(events);

        let stop_reason = self
            .stop_reason
            .clone()
            .unwrap_or_else(|| "end_turn".to_string());
        debug!(stop_reason = %stop_reason, output_tokens = self.output_tokens(), "stream complete");

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaData {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.final_usage(),
        });
        events.push(StreamEvent::MessageStop);
    }

    fn final_usage(&self) -> DeltaUsage {
        let creation = self.cache.cache_creation_input_tokens;
        DeltaUsage {
            input_tokens: Some(self.input_tokens_seen),
            output_tokens: self.output_tokens(),
            cache_creation_input_tokens: Some(creation),
            cache_read_input_tokens: Some(self.cache.cache_read_input_tokens),
            cache_creation: (creation > 0).then_some(CacheCreation {
                ephemeral_5m_input_tokens: creation,
            }),
        }
    }
}

/// Map upstream finish reasons onto the client's stop_reason vocabulary.
pub fn map_finish_reason(reason: &str) -> &'static str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "stop_sequence",
        _ => "end_turn",
    }
}
