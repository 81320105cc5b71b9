use crate::error::ProxyError;
use crate::models::anthropic::{
    ContentBlock, MessageContent, MessagesRequest, SystemPrompt, Tool as AnthropicTool,
    ToolChoice as AnthropicToolChoice,
};
use crate::models::openai::{
    ContentPart, Function, FunctionCall, FunctionChoice, ImageUrl, Message, MessageContent as OpenAIMessageContent,
    OpenAIRequest, StreamOptions, Tool, ToolCall, ToolChoice,
};
use regex::Regex;
use std::sync::OnceLock;

/// Result of converting a client request for the chat-completions wire.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub request: OpenAIRequest,
    /// Top-level request fields with no OpenAI equivalent, surfaced in logs.
    pub dropped_params: Vec<String>,
}

/// Convert a /v1/messages body into a chat-completions payload.
///
/// Pure function of its input: system content is folded into a leading
/// system message, content blocks are flattened and reordered into the
/// role-per-message shape OpenAI expects, and tool declarations are
/// rewritten as function declarations.
pub fn to_openai_request(request: &MessagesRequest) -> Result<TransformedRequest, ProxyError> {
    if request.messages.is_empty() {
        return Err(ProxyError::Validation(
            "messages: at least one message is required".to_string(),
        ));
    }

    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(Message::System {
                role: "system".to_string(),
                content: text,
            });
        }
    }

    for message in &request.messages {
        match message.role.as_str() {
            "user" => flatten_user_message(&message.content, &mut messages)?,
            "assistant" => flatten_assistant_message(&message.content, &mut messages)?,
            other => {
                return Err(ProxyError::Validation(format!(
                    "messages: unsupported role '{}'",
                    other
                )));
            }
        }
    }

    let tools = request
        .tools
        .as_ref()
        .filter(|tools| !tools.is_empty())
        .map(|tools| tools.iter().map(convert_tool).collect::<Vec<_>>());

    let tool_choice = match &request.tool_choice {
        Some(choice) if tools.is_some() => Some(convert_tool_choice(choice)),
        _ => None,
    };

    let stream = request.stream.unwrap_or(false);

    let openai_request = OpenAIRequest {
        model: request.model.clone(),
        messages,
        temperature: Some(request.temperature.unwrap_or(1.0)),
        top_p: request.top_p,
        stream: Some(stream),
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
        stop: request
            .stop_sequences
            .clone()
            .filter(|stops| !stops.is_empty()),
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        tools,
        tool_choice,
    };

    let mut dropped_params: Vec<String> = request.extra.keys().cloned().collect();
    dropped_params.sort();

    Ok(TransformedRequest {
        request: openai_request,
        dropped_params,
    })
}

fn flatten_user_message(
    content: &MessageContent,
    messages: &mut Vec<Message>,
) -> Result<(), ProxyError> {
    let blocks = match content {
        MessageContent::Text(text) => {
            messages.push(Message::User {
                role: "user".to_string(),
                content: OpenAIMessageContent::Text(text.clone()),
            });
            return Ok(());
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    // Tool results must directly follow the assistant tool_calls message,
    // so they are emitted before any remaining user content.
    let mut text_parts: Vec<String> = Vec::new();
    let mut image_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = content.as_ref().map(|c| c.as_text()).unwrap_or_default();
                let text = if is_error.unwrap_or(false) {
                    format!("Error: {}", text)
                } else {
                    text
                };
                messages.push(Message::Tool {
                    role: "tool".to_string(),
                    content: text,
                    tool_call_id: tool_use_id.clone(),
                });
            }
            ContentBlock::Text { text } => text_parts.push(text.clone()),
            ContentBlock::Image { source } => {
                image_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{};base64,{}", source.media_type, source.data),
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolUse { .. } => {
                return Err(ProxyError::Validation(
                    "messages: tool_use block on a user message".to_string(),
                ));
            }
            ContentBlock::Thinking { .. } => {}
        }
    }

    if image_parts.is_empty() && text_parts.is_empty() {
        return Ok(());
    }

    let content = if image_parts.is_empty() {
        OpenAIMessageContent::Text(text_parts.join("\n"))
    } else {
        let mut parts: Vec<ContentPart> = text_parts
            .into_iter()
            .map(|text| ContentPart::Text { text })
            .collect();
        parts.extend(image_parts);
        OpenAIMessageContent::Array(parts)
    };

    messages.push(Message::User {
        role: "user".to_string(),
        content,
    });
    Ok(())
}

fn flatten_assistant_message(
    content: &MessageContent,
    messages: &mut Vec<Message>,
) -> Result<(), ProxyError> {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    match content {
        MessageContent::Text(t) => text.push_str(t),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlock::Text { text: t } => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall {
                            id: id.clone(),
                            tool_type: "function".to_string(),
                            function: FunctionCall {
                                name: sanitize_tool_name(name),
                                arguments: serde_json::to_string(input)?,
                            },
                        });
                    }
                    // Thinking has no wire equivalent; replaying it would
                    // double the model's context.
                    ContentBlock::Thinking { .. } => {}
                    ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } => {
                        return Err(ProxyError::Validation(
                            "messages: unsupported block on an assistant message".to_string(),
                        ));
                    }
                }
            }
        }
    }

    // Swapping the backing model must not leak the original vendor's
    // identity from replayed turns.
    if tool_calls.is_empty() && is_identity_preamble(&text) {
        return Ok(());
    }

    if text.is_empty() && tool_calls.is_empty() {
        return Ok(());
    }

    messages.push(Message::Assistant {
        role: "assistant".to_string(),
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
    });
    Ok(())
}

fn convert_tool(tool: &AnthropicTool) -> Tool {
    Tool {
        tool_type: "function".to_string(),
        function: Function {
            name: sanitize_tool_name(&tool.name),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        },
    }
}

fn convert_tool_choice(choice: &AnthropicToolChoice) -> ToolChoice {
    match choice {
        AnthropicToolChoice::Auto => ToolChoice::Mode("auto".to_string()),
        AnthropicToolChoice::None => ToolChoice::Mode("none".to_string()),
        AnthropicToolChoice::Any => ToolChoice::Mode("required".to_string()),
        AnthropicToolChoice::Tool { name } => ToolChoice::Function {
            choice_type: "function".to_string(),
            function: FunctionChoice {
                name: sanitize_tool_name(name),
            },
        },
    }
}

/// Function names must match `[A-Za-z0-9_-]{1,64}` on the OpenAI side.
pub fn sanitize_tool_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| Regex::new(r"[^A-Za-z0-9_-]").unwrap());
    let sanitized = invalid.replace_all(name, "_");
    sanitized.chars().take(64).collect()
}

/// Matches assistant turns that are nothing but a self-introduction from
/// the original vendor's model.
fn is_identity_preamble(text: &str) -> bool {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?i)^\s*I(?:'|’)?m Claude\b").unwrap(),
            Regex::new(r"(?i)^\s*I am Claude\b").unwrap(),
            Regex::new(r"(?i)^\s*(?:This is )?Claude,? (?:an AI assistant )?(?:made|created) by Anthropic\b").unwrap(),
        ]
    });
    let trimmed = text.trim();
    trimmed.len() < 300 && patterns.iter().any(|p| p.is_match(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::anthropic::{Message as AnthropicMessage, ToolResultContent};
    use serde_json::json;
    use std::collections::HashMap;

    fn simple_request(messages: Vec<AnthropicMessage>) -> MessagesRequest {
        MessagesRequest {
            model: "test-model".to_string(),
            max_tokens: 100,
            messages,
            system: None,
            temperature: None,
            top_p: None,
            stream: Some(true),
            stop_sequences: None,
            tools: None,
            tool_choice: None,
            metadata: None,
            extra: HashMap::new(),
        }
    }

    fn user_text(text: &str) -> AnthropicMessage {
        AnthropicMessage {
            role: "user".to_string(),
            content: MessageContent::Text(text.to_string()),
        }
    }

    #[test]
    fn empty_messages_is_a_validation_error() {
        let err = to_openai_request(&simple_request(vec![])).unwrap_err();
        assert_eq!(err.error_type(), "validation_error");
    }

    #[test]
    fn system_string_becomes_leading_system_message() {
        let mut request = simple_request(vec![user_text("hi")]);
        request.system = Some(SystemPrompt::Text("You are terse.".to_string()));
        let out = to_openai_request(&request).unwrap();
        assert_eq!(out.request.messages.len(), 2);
        match &out.request.messages[0] {
            Message::System { content, .. } => assert_eq!(content, "You are terse."),
            other => panic!("expected system message, got {:?}", other),
        }
    }

    #[test]
    fn system_blocks_join_with_blank_lines() {
        let mut request = simple_request(vec![user_text("hi")]);
        request.system = Some(SystemPrompt::Blocks(vec![
            crate::models::anthropic::SystemContent {
                r#type: "text".to_string(),
                text: "First.".to_string(),
            },
            crate::models::anthropic::SystemContent {
                r#type: "text".to_string(),
                text: "Second.".to_string(),
            },
        ]));
        let out = to_openai_request(&request).unwrap();
        match &out.request.messages[0] {
            Message::System { content, .. } => assert_eq!(content, "First.\n\nSecond."),
            other => panic!("expected system message, got {:?}", other),
        }
    }

    #[test]
    fn tool_results_come_before_user_text() {
        let request = simple_request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Keep going.".to_string(),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "toolu_1".to_string(),
                    content: Some(ToolResultContent::Text("file contents".to_string())),
                    is_error: None,
                },
            ]),
        }]);
        let out = to_openai_request(&request).unwrap();
        assert_eq!(out.request.messages.len(), 2);
        match &out.request.messages[0] {
            Message::Tool {
                content,
                tool_call_id,
                ..
            } => {
                assert_eq!(content, "file contents");
                assert_eq!(tool_call_id, "toolu_1");
            }
            other => panic!("expected tool message first, got {:?}", other),
        }
        match &out.request.messages[1] {
            Message::User { content, .. } => match content {
                OpenAIMessageContent::Text(text) => assert_eq!(text, "Keep going."),
                other => panic!("expected plain text, got {:?}", other),
            },
            other => panic!("expected user message second, got {:?}", other),
        }
    }

    #[test]
    fn error_results_get_a_prefix() {
        let request = simple_request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_2".to_string(),
                content: Some(ToolResultContent::Text("no such file".to_string())),
                is_error: Some(true),
            }]),
        }]);
        let out = to_openai_request(&request).unwrap();
        match &out.request.messages[0] {
            Message::Tool { content, .. } => assert_eq!(content, "Error: no such file"),
            other => panic!("expected tool message, got {:?}", other),
        }
    }

    #[test]
    fn assistant_tool_use_rides_with_adjacent_text() {
        let request = simple_request(vec![AnthropicMessage {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Let me check.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_3".to_string(),
                    name: "Read".to_string(),
                    input: json!({"file_path": "x.rs"}),
                },
            ]),
        }]);
        let out = to_openai_request(&request).unwrap();
        assert_eq!(out.request.messages.len(), 1);
        match &out.request.messages[0] {
            Message::Assistant {
                content,
                tool_calls,
                ..
            } => {
                assert_eq!(content.as_deref(), Some("Let me check."));
                let calls = tool_calls.as_ref().unwrap();
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "toolu_3");
                assert_eq!(calls[0].function.name, "Read");
                let parsed: serde_json::Value =
                    serde_json::from_str(&calls[0].function.arguments).unwrap();
                assert_eq!(parsed, json!({"file_path": "x.rs"}));
            }
            other => panic!("expected assistant message, got {:?}", other),
        }
    }

    #[test]
    fn user_images_become_data_urls() {
        let request = simple_request(vec![AnthropicMessage {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "what is this".to_string(),
                },
                ContentBlock::Image {
                    source: crate::models::anthropic::ImageSource {
                        r#type: "base64".to_string(),
                        media_type: "image/png".to_string(),
                        data: "AAAA".to_string(),
                    },
                },
            ]),
        }]);
        let out = to_openai_request(&request).unwrap();
        match &out.request.messages[0] {
            Message::User {
                content: OpenAIMessageContent::Array(parts),
                ..
            } => {
                assert_eq!(parts.len(), 2);
                match &parts[1] {
                    ContentPart::ImageUrl { image_url } => {
                        assert_eq!(image_url.url, "data:image/png;base64,AAAA");
                    }
                    other => panic!("expected image part, got {:?}", other),
                }
            }
            other => panic!("expected multipart user message, got {:?}", other),
        }
    }

    #[test]
    fn identity_preamble_turns_are_removed() {
        let request = simple_request(vec![
            user_text("who are you"),
            AnthropicMessage {
                role: "assistant".to_string(),
                content: MessageContent::Text(
                    "I'm Claude, an AI assistant made by Anthropic.".to_string(),
                ),
            },
            user_text("ok"),
        ]);
        let out = to_openai_request(&request).unwrap();
        assert!(out
            .request
            .messages
            .iter()
            .all(|m| m.role() != "assistant"));
    }

    #[test]
    fn tool_names_are_sanitized() {
        assert_eq!(sanitize_tool_name("mcp__server.tool"), "mcp__server_tool");
        assert_eq!(sanitize_tool_name("Read"), "Read");
        let long = "a".repeat(80);
        assert_eq!(sanitize_tool_name(&long).len(), 64);
    }

    #[test]
    fn temperature_defaults_and_stream_options_follow_stream() {
        let out = to_openai_request(&simple_request(vec![user_text("hi")])).unwrap();
        assert_eq!(out.request.temperature, Some(1.0));
        assert!(out.request.stream_options.is_some());

        let mut request = simple_request(vec![user_text("hi")]);
        request.stream = Some(false);
        request.temperature = Some(0.2);
        let out = to_openai_request(&request).unwrap();
        assert_eq!(out.request.temperature, Some(0.2));
        assert!(out.request.stream_options.is_none());
    }

    #[test]
    fn unknown_fields_are_reported_dropped() {
        let mut request = simple_request(vec![user_text("hi")]);
        request
            .extra
            .insert("thinking".to_string(), json!({"type": "enabled"}));
        request.extra.insert("top_k".to_string(), json!(5));
        let out = to_openai_request(&request).unwrap();
        assert_eq!(out.dropped_params, vec!["thinking", "top_k"]);
    }

    #[test]
    fn tool_choice_any_becomes_required() {
        let mut request = simple_request(vec![user_text("hi")]);
        request.tools = Some(vec![AnthropicTool {
            name: "search".to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }]);
        request.tool_choice = Some(AnthropicToolChoice::Any);
        let out = to_openai_request(&request).unwrap();
        match out.request.tool_choice.unwrap() {
            ToolChoice::Mode(mode) => assert_eq!(mode, "required"),
            other => panic!("expected mode, got {:?}", other),
        }
    }
}
