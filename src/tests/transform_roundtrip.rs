use crate::models::anthropic::{
    ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, SystemPrompt, Tool,
    ToolResultContent,
};
use crate::models::openai::{ContentPart, Message as OpenAIMessage, MessageContent as OpenAIContent};
use crate::transform::to_openai_request;
use serde_json::json;
use std::collections::HashMap;

fn request(messages: Vec<Message>) -> MessagesRequest {
    MessagesRequest {
        model: "test-model".to_string(),
        max_tokens: 512,
        messages,
        system: Some(SystemPrompt::Text("Be helpful.".to_string())),
        temperature: Some(0.7),
        top_p: None,
        stream: Some(true),
        stop_sequences: None,
        tools: Some(vec![Tool {
            name: "Read".to_string(),
            description: Some("Read a file".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {"file_path": {"type": "string"}},
                "required": ["file_path"]
            }),
        }]),
        tool_choice: None,
        metadata: None,
        extra: HashMap::new(),
    }
}

/// A realistic agent turn: system, user ask, assistant text + tool_use,
/// tool_result, follow-up. Every block must survive with its content
/// intact.
#[test]
fn full_conversation_preserves_every_block() {
    let messages = vec![
        Message {
            role: "user".to_string(),
            content: MessageContent::Text("What does main.rs do?".to_string()),
        },
        Message {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "Let me look.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_abc".to_string(),
                    name: "Read".to_string(),
                    input: json!({"file_path": "src/main.rs"}),
                },
            ]),
        },
        Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "toolu_abc".to_string(),
                content: Some(ToolResultContent::Text("fn main() {}".to_string())),
                is_error: None,
            }]),
        },
        Message {
            role: "user".to_string(),
            content: MessageContent::Text("And the tests?".to_string()),
        },
    ];

    let out = to_openai_request(&request(messages)).unwrap();
    let converted = &out.request.messages;

    // system + user + assistant(with tool call) + tool + user
    assert_eq!(converted.len(), 5);
    assert_eq!(
        converted.iter().map(|m| m.role()).collect::<Vec<_>>(),
        vec!["system", "user", "assistant", "tool", "user"]
    );

    match &converted[2] {
        OpenAIMessage::Assistant {
            content,
            tool_calls,
            ..
        } => {
            assert_eq!(content.as_deref(), Some("Let me look."));
            let call = &tool_calls.as_ref().unwrap()[0];
            assert_eq!(call.id, "toolu_abc");
            let args: serde_json::Value = serde_json::from_str(&call.function.arguments).unwrap();
            assert_eq!(args["file_path"], "src/main.rs");
        }
        other => panic!("expected assistant message, got {:?}", other),
    }

    match &converted[3] {
        OpenAIMessage::Tool {
            content,
            tool_call_id,
            ..
        } => {
            assert_eq!(content, "fn main() {}");
            assert_eq!(tool_call_id, "toolu_abc");
        }
        other => panic!("expected tool message, got {:?}", other),
    }

    // Tool declarations survive with their schema.
    let tools = out.request.tools.as_ref().unwrap();
    assert_eq!(tools[0].function.name, "Read");
    assert_eq!(
        tools[0].function.parameters.as_ref().unwrap()["required"][0],
        "file_path"
    );
}

#[test]
fn image_blocks_survive_as_data_urls() {
    let messages = vec![Message {
        role: "user".to_string(),
        content: MessageContent::Blocks(vec![
            ContentBlock::Text {
                text: "Describe this.".to_string(),
            },
            ContentBlock::Image {
                source: ImageSource {
                    r#type: "base64".to_string(),
                    media_type: "image/jpeg".to_string(),
                    data: "/9j/4AAQ".to_string(),
                },
            },
        ]),
    }];

    let out = to_openai_request(&request(messages)).unwrap();
    let user = out
        .request
        .messages
        .iter()
        .find(|m| m.role() == "user")
        .unwrap();
    match user {
        OpenAIMessage::User {
            content: OpenAIContent::Array(parts),
            ..
        } => {
            let urls: Vec<&str> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url.url.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(urls, vec!["data:image/jpeg;base64,/9j/4AAQ"]);
        }
        other => panic!("expected multipart user content, got {:?}", other),
    }
}

#[test]
fn transformation_is_deterministic() {
    let messages = vec![Message {
        role: "user".to_string(),
        content: MessageContent::Text("same in, same out".to_string()),
    }];
    let a = to_openai_request(&request(messages.clone())).unwrap();
    let b = to_openai_request(&request(messages)).unwrap();
    assert_eq!(
        serde_json::to_value(&a.request).unwrap(),
        serde_json::to_value(&b.request).unwrap()
    );
    assert_eq!(a.dropped_params, b.dropped_params);
}

#[test]
fn serialized_payload_has_expected_wire_shape() {
    let messages = vec![Message {
        role: "user".to_string(),
        content: MessageContent::Text("hi".to_string()),
    }];
    let out = to_openai_request(&request(messages)).unwrap();
    let wire = serde_json::to_value(&out.request).unwrap();

    assert_eq!(wire["model"], "test-model");
    assert_eq!(wire["max_tokens"], 512);
    assert_eq!(wire["stream"], true);
    assert_eq!(wire["stream_options"]["include_usage"], true);
    assert_eq!(wire["messages"][0]["role"], "system");
    assert_eq!(wire["messages"][1]["role"], "user");
    assert_eq!(wire["tools"][0]["type"], "function");
    assert!(wire.get("max_completion_tokens").is_none());
}
