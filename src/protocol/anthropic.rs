//! Anthropic-shaped messages protocol: content-block arrays, out-of-band
//! system parameter, named SSE events paired with data payloads, and
//! ephemeral cache-control annotations on the stable prompt prefix.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{NativePart, StreamParser, map_finish_reason};
use crate::error::WireError;
use crate::normalize::NormalizedRequest;
use crate::profile::{GenerationParams, ProviderProfile};
use crate::sse::SseFrame;
use crate::types::{
    ChatMessage, ImageSource, MessageContent, MessagePart, Role, ToolCallRequest, Usage,
};

const DEFAULT_MAX_TOKENS: u64 = 4096;

// ─── Request encoding ────────────────────────────────────────────────────────

pub fn encode_message(message: &ChatMessage, profile: &ProviderProfile) -> Vec<Value> {
    match message.role {
        // System text travels out-of-band for this family.
        Role::System => Vec::new(),
        Role::User => {
            let blocks = encode_content_blocks(&message.content, profile);
            if blocks.is_empty() {
                Vec::new()
            } else {
                vec![json!({"role": "user", "content": blocks})]
            }
        }
        Role::Assistant => encode_assistant_message(message).into_iter().collect(),
        Role::Tool => {
            let Some(call_id) = message.tool_call_id.as_deref() else {
                tracing::warn!("dropping tool result without tool_call_id");
                return Vec::new();
            };
            vec![json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    profile.tool_id_field.as_str(): call_id,
                    "content": message.content.text_only(),
                }],
            })]
        }
    }
}

fn encode_content_blocks(content: &MessageContent, profile: &ProviderProfile) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"type": "text", "text": text})]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(json!({"type": "text", "text": text})),
                MessagePart::Image { source } if profile.vision => Some(encode_image(source)),
                MessagePart::Image { .. } => None,
            })
            .collect(),
    }
}

fn encode_image(source: &ImageSource) -> Value {
    match source {
        ImageSource::Url { url } => json!({
            "type": "image",
            "source": {"type": "url", "url": url},
        }),
        ImageSource::Base64 { data, .. } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": source.media_type(),
                "data": data,
            },
        }),
    }
}

fn encode_assistant_message(message: &ChatMessage) -> Option<Value> {
    let mut blocks = Vec::new();
    let text = message.content.text_only();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in &message.tool_calls {
        blocks.push(encode_tool_call(call));
    }
    (!blocks.is_empty()).then(|| json!({"role": "assistant", "content": blocks}))
}

pub fn encode_tool(tool: &crate::types::ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

pub fn encode_tool_call(call: &ToolCallRequest) -> Value {
    let input: Value =
        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
    json!({"type": "tool_use", "id": call.id, "name": call.name, "input": input})
}

pub fn decode_tool_call(value: &Value) -> Option<ToolCallRequest> {
    if value.get("type").and_then(Value::as_str) != Some("tool_use") {
        return None;
    }
    Some(ToolCallRequest {
        id: value.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
        name: value.get("name")?.as_str()?.to_string(),
        arguments: value.get("input").cloned().unwrap_or(json!({})).to_string(),
    })
}

pub fn build_request_body(
    params: &GenerationParams,
    model: &str,
    normalized: &NormalizedRequest,
    tools: &[Value],
) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert(
        "max_tokens".to_string(),
        json!(params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );

    let mut messages = merge_adjacent_roles(normalized.messages.clone());
    let mut tools = tools.to_vec();
    annotate_prompt_cache(&mut messages, &mut tools);
    body.insert("messages".to_string(), json!(messages));

    if let Some(system) = &normalized.system_parameter {
        body.insert("system".to_string(), json!(system));
    }
    if let Some(temperature) = params.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(top_k) = params.top_k {
        body.insert("top_k".to_string(), json!(top_k));
    }
    if !params.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(params.stop));
    }
    if params.reasoning.enabled {
        body.insert(
            "thinking".to_string(),
            json!({
                "type": "enabled",
                "budget_tokens": params.reasoning.budget_tokens.unwrap_or(1024),
            }),
        );
    }
    if !tools.is_empty() {
        body.insert("tools".to_string(), json!(tools));
    }

    body.insert("stream".to_string(), json!(true));
    Value::Object(body)
}

/// The protocol requires strict user/assistant alternation; adjacent
/// same-role entries (a tool result following a user turn, say) merge by
/// concatenating their content-block arrays.
fn merge_adjacent_roles(messages: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(messages.len());
    for mut message in messages {
        let same_role = merged
            .last()
            .is_some_and(|previous| previous.get("role") == message.get("role"));
        if same_role
            && let Some(Value::Array(incoming)) = message.get_mut("content")
            && let Some(Value::Array(existing)) = merged
                .last_mut()
                .and_then(|previous| previous.get_mut("content"))
        {
            existing.append(incoming);
            continue;
        }
        merged.push(message);
    }
    merged
}

/// Mark the stable prefix cacheable: the last tool definition and the last
/// content block of the second-to-last message. The final message changes
/// every turn and is left unmarked.
fn annotate_prompt_cache(messages: &mut [Value], tools: &mut [Value]) {
    if let Some(last_tool) = tools.last_mut()
        && let Some(object) = last_tool.as_object_mut()
    {
        object.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
    }

    let count = messages.len();
    if count >= 2
        && let Some(blocks) = messages[count - 2]
            .get_mut("content")
            .and_then(Value::as_array_mut)
        && let Some(block) = blocks.last_mut()
        && let Some(object) = block.as_object_mut()
    {
        object.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
    }
}

// ─── Streaming response ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
}

#[derive(Debug, Deserialize)]
struct MessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<StartUsage>,
}

#[derive(Debug, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking,
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    SignatureDelta {},
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

pub struct AnthropicStreamParser {
    tool_indices: Vec<usize>,
    input_tokens: Option<u64>,
    cached_tokens: Option<u64>,
}

impl AnthropicStreamParser {
    pub fn new() -> Self {
        Self {
            tool_indices: Vec::new(),
            input_tokens: None,
            cached_tokens: None,
        }
    }
}

impl Default for AnthropicStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for AnthropicStreamParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Result<Vec<NativePart>, WireError> {
        // The payload's own `type` discriminator makes the named-event frame
        // redundant; data frames alone drive the parse.
        let SseFrame::Data(data) = frame else {
            return Ok(Vec::new());
        };

        let Ok(event) = serde_json::from_str::<AnthropicEvent>(data) else {
            tracing::debug!("skipping unrecognized event payload");
            return Ok(Vec::new());
        };

        match event {
            AnthropicEvent::MessageStart { message } => {
                if let Some(usage) = &message.usage {
                    self.input_tokens = usage.input_tokens;
                    self.cached_tokens = usage.cache_read_input_tokens;
                }
                Ok(vec![NativePart::ResponseMeta {
                    id: message.id,
                    model: message.model,
                }])
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::ToolUse { id, name } => {
                    self.tool_indices.push(index);
                    Ok(vec![NativePart::ToolCallStart {
                        index,
                        id,
                        name: Some(name),
                    }])
                }
                ContentBlock::Text { text } if !text.is_empty() => {
                    Ok(vec![NativePart::TextDelta(text)])
                }
                _ => Ok(Vec::new()),
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => Ok(vec![NativePart::TextDelta(text)]),
                BlockDelta::ThinkingDelta { thinking } => {
                    Ok(vec![NativePart::ReasoningDelta(thinking)])
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    Ok(vec![NativePart::ToolCallArgsDelta {
                        index,
                        delta: partial_json,
                    }])
                }
                BlockDelta::SignatureDelta {} | BlockDelta::Unknown => Ok(Vec::new()),
            },
            AnthropicEvent::ContentBlockStop { index } => {
                if self.tool_indices.contains(&index) {
                    Ok(vec![NativePart::ToolCallEnd { index }])
                } else {
                    Ok(Vec::new())
                }
            }
            AnthropicEvent::MessageDelta { delta, usage } => {
                let mut totals = Usage::totalled(
                    self.input_tokens,
                    usage.as_ref().and_then(|usage| usage.output_tokens),
                );
                totals.cached_tokens = self.cached_tokens;
                Ok(vec![NativePart::Finish {
                    stop_reason: delta.stop_reason.as_deref().map(map_finish_reason),
                    usage: Some(totals),
                }])
            }
            AnthropicEvent::MessageStop | AnthropicEvent::Ping => Ok(Vec::new()),
            AnthropicEvent::Error { error } => Err(WireError::Api {
                provider: "anthropic".to_string(),
                status: None,
                message: error.message,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AnthropicStreamParser, build_request_body, decode_tool_call, encode_message,
        encode_tool_call,
    };
    use crate::normalize::NormalizedRequest;
    use crate::profile::{GenerationParams, ProviderProfile};
    use crate::protocol::{NativePart, StreamParser};
    use crate::sse::SseFrame;
    use crate::types::{ChatMessage, StopReason, ToolCallRequest};
    use serde_json::json;

    #[test]
    fn tool_result_becomes_user_block_with_tool_use_id() {
        let profile = ProviderProfile::anthropic();
        let message = ChatMessage::tool_result("toolu_1", "42 files", None);
        let encoded = encode_message(&message, &profile);
        assert_eq!(encoded[0]["role"], "user");
        assert_eq!(encoded[0]["content"][0]["type"], "tool_result");
        assert_eq!(encoded[0]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn tool_call_round_trip_preserves_arguments() {
        let call = ToolCallRequest {
            id: "toolu_1".into(),
            name: "search".into(),
            arguments: r#"{"q":"rust"}"#.into(),
        };
        let decoded = decode_tool_call(&encode_tool_call(&call)).unwrap();
        assert_eq!(decoded.name, "search");
        let value: serde_json::Value = serde_json::from_str(&decoded.arguments).unwrap();
        assert_eq!(value, json!({"q": "rust"}));
    }

    #[test]
    fn request_merges_adjacent_user_turns() {
        let normalized = NormalizedRequest {
            messages: vec![
                json!({"role": "user", "content": [{"type": "text", "text": "a"}]}),
                json!({"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]}),
            ],
            system_parameter: Some("be brief".into()),
        };
        let body = build_request_body(&GenerationParams::default(), "claude-sonnet-4", &normalized, &[]);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn cache_annotation_lands_on_stable_prefix() {
        let normalized = NormalizedRequest {
            messages: vec![
                json!({"role": "user", "content": [{"type": "text", "text": "first"}]}),
                json!({"role": "assistant", "content": [{"type": "text", "text": "reply"}]}),
                json!({"role": "user", "content": [{"type": "text", "text": "latest"}]}),
            ],
            system_parameter: None,
        };
        let tools = vec![json!({"name": "search", "input_schema": {"type": "object"}})];
        let body =
            build_request_body(&GenerationParams::default(), "claude-sonnet-4", &normalized, &tools);

        assert_eq!(body["tools"][0]["cache_control"]["type"], "ephemeral");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(
            messages[1]["content"][0]["cache_control"]["type"],
            "ephemeral"
        );
        assert!(messages[2]["content"][0].get("cache_control").is_none());
    }

    #[test]
    fn thinking_budget_forwarded_when_reasoning_enabled() {
        let params = GenerationParams {
            reasoning: crate::profile::ReasoningConfig {
                enabled: true,
                budget_tokens: Some(2048),
                effort: None,
            },
            ..GenerationParams::default()
        };
        let body = build_request_body(
            &params,
            "claude-sonnet-4",
            &NormalizedRequest::default(),
            &[],
        );
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
    }

    #[test]
    fn parser_routes_thinking_to_reasoning_channel() {
        let mut parser = AnthropicStreamParser::new();
        let parts = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "content_block_delta", "index": 0,
                       "delta": {"type": "thinking_delta", "thinking": "let me see"}})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(parts, vec![NativePart::ReasoningDelta("let me see".into())]);
    }

    #[test]
    fn parser_tracks_tool_block_lifecycle() {
        let mut parser = AnthropicStreamParser::new();
        let start = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "content_block_start", "index": 1,
                       "content_block": {"type": "tool_use", "id": "toolu_1", "name": "search"}})
                .to_string(),
            ))
            .unwrap();
        assert!(matches!(
            &start[0],
            NativePart::ToolCallStart { index: 1, name: Some(name), .. } if name == "search"
        ));

        let stop = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "content_block_stop", "index": 1}).to_string(),
            ))
            .unwrap();
        assert_eq!(stop, vec![NativePart::ToolCallEnd { index: 1 }]);

        // A text block stop produces nothing.
        let text_stop = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ))
            .unwrap();
        assert!(text_stop.is_empty());
    }

    #[test]
    fn usage_spans_start_and_delta_events() {
        let mut parser = AnthropicStreamParser::new();
        parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "message_start",
                       "message": {"id": "msg_1", "model": "claude-sonnet-4",
                                    "usage": {"input_tokens": 10, "cache_read_input_tokens": 4}}})
                .to_string(),
            ))
            .unwrap();
        let finish = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"},
                       "usage": {"output_tokens": 5}})
                .to_string(),
            ))
            .unwrap();
        match &finish[0] {
            NativePart::Finish { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                let usage = usage.unwrap();
                assert_eq!(usage.total_tokens, Some(15));
                assert_eq!(usage.cached_tokens, Some(4));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn error_event_raises_api_error() {
        let mut parser = AnthropicStreamParser::new();
        let error = parser
            .parse_frame(&SseFrame::Data(
                json!({"type": "error", "error": {"type": "overloaded_error", "message": "overloaded"}})
                    .to_string(),
            ))
            .unwrap_err();
        assert_eq!(error.code(), "provider");
    }
}
