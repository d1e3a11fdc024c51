//! OpenAI-shaped chat-completions protocol: message array with a `tool_calls`
//! field on assistant turns, SSE chunks with indexed tool-call deltas.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{NativePart, StreamParser, map_finish_reason};
use crate::error::WireError;
use crate::normalize::{NormalizedRequest, render_image_url};
use crate::profile::{GenerationParams, ProviderProfile};
use crate::sse::SseFrame;
use crate::types::{ChatMessage, MessageContent, MessagePart, Role, ToolCallRequest, Usage};

// ─── Request encoding ────────────────────────────────────────────────────────

pub fn encode_system_message(text: &str) -> Value {
    json!({"role": "system", "content": text})
}

/// Map one unified message to zero or more native messages. A tool turn
/// missing its correlation id is dropped: no protocol can represent an
/// uncorrelated tool result.
pub fn encode_message(message: &ChatMessage, profile: &ProviderProfile) -> Vec<Value> {
    match message.role {
        Role::System => {
            let text = message.content.text_only();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![encode_system_message(&text)]
            }
        }
        Role::User => encode_user_message(message, profile)
            .into_iter()
            .collect(),
        Role::Assistant => encode_assistant_message(message).into_iter().collect(),
        Role::Tool => {
            let Some(call_id) = message.tool_call_id.as_deref() else {
                tracing::warn!("dropping tool result without tool_call_id");
                return Vec::new();
            };
            vec![json!({
                "role": profile.tool_result_role,
                profile.tool_id_field.as_str(): call_id,
                "content": message.content.text_only(),
            })]
        }
    }
}

fn encode_user_message(message: &ChatMessage, profile: &ProviderProfile) -> Option<Value> {
    if profile.vision && message.content.has_images() {
        let MessageContent::Parts(parts) = &message.content else {
            return None;
        };
        let native_parts: Vec<Value> = parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => json!({"type": "text", "text": text}),
                MessagePart::Image { source } => json!({
                    "type": "image_url",
                    "image_url": {"url": render_image_url(source, profile.image_template.as_deref())},
                }),
            })
            .collect();
        Some(json!({"role": "user", "content": native_parts}))
    } else {
        let text = message.content.text_only();
        (!text.is_empty()).then(|| json!({"role": "user", "content": text}))
    }
}

fn encode_assistant_message(message: &ChatMessage) -> Option<Value> {
    let text = message.content.text_only();
    if text.is_empty() && message.tool_calls.is_empty() {
        return None;
    }

    let mut native = serde_json::Map::new();
    native.insert("role".to_string(), json!("assistant"));
    native.insert(
        "content".to_string(),
        if text.is_empty() {
            Value::Null
        } else {
            json!(text)
        },
    );
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message.tool_calls.iter().map(encode_tool_call).collect();
        native.insert("tool_calls".to_string(), json!(calls));
    }
    Some(Value::Object(native))
}

pub fn encode_tool_call(call: &ToolCallRequest) -> Value {
    json!({
        "id": call.id,
        "type": "function",
        "function": {"name": call.name, "arguments": call.arguments},
    })
}

/// Inverse of [`encode_tool_call`], also used on non-streaming responses.
pub fn decode_tool_call(value: &Value) -> Option<ToolCallRequest> {
    let function = value.get("function")?;
    Some(ToolCallRequest {
        id: value.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
        name: function.get("name")?.as_str()?.to_string(),
        arguments: function
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string(),
    })
}

pub fn encode_tool(tool: &crate::types::ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
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

    let mut messages = normalized.messages.clone();
    // A `parameter` placement mode on an OpenAI-shaped profile still has to
    // travel in-band; it degrades to a leading system message.
    if let Some(system) = &normalized.system_parameter {
        messages.insert(0, encode_system_message(system));
    }
    body.insert("messages".to_string(), json!(messages));

    if let Some(max_tokens) = params.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = params.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(frequency_penalty) = params.frequency_penalty {
        body.insert("frequency_penalty".to_string(), json!(frequency_penalty));
    }
    if let Some(presence_penalty) = params.presence_penalty {
        body.insert("presence_penalty".to_string(), json!(presence_penalty));
    }
    if !params.stop.is_empty() {
        body.insert("stop".to_string(), json!(params.stop));
    }
    if let Some(seed) = params.seed {
        body.insert("seed".to_string(), json!(seed));
    }
    if params.reasoning.enabled
        && let Some(effort) = &params.reasoning.effort
    {
        body.insert("reasoning_effort".to_string(), json!(effort));
    }
    if !tools.is_empty() {
        body.insert("tools".to_string(), json!(tools));
    }

    body.insert("stream".to_string(), json!(true));
    body.insert("stream_options".to_string(), json!({"include_usage": true}));

    Value::Object(body)
}

// ─── Streaming response ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    /// First-class reasoning channel (DeepSeek-style `reasoning_content`).
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkToolFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u64>,
}

impl ChunkUsage {
    fn to_usage(&self) -> Usage {
        let mut usage = Usage::totalled(self.prompt_tokens, self.completion_tokens);
        usage.cached_tokens = self
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens);
        usage.reasoning_tokens = self
            .completion_tokens_details
            .as_ref()
            .and_then(|details| details.reasoning_tokens);
        usage
    }
}

pub struct OpenAiStreamParser {
    sent_meta: bool,
    started_indices: Vec<usize>,
    /// Usage arrives on a trailing chunk after finish_reason; hold the finish
    /// until either usage shows up or the sentinel ends the stream.
    pending_finish: Option<String>,
}

impl OpenAiStreamParser {
    pub fn new() -> Self {
        Self {
            sent_meta: false,
            started_indices: Vec::new(),
            pending_finish: None,
        }
    }
}

impl Default for OpenAiStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for OpenAiStreamParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Result<Vec<NativePart>, WireError> {
        let SseFrame::Data(data) = frame else {
            if let (SseFrame::Done, Some(reason)) = (frame, self.pending_finish.take()) {
                return Ok(vec![NativePart::Finish {
                    stop_reason: Some(map_finish_reason(&reason)),
                    usage: None,
                }]);
            }
            return Ok(Vec::new());
        };

        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            tracing::debug!("skipping non-JSON data frame");
            return Ok(Vec::new());
        };
        // Provider error payloads come through the data channel too; checked
        // before the chunk shape, which tolerates unknown fields and would
        // otherwise absorb them as an empty chunk.
        if let Some(message) = payload.pointer("/error/message").and_then(Value::as_str) {
            return Err(WireError::Api {
                provider: "openai".to_string(),
                status: None,
                message: message.to_string(),
            });
        }
        let Ok(chunk) = serde_json::from_value::<ChatCompletionChunk>(payload) else {
            tracing::debug!("skipping unparseable chunk payload");
            return Ok(Vec::new());
        };

        let mut parts = Vec::new();

        if !self.sent_meta && (chunk.id.is_some() || chunk.model.is_some()) {
            parts.push(NativePart::ResponseMeta {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
            self.sent_meta = true;
        }

        for choice in &chunk.choices {
            if let Some(reasoning) = &choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                parts.push(NativePart::ReasoningDelta(reasoning.clone()));
            }
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                parts.push(NativePart::TextDelta(content.clone()));
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for tool_call in tool_calls {
                    let name = tool_call
                        .function
                        .as_ref()
                        .and_then(|function| function.name.clone());
                    if !self.started_indices.contains(&tool_call.index) {
                        self.started_indices.push(tool_call.index);
                        parts.push(NativePart::ToolCallStart {
                            index: tool_call.index,
                            id: tool_call.id.clone(),
                            name,
                        });
                    } else if tool_call.id.is_some() || name.is_some() {
                        parts.push(NativePart::ToolCallStart {
                            index: tool_call.index,
                            id: tool_call.id.clone(),
                            name,
                        });
                    }
                    if let Some(arguments) = tool_call
                        .function
                        .as_ref()
                        .and_then(|function| function.arguments.clone())
                        && !arguments.is_empty()
                    {
                        parts.push(NativePart::ToolCallArgsDelta {
                            index: tool_call.index,
                            delta: arguments,
                        });
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.pending_finish = Some(reason.clone());
            }
        }

        if let Some(usage) = &chunk.usage {
            let reason = self.pending_finish.take();
            parts.push(NativePart::Finish {
                stop_reason: reason.as_deref().map(map_finish_reason),
                usage: Some(usage.to_usage()),
            });
        }

        Ok(parts)
    }

    fn finish(&mut self) -> Vec<NativePart> {
        // Transport may close right after the finish_reason chunk, before
        // the usage chunk or sentinel that would normally release it.
        match self.pending_finish.take() {
            Some(reason) => vec![NativePart::Finish {
                stop_reason: Some(map_finish_reason(&reason)),
                usage: None,
            }],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        OpenAiStreamParser, build_request_body, decode_tool_call, encode_message, encode_tool,
        encode_tool_call,
    };
    use crate::normalize::NormalizedRequest;
    use crate::profile::{GenerationParams, ProviderProfile};
    use crate::protocol::{NativePart, StreamParser};
    use crate::sse::SseFrame;
    use crate::types::{ChatMessage, StopReason, ToolCallRequest, ToolDefinition};
    use serde_json::json;

    #[test]
    fn tool_call_round_trip() {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "search".into(),
            arguments: "{\"q\":\"rust\"}".into(),
        };
        let decoded = decode_tool_call(&encode_tool_call(&call)).unwrap();
        assert_eq!(decoded.name, call.name);
        assert_eq!(decoded.arguments, call.arguments);
    }

    #[test]
    fn tool_result_without_id_is_dropped() {
        let mut message = ChatMessage::tool_result("x", "output", None);
        message.tool_call_id = None;
        assert!(encode_message(&message, &ProviderProfile::openai()).is_empty());
    }

    #[test]
    fn assistant_tool_calls_serialize_in_array_field() {
        let message = ChatMessage::assistant_tool_calls(
            "checking",
            vec![ToolCallRequest {
                id: "call_1".into(),
                name: "read_file".into(),
                arguments: "{}".into(),
            }],
        );
        let encoded = encode_message(&message, &ProviderProfile::openai());
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0]["tool_calls"][0]["function"]["name"], "read_file");
    }

    #[test]
    fn request_body_carries_params_and_stream_options() {
        let params = GenerationParams {
            max_tokens: Some(1024),
            temperature: Some(0.2),
            seed: Some(7),
            ..GenerationParams::default()
        };
        let normalized = NormalizedRequest {
            messages: vec![json!({"role": "user", "content": "hi"})],
            system_parameter: None,
        };
        let tools = vec![encode_tool(&ToolDefinition {
            name: "search".into(),
            description: "find things".into(),
            parameters: json!({"type": "object"}),
        })];
        let body = build_request_body(&params, "gpt-4o", &normalized, &tools);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["seed"], 7);
        assert_eq!(body["tools"][0]["function"]["name"], "search");
    }

    #[test]
    fn parser_emits_indexed_tool_deltas() {
        let mut parser = OpenAiStreamParser::new();
        let start = parser
            .parse_frame(&SseFrame::Data(
                json!({"id": "r1", "model": "gpt-4o", "choices": [{"delta": {"tool_calls": [
                    {"index": 0, "id": "call_1", "function": {"name": "search", "arguments": ""}}
                ]}}]})
                .to_string(),
            ))
            .unwrap();
        assert!(matches!(start[0], NativePart::ResponseMeta { .. }));
        assert!(matches!(
            start[1],
            NativePart::ToolCallStart { index: 0, .. }
        ));

        let delta = parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"q\":"}}
                ]}}]})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            delta,
            vec![NativePart::ToolCallArgsDelta {
                index: 0,
                delta: "{\"q\":".into()
            }]
        );
    }

    #[test]
    fn finish_held_until_usage_or_done() {
        let mut parser = OpenAiStreamParser::new();
        let finish_chunk = parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}).to_string(),
            ))
            .unwrap();
        assert!(finish_chunk.is_empty());

        let usage_chunk = parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2}})
                    .to_string(),
            ))
            .unwrap();
        match &usage_chunk[0] {
            NativePart::Finish { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.unwrap().total_tokens, Some(7));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_releases_held_finish() {
        let mut parser = OpenAiStreamParser::new();
        parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}).to_string(),
            ))
            .unwrap();

        // Transport closed before the usage chunk or sentinel arrived.
        let released = parser.finish();
        match &released[0] {
            NativePart::Finish { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::EndTurn));
                assert!(usage.is_none());
            }
            other => panic!("expected finish, got {other:?}"),
        }
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn provider_error_payload_becomes_api_error() {
        let mut parser = OpenAiStreamParser::new();
        let error = parser
            .parse_frame(&SseFrame::Data(
                json!({"error": {"message": "model overloaded"}}).to_string(),
            ))
            .unwrap_err();
        assert_eq!(error.code(), "provider");
        assert!(error.retryable());
    }
}
