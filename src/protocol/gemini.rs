//! Gemini-shaped protocol: `contents` with user/model roles, camelCase
//! generation config, function calls that arrive whole, and tool results
//! correlated by function name rather than call id.

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

// ─── Request encoding ────────────────────────────────────────────────────────

pub fn encode_message(message: &ChatMessage, profile: &ProviderProfile) -> Vec<Value> {
    match message.role {
        // System text travels as systemInstruction.
        Role::System => Vec::new(),
        Role::User => {
            let parts = encode_parts(&message.content, profile);
            if parts.is_empty() {
                Vec::new()
            } else {
                vec![json!({"role": "user", "parts": parts})]
            }
        }
        Role::Assistant => encode_model_message(message).into_iter().collect(),
        Role::Tool => {
            if message.tool_call_id.is_none() {
                tracing::warn!("dropping tool result without tool_call_id");
                return Vec::new();
            }
            // Correlation is by function name on this wire.
            let name = message.name.clone().unwrap_or_default();
            vec![json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        "name": name,
                        "response": {"content": message.content.text_only()},
                    },
                }],
            })]
        }
    }
}

fn encode_parts(content: &MessageContent, profile: &ProviderProfile) -> Vec<Value> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"text": text})]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(json!({"text": text})),
                MessagePart::Image { source } if profile.vision => Some(encode_image(source)),
                MessagePart::Image { .. } => None,
            })
            .collect(),
    }
}

fn encode_image(source: &ImageSource) -> Value {
    match source {
        ImageSource::Url { url } => json!({
            "fileData": {"fileUri": url},
        }),
        ImageSource::Base64 { data, .. } => json!({
            "inlineData": {"mimeType": source.media_type(), "data": data},
        }),
    }
}

fn encode_model_message(message: &ChatMessage) -> Option<Value> {
    let mut parts = Vec::new();
    let text = message.content.text_only();
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    for call in &message.tool_calls {
        parts.push(encode_tool_call(call));
    }
    (!parts.is_empty()).then(|| json!({"role": "model", "parts": parts}))
}

pub fn encode_tool(tool: &crate::types::ToolDefinition) -> Value {
    let mut parameters = tool.parameters.clone();
    sanitize_schema(&mut parameters);
    json!({
        "functionDeclarations": [{
            "name": tool.name,
            "description": tool.description,
            "parameters": parameters,
        }],
    })
}

/// Strip JSON Schema keywords the declaration subset rejects.
fn sanitize_schema(schema: &mut Value) {
    match schema {
        Value::Object(object) => {
            object.remove("additionalProperties");
            object.remove("$schema");
            object.remove("$defs");
            for value in object.values_mut() {
                sanitize_schema(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_schema(item);
            }
        }
        _ => {}
    }
}

/// The wire has no call id; it is dropped on encode and resynthesized by
/// the orchestrator on decode.
pub fn encode_tool_call(call: &ToolCallRequest) -> Value {
    let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
    json!({"functionCall": {"name": call.name, "args": args}})
}

pub fn decode_tool_call(value: &Value) -> Option<ToolCallRequest> {
    let function_call = value.get("functionCall")?;
    Some(ToolCallRequest {
        id: String::new(),
        name: function_call.get("name")?.as_str()?.to_string(),
        arguments: function_call
            .get("args")
            .cloned()
            .unwrap_or(json!({}))
            .to_string(),
    })
}

pub fn build_request_body(
    params: &GenerationParams,
    normalized: &NormalizedRequest,
    tools: &[Value],
) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("contents".to_string(), json!(normalized.messages));

    if let Some(system) = &normalized.system_parameter {
        body.insert(
            "systemInstruction".to_string(),
            json!({"parts": [{"text": system}]}),
        );
    }

    let mut config = serde_json::Map::new();
    if let Some(max_tokens) = params.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = params.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        config.insert("topP".to_string(), json!(top_p));
    }
    if let Some(top_k) = params.top_k {
        config.insert("topK".to_string(), json!(top_k));
    }
    if !params.stop.is_empty() {
        config.insert("stopSequences".to_string(), json!(params.stop));
    }
    if params.reasoning.enabled {
        let mut thinking = serde_json::Map::new();
        thinking.insert("includeThoughts".to_string(), json!(true));
        if let Some(budget) = params.reasoning.budget_tokens {
            thinking.insert("thinkingBudget".to_string(), json!(budget));
        }
        config.insert("thinkingConfig".to_string(), Value::Object(thinking));
    }
    if !config.is_empty() {
        body.insert("generationConfig".to_string(), Value::Object(config));
    }

    // Per-tool singleton declaration lists fold into one tools entry.
    let declarations: Vec<Value> = tools
        .iter()
        .filter_map(|tool| tool.get("functionDeclarations"))
        .filter_map(Value::as_array)
        .flatten()
        .cloned()
        .collect();
    if !declarations.is_empty() {
        body.insert(
            "tools".to_string(),
            json!([{"functionDeclarations": declarations}]),
        );
    }

    Value::Object(body)
}

// ─── Streaming response ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentChunk {
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    /// True on parts carrying model thoughts rather than answer text.
    #[serde(default)]
    thought: bool,
    #[serde(default)]
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    thoughts_token_count: Option<u64>,
    #[serde(default)]
    cached_content_token_count: Option<u64>,
}

pub struct GeminiStreamParser {
    sent_meta: bool,
}

impl GeminiStreamParser {
    pub fn new() -> Self {
        Self { sent_meta: false }
    }
}

impl Default for GeminiStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser for GeminiStreamParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Result<Vec<NativePart>, WireError> {
        let SseFrame::Data(data) = frame else {
            return Ok(Vec::new());
        };

        let Ok(payload) = serde_json::from_str::<Value>(data) else {
            tracing::debug!("skipping non-JSON data frame");
            return Ok(Vec::new());
        };
        // Error payloads must be recognized before the chunk shape, whose
        // lenient fields would deserialize them as an empty chunk.
        if let Some(message) = payload.pointer("/error/message").and_then(Value::as_str) {
            let status = payload
                .pointer("/error/code")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok());
            return Err(WireError::Api {
                provider: "gemini".to_string(),
                status,
                message: message.to_string(),
            });
        }
        let Ok(chunk) = serde_json::from_value::<GenerateContentChunk>(payload) else {
            tracing::debug!("skipping unparseable chunk payload");
            return Ok(Vec::new());
        };

        let mut parts = Vec::new();

        if !self.sent_meta && (chunk.response_id.is_some() || chunk.model_version.is_some()) {
            parts.push(NativePart::ResponseMeta {
                id: chunk.response_id.clone(),
                model: chunk.model_version.clone(),
            });
            self.sent_meta = true;
        }

        let mut finish_reason = None;
        for candidate in &chunk.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text
                        && !text.is_empty()
                    {
                        if part.thought {
                            parts.push(NativePart::ReasoningDelta(text.clone()));
                        } else {
                            parts.push(NativePart::TextDelta(text.clone()));
                        }
                    }
                    if let Some(function_call) = &part.function_call {
                        parts.push(NativePart::ToolCallComplete {
                            id: None,
                            name: function_call.name.clone(),
                            arguments_text: function_call
                                .args
                                .clone()
                                .unwrap_or_else(|| json!({}))
                                .to_string(),
                        });
                    }
                }
            }
            if candidate.finish_reason.is_some() {
                finish_reason.clone_from(&candidate.finish_reason);
            }
        }

        if let Some(reason) = finish_reason {
            let usage = chunk.usage_metadata.as_ref().map(|metadata| {
                let mut usage = Usage::totalled(
                    metadata.prompt_token_count,
                    metadata.candidates_token_count,
                );
                usage.reasoning_tokens = metadata.thoughts_token_count;
                usage.cached_tokens = metadata.cached_content_token_count;
                usage
            });
            // The wire says STOP even when function calls were produced.
            let stop_reason = if parts
                .iter()
                .any(|part| matches!(part, NativePart::ToolCallComplete { .. }))
                && reason == "STOP"
            {
                crate::types::StopReason::ToolUse
            } else {
                map_finish_reason(&reason)
            };
            parts.push(NativePart::Finish {
                stop_reason: Some(stop_reason),
                usage,
            });
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::{GeminiStreamParser, build_request_body, encode_message, encode_tool};
    use crate::normalize::NormalizedRequest;
    use crate::profile::{GenerationParams, ProviderProfile};
    use crate::protocol::{NativePart, StreamParser};
    use crate::sse::SseFrame;
    use crate::types::{ChatMessage, StopReason, ToolDefinition};
    use serde_json::json;

    #[test]
    fn assistant_maps_to_model_role() {
        let encoded = encode_message(
            &ChatMessage::assistant("hello"),
            &ProviderProfile::gemini(),
        );
        assert_eq!(encoded[0]["role"], "model");
        assert_eq!(encoded[0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn tool_result_correlates_by_function_name() {
        let message = ChatMessage::tool_result("ignored-id", "sunny", Some("get_weather"));
        let encoded = encode_message(&message, &ProviderProfile::gemini());
        let response = &encoded[0]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], "get_weather");
        assert_eq!(response["response"]["content"], "sunny");
    }

    #[test]
    fn schema_sanitization_recurses() {
        let tool = ToolDefinition {
            name: "t".into(),
            description: String::new(),
            parameters: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "nested": {"type": "object", "additionalProperties": false}
                }
            }),
        };
        let encoded = encode_tool(&tool);
        let parameters = &encoded["functionDeclarations"][0]["parameters"];
        assert!(parameters.get("additionalProperties").is_none());
        assert!(
            parameters["properties"]["nested"]
                .get("additionalProperties")
                .is_none()
        );
    }

    #[test]
    fn declarations_fold_into_single_tools_entry() {
        let tools = vec![
            encode_tool(&ToolDefinition {
                name: "a".into(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            }),
            encode_tool(&ToolDefinition {
                name: "b".into(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            }),
        ];
        let body = build_request_body(
            &GenerationParams::default(),
            &NormalizedRequest::default(),
            &tools,
        );
        let declarations = body["tools"][0]["functionDeclarations"].as_array().unwrap();
        assert_eq!(declarations.len(), 2);
    }

    #[test]
    fn thought_parts_route_to_reasoning() {
        let mut parser = GeminiStreamParser::new();
        let parts = parser
            .parse_frame(&SseFrame::Data(
                json!({"candidates": [{"content": {"parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "answer"}
                ]}}]})
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            parts,
            vec![
                NativePart::ReasoningDelta("pondering".into()),
                NativePart::TextDelta("answer".into()),
            ]
        );
    }

    #[test]
    fn whole_function_call_with_stop_maps_to_tool_use() {
        let mut parser = GeminiStreamParser::new();
        let parts = parser
            .parse_frame(&SseFrame::Data(
                json!({"candidates": [{
                    "content": {"parts": [{"functionCall": {"name": "search", "args": {"q": "x"}}}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 3}})
                .to_string(),
            ))
            .unwrap();
        assert!(matches!(
            &parts[0],
            NativePart::ToolCallComplete { name, .. } if name == "search"
        ));
        match &parts[1] {
            NativePart::Finish { stop_reason, usage } => {
                assert_eq!(*stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.unwrap().total_tokens, Some(11));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[test]
    fn error_payload_carries_status() {
        let mut parser = GeminiStreamParser::new();
        let error = parser
            .parse_frame(&SseFrame::Data(
                json!({"error": {"code": 429, "message": "quota exceeded"}}).to_string(),
            ))
            .unwrap_err();
        assert!(error.retryable());
        match error {
            crate::error::WireError::Api { status, .. } => assert_eq!(status, Some(429)),
            other => panic!("expected api error, got {other:?}"),
        }
    }
}
