//! Config-driven protocol family. The request skeleton is OpenAI-shaped
//! with operator-renamed fields; every response location is a configured
//! extractor path, so tool calls and usage can live anywhere in the payload.

use serde_json::{Value, json};

use super::{NativePart, StreamParser, map_finish_reason};
use crate::error::WireError;
use crate::normalize::{NormalizedRequest, render_image_url};
use crate::path;
use crate::profile::{CustomFormat, GenerationParams, ProviderProfile};
use crate::sse::SseFrame;
use crate::types::{ChatMessage, MessageContent, MessagePart, Role, ToolCallRequest, Usage};

fn format_of(profile: &ProviderProfile) -> CustomFormat {
    profile
        .custom
        .clone()
        .unwrap_or_else(super::default_custom_format)
}

// ─── Request encoding ────────────────────────────────────────────────────────

pub fn encode_message(message: &ChatMessage, profile: &ProviderProfile) -> Vec<Value> {
    match message.role {
        Role::System => {
            let text = message.content.text_only();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![json!({"role": "system", "content": text})]
            }
        }
        Role::User => encode_user_message(message, profile).into_iter().collect(),
        Role::Assistant => encode_assistant_message(message, profile)
            .into_iter()
            .collect(),
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

fn encode_assistant_message(message: &ChatMessage, profile: &ProviderProfile) -> Option<Value> {
    let text = message.content.text_only();
    if text.is_empty() && message.tool_calls.is_empty() {
        return None;
    }
    let mut native = serde_json::Map::new();
    native.insert("role".to_string(), json!("assistant"));
    native.insert(
        "content".to_string(),
        if text.is_empty() { Value::Null } else { json!(text) },
    );
    if !message.tool_calls.is_empty() {
        let calls: Vec<Value> = message
            .tool_calls
            .iter()
            .map(|call| encode_tool_call(call, profile))
            .collect();
        native.insert("tool_calls".to_string(), json!(calls));
    }
    Some(Value::Object(native))
}

pub fn encode_tool(tool: &crate::types::ToolDefinition, profile: &ProviderProfile) -> Value {
    let format = format_of(profile);
    json!({
        "type": format.tool_wrapper.type_name,
        format.tool_wrapper.function_field.as_str(): {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

/// Encoded through the same configured paths that [`decode_tool_call`]
/// reads, so the pair round-trips for any path configuration.
pub fn encode_tool_call(call: &ToolCallRequest, profile: &ProviderProfile) -> Value {
    let format = format_of(profile);
    let mut value = Value::Object(serde_json::Map::new());
    path::set(&mut value, &format.tool_id_path, json!(call.id));
    path::set(&mut value, &format.tool_name_path, json!(call.name));
    path::set(&mut value, &format.tool_args_path, json!(call.arguments));
    value
}

pub fn decode_tool_call(value: &Value, profile: &ProviderProfile) -> Option<ToolCallRequest> {
    let format = format_of(profile);
    let name = path::get(value, &format.tool_name_path)?.as_str()?.to_string();
    let arguments = match path::get(value, &format.tool_args_path) {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => "{}".to_string(),
    };
    Some(ToolCallRequest {
        id: path::get(value, &format.tool_id_path)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        name,
        arguments,
    })
}

pub fn build_request_body(
    profile: &ProviderProfile,
    params: &GenerationParams,
    model: &str,
    normalized: &NormalizedRequest,
    tools: &[Value],
) -> Value {
    let format = format_of(profile);
    let mut body = Value::Object(serde_json::Map::new());
    path::set(&mut body, "model", json!(model));

    let mut messages = normalized.messages.clone();
    let mut system_parameter = normalized.system_parameter.clone();
    if let (Some(system), None) = (&system_parameter, &format.system_field) {
        // No dedicated field configured: degrade to a leading system message.
        messages.insert(0, json!({"role": "system", "content": system}));
        system_parameter = None;
    }
    path::set(&mut body, &format.messages_field, json!(messages));
    if let (Some(system), Some(field)) = (&system_parameter, &format.system_field) {
        path::set(&mut body, field, json!(system));
    }

    if let Some(max_tokens) = params.max_tokens {
        path::set(&mut body, "max_tokens", json!(max_tokens));
    }
    if let Some(temperature) = params.temperature {
        path::set(&mut body, "temperature", json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        path::set(&mut body, "top_p", json!(top_p));
    }
    if !params.stop.is_empty() {
        path::set(&mut body, "stop", json!(params.stop));
    }
    if let Some(seed) = params.seed {
        path::set(&mut body, "seed", json!(seed));
    }
    if !tools.is_empty() {
        path::set(&mut body, &format.tools_field, json!(tools));
    }
    path::set(&mut body, "stream", json!(true));

    if let Value::Object(object) = &mut body {
        for (key, value) in &format.body_extra {
            object.insert(key.clone(), value.clone());
        }
    }

    body
}

// ─── Streaming response ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Path-driven parser. Tool-call fragments accumulate by array position and
/// flush as whole calls when the stream finishes, so fragmented and whole
/// argument payloads are handled the same way.
pub struct CustomStreamParser {
    format: CustomFormat,
    sent_meta: bool,
    finished: bool,
    pending_calls: Vec<PendingCall>,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl CustomStreamParser {
    pub fn new(format: CustomFormat) -> Self {
        Self {
            format,
            sent_meta: false,
            finished: false,
            pending_calls: Vec::new(),
            prompt_tokens: None,
            completion_tokens: None,
        }
    }

    fn flush_calls(&mut self) -> Vec<NativePart> {
        std::mem::take(&mut self.pending_calls)
            .into_iter()
            .filter_map(|call| {
                let name = call.name?;
                Some(NativePart::ToolCallComplete {
                    id: call.id,
                    name,
                    arguments_text: call.arguments,
                })
            })
            .collect()
    }

    fn absorb_tool_calls(&mut self, payload: &Value) {
        let Some(calls_path) = &self.format.tool_calls_path else {
            return;
        };
        let Some(entries) = path::get(payload, calls_path).and_then(Value::as_array) else {
            return;
        };
        for (position, entry) in entries.iter().enumerate() {
            // OpenAI-style fragments carry an explicit index; fall back to
            // list position for providers that do not.
            let slot = entry
                .get("index")
                .and_then(Value::as_u64)
                .map_or(position, |index| index as usize);
            while self.pending_calls.len() <= slot {
                self.pending_calls.push(PendingCall::default());
            }
            let pending = &mut self.pending_calls[slot];

            if let Some(id) = path::get(entry, &self.format.tool_id_path).and_then(Value::as_str) {
                pending.id = Some(id.to_string());
            }
            if let Some(name) =
                path::get(entry, &self.format.tool_name_path).and_then(Value::as_str)
            {
                pending.name = Some(name.to_string());
            }
            match path::get(entry, &self.format.tool_args_path) {
                Some(Value::String(fragment)) => pending.arguments.push_str(fragment),
                Some(other) if !other.is_null() => pending.arguments = other.to_string(),
                _ => {}
            }
        }
    }

    fn finish_part(&mut self, stop_reason: Option<crate::types::StopReason>) -> NativePart {
        self.finished = true;
        let usage = (self.prompt_tokens.is_some() || self.completion_tokens.is_some())
            .then(|| Usage::totalled(self.prompt_tokens, self.completion_tokens));
        NativePart::Finish { stop_reason, usage }
    }
}

impl StreamParser for CustomStreamParser {
    fn parse_frame(&mut self, frame: &SseFrame) -> Result<Vec<NativePart>, WireError> {
        let payload = match frame {
            SseFrame::Data(data) => data,
            SseFrame::Done => {
                if self.finished {
                    return Ok(Vec::new());
                }
                let mut parts = self.flush_calls();
                let stop_reason = (!parts.is_empty()).then_some(crate::types::StopReason::ToolUse);
                parts.push(self.finish_part(stop_reason));
                return Ok(parts);
            }
            _ => return Ok(Vec::new()),
        };

        let Ok(payload) = serde_json::from_str::<Value>(payload) else {
            tracing::debug!("skipping non-JSON data frame");
            return Ok(Vec::new());
        };

        if let Some(message) = payload.pointer("/error/message").and_then(Value::as_str) {
            return Err(WireError::Api {
                provider: "custom".to_string(),
                status: None,
                message: message.to_string(),
            });
        }

        let mut parts = Vec::new();

        if !self.sent_meta
            && let Some(model_path) = &self.format.model_path
            && let Some(model) = path::get(&payload, model_path).and_then(Value::as_str)
        {
            parts.push(NativePart::ResponseMeta {
                id: payload.get("id").and_then(Value::as_str).map(String::from),
                model: Some(model.to_string()),
            });
            self.sent_meta = true;
        }

        if let Some(reasoning_path) = &self.format.reasoning_path
            && let Some(reasoning) = path::get(&payload, reasoning_path).and_then(Value::as_str)
            && !reasoning.is_empty()
        {
            parts.push(NativePart::ReasoningDelta(reasoning.to_string()));
        }
        if let Some(text) = path::get(&payload, &self.format.text_path).and_then(Value::as_str)
            && !text.is_empty()
        {
            parts.push(NativePart::TextDelta(text.to_string()));
        }

        self.absorb_tool_calls(&payload);

        if let Some(tokens_path) = &self.format.prompt_tokens_path
            && let Some(tokens) = path::get(&payload, tokens_path).and_then(Value::as_u64)
        {
            self.prompt_tokens = Some(tokens);
        }
        if let Some(tokens_path) = &self.format.completion_tokens_path
            && let Some(tokens) = path::get(&payload, tokens_path).and_then(Value::as_u64)
        {
            self.completion_tokens = Some(tokens);
        }

        if let Some(finish_path) = &self.format.finish_path
            && let Some(reason) = path::get(&payload, finish_path).and_then(Value::as_str)
            && !self.finished
        {
            let mut flushed = self.flush_calls();
            let stop_reason = if flushed.is_empty() {
                map_finish_reason(reason)
            } else {
                crate::types::StopReason::ToolUse
            };
            parts.append(&mut flushed);
            parts.push(self.finish_part(Some(stop_reason)));
        }

        Ok(parts)
    }

    fn finish(&mut self) -> Vec<NativePart> {
        if self.finished {
            return Vec::new();
        }
        let mut parts = self.flush_calls();
        let stop_reason = (!parts.is_empty()).then_some(crate::types::StopReason::ToolUse);
        parts.push(self.finish_part(stop_reason));
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::{CustomStreamParser, build_request_body, encode_message};
    use crate::normalize::NormalizedRequest;
    use crate::profile::{CustomFormat, GenerationParams, ProviderProfile};
    use crate::protocol::{NativePart, StreamParser};
    use crate::sse::SseFrame;
    use crate::types::{ChatMessage, StopReason};
    use serde_json::json;

    fn openai_like_format() -> CustomFormat {
        serde_json::from_value(json!({
            "text_path": "choices[0].delta.content",
            "reasoning_path": "choices[0].delta.reasoning_content",
            "tool_calls_path": "choices[0].delta.tool_calls",
            "finish_path": "choices[0].finish_reason",
            "prompt_tokens_path": "usage.prompt_tokens",
            "completion_tokens_path": "usage.completion_tokens",
            "model_path": "model"
        }))
        .unwrap()
    }

    fn profile() -> ProviderProfile {
        ProviderProfile::custom("local", "http://localhost:8080", "/v1/chat", openai_like_format())
    }

    #[test]
    fn body_uses_configured_field_names() {
        let format: CustomFormat = serde_json::from_value(json!({
            "messages_field": "input",
            "system_field": "instructions",
            "tools_field": "functions",
            "text_path": "delta.text",
            "body_extra": {"cache": false}
        }))
        .unwrap();
        let profile = ProviderProfile::custom("alt", "http://localhost:9", "/gen", format);
        let normalized = NormalizedRequest {
            messages: vec![json!({"role": "user", "content": "hi"})],
            system_parameter: Some("be brief".into()),
        };
        let body = build_request_body(
            &profile,
            &GenerationParams::default(),
            "local-model",
            &normalized,
            &[json!({"name": "t"})],
        );
        assert_eq!(body["input"][0]["content"], "hi");
        assert_eq!(body["instructions"], "be brief");
        assert_eq!(body["functions"][0]["name"], "t");
        assert_eq!(body["cache"], false);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn system_parameter_without_field_degrades_to_message() {
        let normalized = NormalizedRequest {
            messages: vec![json!({"role": "user", "content": "hi"})],
            system_parameter: Some("S".into()),
        };
        let body = build_request_body(
            &profile(),
            &GenerationParams::default(),
            "m",
            &normalized,
            &[],
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "S");
    }

    #[test]
    fn tool_result_uses_profile_role_and_id_field() {
        let mut custom = profile();
        custom.tool_result_role = "function".into();
        custom.tool_id_field = "call_id".into();
        let encoded = encode_message(&ChatMessage::tool_result("c1", "ok", None), &custom);
        assert_eq!(encoded[0]["role"], "function");
        assert_eq!(encoded[0]["call_id"], "c1");
    }

    #[test]
    fn parser_extracts_text_and_reasoning_by_path() {
        let mut parser = CustomStreamParser::new(openai_like_format());
        let parts = parser
            .parse_frame(&SseFrame::Data(
                json!({"model": "local", "choices": [{"delta": {
                    "content": "hi", "reasoning_content": "hm"
                }}]})
                .to_string(),
            ))
            .unwrap();
        assert!(matches!(parts[0], NativePart::ResponseMeta { .. }));
        assert_eq!(parts[1], NativePart::ReasoningDelta("hm".into()));
        assert_eq!(parts[2], NativePart::TextDelta("hi".into()));
    }

    #[test]
    fn fragmented_tool_calls_flush_whole_on_finish() {
        let mut parser = CustomStreamParser::new(openai_like_format());
        parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "id": "c1", "function": {"name": "search", "arguments": "{\"q\":"}}
                ]}}]})
                .to_string(),
            ))
            .unwrap();
        parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "\"rust\"}"}}
                ]}}]})
                .to_string(),
            ))
            .unwrap();
        let parts = parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]}).to_string(),
            ))
            .unwrap();
        match &parts[0] {
            NativePart::ToolCallComplete {
                id,
                name,
                arguments_text,
            } => {
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(name, "search");
                assert_eq!(arguments_text, "{\"q\":\"rust\"}");
            }
            other => panic!("expected complete call, got {other:?}"),
        }
        assert!(matches!(
            parts[1],
            NativePart::Finish {
                stop_reason: Some(StopReason::ToolUse),
                ..
            }
        ));
    }

    #[test]
    fn done_without_finish_reason_still_finishes_once() {
        let mut parser = CustomStreamParser::new(openai_like_format());
        let parts = parser.parse_frame(&SseFrame::Done).unwrap();
        assert!(matches!(parts[0], NativePart::Finish { .. }));
        assert!(parser.parse_frame(&SseFrame::Done).unwrap().is_empty());
    }

    #[test]
    fn truncated_stream_flushes_pending_calls() {
        let mut parser = CustomStreamParser::new(openai_like_format());
        parser
            .parse_frame(&SseFrame::Data(
                json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "id": "c1", "function": {"name": "lookup", "arguments": "{}"}}
                ]}}]})
                .to_string(),
            ))
            .unwrap();

        // Byte stream ended without a finish reason or done sentinel.
        let parts = parser.finish();
        assert!(matches!(
            &parts[0],
            NativePart::ToolCallComplete { name, .. } if name == "lookup"
        ));
        assert!(matches!(
            parts[1],
            NativePart::Finish {
                stop_reason: Some(StopReason::ToolUse),
                ..
            }
        ));
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn usage_paths_feed_finish() {
        let mut parser = CustomStreamParser::new(openai_like_format());
        parser
            .parse_frame(&SseFrame::Data(
                json!({"usage": {"prompt_tokens": 9, "completion_tokens": 4},
                       "choices": []})
                .to_string(),
            ))
            .unwrap();
        let parts = parser.parse_frame(&SseFrame::Done).unwrap();
        match &parts[0] {
            NativePart::Finish { usage, .. } => {
                assert_eq!(usage.unwrap().total_tokens, Some(13));
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }
}
