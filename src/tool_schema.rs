//! Tool schema translation between the unified [`ToolDefinition`] /
//! [`ToolCallRequest`] vocabulary and each family's native shapes. Encoding
//! and decoding are paired per family: decoding an encoded call yields the
//! original name and argument text.

use serde_json::Value;

use crate::profile::{ProtocolFamily, ProviderProfile};
use crate::protocol::{anthropic, custom, gemini, openai};
use crate::types::{ToolCallRequest, ToolDefinition};

/// Native tool schema array for the profile's family.
pub fn translate(profile: &ProviderProfile, tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| match profile.family {
            ProtocolFamily::OpenAi => openai::encode_tool(tool),
            ProtocolFamily::Anthropic => anthropic::encode_tool(tool),
            ProtocolFamily::Gemini => gemini::encode_tool(tool),
            ProtocolFamily::Custom => custom::encode_tool(tool, profile),
        })
        .collect()
}

/// Native representation of one assistant tool call, as it appears inside
/// an assistant history turn.
pub fn encode_tool_call(profile: &ProviderProfile, call: &ToolCallRequest) -> Value {
    match profile.family {
        ProtocolFamily::OpenAi => openai::encode_tool_call(call),
        ProtocolFamily::Anthropic => anthropic::encode_tool_call(call),
        ProtocolFamily::Gemini => gemini::encode_tool_call(call),
        ProtocolFamily::Custom => custom::encode_tool_call(call, profile),
    }
}

/// Inverse of [`encode_tool_call`]. `None` on a shape that is not a tool
/// call for this family.
pub fn decode_tool_call(profile: &ProviderProfile, value: &Value) -> Option<ToolCallRequest> {
    match profile.family {
        ProtocolFamily::OpenAi => openai::decode_tool_call(value),
        ProtocolFamily::Anthropic => anthropic::decode_tool_call(value),
        ProtocolFamily::Gemini => gemini::decode_tool_call(value),
        ProtocolFamily::Custom => custom::decode_tool_call(value, profile),
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_tool_call, encode_tool_call, translate};
    use crate::profile::{CustomFormat, ProviderProfile};
    use crate::types::{ToolCallRequest, ToolDefinition};
    use serde_json::json;

    fn sample_call() -> ToolCallRequest {
        ToolCallRequest {
            id: "call_7".into(),
            name: "get_weather".into(),
            arguments: r#"{"city":"Oslo"}"#.into(),
        }
    }

    fn sample_tool() -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"],
                "additionalProperties": false
            }),
        }
    }

    #[test]
    fn round_trip_holds_for_every_family() {
        let custom_format: CustomFormat =
            serde_json::from_value(json!({"text_path": "delta.text"})).unwrap();
        let profiles = [
            ProviderProfile::openai(),
            ProviderProfile::anthropic(),
            ProviderProfile::gemini(),
            ProviderProfile::custom("local", "http://localhost:1234", "/chat", custom_format),
        ];
        for profile in &profiles {
            let call = sample_call();
            let decoded = decode_tool_call(profile, &encode_tool_call(profile, &call))
                .unwrap_or_else(|| panic!("decode failed for {}", profile.name));
            assert_eq!(decoded.name, call.name, "family {}", profile.name);
            let expected: serde_json::Value = serde_json::from_str(&call.arguments).unwrap();
            let got: serde_json::Value = serde_json::from_str(&decoded.arguments).unwrap();
            assert_eq!(got, expected, "family {}", profile.name);
        }
    }

    #[test]
    fn openai_schema_wraps_function() {
        let translated = translate(&ProviderProfile::openai(), &[sample_tool()]);
        assert_eq!(translated[0]["type"], "function");
        assert_eq!(translated[0]["function"]["name"], "get_weather");
    }

    #[test]
    fn anthropic_schema_uses_input_schema() {
        let translated = translate(&ProviderProfile::anthropic(), &[sample_tool()]);
        assert_eq!(translated[0]["name"], "get_weather");
        assert_eq!(translated[0]["input_schema"]["type"], "object");
    }

    #[test]
    fn gemini_schema_drops_unsupported_keywords() {
        let translated = translate(&ProviderProfile::gemini(), &[sample_tool()]);
        let declaration = &translated[0]["functionDeclarations"][0];
        assert_eq!(declaration["name"], "get_weather");
        assert!(declaration["parameters"].get("additionalProperties").is_none());
    }
}
