//! Native protocol families. Each family is a pure function set over the
//! same normalized inputs — request assembly on the way out, incremental
//! part extraction on the way back — selected by tagged-variant dispatch on
//! [`ProtocolFamily`], never subclassing.

pub mod anthropic;
pub mod custom;
pub mod gemini;
pub mod openai;

use serde_json::Value;

use crate::error::WireError;
use crate::normalize::NormalizedRequest;
use crate::profile::{ProtocolFamily, ProviderProfile};
use crate::sse::{SseConfig, SseFrame};
use crate::types::{StopReason, Usage};

/// One incremental unit extracted from a provider's native stream, before
/// canonical translation by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum NativePart {
    TextDelta(String),
    /// First-class reasoning channel; bypasses the thinking strategy.
    ReasoningDelta(String),
    ToolCallStart {
        index: usize,
        id: Option<String>,
        name: Option<String>,
    },
    ToolCallArgsDelta {
        index: usize,
        delta: String,
    },
    ToolCallEnd {
        index: usize,
    },
    /// A tool call that arrived whole (Gemini, custom profiles). Arguments
    /// stay textual so the repair path applies uniformly.
    ToolCallComplete {
        id: Option<String>,
        name: String,
        arguments_text: String,
    },
    ResponseMeta {
        id: Option<String>,
        model: Option<String>,
    },
    Finish {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
}

/// Stateful incremental parser over SSE frames for one streaming session.
pub trait StreamParser: Send {
    fn parse_frame(&mut self, frame: &SseFrame) -> Result<Vec<NativePart>, WireError>;

    /// Release parts still held back when the byte stream ends without a
    /// done sentinel.
    fn finish(&mut self) -> Vec<NativePart> {
        Vec::new()
    }
}

pub fn stream_parser(profile: &ProviderProfile) -> Box<dyn StreamParser> {
    match profile.family {
        ProtocolFamily::OpenAi => Box::new(openai::OpenAiStreamParser::new()),
        ProtocolFamily::Anthropic => Box::new(anthropic::AnthropicStreamParser::new()),
        ProtocolFamily::Gemini => Box::new(gemini::GeminiStreamParser::new()),
        ProtocolFamily::Custom => Box::new(custom::CustomStreamParser::new(
            profile.custom.clone().unwrap_or_else(default_custom_format),
        )),
    }
}

/// SSE framing for the family; only custom profiles deviate from defaults.
pub fn sse_config(profile: &ProviderProfile) -> SseConfig {
    match (&profile.family, &profile.custom) {
        (ProtocolFamily::Custom, Some(format)) => SseConfig {
            data_prefix: format.data_prefix.clone(),
            done_sentinel: format.done_sentinel.clone(),
        },
        _ => SseConfig::default(),
    }
}

/// Encode one unified message into zero or more native messages.
pub fn encode_message(profile: &ProviderProfile, message: &crate::types::ChatMessage) -> Vec<Value> {
    match profile.family {
        ProtocolFamily::OpenAi => openai::encode_message(message, profile),
        ProtocolFamily::Anthropic => anthropic::encode_message(message, profile),
        ProtocolFamily::Gemini => gemini::encode_message(message, profile),
        ProtocolFamily::Custom => custom::encode_message(message, profile),
    }
}

/// Assemble the native request body for one generation call.
pub fn build_request_body(
    profile: &ProviderProfile,
    params: &crate::profile::GenerationParams,
    model: &str,
    normalized: &NormalizedRequest,
    tools: &[Value],
) -> Value {
    match profile.family {
        ProtocolFamily::OpenAi => openai::build_request_body(params, model, normalized, tools),
        ProtocolFamily::Anthropic => {
            anthropic::build_request_body(params, model, normalized, tools)
        }
        ProtocolFamily::Gemini => gemini::build_request_body(params, normalized, tools),
        ProtocolFamily::Custom => custom::build_request_body(profile, params, model, normalized, tools),
    }
}

/// Streaming endpoint for one call. Gemini addresses the model in the path;
/// the other families post to a fixed endpoint.
pub fn request_url(profile: &ProviderProfile, model: &str) -> Result<url::Url, WireError> {
    let base = profile.endpoint_url()?;
    match profile.family {
        ProtocolFamily::Gemini => {
            let path = format!(
                "{}/models/{}:streamGenerateContent",
                base.path().trim_end_matches('/'),
                model
            );
            let mut url = base;
            url.set_path(&path);
            url.set_query(Some("alt=sse"));
            Ok(url)
        }
        _ => Ok(base),
    }
}

fn default_custom_format() -> crate::profile::CustomFormat {
    // Profiles are validated before use; this fallback only guards against
    // construction that skipped validate().
    serde_json::from_value(serde_json::json!({
        "text_path": "choices[0].delta.content"
    }))
    .unwrap_or_else(|_| unreachable!())
}

pub(crate) fn map_finish_reason(reason: &str) -> StopReason {
    match reason {
        "stop" | "end_turn" | "STOP" | "stop_sequence" => StopReason::EndTurn,
        "tool_calls" | "tool_use" | "FUNCTION_CALL" => StopReason::ToolUse,
        "length" | "max_tokens" | "MAX_TOKENS" => StopReason::MaxTokens,
        _ => StopReason::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::{map_finish_reason, request_url};
    use crate::profile::ProviderProfile;
    use crate::types::StopReason;

    #[test]
    fn finish_reason_mapping_covers_families() {
        assert_eq!(map_finish_reason("stop"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("end_turn"), StopReason::EndTurn);
        assert_eq!(map_finish_reason("tool_calls"), StopReason::ToolUse);
        assert_eq!(map_finish_reason("MAX_TOKENS"), StopReason::MaxTokens);
        assert_eq!(map_finish_reason("mystery"), StopReason::Error);
    }

    #[test]
    fn gemini_url_addresses_model_in_path() {
        let url = request_url(&ProviderProfile::gemini(), "gemini-2.0-flash").unwrap();
        assert_eq!(
            url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn fixed_endpoint_families_ignore_model_in_url() {
        let url = request_url(&ProviderProfile::openai(), "gpt-4o").unwrap();
        assert_eq!(url.as_str(), "https://api.openai.com/v1/chat/completions");
    }
}
