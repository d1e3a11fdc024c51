use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::WireError;

/// Wire protocol family. Fixed per session: switching providers requires a
/// full re-normalization of history, never incremental patching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolFamily {
    OpenAi,
    Anthropic,
    Gemini,
    /// Response shape described entirely by [`CustomFormat`] configuration.
    Custom,
}

/// Where the concatenated system text lands in the native request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SystemMessageMode {
    /// Leading system-role entry in the message array.
    Message,
    /// Prefixed onto the first user turn's text, blank-line joined.
    FirstUser,
    /// Returned out-of-band for a dedicated transport field.
    Parameter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <secret>`
    Bearer,
    /// Named header carrying the raw secret, e.g. `x-api-key`.
    Header { name: String },
    /// Query parameter carrying the secret, e.g. `?key=`.
    Query { name: String },
    None,
}

/// Naming and wrapping of tool calls in a custom request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolWrapper {
    /// Value of the discriminator field, e.g. `"function"`.
    #[serde(default = "default_tool_type")]
    pub type_name: String,
    /// Field holding `{name, arguments}`, e.g. `"function"`.
    #[serde(default = "default_tool_field")]
    pub function_field: String,
}

fn default_tool_type() -> String {
    "function".to_string()
}

fn default_tool_field() -> String {
    "function".to_string()
}

impl Default for ToolWrapper {
    fn default() -> Self {
        Self {
            type_name: default_tool_type(),
            function_field: default_tool_field(),
        }
    }
}

/// Full description of a custom provider's request/response shape.
///
/// Response paths use the extractor syntax: `.` for objects, `[n]` for
/// array indices (e.g. `choices[0].delta.content`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomFormat {
    #[serde(default = "default_messages_field")]
    pub messages_field: String,
    #[serde(default)]
    pub system_field: Option<String>,
    #[serde(default = "default_tools_field")]
    pub tools_field: String,
    #[serde(default)]
    pub tool_wrapper: ToolWrapper,

    /// Extra top-level fields merged verbatim into the request body.
    #[serde(default)]
    pub body_extra: serde_json::Map<String, serde_json::Value>,

    // ── Streaming response paths ─────────────────────────────────────────
    pub text_path: String,
    #[serde(default)]
    pub reasoning_path: Option<String>,
    #[serde(default)]
    pub tool_calls_path: Option<String>,
    #[serde(default = "default_tool_id_path")]
    pub tool_id_path: String,
    #[serde(default = "default_tool_name_path")]
    pub tool_name_path: String,
    #[serde(default = "default_tool_args_path")]
    pub tool_args_path: String,
    #[serde(default)]
    pub finish_path: Option<String>,
    #[serde(default)]
    pub prompt_tokens_path: Option<String>,
    #[serde(default)]
    pub completion_tokens_path: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,

    // ── SSE framing knobs ────────────────────────────────────────────────
    #[serde(default = "default_data_prefix")]
    pub data_prefix: String,
    #[serde(default = "default_done_sentinel")]
    pub done_sentinel: String,
}

fn default_messages_field() -> String {
    "messages".to_string()
}

fn default_tools_field() -> String {
    "tools".to_string()
}

fn default_tool_id_path() -> String {
    "id".to_string()
}

fn default_tool_name_path() -> String {
    "function.name".to_string()
}

fn default_tool_args_path() -> String {
    "function.arguments".to_string()
}

fn default_data_prefix() -> String {
    "data:".to_string()
}

fn default_done_sentinel() -> String {
    "[DONE]".to_string()
}

/// One provider's protocol family, auth, and format knobs. Immutable for
/// the duration of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    pub family: ProtocolFamily,
    pub base_url: String,
    pub endpoint_path: String,
    pub auth: AuthScheme,
    pub system_mode: SystemMessageMode,
    #[serde(default)]
    pub vision: bool,
    /// Role used for tool-result turns (OpenAI-shaped protocols).
    #[serde(default = "default_tool_result_role")]
    pub tool_result_role: String,
    /// Field correlating a tool result to its call.
    #[serde(default = "default_tool_id_field")]
    pub tool_id_field: String,
    /// Image URL template; `{{url}}`, `{{base64}}`, `{{mediaType}}` substituted.
    #[serde(default)]
    pub image_template: Option<String>,
    #[serde(default)]
    pub extra_headers: Vec<(String, String)>,
    /// Present only when `family` is [`ProtocolFamily::Custom`].
    #[serde(default)]
    pub custom: Option<CustomFormat>,
}

fn default_tool_result_role() -> String {
    "tool".to_string()
}

fn default_tool_id_field() -> String {
    "tool_call_id".to_string()
}

impl ProviderProfile {
    pub fn openai() -> Self {
        Self {
            name: "openai".to_string(),
            family: ProtocolFamily::OpenAi,
            base_url: "https://api.openai.com".to_string(),
            endpoint_path: "/v1/chat/completions".to_string(),
            auth: AuthScheme::Bearer,
            system_mode: SystemMessageMode::Message,
            vision: true,
            tool_result_role: default_tool_result_role(),
            tool_id_field: default_tool_id_field(),
            image_template: None,
            extra_headers: Vec::new(),
            custom: None,
        }
    }

    pub fn anthropic() -> Self {
        Self {
            name: "anthropic".to_string(),
            family: ProtocolFamily::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            endpoint_path: "/v1/messages".to_string(),
            auth: AuthScheme::Header {
                name: "x-api-key".to_string(),
            },
            system_mode: SystemMessageMode::Parameter,
            vision: true,
            tool_result_role: default_tool_result_role(),
            tool_id_field: "tool_use_id".to_string(),
            image_template: None,
            extra_headers: vec![("anthropic-version".to_string(), "2023-06-01".to_string())],
            custom: None,
        }
    }

    pub fn gemini() -> Self {
        Self {
            name: "gemini".to_string(),
            family: ProtocolFamily::Gemini,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            endpoint_path: "/v1beta".to_string(),
            auth: AuthScheme::Query {
                name: "key".to_string(),
            },
            system_mode: SystemMessageMode::Parameter,
            vision: true,
            tool_result_role: default_tool_result_role(),
            tool_id_field: default_tool_id_field(),
            image_template: None,
            extra_headers: Vec::new(),
            custom: None,
        }
    }

    pub fn custom(
        name: impl Into<String>,
        base_url: impl Into<String>,
        endpoint_path: impl Into<String>,
        format: CustomFormat,
    ) -> Self {
        Self {
            name: name.into(),
            family: ProtocolFamily::Custom,
            base_url: base_url.into(),
            endpoint_path: endpoint_path.into(),
            auth: AuthScheme::Bearer,
            system_mode: SystemMessageMode::Message,
            vision: false,
            tool_result_role: default_tool_result_role(),
            tool_id_field: default_tool_id_field(),
            image_template: None,
            extra_headers: Vec::new(),
            custom: Some(format),
        }
    }

    /// Load a profile from operator-supplied TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, WireError> {
        let profile: Self =
            toml::from_str(raw).map_err(|error| WireError::Config(error.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), WireError> {
        url::Url::parse(&self.base_url)
            .map_err(|error| WireError::Config(format!("invalid base_url: {error}")))?;
        if self.family == ProtocolFamily::Custom && self.custom.is_none() {
            return Err(WireError::Config(
                "custom family requires a [custom] format section".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint_url(&self) -> Result<url::Url, WireError> {
        let base = url::Url::parse(&self.base_url)
            .map_err(|error| WireError::Config(format!("invalid base_url: {error}")))?;
        base.join(&self.endpoint_path)
            .map_err(|error| WireError::Config(format!("invalid endpoint_path: {error}")))
    }
}

/// Extended-reasoning toggle forwarded to providers that support it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub enabled: bool,
    /// Anthropic thinking budget, in tokens.
    #[serde(default)]
    pub budget_tokens: Option<u64>,
    /// OpenAI reasoning effort ("low" | "medium" | "high").
    #[serde(default)]
    pub effort: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub stop: Vec<String>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
}

#[derive(Debug, Clone)]
pub struct TransportParams {
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub headers: Vec<(String, String)>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(120)),
            max_retries: 3,
            headers: Vec::new(),
        }
    }
}

/// Operator-supplied credentials, shared read-mostly across orchestrator
/// instances. Writes replace the whole map: last writer wins, acceptable
/// because this is configuration, not contended application data.
#[derive(Debug, Default)]
pub struct CredentialCache {
    secrets: ArcSwap<HashMap<String, String>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: &str) -> Option<String> {
        self.secrets.load().get(provider).cloned()
    }

    pub fn set(&self, provider: impl Into<String>, secret: impl Into<String>) {
        let mut next: HashMap<String, String> = self.secrets.load().as_ref().clone();
        next.insert(provider.into(), secret.into());
        self.secrets.store(Arc::new(next));
    }
}
