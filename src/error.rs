use thiserror::Error;

/// Structured error for the protocol adaptation layer.
///
/// Callers match on the variant (or use [`WireError::code`] /
/// [`WireError::retryable`]) to decide recovery strategy. Errors cross the
/// `generate` boundary unchanged so the original failure kind survives a
/// retry wrapper.
#[derive(Debug, Error)]
pub enum WireError {
    /// Network-level failure: DNS, connect, reset, timeout.
    #[error("transport: {message}")]
    Transport { message: String },

    /// Provider-reported failure: non-success status or structured error payload.
    #[error("provider {provider} error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Api {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Unexpected or unparseable incremental payload.
    #[error("malformed stream part: {message}")]
    Stream { message: String },

    /// Tool-call argument text that could not be parsed or repaired.
    #[error("tool call {call_id} arguments unparseable: {message}")]
    ToolArguments { call_id: String, message: String },

    /// Invalid profile or request configuration.
    #[error("config: {0}")]
    Config(String),

    /// The caller's abort signal fired before the stream completed.
    #[error("cancelled")]
    Cancelled,
}

/// Substrings that mark a transport or provider failure as transient.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "dns",
    "rate limit",
    "429",
    "503",
    "504",
    "temporarily unavailable",
    "overloaded",
];

fn message_is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES
        .iter()
        .any(|signature| lower.contains(signature))
}

impl WireError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, carried on canonical error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Api { .. } => "provider",
            Self::Stream { .. } => "stream",
            Self::ToolArguments { .. } => "tool_arguments",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::Transport { message } => message_is_transient(message),
            Self::Api {
                status, message, ..
            } => match status {
                Some(429 | 503 | 504 | 408) => true,
                Some(code) if (400..500).contains(code) => false,
                Some(_) => true,
                None => message_is_transient(message),
            },
            Self::Stream { .. } | Self::ToolArguments { .. } | Self::Config(_) | Self::Cancelled => {
                false
            }
        }
    }
}

impl From<reqwest::Error> for WireError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            Self::Api {
                provider: error
                    .url()
                    .and_then(url::Url::host_str)
                    .unwrap_or("unknown")
                    .to_string(),
                status: Some(status.as_u16()),
                message: error.to_string(),
            }
        } else {
            Self::Transport {
                message: error.to_string(),
            }
        }
    }
}
