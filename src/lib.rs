#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::return_self_not_must_use
)]

//! Protocol adaptation and streaming orchestration for LLM chat providers.
//!
//! One unified message/tool vocabulary goes in; the [`Orchestrator`] speaks
//! the provider's native wire dialect (OpenAI-, Anthropic-, or Gemini-shaped,
//! or a fully config-driven custom shape) and emits one canonical event
//! stream back out, with SSE decoding, reasoning separation, tool-call
//! assembly and repair, retry, and cancellation handled along the way.

pub mod error;
pub mod event;
pub mod normalize;
pub mod orchestrator;
pub mod path;
pub mod profile;
pub mod protocol;
pub mod repair;
pub mod retry;
pub mod sse;
pub mod thinking;
pub mod tool_schema;
pub mod types;

pub use error::WireError;
pub use event::{
    ChannelEventSink, CollectedResponse, EventSink, NullEventSink, StreamCollector, StreamEvent,
};
pub use orchestrator::{GenerateRequest, Orchestrator};
pub use profile::{
    AuthScheme, CredentialCache, CustomFormat, GenerationParams, ProtocolFamily, ProviderProfile,
    ReasoningConfig, SystemMessageMode, TransportParams,
};
pub use retry::{RetryPolicy, with_retry};
pub use types::{
    ChatMessage, ImageSource, MessageContent, MessagePart, ResponseMetadata, Role, StopReason,
    ToolCallRequest, ToolDefinition, Usage,
};
