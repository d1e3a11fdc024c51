use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::types::{ResponseMetadata, ToolCallRequest, Usage};

/// Canonical, provider-independent stream event.
///
/// Per tool-call id: `ToolCallStart` precedes all deltas, which precede
/// exactly one `ToolCallDeltaEnd`, which precedes at most one
/// `ToolCallAvailable`. Exactly one `Done` terminates a successful stream;
/// no content events follow the first terminal `Error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    /// Emitted with id+name only, before arguments finish, so a pending UI
    /// affordance can render immediately.
    ToolCallStart {
        id: String,
        name: String,
    },
    /// Raw incremental argument-JSON fragment.
    ToolCallDelta {
        id: String,
        arguments_delta: String,
    },
    ToolCallDeltaEnd {
        id: String,
    },
    ToolCallAvailable {
        id: String,
        name: String,
        arguments: Value,
    },
    Error {
        message: String,
        code: String,
        retryable: bool,
    },
    Done {
        usage: Option<Usage>,
        metadata: Option<ResponseMetadata>,
    },
}

/// Destination surface for canonical events. `is_live` is the
/// destination-gone guard: once it reports false the orchestrator keeps
/// draining the provider stream but emits nothing further.
pub trait EventSink: Send + Sync {
    fn is_live(&self) -> bool {
        true
    }

    fn on_event<'a>(
        &'a self,
        event: &'a StreamEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Debug, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn on_event<'a>(
        &'a self,
        _event: &'a StreamEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }
}

/// Forwards events over an mpsc channel; liveness follows the receiver.
pub struct ChannelEventSink {
    sender: mpsc::Sender<StreamEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::Sender<StreamEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn is_live(&self) -> bool {
        !self.sender.is_closed()
    }

    fn on_event<'a>(
        &'a self,
        event: &'a StreamEvent,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = self.sender.send(event.clone()).await;
        })
    }
}

/// Folds canonical events into the final aggregate the caller receives.
#[derive(Debug, Default)]
pub struct StreamCollector {
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    metadata: Option<ResponseMetadata>,
    errors: Vec<String>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text { text } => self.content.push_str(text),
            StreamEvent::Reasoning { text } => self.reasoning.push_str(text),
            StreamEvent::ToolCallAvailable {
                id,
                name,
                arguments,
            } => {
                self.tool_calls.push(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.to_string(),
                });
            }
            StreamEvent::Error { message, .. } => self.errors.push(message.clone()),
            StreamEvent::Done { usage, metadata } => {
                self.usage = *usage;
                self.metadata.clone_from(metadata);
            }
            StreamEvent::ToolCallStart { .. }
            | StreamEvent::ToolCallDelta { .. }
            | StreamEvent::ToolCallDeltaEnd { .. } => {}
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn reasoning(&self) -> Option<&str> {
        (!self.reasoning.is_empty()).then_some(self.reasoning.as_str())
    }

    /// Replace incrementally accumulated reasoning/content, used when a
    /// whole-text extraction pass wins at finalize time.
    pub fn override_split(&mut self, reasoning: String, content: String) {
        self.reasoning = reasoning;
        self.content = content;
    }

    pub fn finish(self) -> CollectedResponse {
        CollectedResponse {
            content: self.content,
            reasoning: (!self.reasoning.is_empty()).then_some(self.reasoning),
            tool_calls: self.tool_calls,
            usage: self.usage,
            metadata: self.metadata,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedResponse {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
    pub metadata: Option<ResponseMetadata>,
    /// Recoverable per-call errors observed mid-stream; partial output is
    /// never discarded on error.
    pub errors: Vec<String>,
}
