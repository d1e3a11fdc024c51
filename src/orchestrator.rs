//! Streaming orchestration: one `generate` call drives normalization,
//! request assembly, transport, SSE decoding, native-part translation, and
//! canonical event emission, folding everything into a final
//! [`CollectedResponse`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::WireError;
use crate::event::{CollectedResponse, EventSink, StreamCollector, StreamEvent};
use crate::normalize;
use crate::profile::{
    AuthScheme, CredentialCache, GenerationParams, ProviderProfile, TransportParams,
};
use crate::protocol::{self, NativePart};
use crate::repair::parse_or_repair_arguments;
use crate::retry::{RetryPolicy, with_retry};
use crate::sse::{SseFrame, frame_stream};
use crate::thinking::{self, ThinkingStrategy};
use crate::tool_schema;
use crate::types::{ChatMessage, ResponseMetadata, StopReason, ToolDefinition, Usage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One generation call: history, tool surface, and per-call knobs.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// When present, only tools named here are offered to the provider.
    pub active_tools: Option<Vec<String>>,
    pub params: GenerationParams,
}

/// Protocol adapter bound to one provider profile. Cheap to clone state is
/// shared; one instance serves concurrent calls.
pub struct Orchestrator {
    profile: ProviderProfile,
    client: reqwest::Client,
    credentials: Arc<CredentialCache>,
    transport: TransportParams,
}

impl Orchestrator {
    pub fn new(
        profile: ProviderProfile,
        credentials: Arc<CredentialCache>,
        transport: TransportParams,
    ) -> Result<Self, WireError> {
        profile.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| WireError::Config(format!("http client: {error}")))?;
        Ok(Self {
            profile,
            client,
            credentials,
            transport,
        })
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    /// Run one streaming generation, emitting canonical events to `sink`.
    ///
    /// Failures before any output surface as `Err` (and are safe to retry);
    /// failures after output began are emitted as a terminal error event and
    /// the partial aggregate is returned. Cancellation always surfaces as
    /// [`WireError::Cancelled`].
    pub async fn generate(
        &self,
        request: &GenerateRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<CollectedResponse, WireError> {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(WireError::Cancelled),
            response = self.send_request(request) => response?,
        };

        let frames = frame_stream(response.bytes_stream(), protocol::sse_config(&self.profile));
        let mut frames = std::pin::pin!(frames);
        let mut session = Session::new(&self.profile, &request.model);

        loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(provider = %self.profile.name, "generation cancelled");
                    return Err(WireError::Cancelled);
                }
                frame = frames.next() => frame,
            };
            let Some(frame) = frame else {
                break;
            };

            match session.handle_frame(&frame, sink).await {
                FrameOutcome::Continue => {}
                FrameOutcome::Stop => break,
                FrameOutcome::Fail(error) => return Err(error),
            }
        }

        Ok(session.finalize(sink).await)
    }

    /// [`Orchestrator::generate`] under the transport retry policy.
    pub async fn generate_with_retry(
        &self,
        request: &GenerateRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<CollectedResponse, WireError> {
        let policy = RetryPolicy::default().with_max_retries(self.transport.max_retries);
        with_retry(&policy, || self.generate(request, sink, cancel)).await
    }

    async fn send_request(&self, request: &GenerateRequest) -> Result<reqwest::Response, WireError> {
        let normalized = normalize::normalize(
            &self.profile,
            &request.messages,
            request.system_prompt.as_deref(),
        );
        let tools = tool_schema::translate(&self.profile, &self.active_tools(request));
        let body = protocol::build_request_body(
            &self.profile,
            &request.params,
            &request.model,
            &normalized,
            &tools,
        );

        let mut url = protocol::request_url(&self.profile, &request.model)?;
        let secret = self.credentials.get(&self.profile.name);
        if secret.is_none() && self.profile.auth != AuthScheme::None {
            // Local endpoints often run unauthenticated; the provider rejects
            // the request if a credential was actually required.
            tracing::warn!(provider = %self.profile.name, "no credential configured");
        }
        if let (Some(secret), AuthScheme::Query { name }) = (&secret, &self.profile.auth) {
            url.query_pairs_mut().append_pair(name, secret);
        }

        let mut builder = self.client.post(url.clone()).json(&body);
        if let Some(secret) = &secret {
            builder = match &self.profile.auth {
                AuthScheme::Bearer => builder.bearer_auth(secret),
                AuthScheme::Header { name } => builder.header(name.as_str(), secret.as_str()),
                AuthScheme::Query { .. } | AuthScheme::None => builder,
            };
        }
        for (name, value) in &self.profile.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in &self.transport.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = self.transport.timeout {
            builder = builder.timeout(timeout);
        }

        tracing::debug!(provider = %self.profile.name, model = %request.model, "sending generation request");
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(String::from)
                })
                .unwrap_or(body);
            return Err(WireError::Api {
                provider: self.profile.name.clone(),
                status: Some(status.as_u16()),
                message,
            });
        }
        Ok(response)
    }

    fn active_tools(&self, request: &GenerateRequest) -> Vec<ToolDefinition> {
        match &request.active_tools {
            Some(names) => request
                .tools
                .iter()
                .filter(|tool| names.contains(&tool.name))
                .cloned()
                .collect(),
            None => request.tools.clone(),
        }
    }
}

enum FrameOutcome {
    Continue,
    Stop,
    Fail(WireError),
}

#[derive(Debug, Default)]
struct ToolBuilder {
    event_id: String,
    name: String,
    arguments: String,
    /// Argument fragments held back until the start event has gone out, so
    /// deltas never precede the start for their call id.
    pending_deltas: Vec<String>,
    started: bool,
    ended: bool,
}

/// Per-call streaming state: native parts in, canonical events out.
struct Session {
    provider: String,
    parser: Box<dyn protocol::StreamParser>,
    strategy: Box<dyn ThinkingStrategy>,
    collector: StreamCollector,
    builders: BTreeMap<usize, ToolBuilder>,
    next_call_id: usize,
    raw_text: String,
    native_reasoning: bool,
    emitted_any: bool,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
    response_id: Option<String>,
    response_model: Option<String>,
    terminal_error: bool,
}

impl Session {
    fn new(profile: &ProviderProfile, model: &str) -> Self {
        Self {
            provider: profile.name.clone(),
            parser: protocol::stream_parser(profile),
            strategy: thinking::strategy_for_model(model),
            collector: StreamCollector::new(),
            builders: BTreeMap::new(),
            next_call_id: 0,
            raw_text: String::new(),
            native_reasoning: false,
            emitted_any: false,
            stop_reason: None,
            usage: None,
            response_id: None,
            response_model: None,
            terminal_error: false,
        }
    }

    async fn emit(&mut self, sink: &dyn EventSink, event: StreamEvent) {
        self.emitted_any = true;
        self.collector.feed(&event);
        if sink.is_live() {
            sink.on_event(&event).await;
        }
    }

    async fn handle_frame(&mut self, frame: &SseFrame, sink: &dyn EventSink) -> FrameOutcome {
        if let SseFrame::Error(message) = frame {
            return self
                .terminal_error(sink, WireError::transport(message.clone()))
                .await;
        }

        let parts = match self.parser.parse_frame(frame) {
            Ok(parts) => parts,
            Err(error) => return self.terminal_error(sink, error).await,
        };
        for part in parts {
            self.handle_part(part, sink).await;
        }

        if matches!(frame, SseFrame::Done) {
            FrameOutcome::Stop
        } else {
            FrameOutcome::Continue
        }
    }

    /// A failure that ends the stream. Before any output it is the caller's
    /// to retry; after output it becomes a terminal error event and the
    /// partial aggregate survives.
    async fn terminal_error(&mut self, sink: &dyn EventSink, error: WireError) -> FrameOutcome {
        if !self.emitted_any {
            return FrameOutcome::Fail(error);
        }
        tracing::warn!(provider = %self.provider, "stream failed mid-flight: {error}");
        self.terminal_error = true;
        self.emit(
            sink,
            StreamEvent::Error {
                message: error.to_string(),
                code: error.code().to_string(),
                retryable: error.retryable(),
            },
        )
        .await;
        FrameOutcome::Stop
    }

    async fn handle_part(&mut self, part: NativePart, sink: &dyn EventSink) {
        match part {
            NativePart::TextDelta(text) => {
                self.raw_text.push_str(&text);
                if self.native_reasoning {
                    // A native reasoning channel makes marker scanning moot.
                    self.emit(sink, StreamEvent::Text { text }).await;
                } else {
                    let split = self.strategy.parse_chunk(&text);
                    self.emit_split(sink, split).await;
                }
            }
            NativePart::ReasoningDelta(text) => {
                self.native_reasoning = true;
                self.emit(sink, StreamEvent::Reasoning { text }).await;
            }
            NativePart::ToolCallStart { index, id, name } => {
                self.upsert_builder(index, id, name, sink).await;
            }
            NativePart::ToolCallArgsDelta { index, delta } => {
                let Some(builder) = self.builders.get_mut(&index) else {
                    tracing::debug!(index, "argument delta for unknown tool call");
                    return;
                };
                builder.arguments.push_str(&delta);
                if builder.started {
                    let event = StreamEvent::ToolCallDelta {
                        id: builder.event_id.clone(),
                        arguments_delta: delta,
                    };
                    self.emit(sink, event).await;
                } else {
                    // Name not known yet; hold the delta until the start event
                    // has gone out so ordering per call id is preserved.
                    builder.pending_deltas.push(delta);
                }
            }
            NativePart::ToolCallEnd { index } => {
                self.finish_builder(index, sink).await;
            }
            NativePart::ToolCallComplete {
                id,
                name,
                arguments_text,
            } => {
                let index = self
                    .builders
                    .keys()
                    .next_back()
                    .map_or(0, |highest| highest + 1);
                self.upsert_builder(index, id, Some(name), sink).await;
                if let Some(builder) = self.builders.get_mut(&index)
                    && !arguments_text.is_empty()
                {
                    builder.arguments = arguments_text.clone();
                    let event = StreamEvent::ToolCallDelta {
                        id: builder.event_id.clone(),
                        arguments_delta: arguments_text,
                    };
                    self.emit(sink, event).await;
                }
                self.finish_builder(index, sink).await;
            }
            NativePart::ResponseMeta { id, model } => {
                if self.response_id.is_none() {
                    self.response_id = id;
                }
                if self.response_model.is_none() {
                    self.response_model = model;
                }
            }
            NativePart::Finish { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if usage.is_some() {
                    self.usage = usage;
                }
            }
        }
    }

    async fn emit_split(&mut self, sink: &dyn EventSink, split: crate::thinking::SplitText) {
        if let Some(text) = split.thinking
            && !text.is_empty()
        {
            self.emit(sink, StreamEvent::Reasoning { text }).await;
        }
        if let Some(text) = split.content
            && !text.is_empty()
        {
            self.emit(sink, StreamEvent::Text { text }).await;
        }
    }

    async fn upsert_builder(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        sink: &dyn EventSink,
    ) {
        if !self.builders.contains_key(&index) {
            let event_id = id.clone().filter(|id| !id.is_empty()).unwrap_or_else(|| {
                let synthesized = format!("call_{}", self.next_call_id);
                self.next_call_id += 1;
                synthesized
            });
            self.builders.insert(
                index,
                ToolBuilder {
                    event_id,
                    ..ToolBuilder::default()
                },
            );
        }
        let builder = self
            .builders
            .get_mut(&index)
            .unwrap_or_else(|| unreachable!());
        if let Some(name) = name
            && !name.is_empty()
        {
            builder.name = name;
        }

        if !builder.started && !builder.name.is_empty() {
            builder.started = true;
            let event = StreamEvent::ToolCallStart {
                id: builder.event_id.clone(),
                name: builder.name.clone(),
            };
            let event_id = builder.event_id.clone();
            let held = std::mem::take(&mut builder.pending_deltas);
            self.emit(sink, event).await;
            for delta in held {
                self.emit(
                    sink,
                    StreamEvent::ToolCallDelta {
                        id: event_id.clone(),
                        arguments_delta: delta,
                    },
                )
                .await;
            }
        }
    }

    async fn finish_builder(&mut self, index: usize, sink: &dyn EventSink) {
        let Some(builder) = self.builders.get_mut(&index) else {
            return;
        };
        if builder.ended {
            return;
        }
        builder.ended = true;
        let id = builder.event_id.clone();
        let name = builder.name.clone();
        let arguments_text = builder.arguments.clone();
        let force_start = !builder.started;
        let held = std::mem::take(&mut builder.pending_deltas);
        builder.started = true;

        if force_start {
            // The stream ended without ever naming the call. Emit the start
            // anyway so every delta-end is preceded by a start for its id.
            self.emit(
                sink,
                StreamEvent::ToolCallStart {
                    id: id.clone(),
                    name: name.clone(),
                },
            )
            .await;
            for delta in held {
                self.emit(
                    sink,
                    StreamEvent::ToolCallDelta {
                        id: id.clone(),
                        arguments_delta: delta,
                    },
                )
                .await;
            }
        }

        self.emit(sink, StreamEvent::ToolCallDeltaEnd { id: id.clone() })
            .await;

        match parse_or_repair_arguments(&arguments_text) {
            Some((arguments, repaired)) => {
                if repaired {
                    tracing::debug!(call_id = %id, "tool-call arguments repaired");
                }
                self.emit(
                    sink,
                    StreamEvent::ToolCallAvailable {
                        id,
                        name,
                        arguments,
                    },
                )
                .await;
            }
            None => {
                // Recoverable per-call failure; the stream continues.
                let error = WireError::ToolArguments {
                    call_id: id,
                    message: "arguments are not valid JSON after repair".to_string(),
                };
                self.emit(
                    sink,
                    StreamEvent::Error {
                        message: error.to_string(),
                        code: error.code().to_string(),
                        retryable: false,
                    },
                )
                .await;
            }
        }
    }

    async fn finalize(mut self, sink: &dyn EventSink) -> CollectedResponse {
        if self.terminal_error {
            // No Done after a terminal error; hand back the partial aggregate.
            return self.collector.finish();
        }

        // Parts held back waiting for a sentinel that never came.
        for part in self.parser.finish() {
            self.handle_part(part, sink).await;
        }

        // Providers may end the byte stream without closing tool blocks.
        let open: Vec<usize> = self
            .builders
            .iter()
            .filter(|(_, builder)| !builder.ended)
            .map(|(index, _)| *index)
            .collect();
        for index in open {
            self.finish_builder(index, sink).await;
        }

        let flushed = self.strategy.finish();
        self.emit_split(sink, flushed).await;

        if !self.native_reasoning {
            let extracted = self.strategy.extract(&self.raw_text);
            if let Some(thinking) = extracted.thinking {
                self.collector
                    .override_split(thinking, extracted.content.unwrap_or_default());
            }
        }

        let metadata = ResponseMetadata {
            id: self.response_id.take(),
            model: self.response_model.take(),
            created: Some(chrono::Utc::now()),
            stop_reason: self.stop_reason,
        };
        let done = StreamEvent::Done {
            usage: self.usage,
            metadata: Some(metadata),
        };
        self.emit(sink, done).await;

        self.collector.finish()
    }
}
