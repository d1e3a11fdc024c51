use futures_util::{Stream, StreamExt};

/// Framing knobs for one provider's SSE dialect. The decoder interprets only
/// line framing plus these two tokens; payload semantics belong to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct SseConfig {
    pub data_prefix: String,
    pub done_sentinel: String,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            data_prefix: "data:".to_string(),
            done_sentinel: "[DONE]".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// Payload of one `data:` line, passed through as a raw string even when
    /// it is not valid JSON.
    Data(String),
    /// Name from an `event:` line.
    Event(String),
    Done,
    /// Transport failure surfaced mid-stream (emitted by [`frame_stream`]).
    Error(String),
}

/// Incremental SSE line decoder. Bytes go in via [`SseDecoder::push_chunk`];
/// complete frames come out via [`SseDecoder::next_frame`]. Partial lines are
/// buffered across chunk boundaries, so splitting one byte stream at
/// arbitrary points yields the same frame sequence as feeding it whole.
#[derive(Debug, Default)]
pub struct SseDecoder {
    config: SseConfig,
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    pub fn new(config: SseConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            done: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) {
        if !self.done {
            self.buffer.extend_from_slice(chunk);
        }
    }

    /// Next complete frame, or `None` when the buffer holds no full line.
    /// After [`SseFrame::Done`] no further lines are read.
    pub fn next_frame(&mut self) -> Option<SseFrame> {
        while !self.done {
            let newline = self.buffer.iter().position(|byte| *byte == b'\n')?;
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..newline]);
            if let Some(frame) = self.decode_line(line.trim_end_matches('\r')) {
                if frame == SseFrame::Done {
                    self.done = true;
                    self.buffer.clear();
                }
                return Some(frame);
            }
        }
        None
    }

    /// One final flush of a non-terminated trailing line at end of stream.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.done || self.buffer.is_empty() {
            return None;
        }
        let trailing = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
        let frame = self.decode_line(trailing.trim_end_matches('\r'))?;
        if frame == SseFrame::Done {
            self.done = true;
        }
        Some(frame)
    }

    fn decode_line(&self, line: &str) -> Option<SseFrame> {
        if line.is_empty() || line.starts_with(':') {
            return None;
        }

        if let Some(payload) = line.strip_prefix(self.config.data_prefix.as_str()) {
            let payload = payload.strip_prefix(' ').unwrap_or(payload);
            if payload == self.config.done_sentinel {
                return Some(SseFrame::Done);
            }
            return Some(SseFrame::Data(payload.to_string()));
        }

        if let Some(name) = line.strip_prefix("event:") {
            let name = name.trim();
            // Streams may signal completion by event name rather than payload.
            if name == self.config.done_sentinel || name == "done" {
                return Some(SseFrame::Done);
            }
            return Some(SseFrame::Event(name.to_string()));
        }

        // Unknown field names (id:, retry:, ...) are skipped.
        None
    }
}

/// Adapt a transport byte stream into a frame stream. Transport errors become
/// [`SseFrame::Error`] so the consuming loop can emit one canonical error and
/// stop; the stream always terminates after `Done` or `Error`.
pub fn frame_stream<S, B, E>(
    byte_stream: S,
    config: SseConfig,
) -> impl Stream<Item = SseFrame> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new(config);
        let mut byte_stream = std::pin::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    decoder.push_chunk(chunk.as_ref());
                    while let Some(frame) = decoder.next_frame() {
                        let is_done = frame == SseFrame::Done;
                        yield frame;
                        if is_done {
                            return;
                        }
                    }
                }
                Err(error) => {
                    yield SseFrame::Error(error.to_string());
                    return;
                }
            }
        }

        if let Some(frame) = decoder.finish() {
            yield frame;
        }
    }
}
