//! Per-model separation of interleaved reasoning and answer text, for
//! providers without a first-class reasoning channel. Providers that stream
//! reasoning natively bypass these strategies entirely.

/// Output of one strategy pass: reasoning text and/or answer text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitText {
    pub thinking: Option<String>,
    pub content: Option<String>,
}

pub trait ThinkingStrategy: Send {
    /// Classify one streamed text chunk. Cross-chunk marker state is kept
    /// inside the strategy; a marker may split across two chunks.
    fn parse_chunk(&mut self, chunk: &str) -> SplitText;

    /// Re-extract from the full aggregate text once streaming finishes. A
    /// non-empty result overrides incrementally accumulated reasoning.
    fn extract(&self, full_text: &str) -> SplitText;

    /// Flush any held-back text at end of stream.
    fn finish(&mut self) -> SplitText {
        SplitText::default()
    }

    /// Clear cross-chunk state. Runs once per new streaming session.
    fn reset(&mut self);
}

/// Default no-op pass-through: everything is answer content.
#[derive(Debug, Default)]
pub struct PassthroughStrategy;

impl ThinkingStrategy for PassthroughStrategy {
    fn parse_chunk(&mut self, chunk: &str) -> SplitText {
        SplitText {
            thinking: None,
            content: Some(chunk.to_string()),
        }
    }

    fn extract(&self, _full_text: &str) -> SplitText {
        SplitText::default()
    }

    fn reset(&mut self) {}
}

/// Marker-pair strategy for models that interleave reasoning and answer in
/// one text channel (e.g. `<think>...</think>`).
#[derive(Debug)]
pub struct TagStrategy {
    open: String,
    close: String,
    in_thinking: bool,
    /// Trailing bytes that may be the start of a marker split across chunks.
    pending: String,
}

impl TagStrategy {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            in_thinking: false,
            pending: String::new(),
        }
    }

    pub fn think_tags() -> Self {
        Self::new("<think>", "</think>")
    }

    fn active_marker(&self) -> &str {
        if self.in_thinking {
            &self.close
        } else {
            &self.open
        }
    }

    /// Longest suffix of `text` that is a proper prefix of `marker`.
    fn marker_prefix_len(text: &str, marker: &str) -> usize {
        let max = marker.len().saturating_sub(1).min(text.len());
        for length in (1..=max).rev() {
            if !text.is_char_boundary(text.len() - length) {
                continue;
            }
            if marker.starts_with(&text[text.len() - length..]) {
                return length;
            }
        }
        0
    }
}

impl ThinkingStrategy for TagStrategy {
    fn parse_chunk(&mut self, chunk: &str) -> SplitText {
        let mut buffer = std::mem::take(&mut self.pending);
        buffer.push_str(chunk);

        let mut thinking = String::new();
        let mut content = String::new();

        loop {
            let marker = self.active_marker().to_string();
            let target = if self.in_thinking {
                &mut thinking
            } else {
                &mut content
            };

            if let Some(position) = buffer.find(&marker) {
                target.push_str(&buffer[..position]);
                buffer.drain(..position + marker.len());
                self.in_thinking = !self.in_thinking;
            } else {
                let hold = Self::marker_prefix_len(&buffer, &marker);
                let emit_to = buffer.len() - hold;
                target.push_str(&buffer[..emit_to]);
                self.pending = buffer.split_off(emit_to);
                break;
            }
        }

        SplitText {
            thinking: (!thinking.is_empty()).then_some(thinking),
            content: (!content.is_empty()).then_some(content),
        }
    }

    fn extract(&self, full_text: &str) -> SplitText {
        let Some(open_at) = full_text.find(&self.open) else {
            return SplitText::default();
        };
        let after_open = &full_text[open_at + self.open.len()..];

        let (thinking, tail) = match after_open.find(&self.close) {
            Some(close_at) => (
                &after_open[..close_at],
                &after_open[close_at + self.close.len()..],
            ),
            // Unterminated reasoning block: everything after the marker is
            // reasoning, no answer followed.
            None => (after_open, ""),
        };

        let mut content = full_text[..open_at].to_string();
        content.push_str(tail);
        let content = content.trim().to_string();
        let thinking = thinking.trim().to_string();

        SplitText {
            thinking: (!thinking.is_empty()).then_some(thinking),
            content: Some(content),
        }
    }

    fn finish(&mut self) -> SplitText {
        let held = std::mem::take(&mut self.pending);
        if held.is_empty() {
            return SplitText::default();
        }
        if self.in_thinking {
            SplitText {
                thinking: Some(held),
                content: None,
            }
        } else {
            SplitText {
                thinking: None,
                content: Some(held),
            }
        }
    }

    fn reset(&mut self) {
        self.in_thinking = false;
        self.pending.clear();
    }
}

/// Model identifiers known to emit tag-marked reasoning in the text channel.
const TAG_MODEL_MARKERS: &[&str] = &["deepseek-r1", "deepseek-reasoner", "qwq", "r1-distill"];

/// Select the strategy for a model identifier. Unknown models pass through.
pub fn strategy_for_model(model: &str) -> Box<dyn ThinkingStrategy> {
    let lower = model.to_ascii_lowercase();
    if TAG_MODEL_MARKERS.iter().any(|marker| lower.contains(marker)) {
        Box::new(TagStrategy::think_tags())
    } else {
        Box::new(PassthroughStrategy)
    }
}
