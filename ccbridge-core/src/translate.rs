//! Upstream-to-downstream stream translation.
//!
//! The translator is a small state machine fed decoded upstream events and
//! producing the downstream `StreamEvent` sequence. It owns the ordering
//! guarantees the downstream adapter relies on:
//! - the `Role` announcement is emitted exactly once, before the first
//!   `Content` event;
//! - content deltas pass through in arrival order, unbatched;
//! - the stream terminates exactly once, with `Finish` + `Done` on success
//!   or a single `Error` on failure.

use crate::error::BridgeError;
use crate::stream::StreamEvent;

/// Decoded upstream message events, dialect-independent. Backends decode
/// their wire format into these before handing them to the translator.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Start of a message; carries the prompt-side token count when known.
    MessageStart { model: String, input_tokens: u32 },
    /// Incremental assistant text.
    ContentDelta(String),
    /// Late metadata: completion-side token count and stop reason.
    MessageDelta {
        output_tokens: u32,
        stop_reason: Option<String>,
    },
    /// End of message.
    MessageStop,
    /// Anything the backend recognized but has no translation for.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstDelta,
    Streaming,
    Completed,
    Failed,
}

/// Per-request translator. Create one per upstream stream; feed it events
/// with [`on_event`](Self::on_event) and close it with
/// [`finish`](Self::finish) or [`fail`](Self::fail).
#[derive(Debug)]
pub struct StreamTranslator {
    phase: Phase,
    model: Option<String>,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
    text: String,
}

impl Default for StreamTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTranslator {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingFirstDelta,
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
            text: String::new(),
        }
    }

    /// Translate one upstream event into zero or more downstream events.
    /// Events arriving after the stream has terminated are dropped.
    pub fn on_event(&mut self, event: UpstreamEvent) -> Vec<StreamEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        match event {
            UpstreamEvent::MessageStart {
                model,
                input_tokens,
            } => {
                self.model = Some(model);
                self.input_tokens = input_tokens;
                Vec::new()
            }
            UpstreamEvent::ContentDelta(delta) => {
                self.text.push_str(&delta);
                if self.phase == Phase::AwaitingFirstDelta {
                    self.phase = Phase::Streaming;
                    vec![StreamEvent::Role, StreamEvent::Content(delta)]
                } else {
                    vec![StreamEvent::Content(delta)]
                }
            }
            UpstreamEvent::MessageDelta {
                output_tokens,
                stop_reason,
            } => {
                self.output_tokens = output_tokens;
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                Vec::new()
            }
            UpstreamEvent::MessageStop => self.finish(),
            UpstreamEvent::Other => Vec::new(),
        }
    }

    /// Close the stream successfully. A stream that produced no content
    /// still announces the role so the downstream shape stays uniform.
    /// Idempotent: a second call returns nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.phase == Phase::AwaitingFirstDelta {
            out.push(StreamEvent::Role);
        }
        self.phase = Phase::Completed;
        out.push(StreamEvent::Finish {
            reason: self.stop_reason.clone().unwrap_or_else(|| "stop".to_string()),
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        });
        out.push(StreamEvent::Done);
        out
    }

    /// Close the stream with an error. Idempotent after any terminal.
    pub fn fail(&mut self, err: BridgeError) -> Vec<StreamEvent> {
        if self.is_terminal() {
            return Vec::new();
        }
        self.phase = Phase::Failed;
        vec![StreamEvent::Error(err)]
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::Failed)
    }

    /// Full assistant text accumulated so far, for logging and the
    /// non-streaming response body.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn usage(&self) -> (u32, u32) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn stop_reason(&self) -> Option<&str> {
        self.stop_reason.as_deref()
    }
}
