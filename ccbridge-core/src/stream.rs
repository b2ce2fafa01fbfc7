//! Streaming primitives exposed by ccbridge.
//!
//! Contract:
//! - A stream begins with exactly one `Role` announcement, emitted before the
//!   first `Content` event.
//! - `Content` events arrive in upstream order; no batching or reordering.
//! - The stream **must** terminate with `Finish` followed by `Done`, or with
//!   a single `Error`. After `Done`/`Error`, no further events are emitted.
//!
//! This module intentionally avoids deriving `Clone` / `PartialEq` because
//! `Error` contains `BridgeError`, which is not (and should not be) `Clone`.

/// What the downstream adapter receives incrementally.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    /// Assistant role announcement; carries no content.
    Role,
    /// Partial assistant text (delta). Empty string is allowed but rare.
    Content(String),
    /// Completion metadata: finish reason plus final token accounting.
    Finish {
        reason: String,
        input_tokens: u32,
        output_tokens: u32,
    },
    /// Explicit end-of-stream marker, emitted exactly once after `Finish`.
    Done,
    /// Transport/parse error surfaced mid-stream; stream ends after this.
    Error(crate::error::BridgeError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Done` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }

    /// Convenience accessor for `Content` text.
    pub fn as_content(&self) -> Option<&str> {
        match self {
            Self::Content(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Boxed stream of downstream events. Backends that support streaming return this.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;
