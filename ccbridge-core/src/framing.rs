//! Line framing shared by the SSE client path and the subprocess reader.
//!
//! Both paths receive arbitrary byte chunks and need complete `\n`-terminated
//! lines out the other side, with the tail of the last incomplete line carried
//! across chunk boundaries.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

/// Accumulates chunk text and drains complete lines.
///
/// Invariant: after `push` returns, the retained tail contains no newline.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete line it closes.
    /// Trailing `\r` (from CRLF framing) is trimmed off each line.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buf.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(idx) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=idx).collect();
            line.pop(); // the '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Drain the final (unterminated) fragment, if any. Called once the
    /// producer is exhausted so a missing trailing newline does not drop data.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            let mut tail = std::mem::take(&mut self.buf);
            if tail.ends_with('\r') {
                tail.pop();
            }
            Some(tail)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// CSI sequences, OSC sequences (BEL or ST terminated), lone ESC+final, and
// remaining C0 controls except \t. Newlines are consumed by the line split
// before this runs on subprocess output.
static CONTROL_SEQ: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \x1b \[ [0-9;?]* [\x20-\x2f]* [@-~]        # CSI ... final
      | \x1b \] [^\x07\x1b]* (?: \x07 | \x1b \\ )? # OSC ... BEL/ST
      | \x1b [@-_]                                 # two-byte escapes
      | [\x00-\x08\x0b\x0c\x0e-\x1f\x7f]           # stray C0 / DEL
    ",
    )
    .expect("control sequence pattern compiles")
});

/// Strip terminal control sequences from subprocess output.
///
/// Best-effort by design: an escape sequence split across two chunk
/// boundaries is not reassembled; the orphaned half is dropped or passed
/// through as-is depending on where the split fell.
pub fn strip_control_sequences(s: &str) -> Cow<'_, str> {
    CONTROL_SEQ.replace_all(s, "")
}
