//! Incremental decoding of `data:`-framed event streams.
//!
//! Streaming chat completions arrive as arbitrary byte chunks. [`LineBuffer`]
//! reassembles complete lines across chunk boundaries (including multi-byte
//! UTF-8 sequences split between chunks) and [`DataLine::parse`] classifies
//! each line.
//!
//! ```text
//! data: {"choices":[...]}
//!
//! data: [DONE]
//! ```

/// Accumulates raw bytes and yields complete lines without their terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        Some(line)
    }
}

/// Classification of one event-stream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLine<'a> {
    /// A `data:` line carrying a payload.
    Payload(&'a str),
    /// The `[DONE]` end-of-stream sentinel.
    Done,
}

impl<'a> DataLine<'a> {
    /// Parses a line. Returns `None` for blank lines, comments and any field
    /// other than `data`.
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end();
        let value = line.strip_prefix("data:")?;
        let value = value.strip_prefix(' ').unwrap_or(value);
        if value.trim() == "[DONE]" {
            return Some(Self::Done);
        }
        if value.trim().is_empty() {
            return None;
        }
        Some(Self::Payload(value))
    }
}
