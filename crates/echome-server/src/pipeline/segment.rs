//! Cuts streamed text into pieces worth sending to the synthesizer.

const SENTENCE_ENDINGS: &[char] = &['。', '！', '？', '.', '!', '?'];

/// Buffers LLM chunks until they end a sentence or grow past `min_chars`.
#[derive(Debug)]
pub struct Segmenter {
    buffer: String,
    chars: usize,
    min_chars: usize,
}

impl Segmenter {
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            chars: 0,
            min_chars: min_chars.max(1),
        }
    }

    /// Adds a chunk and returns the buffered text if it is ready to speak.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.buffer.push_str(chunk);
        self.chars += chunk.chars().count();

        let ends_sentence = self
            .buffer
            .trim_end()
            .ends_with(SENTENCE_ENDINGS);
        if self.chars >= self.min_chars || ends_sentence {
            self.take()
        } else {
            None
        }
    }

    /// Whatever is left once generation ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        self.chars = 0;
        let text = std::mem::take(&mut self.buffer);
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}
