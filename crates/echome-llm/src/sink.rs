use async_trait::async_trait;
use echome_types::SinkError;

/// Receives generated text chunks in generation order.
///
/// Returning an error vetoes further delivery: the adapter stops reading the
/// upstream stream and surfaces [`crate::LlmError::Sink`].
#[async_trait]
pub trait ChunkSink: Send {
    async fn send_chunk(&mut self, chunk: &str) -> Result<(), SinkError>;
}

/// Sink that concatenates every chunk, used for non-streaming turns.
#[derive(Debug, Default)]
pub struct CollectingSink {
    text: String,
}

impl CollectingSink {
    pub fn into_text(self) -> String {
        self.text
    }
}

#[async_trait]
impl ChunkSink for CollectingSink {
    async fn send_chunk(&mut self, chunk: &str) -> Result<(), SinkError> {
        self.text.push_str(chunk);
        Ok(())
    }
}
