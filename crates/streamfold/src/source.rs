use std::pin::Pin;

use crate::conversation::ContextSnapshot;
use crate::errors::SourceError;

/// One unit of raw data delivered by a generation source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    /// A text fragment.
    Text(String),
    /// UTF-8 bytes; a code point may be split across chunks.
    Bytes(bytes::Bytes),
    /// Terminal marker. Only the first one is honored.
    End,
}

impl Chunk {
    pub fn text(text: impl Into<String>) -> Self {
        Chunk::Text(text.into())
    }
}

impl From<&str> for Chunk {
    fn from(value: &str) -> Self {
        Chunk::Text(value.to_string())
    }
}

impl From<String> for Chunk {
    fn from(value: String) -> Self {
        Chunk::Text(value)
    }
}

impl From<bytes::Bytes> for Chunk {
    fn from(value: bytes::Bytes) -> Self {
        Chunk::Bytes(value)
    }
}

/// Stream of chunks consumed by a decode session.
pub type ChunkStream =
    Pin<Box<dyn futures::Stream<Item = Result<Chunk, SourceError>> + Send + 'static>>;

/// Producer of chunk streams for the next decision step.
///
/// Implementations receive the conversation so far and answer with the raw
/// output of an external generator. The decoder treats the result as opaque.
#[async_trait::async_trait]
pub trait ChunkSource: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Opens a chunk stream for a request built from `context`.
    async fn open(&self, context: &ContextSnapshot) -> Result<ChunkStream, SourceError>;
}

/// Wraps already-available chunk results.
pub fn from_iter<I>(items: I) -> ChunkStream
where
    I: IntoIterator<Item = Result<Chunk, SourceError>>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures::stream::iter(items))
}

/// Wraps a list of text fragments, without a terminal marker.
pub fn from_text_chunks<I, S>(parts: I) -> ChunkStream
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let chunks: Vec<Result<Chunk, SourceError>> = parts
        .into_iter()
        .map(|part| Ok(Chunk::Text(part.into())))
        .collect();
    from_iter(chunks)
}

/// Splits `text` into fragments of at most `size` characters.
pub fn split_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// A source that replays fixed chunks regardless of context. Useful for tests
/// and offline replays of captured output.
#[derive(Clone, Debug, Default)]
pub struct ReplaySource {
    chunks: Vec<Chunk>,
}

impl ReplaySource {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

#[async_trait::async_trait]
impl ChunkSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    async fn open(&self, _context: &ContextSnapshot) -> Result<ChunkStream, SourceError> {
        Ok(from_iter(
            self.chunks.clone().into_iter().map(Ok).collect::<Vec<_>>(),
        ))
    }
}
