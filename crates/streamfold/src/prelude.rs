//! Common imports for typical decoding and conversation usage.
pub use crate::{
    AbortHandle, Chunk, ChunkSource, ChunkStream, ContextSnapshot, ContextStore, Conversation,
    ConversationConfig, ConversationId, DecodeBuilder, DecodeEvent, DecodeOptions, Error, Field,
    PartialStream, Schema, StreamFailure, Turn,
};
