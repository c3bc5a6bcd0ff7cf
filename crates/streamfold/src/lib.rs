//! Incremental structured-output decoding with an append-only conversation log.
//!
//! A [`PartialStream`] turns a stream of text chunks into progressively more
//! complete snapshots of a value described by a [`Schema`], ending in exactly
//! one validated value or one failure. A [`Conversation`] keeps the ordered
//! turns that are handed to a [`ChunkSource`] to produce the next chunk stream.
//!
//! # Decoding a stream
//!
//! ```no_run
//! use streamfold::prelude::*;
//! use streamfold::source::from_text_chunks;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Error> {
//! let schema = Schema::object([
//!     Field::required("name", Schema::string()),
//!     Field::optional("tags", Schema::array(Schema::string())),
//! ]);
//!
//! let mut stream = DecodeBuilder::new(schema)
//!     .stream(from_text_chunks([r#"{"name":"Ad"#, r#"a","tags":["x"]}"#]))?;
//! while let Some(event) = stream.next_event().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Driving a conversation
//!
//! ```no_run
//! use streamfold::prelude::*;
//! use streamfold::http::HttpSource;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Error> {
//! let source = HttpSource::from_env()?;
//! let conversation = Conversation::in_memory(ConversationConfig::named("demo"));
//! conversation.append(Turn::user("What should I do next?")).await?;
//!
//! let schema = Schema::object([Field::required("action", Schema::string())]);
//! let stream = conversation.request(&source, schema).await?;
//! let decision = conversation.complete(stream).await?;
//! println!("{decision}");
//! # Ok(())
//! # }
//! ```

/// Context snapshots and the conversation handle.
pub mod conversation;
/// Push-driven decode sessions and the decode builder.
pub mod decode;
/// Public error types.
pub mod errors;
/// HTTP chunk source.
pub mod http;
/// Process-wide logging setup.
pub mod observability;
/// Decoder options and identifiers.
pub mod options;
/// Snapshot comparison and document merging.
pub mod partial;
mod partial_json;
/// Common imports for typical usage.
pub mod prelude;
/// Schema model, validation and JSON Schema conversion.
pub mod schema;
/// Chunks and chunk sources.
pub mod source;
/// Server-sent-events framing.
pub mod sse;
/// Context log storage.
pub mod store;
/// Decode events, the partial stream and its cancellation handle.
pub mod stream;
/// Conversation turns.
pub mod turn;

pub use conversation::{ContextSnapshot, Conversation, ConversationConfig};
pub use decode::{DecodeBuilder, DecodeSession, DecodeState, decode_all};
pub use errors::{Error, SchemaError, SourceError, StoreError, StreamFailure};
pub use observability::init_observability;
pub use options::{ConversationId, DecodeOptions};
pub use partial::{PartialValue, is_subsumed_by};
pub use schema::{Field, ObjectSchema, Schema, Violation};
pub use source::{Chunk, ChunkSource, ChunkStream, ReplaySource};
pub use store::{ContextStore, JsonlContextStore, MemoryContextStore};
pub use stream::{AbortHandle, DecodeEvent, PartialStream};
pub use turn::{ContentPart, Turn, TurnRecord};
