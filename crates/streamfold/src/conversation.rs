use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::decode::DecodeBuilder;
use crate::errors::Error;
use crate::options::{ConversationId, DecodeOptions};
use crate::schema::Schema;
use crate::source::ChunkSource;
use crate::store::{ContextStore, MemoryContextStore};
use crate::stream::PartialStream;
use crate::turn::{Turn, TurnRecord};

/// Immutable copy of a conversation log at one point in time.
///
/// Later appends never change a snapshot that was already taken.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ContextSnapshot {
    records: Vec<TurnRecord>,
}

impl ContextSnapshot {
    pub fn new(records: Vec<TurnRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[TurnRecord] {
        &self.records
    }

    /// Turns in append order.
    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.records.iter().map(|record| &record.turn)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.records.last().map(|record| &record.turn)
    }
}

impl From<Vec<TurnRecord>> for ContextSnapshot {
    fn from(records: Vec<TurnRecord>) -> Self {
        Self::new(records)
    }
}

/// Configuration used to create a `Conversation`.
#[derive(Clone, Debug, Default)]
pub struct ConversationConfig {
    /// Human-readable name used in logs.
    pub name: String,
    /// Options applied to every decode started from the conversation.
    pub decode: DecodeOptions,
}

impl ConversationConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decode: DecodeOptions::default(),
        }
    }

    pub fn decode_options(mut self, options: DecodeOptions) -> Self {
        self.decode = options;
        self
    }
}

/// Handle onto one conversation's context log.
///
/// Clones share the same underlying log. Appends go through the store, which
/// keeps them ordered even when several handles append concurrently.
#[derive(Clone)]
pub struct Conversation {
    id: ConversationId,
    config: ConversationConfig,
    store: Arc<dyn ContextStore>,
}

impl Conversation {
    /// Starts a conversation with a fresh id on the given store.
    pub fn new(store: Arc<dyn ContextStore>, config: ConversationConfig) -> Self {
        Self::with_id(store, ConversationId::generate(), config)
    }

    /// Opens an existing (or new) conversation by id.
    pub fn with_id(
        store: Arc<dyn ContextStore>,
        id: impl Into<ConversationId>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            store,
        }
    }

    /// A conversation backed by a private in-memory store.
    pub fn in_memory(config: ConversationConfig) -> Self {
        Self::new(Arc::new(MemoryContextStore::new()), config)
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Appends a turn at the end of the log.
    ///
    /// If the store fails, nothing is recorded.
    pub async fn append(&self, turn: Turn) -> Result<TurnRecord, Error> {
        let record = self.store.append(&self.id, turn).await?;
        debug!(
            conversation = %self.id,
            name = %self.config.name,
            index = record.index,
            "context appended"
        );
        Ok(record)
    }

    /// Returns every turn appended so far, in order.
    pub async fn snapshot(&self) -> Result<ContextSnapshot, Error> {
        Ok(ContextSnapshot::new(self.store.snapshot(&self.id).await?))
    }

    /// Starts a decode builder with this conversation's options.
    pub fn decode(&self, schema: impl Into<Arc<Schema>>) -> DecodeBuilder {
        DecodeBuilder::new(schema).options(self.config.decode.clone())
    }

    /// Asks `source` for the next step given the current context and streams
    /// the decoded output.
    ///
    /// The context is snapshotted once, before the source is opened.
    pub async fn request(
        &self,
        source: &dyn ChunkSource,
        schema: impl Into<Arc<Schema>>,
    ) -> Result<PartialStream, Error> {
        let builder = self.decode(schema);
        let context = self.snapshot().await?;
        info!(
            conversation = %self.id,
            source = source.name(),
            turns = context.len(),
            "opening chunk source"
        );
        let chunks = source.open(&context).await?;
        builder.stream(chunks)
    }

    /// Drains `stream` and records the final value as a model turn.
    ///
    /// Failed streams are not recorded.
    pub async fn complete(&self, stream: PartialStream) -> Result<Value, Error> {
        let value = stream.finish().await?;
        self.append(Turn::model_json(value.clone())).await?;
        Ok(value)
    }
}
