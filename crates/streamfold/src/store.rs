//! Backing stores for conversation logs.
//!
//! A store only ever appends. Appends for one conversation are serialized so
//! that indexes are dense and in arrival order; different conversations never
//! share a log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt as _;
use tracing::{debug, warn};

use crate::errors::{Error, StoreError};
use crate::options::ConversationId;
use crate::turn::{Turn, TurnRecord};

/// Persistence contract for context logs.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Appends a turn and returns the stored record.
    ///
    /// On error the log is left exactly as it was.
    async fn append(
        &self,
        conversation: &ConversationId,
        turn: Turn,
    ) -> Result<TurnRecord, StoreError>;

    /// Returns a copy of the full log. Unknown conversations have an empty log.
    async fn snapshot(&self, conversation: &ConversationId) -> Result<Vec<TurnRecord>, StoreError>;

    /// Number of turns in the log.
    async fn turn_count(&self, conversation: &ConversationId) -> Result<usize, StoreError> {
        Ok(self.snapshot(conversation).await?.len())
    }

    /// Ids of every conversation with at least one turn, sorted.
    async fn conversations(&self) -> Result<Vec<ConversationId>, StoreError>;
}

fn new_record(index: usize, turn: Turn) -> TurnRecord {
    TurnRecord {
        index: index as u64,
        recorded_at: chrono::Utc::now(),
        turn,
    }
}

/// In-memory storage for tests and single-process use.
#[derive(Default)]
pub struct MemoryContextStore {
    logs: DashMap<ConversationId, Vec<TurnRecord>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        turn: Turn,
    ) -> Result<TurnRecord, StoreError> {
        // The entry guard holds the shard lock, which serializes appends.
        let mut log = self.logs.entry(conversation.clone()).or_default();
        let record = new_record(log.len(), turn);
        log.push(record.clone());
        debug!(conversation = %conversation, index = record.index, role = record.turn.role(), "turn appended");
        Ok(record)
    }

    async fn snapshot(&self, conversation: &ConversationId) -> Result<Vec<TurnRecord>, StoreError> {
        Ok(self
            .logs
            .get(conversation)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn turn_count(&self, conversation: &ConversationId) -> Result<usize, StoreError> {
        Ok(self.logs.get(conversation).map_or(0, |log| log.len()))
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, StoreError> {
        let mut ids: Vec<ConversationId> = self
            .logs
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// File-backed storage: one JSON-lines file per conversation.
pub struct JsonlContextStore {
    base_path: PathBuf,
    locks: DashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>,
    counts: DashMap<ConversationId, usize>,
    /// Byte count after which the next write fails.
    #[cfg(test)]
    fail_write_after: std::sync::atomic::AtomicUsize,
}

impl JsonlContextStore {
    /// Creates a store rooted at `base_path`. The directory is created on the
    /// first append.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            locks: DashMap::new(),
            counts: DashMap::new(),
            #[cfg(test)]
            fail_write_after: std::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    /// Creates a store rooted at `STREAMFOLD_CONTEXT_DIR`.
    pub fn from_env() -> Result<Self, Error> {
        let dir = std::env::var("STREAMFOLD_CONTEXT_DIR").unwrap_or_default();
        if dir.trim().is_empty() {
            return Err(Error::Config(
                "missing STREAMFOLD_CONTEXT_DIR for the JSONL context store".into(),
            ));
        }
        Ok(Self::new(dir))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn log_path(&self, conversation: &ConversationId) -> Result<PathBuf, StoreError> {
        validate_conversation_id(conversation)?;
        Ok(self.base_path.join(format!("{conversation}.jsonl")))
    }

    fn lock_for(&self, conversation: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(conversation.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn write_record(
        &self,
        file: &mut tokio::fs::File,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let limit = self.fail_write_after.swap(usize::MAX, Ordering::SeqCst);
            if limit != usize::MAX {
                file.write_all(&bytes[..limit.min(bytes.len())]).await?;
                file.flush().await?;
                return Err(std::io::Error::other("injected write failure"));
            }
        }
        write_line(file, bytes).await
    }

    /// Truncates the log back to `before` bytes after a failed write.
    ///
    /// A log that was empty before the write is removed so it is not listed.
    async fn roll_back(
        &self,
        conversation: &ConversationId,
        path: &Path,
        file: &tokio::fs::File,
        before: u64,
        err: std::io::Error,
    ) -> StoreError {
        self.counts.remove(conversation);
        if let Err(rollback) = file.set_len(before).await {
            warn!(conversation = %conversation, error = %rollback, "rollback failed");
            return StoreError::unavailable(format!(
                "append failed ({err}) and rollback failed ({rollback}); log may end in a partial line"
            ));
        }
        if before == 0
            && let Err(remove) = tokio::fs::remove_file(path).await
        {
            debug!(conversation = %conversation, error = %remove, "could not remove empty log");
        }
        err.into()
    }
}

/// Rejects ids that are unsafe as file names: empty, path separators, `..`,
/// NUL or other control characters.
pub fn validate_conversation_id(conversation: &ConversationId) -> Result<(), StoreError> {
    let id = conversation.as_str();
    if id.is_empty() {
        return Err(StoreError::InvalidConversationId(
            "conversation id cannot be empty".to_string(),
        ));
    }
    if id.contains('/') || id.contains('\\') || id.contains("..") || id.contains('\0') {
        return Err(StoreError::InvalidConversationId(format!(
            "conversation id contains invalid characters: {id:?}"
        )));
    }
    if id.chars().any(|c| c.is_control()) {
        return Err(StoreError::InvalidConversationId(format!(
            "conversation id contains control characters: {id:?}"
        )));
    }
    Ok(())
}

async fn read_records(
    conversation: &ConversationId,
    path: &Path,
) -> Result<Vec<TurnRecord>, StoreError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut records = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TurnRecord = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
            conversation: conversation.clone(),
            line: idx + 1,
            message: e.to_string(),
        })?;
        if record.index != records.len() as u64 {
            return Err(StoreError::Corrupt {
                conversation: conversation.clone(),
                line: idx + 1,
                message: format!(
                    "expected turn index {}, found {}",
                    records.len(),
                    record.index
                ),
            });
        }
        records.push(record);
    }
    Ok(records)
}

async fn write_line(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_data().await
}

#[async_trait]
impl ContextStore for JsonlContextStore {
    async fn append(
        &self,
        conversation: &ConversationId,
        turn: Turn,
    ) -> Result<TurnRecord, StoreError> {
        let path = self.log_path(conversation)?;
        let lock = self.lock_for(conversation);
        let _guard = lock.lock().await;

        tokio::fs::create_dir_all(&self.base_path).await?;
        let index = match self.counts.get(conversation).map(|count| *count) {
            Some(count) => count,
            None => read_records(conversation, &path).await?.len(),
        };
        let record = new_record(index, turn);
        let mut line = serde_json::to_string(&record)
            .map_err(|e| StoreError::unavailable(format!("failed to encode turn: {e}")))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let before = file.metadata().await?.len();
        if let Err(err) = self.write_record(&mut file, line.as_bytes()).await {
            warn!(conversation = %conversation, error = %err, "append failed; rolling back");
            return Err(self.roll_back(conversation, &path, &file, before, err).await);
        }

        self.counts.insert(conversation.clone(), index + 1);
        debug!(conversation = %conversation, index = record.index, role = record.turn.role(), "turn appended");
        Ok(record)
    }

    async fn snapshot(&self, conversation: &ConversationId) -> Result<Vec<TurnRecord>, StoreError> {
        let path = self.log_path(conversation)?;
        let lock = self.lock_for(conversation);
        let _guard = lock.lock().await;
        read_records(conversation, &path).await
    }

    async fn conversations(&self) -> Result<Vec<ConversationId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            // Left behind by a first append that failed and could not be removed.
            if entry.metadata().await?.len() == 0 {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(ConversationId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}
