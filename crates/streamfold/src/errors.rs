use crate::options::ConversationId;

/// Errors produced by a chunk source before they are normalized into a
/// terminal stream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Transport or stream I/O failed.
    #[error("transport error ({source_name}): {message}")]
    Transport {
        source_name: String,
        message: String,
        status_code: Option<u16>,
    },
    /// The source produced something that is not a chunk sequence.
    #[error("protocol error ({source_name}): {message}")]
    Protocol {
        source_name: String,
        message: String,
    },
}

impl SourceError {
    /// Creates a transport-level error.
    pub fn transport(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            source_name: source_name.into(),
            message: message.into(),
            status_code: None,
        }
    }

    /// Creates a transport-level error carrying an HTTP status.
    pub fn status(source_name: impl Into<String>, message: impl Into<String>, status: u16) -> Self {
        Self::Transport {
            source_name: source_name.into(),
            message: message.into(),
            status_code: Some(status),
        }
    }

    /// Creates a protocol-level error.
    pub fn protocol(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message, .. } | Self::Protocol { message, .. } => message,
        }
    }
}

/// Terminal failure of a decode session, sent through `DecodeEvent::Failed`.
///
/// Failures carry the last emitted partial value (if any) so callers can see
/// how far decoding got.
#[derive(Debug, Clone, PartialEq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFailure {
    /// A chunk broke JSON syntax, the schema, or the merge rules.
    #[error("decode error at chunk {chunk_index} ({path}): {message}")]
    Decode {
        chunk_index: usize,
        path: String,
        message: String,
        partial: Option<serde_json::Value>,
    },
    /// The chunk source ended before a complete value was produced.
    #[error("incomplete stream after {chunks_seen} chunks: {message}")]
    IncompleteStream {
        chunks_seen: usize,
        message: String,
        partial: Option<serde_json::Value>,
    },
    /// The upstream chunk source failed.
    #[error("source failure: {message}")]
    Source { message: String },
    /// The session was aborted by the caller.
    #[error("decode cancelled")]
    Cancelled,
    /// A data chunk was pushed after the session reached a terminal state.
    #[error("session already terminated")]
    SessionClosed,
}

impl StreamFailure {
    /// Returns the partial value captured at the point of failure.
    pub fn partial(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Decode { partial, .. } | Self::IncompleteStream { partial, .. } => {
                partial.as_ref()
            }
            _ => None,
        }
    }
}

impl From<&SourceError> for StreamFailure {
    fn from(err: &SourceError) -> Self {
        StreamFailure::Source {
            message: err.to_string(),
        }
    }
}

/// Errors returned by a `ContextStore`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not accept the request.
    #[error("context store unavailable: {message}")]
    Unavailable { message: String },
    /// A persisted log could not be read back.
    #[error("context log for {conversation} is corrupt at line {line}: {message}")]
    Corrupt {
        conversation: ConversationId,
        line: usize,
        message: String,
    },
    /// The conversation id cannot be used by this store.
    #[error("invalid conversation id: {0}")]
    InvalidConversationId(String),
}

impl StoreError {
    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::unavailable(err.to_string())
    }
}

/// Problems found while building or converting a schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("schema error at {path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub(crate) fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Top-level error type for the public API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid input to a builder.
    #[error("validation error: {0}")]
    Validation(String),
    /// Schema could not be built or converted.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Terminal failure returned from a decode session.
    #[error(transparent)]
    StreamFailed(StreamFailure),
    /// Chunk source could not be opened.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// Context store rejected the request.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The final value did not deserialize into the requested type.
    #[error("final value does not match target type: {0}")]
    Deserialize(#[from] serde_json::Error),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<StreamFailure> for Error {
    fn from(value: StreamFailure) -> Self {
        Error::StreamFailed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_error_maps_to_source_failure() {
        let err = SourceError::status("http", "bad gateway", 502);
        let failure = StreamFailure::from(&err);
        assert!(
            matches!(failure, StreamFailure::Source { message } if message.contains("bad gateway"))
        );
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let failure = StreamFailure::IncompleteStream {
            chunks_seen: 0,
            message: "no data".into(),
            partial: None,
        };
        let value = serde_json::to_value(&failure).expect("serialize");
        assert_eq!(value["kind"], "incomplete_stream");
        assert_eq!(value["message"], "no data");
    }
}
