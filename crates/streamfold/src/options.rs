use std::fmt;

use crate::errors::Error;

/// Stable identifier for a conversation log.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Creates a conversation id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

const DEFAULT_MAX_BUFFER_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_DEPTH: usize = 128;

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

/// Decoder behavior options.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DecodeOptions {
    /// Upper bound on decoded input held by one session. Exceeding it fails
    /// the session.
    pub max_buffer_bytes: usize,
    /// Whether string values are shown while still being streamed.
    pub emit_partial_strings: bool,
    /// Deepest allowed nesting of arrays and objects. Deeper input fails the
    /// session.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            emit_partial_strings: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl DecodeOptions {
    /// Sets the buffer limit.
    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.max_buffer_bytes = bytes;
        self
    }

    /// Enables or disables in-progress string snapshots.
    pub fn emit_partial_strings(mut self, enabled: bool) -> Self {
        self.emit_partial_strings = enabled;
        self
    }

    /// Sets the nesting limit.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Reads overrides from the environment.
    ///
    /// - `STREAMFOLD_MAX_BUFFER_BYTES`: positive integer.
    /// - `STREAMFOLD_EMIT_PARTIAL_STRINGS`: `true`/`false` (also `1`/`0`, `on`/`off`).
    /// - `STREAMFOLD_MAX_DEPTH`: positive integer.
    pub fn from_env() -> Result<Self, Error> {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var("STREAMFOLD_MAX_BUFFER_BYTES") {
            let bytes = raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("invalid STREAMFOLD_MAX_BUFFER_BYTES {raw:?}: {e}"))
            })?;
            options.max_buffer_bytes = bytes;
        }
        if let Ok(raw) = std::env::var("STREAMFOLD_MAX_DEPTH") {
            options.max_depth = raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("invalid STREAMFOLD_MAX_DEPTH {raw:?}: {e}"))
            })?;
        }
        if let Ok(raw) = std::env::var("STREAMFOLD_EMIT_PARTIAL_STRINGS") {
            options.emit_partial_strings = parse_bool(&raw).ok_or_else(|| {
                Error::Config(format!("invalid STREAMFOLD_EMIT_PARTIAL_STRINGS {raw:?}"))
            })?;
        }
        options.validate()?;
        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_buffer_bytes == 0 {
            return Err(Error::Validation(
                "max_buffer_bytes must be greater than 0".into(),
            ));
        }
        if self.max_depth == 0 {
            return Err(Error::Validation("max_depth must be greater than 0".into()));
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}
