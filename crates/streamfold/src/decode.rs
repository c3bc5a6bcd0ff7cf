use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Error, StreamFailure};
use crate::options::DecodeOptions;
use crate::partial::{is_subsumed_by, merge_document};
use crate::partial_json::{PartialJsonParser, SyntaxError};
use crate::schema::Schema;
use crate::source::{Chunk, ChunkStream};
use crate::stream::{DecodeEvent, PartialStream};

/// Lifecycle of a decode session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeState {
    /// No chunk has arrived yet.
    Idle,
    /// At least one chunk arrived; snapshots may be emitted.
    Streaming,
    /// The final value was produced. Terminal.
    Complete,
    /// The session failed. Terminal.
    Failed,
}

impl DecodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DecodeState::Complete | DecodeState::Failed)
    }
}

/// Push-driven decoder for one stream of chunks against one schema.
///
/// Feed chunks with [`DecodeSession::push`] and signal the end of the source
/// with [`DecodeSession::finish`] (or push [`Chunk::End`]). Each call yields at
/// most one event.
#[derive(Debug)]
pub struct DecodeSession {
    session_id: uuid::Uuid,
    schema: Arc<Schema>,
    options: DecodeOptions,
    parser: PartialJsonParser,
    utf8_tail: Vec<u8>,
    accumulated: Option<Value>,
    last_emitted: Option<Value>,
    state: DecodeState,
    chunks_seen: usize,
    bytes_seen: usize,
    seq: u64,
}

impl DecodeSession {
    /// Creates a session after checking the schema and options.
    pub fn new(schema: Arc<Schema>, options: DecodeOptions) -> Result<Self, Error> {
        schema.check()?;
        options.validate()?;
        Ok(Self {
            session_id: uuid::Uuid::new_v4(),
            parser: PartialJsonParser::new(options.emit_partial_strings)
                .max_depth(options.max_depth),
            schema,
            options,
            utf8_tail: Vec::new(),
            accumulated: None,
            last_emitted: None,
            state: DecodeState::Idle,
            chunks_seen: 0,
            bytes_seen: 0,
            seq: 0,
        })
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The most recently emitted snapshot.
    pub fn last_partial(&self) -> Option<&Value> {
        self.last_emitted.as_ref()
    }

    /// Number of data chunks consumed so far.
    pub fn chunks_seen(&self) -> usize {
        self.chunks_seen
    }

    /// Consumes one chunk.
    ///
    /// Returns `Ok(Some(Partial))` when the chunk produced a new distinguishable
    /// snapshot, `Ok(Some(Completed))` for the first terminal marker, and
    /// `Ok(None)` otherwise. Terminal markers after a terminal state are
    /// ignored; data after a terminal state is rejected with `SessionClosed`.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<DecodeEvent>, StreamFailure> {
        if self.state.is_terminal() {
            return match chunk {
                Chunk::End => {
                    debug!(session_id = %self.session_id, "ignoring repeated terminal marker");
                    Ok(None)
                }
                _ => Err(StreamFailure::SessionClosed),
            };
        }
        let text = match chunk {
            Chunk::End => return self.finish().map(Some),
            Chunk::Text(text) => text,
            Chunk::Bytes(bytes) => self.decode_utf8(&bytes)?,
        };

        let chunk_index = self.chunks_seen;
        self.chunks_seen += 1;
        self.state = DecodeState::Streaming;
        self.bytes_seen = self.bytes_seen.saturating_add(text.len());
        if self.bytes_seen > self.options.max_buffer_bytes {
            let message = format!(
                "input exceeds max_buffer_bytes ({})",
                self.options.max_buffer_bytes
            );
            return Err(self.decode_failure(chunk_index, "$", message));
        }

        let documents = match self.parser.feed(&text) {
            Ok(documents) => documents,
            Err(err) => return Err(self.syntax_failure(chunk_index, err)),
        };
        for document in documents {
            self.fold_document(chunk_index, document)?;
        }

        let Some(snapshot) = self.current_snapshot(chunk_index)? else {
            return Ok(None);
        };
        if let Err(violation) = self.schema.validate_partial(&snapshot) {
            return Err(self.decode_failure(chunk_index, violation.path, violation.message));
        }
        if !self.is_new(&snapshot) {
            return Ok(None);
        }

        debug_assert!(
            self.last_emitted
                .as_ref()
                .is_none_or(|prev| is_subsumed_by(prev, &snapshot)),
            "snapshot retracted earlier content"
        );
        let seq = self.seq;
        self.seq += 1;
        self.last_emitted = Some(snapshot.clone());
        debug!(session_id = %self.session_id, chunk_index, seq, "partial snapshot");
        Ok(Some(DecodeEvent::Partial {
            session_id: self.session_id,
            seq,
            chunk_index,
            value: snapshot,
        }))
    }

    /// Signals that the source is exhausted and produces the final value.
    pub fn finish(&mut self) -> Result<DecodeEvent, StreamFailure> {
        if self.state.is_terminal() {
            return Err(StreamFailure::SessionClosed);
        }
        let last_index = self.chunks_seen.saturating_sub(1);
        if !self.utf8_tail.is_empty() {
            return Err(self.decode_failure(last_index, "$", "truncated UTF-8 sequence"));
        }
        match self.parser.finish() {
            Ok(Some(document)) => self.fold_document(last_index, document)?,
            Ok(None) => {}
            Err(err) => return Err(self.syntax_failure(last_index, err)),
        }
        if !self.parser.is_idle() {
            let message = format!("document still open at {}", self.parser.path());
            return Err(self.incomplete(message));
        }
        let Some(value) = self.accumulated.take() else {
            return Err(self.incomplete("no data"));
        };
        if let Err(violation) = self.schema.validate_complete(&value) {
            return Err(self.decode_failure(last_index, violation.path, violation.message));
        }

        self.state = DecodeState::Complete;
        self.last_emitted = None;
        debug!(session_id = %self.session_id, chunks = self.chunks_seen, "decode complete");
        Ok(DecodeEvent::Completed {
            session_id: self.session_id,
            value,
        })
    }

    /// Moves the session to `Failed` for reasons outside the chunk content,
    /// such as an upstream error or cancellation.
    pub fn fail(&mut self, failure: StreamFailure) -> StreamFailure {
        if !self.state.is_terminal() {
            warn!(session_id = %self.session_id, error = %failure, "decode failed");
            self.state = DecodeState::Failed;
            self.release();
        }
        failure
    }

    fn fold_document(&mut self, chunk_index: usize, document: Value) -> Result<(), StreamFailure> {
        match self.accumulated.as_mut() {
            None => {
                self.accumulated = Some(document);
                Ok(())
            }
            Some(target) => {
                if let Err(conflict) = merge_document(target, document, "$", false) {
                    return Err(self.decode_failure(chunk_index, conflict.path, conflict.message));
                }
                Ok(())
            }
        }
    }

    fn current_snapshot(&mut self, chunk_index: usize) -> Result<Option<Value>, StreamFailure> {
        let mut snapshot = self.accumulated.clone();
        if let Some(open) = self.parser.snapshot() {
            match snapshot.as_mut() {
                None => snapshot = Some(open),
                Some(target) => {
                    if let Err(conflict) = merge_document(target, open, "$", true) {
                        return Err(self.decode_failure(
                            chunk_index,
                            conflict.path,
                            conflict.message,
                        ));
                    }
                }
            }
        }
        Ok(snapshot)
    }

    fn is_new(&self, snapshot: &Value) -> bool {
        match &self.last_emitted {
            Some(prev) => prev != snapshot,
            None => !is_empty_container(snapshot),
        }
    }

    fn decode_utf8(&mut self, bytes: &[u8]) -> Result<String, StreamFailure> {
        let mut buf = std::mem::take(&mut self.utf8_tail);
        buf.extend_from_slice(bytes);
        match std::str::from_utf8(&buf) {
            Ok(text) => Ok(text.to_string()),
            Err(err) if err.error_len().is_none() => {
                let valid = err.valid_up_to();
                self.utf8_tail = buf.split_off(valid);
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(err) => {
                let index = self.chunks_seen;
                Err(self.decode_failure(index, "$", format!("invalid UTF-8: {err}")))
            }
        }
    }

    fn syntax_failure(&mut self, chunk_index: usize, err: SyntaxError) -> StreamFailure {
        let message = format!("{} (offset {})", err.message, err.offset);
        self.decode_failure(chunk_index, err.path, message)
    }

    fn decode_failure(
        &mut self,
        chunk_index: usize,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> StreamFailure {
        let failure = StreamFailure::Decode {
            chunk_index,
            path: path.into(),
            message: message.into(),
            partial: self.last_emitted.clone(),
        };
        self.fail(failure)
    }

    fn incomplete(&mut self, message: impl Into<String>) -> StreamFailure {
        let failure = StreamFailure::IncompleteStream {
            chunks_seen: self.chunks_seen,
            message: message.into(),
            partial: self.last_emitted.clone(),
        };
        self.fail(failure)
    }

    fn release(&mut self) {
        self.parser = PartialJsonParser::new(self.options.emit_partial_strings)
            .max_depth(self.options.max_depth);
        self.utf8_tail = Vec::new();
        self.accumulated = None;
        self.last_emitted = None;
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Builder for configuring a decode session before attaching a source.
#[derive(Clone, Debug)]
pub struct DecodeBuilder {
    schema: Arc<Schema>,
    options: DecodeOptions,
}

impl DecodeBuilder {
    pub fn new(schema: impl Into<Arc<Schema>>) -> Self {
        Self {
            schema: schema.into(),
            options: DecodeOptions::default(),
        }
    }

    /// Replaces all options.
    pub fn options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn max_buffer_bytes(mut self, bytes: usize) -> Self {
        self.options.max_buffer_bytes = bytes;
        self
    }

    pub fn emit_partial_strings(mut self, enabled: bool) -> Self {
        self.options.emit_partial_strings = enabled;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.options.max_depth = depth;
        self
    }

    /// Builds a push-driven session.
    pub fn session(self) -> Result<DecodeSession, Error> {
        DecodeSession::new(self.schema, self.options)
    }

    /// Attaches a chunk source and returns the lazy event stream.
    ///
    /// Nothing is read from `source` until the returned stream is polled.
    pub fn stream(self, source: ChunkStream) -> Result<PartialStream, Error> {
        Ok(PartialStream::new(self.session()?, source))
    }
}

/// Decodes a complete input in one shot.
pub fn decode_all(schema: impl Into<Arc<Schema>>, text: &str) -> Result<Value, Error> {
    let mut session = DecodeBuilder::new(schema).session()?;
    session.push(Chunk::Text(text.to_string()))?;
    match session.finish()? {
        DecodeEvent::Completed { value, .. } => Ok(value),
        _ => Err(Error::protocol_msg("finish did not produce a final value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;
    use serde_json::json;

    fn profile_schema() -> Arc<Schema> {
        Arc::new(Schema::object([
            Field::required("name", Schema::string()),
            Field::optional(
                "items",
                Schema::array(Schema::object([Field::required("id", Schema::string())])),
            ),
        ]))
    }

    fn session(emit_partial_strings: bool) -> DecodeSession {
        DecodeBuilder::new(profile_schema())
            .emit_partial_strings(emit_partial_strings)
            .session()
            .expect("session")
    }

    fn partial_value(event: Option<DecodeEvent>) -> Option<Value> {
        match event {
            Some(DecodeEvent::Partial { value, .. }) => Some(value),
            _ => None,
        }
    }

    #[test]
    fn worked_example_yields_name_then_items() {
        let mut session = session(false);
        assert_eq!(session.state(), DecodeState::Idle);
        let first = session.push(Chunk::text(r#"{"name":"A"#)).expect("chunk 1");
        assert!(first.is_none());
        assert_eq!(session.state(), DecodeState::Streaming);
        let second = session.push(Chunk::text(r#"lice"}"#)).expect("chunk 2");
        assert_eq!(partial_value(second), Some(json!({"name": "Alice"})));
        let third = session
            .push(Chunk::text(r#"{"items":[{"id":"1"}]}"#))
            .expect("chunk 3");
        assert_eq!(
            partial_value(third),
            Some(json!({"name": "Alice", "items": [{"id": "1"}]}))
        );
        let done = session.finish().expect("finish");
        assert!(matches!(
            done,
            DecodeEvent::Completed { value, .. } if value == json!({"name": "Alice", "items": [{"id": "1"}]})
        ));
        assert_eq!(session.state(), DecodeState::Complete);
    }

    #[test]
    fn partial_strings_are_emitted_when_enabled() {
        let mut session = session(true);
        let first = session.push(Chunk::text(r#"{"name":"A"#)).expect("chunk 1");
        assert_eq!(partial_value(first), Some(json!({"name": "A"})));
    }

    #[test]
    fn empty_input_is_incomplete_without_partials() {
        let mut session = session(true);
        let failure = session.finish().expect_err("no data");
        assert!(matches!(
            failure,
            StreamFailure::IncompleteStream { chunks_seen: 0, ref message, partial: None } if message == "no data"
        ));
        assert_eq!(session.state(), DecodeState::Failed);
    }

    #[test]
    fn whitespace_only_input_counts_as_no_data() {
        let mut session = session(true);
        assert!(session.push(Chunk::text("  \n")).expect("push").is_none());
        let failure = session.push(Chunk::End).expect_err("no data");
        assert!(matches!(failure, StreamFailure::IncompleteStream { ref message, .. } if message == "no data"));
    }

    #[test]
    fn open_document_at_end_is_incomplete_with_last_partial() {
        let mut session = session(true);
        session.push(Chunk::text(r#"{"name":"Bo"#)).expect("push");
        let failure = session.finish().expect_err("open document");
        assert_eq!(failure.partial(), Some(&json!({"name": "Bo"})));
        assert!(matches!(failure, StreamFailure::IncompleteStream { chunks_seen: 1, .. }));
    }

    #[test]
    fn type_violation_fails_at_offending_chunk() {
        let mut session = session(true);
        session.push(Chunk::text(r#"{"name":"Al"#)).expect("push");
        let failure = session
            .push(Chunk::text(r#"", "items": [{"id": 1}]}"#))
            .expect_err("id must be a string");
        match failure {
            StreamFailure::Decode {
                chunk_index,
                path,
                partial,
                ..
            } => {
                assert_eq!(chunk_index, 1);
                assert_eq!(path, "$.items[0].id");
                assert_eq!(partial, Some(json!({"name": "Al"})));
            }
            other => panic!("unexpected failure {other:?}"),
        }
        assert_eq!(session.state(), DecodeState::Failed);
        assert!(session.last_partial().is_none());
    }

    #[test]
    fn missing_required_field_fails_final_validation() {
        let mut session = session(true);
        session
            .push(Chunk::text(r#"{"items": []}"#))
            .expect("push");
        let failure = session.finish().expect_err("name missing");
        assert!(
            matches!(failure, StreamFailure::Decode { ref message, .. } if message.contains("`name`"))
        );
    }

    #[test]
    fn conflicting_documents_fail() {
        let mut session = session(true);
        session.push(Chunk::text(r#"{"name":"Alice"}"#)).expect("push");
        let failure = session
            .push(Chunk::text(r#"{"name":"Bob"}"#))
            .expect_err("conflict");
        assert!(matches!(failure, StreamFailure::Decode { ref path, .. } if path == "$.name"));
    }

    #[test]
    fn duplicate_terminal_markers_are_ignored() {
        let mut session = session(true);
        session.push(Chunk::text(r#"{"name":"A"}"#)).expect("push");
        assert!(matches!(
            session.push(Chunk::End),
            Ok(Some(DecodeEvent::Completed { .. }))
        ));
        assert!(matches!(session.push(Chunk::End), Ok(None)));
        assert!(matches!(
            session.push(Chunk::text("{}")),
            Err(StreamFailure::SessionClosed)
        ));
    }

    #[test]
    fn utf8_split_across_byte_chunks() {
        let mut session = session(true);
        let bytes = r#"{"name":"Zoë"}"#.as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).expect("multibyte") + 1;
        session
            .push(Chunk::Bytes(bytes::Bytes::copy_from_slice(&bytes[..split])))
            .expect("first half");
        session
            .push(Chunk::Bytes(bytes::Bytes::copy_from_slice(&bytes[split..])))
            .expect("second half");
        let done = session.finish().expect("finish");
        assert!(matches!(done, DecodeEvent::Completed { value, .. } if value == json!({"name": "Zoë"})));
    }

    #[test]
    fn invalid_utf8_is_a_decode_failure() {
        let mut session = session(true);
        let failure = session
            .push(Chunk::Bytes(bytes::Bytes::from_static(&[b'"', 0xFF, b'"'])))
            .expect_err("invalid utf-8");
        assert!(matches!(failure, StreamFailure::Decode { ref message, .. } if message.contains("UTF-8")));
    }

    #[test]
    fn buffer_limit_is_enforced() {
        let mut session = DecodeBuilder::new(profile_schema())
            .max_buffer_bytes(8)
            .session()
            .expect("session");
        let failure = session
            .push(Chunk::text(r#"{"name":"too long"}"#))
            .expect_err("limit");
        assert!(
            matches!(failure, StreamFailure::Decode { ref message, .. } if message.contains("max_buffer_bytes"))
        );
    }

    #[test]
    fn identical_snapshots_are_not_reemitted() {
        let mut session = session(true);
        assert!(session.push(Chunk::text(r#"{"name":"A""#)).expect("push").is_some());
        assert!(session.push(Chunk::text("  ,")).expect("push").is_none());
        assert!(session.push(Chunk::text(r#" "items": [ "#)).expect("push").is_some());
    }

    #[test]
    fn streaming_matches_one_shot_decode_for_every_split() {
        let text = r#"{"name":"Ada \"L\" ✓","items":[{"id":"1"},{"id":"22"}]}"#;
        let expected = decode_all(profile_schema(), text).expect("one shot");
        assert_eq!(expected, serde_json::from_str::<Value>(text).expect("serde"));
        let chars: Vec<char> = text.chars().collect();
        for split in 1..chars.len() {
            let (head, tail): (String, String) =
                (chars[..split].iter().collect(), chars[split..].iter().collect());
            let mut session = session(true);
            let mut previous: Option<Value> = None;
            for part in [head, tail] {
                if let Some(value) = partial_value(session.push(Chunk::Text(part)).expect("push")) {
                    if let Some(prev) = &previous {
                        assert!(is_subsumed_by(prev, &value), "split {split}: {prev} -> {value}");
                    }
                    previous = Some(value);
                }
            }
            match session.finish().expect("finish") {
                DecodeEvent::Completed { value, .. } => {
                    if let Some(prev) = &previous {
                        assert!(is_subsumed_by(prev, &value));
                    }
                    assert_eq!(value, expected, "split {split}");
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn concatenated_documents_grow_monotonically_char_by_char() {
        let text = r#"{"name":"Alice"} {"items":[{"id":"1"},{"id":"22"}]}"#;
        let expected = json!({"name": "Alice", "items": [{"id": "1"}, {"id": "22"}]});
        for emit_partial_strings in [true, false] {
            let mut session = session(emit_partial_strings);
            let mut snapshots: Vec<Value> = Vec::new();
            for c in text.chars() {
                if let Some(value) = partial_value(session.push(Chunk::Text(c.to_string())).expect("push")) {
                    if let Some(prev) = snapshots.last() {
                        assert!(is_subsumed_by(prev, &value), "{prev} -> {value}");
                    }
                    snapshots.push(value);
                }
            }
            assert_eq!(snapshots.last(), Some(&expected));
            assert!(snapshots.iter().any(|v| v == &json!({"name": "Alice"})));
            match session.finish().expect("finish") {
                DecodeEvent::Completed { value, .. } => assert_eq!(value, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn deeply_nested_input_fails_instead_of_overflowing() {
        let text = format!("{}{}", "[".repeat(10_000), "]".repeat(10_000));
        let err = decode_all(Schema::array(Schema::string()), &text).expect_err("too deep");
        assert!(matches!(
            err,
            Error::StreamFailed(StreamFailure::Decode { ref message, .. }) if message.contains("deeper than 128")
        ));

        let mut session = DecodeBuilder::new(Schema::any())
            .max_depth(4)
            .session()
            .expect("session");
        assert!(session.push(Chunk::text("[[[[")).expect("within limit").is_some());
        let failure = session.push(Chunk::text("[")).expect_err("fifth level");
        assert!(matches!(failure, StreamFailure::Decode { chunk_index: 1, .. }));
        assert_eq!(session.state(), DecodeState::Failed);
    }

    #[test]
    fn top_level_scalar_schema_decodes() {
        let value = decode_all(Schema::integer(), " 42 ").expect("decode");
        assert_eq!(value, json!(42));
        let err = decode_all(Schema::integer(), "4.5").expect_err("not an integer");
        assert!(matches!(err, Error::StreamFailed(StreamFailure::Decode { .. })));
    }
}
