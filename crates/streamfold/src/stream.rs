use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Abortable;
use futures::{Stream, StreamExt as _};
use serde_json::Value;

use crate::decode::DecodeSession;
use crate::errors::{Error, StreamFailure};
use crate::source::ChunkStream;

/// Events yielded by a `PartialStream`.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodeEvent {
    /// A new, structurally valid snapshot of the value being decoded.
    Partial {
        session_id: uuid::Uuid,
        seq: u64,
        chunk_index: usize,
        value: Value,
    },
    /// Terminal success with the fully validated value.
    Completed { session_id: uuid::Uuid, value: Value },
    /// Terminal failure.
    Failed {
        session_id: uuid::Uuid,
        error: StreamFailure,
    },
}

impl DecodeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecodeEvent::Completed { .. } | DecodeEvent::Failed { .. })
    }

    /// The value carried by a `Partial` or `Completed` event.
    pub fn value(&self) -> Option<&Value> {
        match self {
            DecodeEvent::Partial { value, .. } | DecodeEvent::Completed { value, .. } => {
                Some(value)
            }
            DecodeEvent::Failed { .. } => None,
        }
    }
}

/// Handle used to cancel a running stream.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    inner: futures::stream::AbortHandle,
}

impl AbortHandle {
    /// Requests cancellation.
    ///
    /// A pending read on the source is interrupted; the stream then yields a
    /// terminal `DecodeEvent::Failed` with `StreamFailure::Cancelled`.
    pub fn abort(&self) {
        self.inner.abort();
    }
}

struct Driver {
    session: DecodeSession,
    source: Option<Abortable<ChunkStream>>,
}

impl Driver {
    fn terminate(&mut self, failure: StreamFailure) -> DecodeEvent {
        self.source = None;
        DecodeEvent::Failed {
            session_id: self.session.session_id(),
            error: self.session.fail(failure),
        }
    }

    async fn next_event(&mut self) -> Option<DecodeEvent> {
        loop {
            let source = self.source.as_mut()?;
            let next = source.next().await;
            if source.is_aborted() {
                return Some(self.terminate(StreamFailure::Cancelled));
            }
            let outcome = match next {
                Some(Ok(chunk)) => self.session.push(chunk),
                Some(Err(err)) => return Some(self.terminate(StreamFailure::from(&err))),
                None => self.session.finish().map(Some),
            };
            match outcome {
                Ok(Some(event)) => {
                    if event.is_terminal() {
                        self.source = None;
                    }
                    return Some(event);
                }
                Ok(None) => continue,
                Err(failure) => return Some(self.terminate(failure)),
            }
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = DecodeEvent> + Send>>;

/// Lazy sequence of decode events for one session.
///
/// The source is only read while the stream is polled; dropping the stream
/// drops the source. Exactly one terminal event (`Completed` or `Failed`) ends
/// the sequence.
pub struct PartialStream {
    session_id: uuid::Uuid,
    events: EventStream,
    abort_handle: AbortHandle,
    outcome: Option<Result<Value, StreamFailure>>,
}

impl PartialStream {
    pub(crate) fn new(session: DecodeSession, source: ChunkStream) -> Self {
        let (inner, registration) = futures::stream::AbortHandle::new_pair();
        let session_id = session.session_id();
        let driver = Driver {
            session,
            source: Some(Abortable::new(source, registration)),
        };
        let events = futures::stream::unfold(driver, |mut driver| async move {
            let event = driver.next_event().await?;
            Some((event, driver))
        });
        Self {
            session_id,
            events: Box::pin(events),
            abort_handle: AbortHandle { inner },
            outcome: None,
        }
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.session_id
    }

    /// Returns a handle that can cancel the stream.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Waits for and returns the next event.
    ///
    /// Returns `None` after the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<DecodeEvent> {
        self.next().await
    }

    /// Drains the stream (if needed) and returns the final value.
    ///
    /// Safe to call after consuming events manually with `next_event()`.
    pub async fn finish(mut self) -> Result<Value, Error> {
        while self.outcome.is_none() {
            if self.next_event().await.is_none() {
                break;
            }
        }
        match self.outcome.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(Error::StreamFailed(failure)),
            None => Err(Error::protocol_msg(format!(
                "decode stream {} ended without a terminal event",
                self.session_id
            ))),
        }
    }

    /// Like [`PartialStream::finish`], then deserializes the final value.
    pub async fn finish_typed<T: serde::de::DeserializeOwned>(self) -> Result<T, Error> {
        let value = self.finish().await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Stream for PartialStream {
    type Item = DecodeEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.events.as_mut().poll_next(cx);
        if let Poll::Ready(Some(event)) = &polled {
            match event {
                DecodeEvent::Completed { value, .. } => this.outcome = Some(Ok(value.clone())),
                DecodeEvent::Failed { error, .. } => this.outcome = Some(Err(error.clone())),
                DecodeEvent::Partial { .. } => {}
            }
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeBuilder;
    use crate::errors::SourceError;
    use crate::schema::{Field, Schema};
    use crate::source::{Chunk, from_iter, from_text_chunks};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn schema() -> Schema {
        Schema::object([
            Field::required("name", Schema::string()),
            Field::optional(
                "items",
                Schema::array(Schema::object([Field::required("id", Schema::string())])),
            ),
        ])
    }

    #[tokio::test]
    async fn worked_example_streams_partials_then_final() {
        let mut stream = DecodeBuilder::new(schema())
            .emit_partial_strings(false)
            .stream(from_text_chunks([
                r#"{"name":"A"#,
                r#"lice"}"#,
                r#"{"items":[{"id":"1"}]}"#,
            ]))
            .expect("stream");

        let mut partials = Vec::new();
        let mut final_value = None;
        while let Some(event) = stream.next_event().await {
            match event {
                DecodeEvent::Partial { value, .. } => partials.push(value),
                DecodeEvent::Completed { value, .. } => final_value = Some(value),
                DecodeEvent::Failed { error, .. } => panic!("unexpected failure {error}"),
            }
        }
        let expected_final = json!({"name": "Alice", "items": [{"id": "1"}]});
        assert_eq!(partials, vec![json!({"name": "Alice"}), expected_final.clone()]);
        assert_eq!(final_value, Some(expected_final.clone()));
        assert_eq!(stream.finish().await.expect("finish"), expected_final);
    }

    #[tokio::test]
    async fn empty_source_fails_without_partials() {
        let mut stream = DecodeBuilder::new(schema())
            .stream(from_iter(Vec::new()))
            .expect("stream");
        let first = stream.next_event().await.expect("terminal event");
        assert!(matches!(
            first,
            DecodeEvent::Failed {
                error: StreamFailure::IncompleteStream { partial: None, .. },
                ..
            }
        ));
        assert!(stream.next_event().await.is_none());
        assert!(matches!(
            stream.finish().await,
            Err(Error::StreamFailed(StreamFailure::IncompleteStream { .. }))
        ));
    }

    #[tokio::test]
    async fn source_error_is_terminal() {
        let stream = DecodeBuilder::new(schema())
            .stream(from_iter(vec![
                Ok(Chunk::text(r#"{"name":"#)),
                Err(SourceError::transport("fake", "connection reset")),
                Ok(Chunk::text(r#""x"}"#)),
            ]))
            .expect("stream");
        let err = stream.finish().await.expect_err("source failure");
        assert!(
            matches!(err, Error::StreamFailed(StreamFailure::Source { message }) if message.contains("connection reset"))
        );
    }

    #[tokio::test]
    async fn end_marker_stops_reading_the_source() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let chunks = vec![
            Chunk::text(r#"{"name":"A"}"#),
            Chunk::End,
            Chunk::End,
            Chunk::text("garbage"),
        ];
        let source: ChunkStream = Box::pin(futures::stream::iter(chunks).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SourceError>(chunk)
        }));
        let value = DecodeBuilder::new(schema())
            .stream(source)
            .expect("stream")
            .finish()
            .await
            .expect("finish");
        assert_eq!(value, json!({"name": "A"}));
        assert_eq!(pulled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abort_interrupts_pending_source() {
        let source: ChunkStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, SourceError>(Chunk::text(r#"{"name":"Al"#))])
                .chain(futures::stream::pending()),
        );
        let mut stream = DecodeBuilder::new(schema()).stream(source).expect("stream");
        let first = stream.next_event().await.expect("partial");
        assert_eq!(first.value(), Some(&json!({"name": "Al"})));

        let abort = stream.abort_handle();
        let waiter = tokio::spawn(async move {
            let mut events = Vec::new();
            while let Some(event) = stream.next_event().await {
                events.push(event);
            }
            events
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        abort.abort();
        let events = waiter.await.expect("join");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            DecodeEvent::Failed {
                error: StreamFailure::Cancelled,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dropping_a_stream_leaves_fresh_sessions_unaffected() {
        let shared = Arc::new(schema());
        {
            let mut abandoned = DecodeBuilder::new(shared.clone())
                .stream(from_text_chunks([r#"{"name":"Partial"#, r#"ly"}"#]))
                .expect("stream");
            let _ = abandoned.next_event().await;
        }
        let value = DecodeBuilder::new(shared)
            .stream(from_text_chunks([r#"{"na"#, r#"me":"Fresh"}"#]))
            .expect("stream")
            .finish()
            .await
            .expect("finish");
        assert_eq!(value, json!({"name": "Fresh"}));
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Profile {
        name: String,
        #[serde(default)]
        items: Vec<Item>,
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Item {
        id: String,
    }

    #[tokio::test]
    async fn finish_typed_deserializes_final_value() {
        let profile: Profile = DecodeBuilder::new(schema())
            .stream(from_text_chunks([r#"{"name":"Lin","items":[{"id":"#, r#""9"}]}"#]))
            .expect("stream")
            .finish_typed()
            .await
            .expect("typed");
        assert_eq!(
            profile,
            Profile {
                name: "Lin".into(),
                items: vec![Item { id: "9".into() }],
            }
        );
    }
}
