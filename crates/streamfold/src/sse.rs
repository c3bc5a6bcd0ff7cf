//! Server-sent-events framing for chunk sources.
//!
//! Each `data:` payload becomes one text chunk. A `[DONE]` payload becomes the
//! terminal `Chunk::End`, and an `error` event fails the stream.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::SourceError;
use crate::source::{Chunk, ChunkStream};

/// Raw byte stream read from a transport.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, SourceError>> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame splitter.
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a delimiter.
    scanned: usize,
    max_frame_bytes: usize,
}

impl SseDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Appends `chunk` and moves every completed frame into `frames`.
    ///
    /// Frames completed before an error are still pushed.
    pub fn push_chunk(&mut self, chunk: &[u8], frames: &mut Vec<SseFrame>) -> Result<(), String> {
        self.buf.extend_from_slice(chunk);
        // A delimiter may straddle the previous end of the buffer.
        let mut from = self.scanned.saturating_sub(3);
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf, from) {
            let frame: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            if let Some(frame) = parse_sse_frame(&frame)? {
                frames.push(frame);
            }
            from = 0;
        }
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_frame_bytes {
            self.buf.clear();
            self.scanned = 0;
            return Err(format!(
                "SSE frame exceeds {} bytes without a delimiter",
                self.max_frame_bytes
            ));
        }
        Ok(())
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Option<SseFrame>, String> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        parse_sse_frame(&rest)
    }
}

fn find_frame_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Result<Option<SseFrame>, String> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let text =
        std::str::from_utf8(bytes).map_err(|e| format!("invalid UTF-8 in SSE frame: {e}"))?;
    let mut event: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            // Only one leading space belongs to the framing; the rest is payload.
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if event.is_none() && data_lines.is_empty() {
        return Ok(None);
    }
    Ok(Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    }))
}

fn map_frame(source_name: &str, frame: SseFrame) -> Result<Option<Chunk>, SourceError> {
    if frame.event.as_deref() == Some("error") {
        let message = if frame.data.is_empty() {
            "source reported an error".to_string()
        } else {
            frame.data
        };
        return Err(SourceError::protocol(source_name, message));
    }
    if frame.data.trim() == "[DONE]" {
        return Ok(Some(Chunk::End));
    }
    if frame.data.is_empty() {
        return Ok(None);
    }
    Ok(Some(Chunk::Text(frame.data)))
}

/// Turns an SSE byte stream into a chunk stream.
///
/// A frame larger than `max_frame_bytes`, or one that is not valid UTF-8,
/// fails the stream with `SourceError::Protocol`.
pub fn sse_chunks(
    source_name: impl Into<String>,
    bytes_stream: ByteStream,
    max_frame_bytes: usize,
) -> ChunkStream {
    struct State {
        source_name: String,
        bytes_stream: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<Chunk>,
        failed: Option<SourceError>,
        done: bool,
    }

    impl State {
        // Chunks framed before an error are still delivered.
        fn enqueue(&mut self, frames: Vec<SseFrame>, framing: Result<(), String>) {
            for frame in frames {
                match map_frame(&self.source_name, frame) {
                    Ok(Some(chunk)) => self.pending.push_back(chunk),
                    Ok(None) => {}
                    Err(err) => {
                        self.failed = Some(err);
                        return;
                    }
                }
            }
            if let Err(message) = framing {
                self.failed = Some(SourceError::protocol(self.source_name.clone(), message));
            }
        }
    }

    let chunks = stream::try_unfold(
        State {
            source_name: source_name.into(),
            bytes_stream,
            decoder: SseDecoder::new(max_frame_bytes),
            pending: VecDeque::new(),
            failed: None,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(Some((chunk, state)));
                }
                if let Some(err) = state.failed.take() {
                    state.done = true;
                    return Err(err);
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(bytes)) => {
                        let mut frames = Vec::new();
                        let framing = state.decoder.push_chunk(&bytes, &mut frames);
                        state.enqueue(frames, framing);
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        let (frames, framing) = match state.decoder.finish() {
                            Ok(frame) => (frame.into_iter().collect(), Ok(())),
                            Err(message) => (Vec::new(), Err(message)),
                        };
                        state.enqueue(frames, framing);
                        debug!(source = %state.source_name, "sse stream ended");
                        state.done = true;
                    }
                }
            }
        },
    );
    Box::pin(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 1024;

    fn bytes_of(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<Result<bytes::Bytes, SourceError>> = parts
            .iter()
            .map(|p| Ok(bytes::Bytes::from_static(p)))
            .collect();
        Box::pin(stream::iter(items))
    }

    async fn collect(parts: &[&'static [u8]]) -> Vec<Result<Chunk, SourceError>> {
        sse_chunks("test", bytes_of(parts), LIMIT).collect().await
    }

    #[test]
    fn decoder_handles_partial_chunk_boundaries() {
        let mut decoder = SseDecoder::new(LIMIT);
        let mut frames = Vec::new();
        decoder
            .push_chunk(b"event: delta\ndata: {\"na", &mut frames)
            .expect("push");
        assert!(frames.is_empty());
        decoder
            .push_chunk(b"me\"\n\ndata: x\r\n\r\n", &mut frames)
            .expect("push");
        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("delta".into()),
                    data: "{\"name\"".into(),
                },
                SseFrame {
                    event: None,
                    data: "x".into(),
                },
            ]
        );
    }

    #[test]
    fn delimiter_split_across_single_byte_pushes_is_found() {
        let mut decoder = SseDecoder::new(LIMIT);
        let mut frames = Vec::new();
        for byte in b"data: a\r\n\r\ndata: b\n\n" {
            decoder
                .push_chunk(std::slice::from_ref(byte), &mut frames)
                .expect("push");
        }
        let data: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b"]);
    }

    #[test]
    fn payload_whitespace_after_the_first_space_is_kept() {
        let frame = parse_sse_frame(b"data:  world").expect("utf-8").expect("frame");
        assert_eq!(frame.data, " world");
        assert!(parse_sse_frame(b": keep-alive").expect("utf-8").is_none());
    }

    #[tokio::test]
    async fn data_frames_become_text_chunks_and_done_ends() {
        let chunks = collect(&[b"data: {\"a\":\n\n", b"data: 1}\n\ndata: [DONE]\n\n"]).await;
        assert_eq!(
            chunks,
            vec![
                Ok(Chunk::text("{\"a\":")),
                Ok(Chunk::text("1}")),
                Ok(Chunk::End),
            ]
        );
    }

    #[tokio::test]
    async fn trailing_frame_without_blank_line_is_flushed() {
        let chunks = collect(&[b"data: {}"]).await;
        assert_eq!(chunks, vec![Ok(Chunk::text("{}"))]);
    }

    #[tokio::test]
    async fn error_event_fails_the_stream() {
        let chunks = collect(&[b"data: {\n\nevent: error\ndata: overloaded\n\n"]).await;
        assert_eq!(
            chunks,
            vec![
                Ok(Chunk::text("{")),
                Err(SourceError::protocol("test", "overloaded")),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_utf8_fails_instead_of_being_replaced() {
        let chunks = collect(&[b"data: {\"name\":\"a\xFFb\"}\n\n"]).await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            &chunks[0],
            Err(SourceError::Protocol { message, .. }) if message.contains("invalid UTF-8")
        ));

        let schema = crate::schema::Schema::object([crate::schema::Field::required(
            "name",
            crate::schema::Schema::string(),
        )]);
        let err = crate::decode::DecodeBuilder::new(schema)
            .stream(sse_chunks("test", bytes_of(&[b"data: {\"name\":\"a\xFFb\"}\n\n"]), LIMIT))
            .expect("stream")
            .finish()
            .await
            .expect_err("corrupt body");
        assert!(matches!(
            err,
            crate::errors::Error::StreamFailed(crate::errors::StreamFailure::Source { .. })
        ));
    }

    #[tokio::test]
    async fn multibyte_char_split_across_reads_is_kept() {
        let chunks = collect(&[b"data: \"Zo\xC3", b"\xAB\"\n\n"]).await;
        assert_eq!(chunks, vec![Ok(Chunk::text("\"Zoë\""))]);
    }

    #[tokio::test]
    async fn oversized_frame_fails_the_stream() {
        let mut decoder = SseDecoder::new(8);
        let mut frames = Vec::new();
        assert!(decoder.push_chunk(b"data: 1234", &mut frames).is_err());

        let body: &'static [u8] = Box::leak(vec![b'x'; LIMIT + 1].into_boxed_slice());
        let chunks = collect(&[b"data: ok\n\n", b"data: ", body]).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], Ok(Chunk::text("ok")));
        assert!(matches!(
            &chunks[1],
            Err(SourceError::Protocol { message, .. }) if message.contains("exceeds 1024 bytes")
        ));
    }
}
