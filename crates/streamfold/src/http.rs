use std::time::Duration;

use futures::StreamExt as _;
use tracing::debug;

use crate::conversation::ContextSnapshot;
use crate::errors::{Error, SourceError};
use crate::options::DecodeOptions;
use crate::source::{Chunk, ChunkSource, ChunkStream};
use crate::sse::{ByteStream, sse_chunks};

const HTTP_SOURCE: &str = "http";

/// How the response body is split into chunks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// Every body read is one `Chunk::Bytes`.
    #[default]
    Raw,
    /// The body is a server-sent-events stream of `data:` payloads.
    Sse,
}

/// Configuration for [`HttpSource`].
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Endpoint that receives the context snapshot as a JSON POST body.
    pub url: String,
    /// Overall request timeout.
    pub timeout: Duration,
    pub framing: Framing,
    /// Extra headers sent with each request.
    pub headers: Vec<(String, String)>,
    /// Largest SSE frame accepted before the stream fails.
    pub max_frame_bytes: usize,
}

impl HttpSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(120),
            framing: Framing::Raw,
            headers: Vec::new(),
            max_frame_bytes: DecodeOptions::default().max_buffer_bytes,
        }
    }

    /// Builds a config from `STREAMFOLD_SOURCE_URL`.
    pub fn from_env() -> Result<Self, Error> {
        let url = std::env::var("STREAMFOLD_SOURCE_URL").unwrap_or_default();
        if url.trim().is_empty() {
            return Err(Error::Config(
                "missing STREAMFOLD_SOURCE_URL for the HTTP chunk source".into(),
            ));
        }
        Ok(Self::new(url))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Chunk source that POSTs the context to an HTTP endpoint and streams the
/// response body.
pub struct HttpSource {
    client: reqwest::Client,
    config: HttpSourceConfig,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, Error> {
        if config.url.trim().is_empty() {
            return Err(Error::Config("HTTP source url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, Error> {
        Self::new(HttpSourceConfig::from_env()?)
    }
}

#[async_trait::async_trait]
impl ChunkSource for HttpSource {
    fn name(&self) -> &str {
        HTTP_SOURCE
    }

    async fn open(&self, context: &ContextSnapshot) -> Result<ChunkStream, SourceError> {
        debug!(url = %self.config.url, turns = context.len(), "opening HTTP chunk source");
        let mut request = self.client.post(&self.config.url).json(context);
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| {
            SourceError::transport(HTTP_SOURCE, format!("request failed: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(SourceError::status(
                HTTP_SOURCE,
                format!("request failed with status {status}: {body}"),
                status.as_u16(),
            ));
        }
        Ok(response_chunks(
            response,
            self.config.framing,
            self.config.max_frame_bytes,
        ))
    }
}

/// Streams a response body as chunks using the given framing.
pub fn response_chunks(
    response: reqwest::Response,
    framing: Framing,
    max_frame_bytes: usize,
) -> ChunkStream {
    let bytes_stream: ByteStream = Box::pin(response.bytes_stream().map(|item| {
        item.map_err(|e| SourceError::transport(HTTP_SOURCE, format!("streaming read failed: {e}")))
    }));
    match framing {
        Framing::Raw => {
            let chunks: ChunkStream = Box::pin(bytes_stream.map(|item| item.map(Chunk::Bytes)));
            chunks
        }
        Framing::Sse => sse_chunks(HTTP_SOURCE, bytes_stream, max_frame_bytes),
    }
}
