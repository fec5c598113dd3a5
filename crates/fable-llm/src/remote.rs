use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use fable_core::errors::GenerateError;
use fable_core::generate::{ReplyEvent, ReplyGenerator, ReplyStream, TurnRequest};

use crate::sse::{self, SseParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Streaming HTTP adapter for a remote model-serving endpoint.
///
/// Sends the turn as JSON and consumes the SSE response body, surfacing it
/// as a ReplyEvent stream. Non-2xx responses are classified through
/// `GenerateError::from_status` before any stream exists, so the retry
/// wrapper can still act on them.
pub struct RemoteGenerator {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl RemoteGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, GenerateError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GenerateError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    fn build_request(&self, turn: &TurnRequest) -> reqwest::RequestBuilder {
        let body = serde_json::json!({
            "persona": turn.persona.id,
            "text": turn.text,
            "history": turn.history,
            "stream": true,
        });

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .header("content-type", "application/json");

        if let Some(key) = &self.api_key {
            req = req.header("authorization", format!("Bearer {}", key.expose_secret()));
        }

        req.json(&body)
    }
}

#[async_trait]
impl ReplyGenerator for RemoteGenerator {
    fn name(&self) -> &str {
        "remote"
    }

    #[instrument(skip(self, turn), fields(session_id = %turn.session_id, persona = %turn.persona.id))]
    async fn generate(&self, turn: &TurnRequest) -> Result<ReplyStream, GenerateError> {
        let resp = self
            .build_request(turn)
            .send()
            .await
            .map_err(|e| GenerateError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenerateError::from_status(status, body));
        }

        let byte_stream = resp.bytes_stream();
        Ok(Box::pin(SseStream::new(byte_stream)))
    }
}

/// Wraps the response byte stream and yields ReplyEvents.
/// Includes an idle timeout: if no bytes arrive within `idle_duration`, the
/// stream yields an Interrupted error and ends.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    buffer: String,
    pending: Vec<ReplyEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, STREAM_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

impl Stream for SseStream {
    type Item = ReplyEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if self.finished {
            return std::task::Poll::Ready(None);
        }

        // Return pending events first
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset the idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);

                    // Process complete SSE events from the buffer
                    while let Some(pos) = self.buffer.find("\n\n") {
                        let chunk = self.buffer[..pos + 2].to_string();
                        self.buffer = self.buffer[pos + 2..].to_string();

                        for (event_type, data) in sse::parse_sse_lines(&chunk) {
                            let events = self.parser.parse_event(&event_type, &data);
                            self.pending.extend(events);
                        }
                    }

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return std::task::Poll::Ready(Some(ReplyEvent::Error {
                        error: GenerateError::Interrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    // Stream ended, process whatever is left in the buffer
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        for (event_type, data) in sse::parse_sse_lines(&remaining) {
                            let events = self.parser.parse_event(&event_type, &data);
                            self.pending.extend(events);
                        }
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    // No data available, check the idle timeout
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return std::task::Poll::Ready(Some(ReplyEvent::Error {
                            error: GenerateError::Interrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
