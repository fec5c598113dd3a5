use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};

use fable_core::errors::GenerateError;
use fable_core::generate::{ReplyEvent, ReplyGenerator, ReplyStream, TurnRequest};

/// How a full-text delta is re-cut into paced chunks.
#[derive(Clone, Debug)]
pub struct PacingConfig {
    /// Words per emitted chunk.
    pub chunk_words: usize,
    /// Gap between consecutive chunks. Zero disables pacing delays.
    pub delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            chunk_words: 3,
            delay: Duration::from_millis(40),
        }
    }
}

/// Wraps a generator whose deltas arrive in large pieces and re-emits them
/// as word-boundary chunks with a fixed gap, so downstream consumers see a
/// stream shaped like live token output.
///
/// Start, Done and Error events pass through untouched; only Delta text is
/// re-cut. Concatenation of the emitted chunks equals the original text.
pub struct PacedGenerator<G> {
    inner: G,
    config: PacingConfig,
}

impl<G> PacedGenerator<G> {
    pub fn new(inner: G, config: PacingConfig) -> Self {
        Self { inner, config }
    }

    pub fn with_defaults(inner: G) -> Self {
        Self::new(inner, PacingConfig::default())
    }
}

#[async_trait]
impl<G: ReplyGenerator> ReplyGenerator for PacedGenerator<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(&self, turn: &TurnRequest) -> Result<ReplyStream, GenerateError> {
        let inner = self.inner.generate(turn).await?;
        Ok(Box::pin(PacedStream::new(inner, self.config.clone())))
    }
}

/// Split text into chunks of `chunk_words` whitespace-delimited words, each
/// chunk keeping its trailing whitespace so concatenation reproduces the
/// input exactly.
pub fn split_chunks(text: &str, chunk_words: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chunk_words = chunk_words.max(1);

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut words = 0;
    for token in text.split_inclusive(char::is_whitespace) {
        current.push_str(token);
        words += 1;
        if words == chunk_words {
            chunks.push(std::mem::take(&mut current));
            words = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct PacedStream {
    inner: ReplyStream,
    config: PacingConfig,
    queue: VecDeque<ReplyEvent>,
    delay: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl PacedStream {
    fn new(inner: ReplyStream, config: PacingConfig) -> Self {
        Self {
            inner,
            config,
            queue: VecDeque::new(),
            delay: None,
        }
    }
}

impl Stream for PacedStream {
    type Item = ReplyEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        loop {
            // An armed delay gates the next queued chunk.
            if let Some(sleep) = self.delay.as_mut() {
                match sleep.as_mut().poll(cx) {
                    std::task::Poll::Ready(()) => self.delay = None,
                    std::task::Poll::Pending => return std::task::Poll::Pending,
                }
            }

            if let Some(event) = self.queue.pop_front() {
                let more_chunks = matches!(self.queue.front(), Some(ReplyEvent::Delta { .. }));
                if more_chunks && !self.config.delay.is_zero() {
                    self.delay = Some(Box::pin(tokio::time::sleep(self.config.delay)));
                }
                return std::task::Poll::Ready(Some(event));
            }

            // Queue drained; pull the next inner event.
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(ReplyEvent::Delta { text })) => {
                    for chunk in split_chunks(&text, self.config.chunk_words) {
                        self.queue.push_back(ReplyEvent::Delta { text: chunk });
                    }
                    // Loop again: pop the first chunk (or poll on, if the
                    // delta was empty).
                }
                std::task::Poll::Ready(Some(other)) => return std::task::Poll::Ready(Some(other)),
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedGenerator, ScriptedReply};
    use fable_core::generate::PersonaRef;
    use fable_core::ids::{MessageId, SessionId};
    use tokio_stream::StreamExt;

    fn turn() -> TurnRequest {
        TurnRequest {
            session_id: SessionId::new(),
            message_id: MessageId::new(),
            persona: PersonaRef::new("bk_moby_dick", "Ishmael"),
            text: "tell me of the sea".to_string(),
            history: Vec::new(),
        }
    }

    #[test]
    fn chunks_group_words() {
        let chunks = split_chunks("one two three four five", 2);
        assert_eq!(chunks, vec!["one two ", "three four ", "five"]);
    }

    #[test]
    fn chunks_concatenate_to_input() {
        let text = "Call me Ishmael.  Some years ago\nnever mind how long";
        let chunks = split_chunks(text, 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(split_chunks("", 3).is_empty());
    }

    #[test]
    fn zero_chunk_words_treated_as_one() {
        let chunks = split_chunks("a b", 0);
        assert_eq!(chunks, vec!["a ", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_stream_recuts_deltas() {
        let inner = ScriptedGenerator::new(vec![ScriptedReply::text(
            "Call me Ishmael. Some years ago.",
        )]);
        let paced = PacedGenerator::new(
            inner,
            PacingConfig {
                chunk_words: 2,
                delay: Duration::from_millis(40),
            },
        );

        let mut stream = paced.generate(&turn()).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }

        // Start, 3 chunks of 2 words, Done
        assert_eq!(events.len(), 5, "got: {events:?}");
        assert!(matches!(events[0], ReplyEvent::Start));
        assert!(matches!(events.last(), Some(ReplyEvent::Done { .. })));

        let assembled: String = events
            .iter()
            .filter_map(|e| match e {
                ReplyEvent::Delta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(assembled, "Call me Ishmael. Some years ago.");
    }

    #[tokio::test(start_paused = true)]
    async fn paced_stream_spaces_chunks_in_time() {
        let inner = ScriptedGenerator::new(vec![ScriptedReply::text("one two three")]);
        let paced = PacedGenerator::new(
            inner,
            PacingConfig {
                chunk_words: 1,
                delay: Duration::from_millis(40),
            },
        );

        let mut stream = paced.generate(&turn()).await.unwrap();
        let begin = tokio::time::Instant::now();
        while stream.next().await.is_some() {}

        // Three chunks, two inter-chunk gaps.
        assert_eq!(begin.elapsed(), Duration::from_millis(80));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_emits_immediately() {
        let inner = ScriptedGenerator::new(vec![ScriptedReply::text("one two three four")]);
        let paced = PacedGenerator::new(
            inner,
            PacingConfig {
                chunk_words: 1,
                delay: Duration::ZERO,
            },
        );

        let mut stream = paced.generate(&turn()).await.unwrap();
        let begin = tokio::time::Instant::now();
        while stream.next().await.is_some() {}
        assert_eq!(begin.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn errors_pass_through_unpaced() {
        let inner = ScriptedGenerator::new(vec![ScriptedReply::mid_stream_error(
            GenerateError::Interrupted("upstream gone".into()),
        )]);
        let paced = PacedGenerator::with_defaults(inner);

        let mut stream = paced.generate(&turn()).await.unwrap();
        assert!(matches!(stream.next().await, Some(ReplyEvent::Start)));
        assert!(matches!(
            stream.next().await,
            Some(ReplyEvent::Error {
                error: GenerateError::Interrupted(_)
            })
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn generate_error_propagates() {
        let inner = ScriptedGenerator::new(vec![ScriptedReply::Error(GenerateError::Overloaded)]);
        let paced = PacedGenerator::with_defaults(inner);
        let result = paced.generate(&turn()).await;
        assert!(matches!(result, Err(GenerateError::Overloaded)));
    }

    #[test]
    fn name_delegates_to_inner() {
        let paced = PacedGenerator::with_defaults(ScriptedGenerator::new(vec![]));
        assert_eq!(paced.name(), "scripted");
    }
}
