use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use fable_core::errors::GenerateError;
use fable_core::generate::{ReplyEvent, ReplyGenerator, ReplyStream, TurnRequest};

/// Pre-programmed replies for deterministic testing and demos without a
/// live generation backend.
pub enum ScriptedReply {
    /// Yield a sequence of ReplyEvents.
    Events(Vec<ReplyEvent>),
    /// Return an error from the generate() call itself.
    Error(GenerateError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<ScriptedReply>),
}

impl ScriptedReply {
    /// Convenience: a reply delivered as a single delta.
    pub fn text(text: &str) -> Self {
        let text = text.to_string();
        Self::Events(vec![
            ReplyEvent::Start,
            ReplyEvent::Delta { text: text.clone() },
            ReplyEvent::Done { full_text: text },
        ])
    }

    /// Convenience: a reply delivered delta by delta. The final text is the
    /// concatenation of the pieces.
    pub fn deltas(pieces: &[&str]) -> Self {
        let mut events = vec![ReplyEvent::Start];
        for piece in pieces {
            events.push(ReplyEvent::Delta { text: piece.to_string() });
        }
        events.push(ReplyEvent::Done { full_text: pieces.concat() });
        Self::Events(events)
    }

    /// Convenience: a stream that starts, then ends with an error event.
    pub fn mid_stream_error(error: GenerateError) -> Self {
        Self::Events(vec![ReplyEvent::Start, ReplyEvent::Error { error }])
    }

    /// Convenience: wrap any reply with a delay.
    pub fn delayed(delay: Duration, inner: ScriptedReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Generator that plays back pre-programmed replies in call order.
pub struct ScriptedGenerator {
    replies: Vec<ScriptedReply>,
    call_count: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ReplyGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, _turn: &TurnRequest) -> Result<ReplyStream, GenerateError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        let Some(reply) = self.replies.get(idx) else {
            return Err(GenerateError::InvalidTurn(format!(
                "ScriptedGenerator: no reply configured for call {}",
                idx
            )));
        };

        resolve_reply(reply).await
    }
}

/// Resolve a ScriptedReply, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_reply(reply: &ScriptedReply) -> Result<ReplyStream, GenerateError> {
    let mut current = reply;
    loop {
        match current {
            ScriptedReply::Events(events) => {
                let events = events.clone();
                return Ok(Box::pin(stream::iter(events)));
            }
            ScriptedReply::Error(e) => return Err(e.clone()),
            ScriptedReply::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}
