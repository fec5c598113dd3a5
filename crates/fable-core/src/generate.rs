use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GenerateError;
use crate::history::TranscriptMessage;
use crate::ids::{MessageId, SessionId};

/// Opaque reference to the persona (book or character) a session talks to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersonaRef {
    /// Content key understood by the generation backend.
    pub id: String,
    /// Display name shown in transcripts.
    pub name: String,
}

impl PersonaRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into() }
    }
}

/// One user turn handed to the generation collaborator.
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: SessionId,
    /// Client-generated id of the user message; the dedup key.
    pub message_id: MessageId,
    pub persona: PersonaRef,
    pub text: String,
    /// Recent transcript for context, oldest first.
    pub history: Vec<TranscriptMessage>,
}

/// Events emitted while a reply is generated. Ordering contract:
///
/// Start → Delta* → Done | Error
///
/// Error may replace Done at any point after Start.
#[derive(Clone, Debug)]
pub enum ReplyEvent {
    Start,
    Delta { text: String },
    Done { full_text: String },
    Error { error: GenerateError },
}

impl ReplyEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = ReplyEvent> + Send>>;

/// Trait implemented by each generation backend adapter.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, turn: &TurnRequest) -> Result<ReplyStream, GenerateError>;
}
