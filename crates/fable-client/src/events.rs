use fable_core::envelope::StreamOutcome;
use fable_core::history::TranscriptMessage;
use fable_core::ids::{MessageId, StreamId};

use crate::status::ConnectionState;

/// Events fanned out to subscribers. One broadcast channel per client;
/// slow subscribers lag and lose the oldest events rather than block the
/// manager.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Channel established and ready for turns.
    Open,
    /// Channel dropped. `code` is the close code when the server sent one.
    Close { code: Option<u16>, reason: String },
    StatusChange { state: ConnectionState },
    /// A complete message, either broadcast directly or the authoritative
    /// form of a finished stream.
    Message { message: TranscriptMessage },
    StreamStart {
        stream_id: StreamId,
        message_id: MessageId,
        replies_to: MessageId,
    },
    StreamChunk {
        stream_id: StreamId,
        seq: u64,
        text: String,
    },
    StreamEnd {
        stream_id: StreamId,
        outcome: StreamOutcome,
        content: String,
    },
    /// The persona is composing a reply.
    Typing,
    /// Transcript refetched after an envelope sequence gap.
    Resync { messages: Vec<TranscriptMessage> },
    /// A queued turn exhausted its retry budget.
    SendFailed { message_id: MessageId, reason: String },
    /// An error envelope from the server, or a terminal client-side failure.
    Error {
        code: String,
        message: String,
        message_id: Option<MessageId>,
    },
}

impl ClientEvent {
    /// Short tag for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close { .. } => "close",
            Self::StatusChange { .. } => "status_change",
            Self::Message { .. } => "message",
            Self::StreamStart { .. } => "stream_start",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::StreamEnd { .. } => "stream_end",
            Self::Typing => "typing",
            Self::Resync { .. } => "resync",
            Self::SendFailed { .. } => "send_failed",
            Self::Error { .. } => "error",
        }
    }
}
