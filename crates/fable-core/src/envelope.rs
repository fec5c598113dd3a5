use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::{MessageId, SessionId, StreamId};

/// Wire event kinds carried in the envelope `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserMessage,
    AiResponse,
    StreamStart,
    StreamChunk,
    StreamEnd,
    Typing,
    HeartbeatPing,
    HeartbeatPong,
    Error,
    System,
    /// A kind this build does not recognize. Decoded, counted, ignored.
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AiResponse => "ai_response",
            Self::StreamStart => "stream_start",
            Self::StreamChunk => "stream_chunk",
            Self::StreamEnd => "stream_end",
            Self::Typing => "typing",
            Self::HeartbeatPing => "heartbeat_ping",
            Self::HeartbeatPong => "heartbeat_pong",
            Self::Error => "error",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }

    /// Permissive mapping from the wire string. Anything unrecognized maps
    /// to `Unknown` so that newer peers never tear down the channel.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "user_message" => Self::UserMessage,
            "ai_response" => Self::AiResponse,
            "stream_start" => Self::StreamStart,
            "stream_chunk" => Self::StreamChunk,
            "stream_end" => Self::StreamEnd,
            "typing" => Self::Typing,
            "heartbeat_ping" => Self::HeartbeatPing,
            "heartbeat_pong" => Self::HeartbeatPong,
            "error" => Self::Error,
            "system" => Self::System,
            _ => Self::Unknown,
        }
    }
}

impl Serialize for EventKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_wire(&s))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope decode failures. Logged and counted by both endpoints; never a
/// reason to close the channel.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("envelope missing required field: {0}")]
    MissingField(&'static str),
    #[error("bad {kind} payload: {detail}")]
    Payload { kind: &'static str, detail: String },
}

/// WebSocket close codes in the application range (4000+).
pub mod close_code {
    pub const EXPIRED: u16 = 4001;
    pub const MALFORMED: u16 = 4002;
    pub const SESSION_MISMATCH: u16 = 4003;
    /// Channel displaced by a newer channel for the same session.
    pub const SUPERSEDED: u16 = 4008;
    pub const ALREADY_BOUND: u16 = 4009;
}

/// `code` values carried by `error` envelopes.
pub mod error_code {
    pub const QUOTA_EXCEEDED: &str = "quota_exceeded";
    pub const SUPERSEDED: &str = "superseded";
    pub const ALREADY_BOUND: &str = "already_bound";
    pub const GENERATION_FAILED: &str = "generation_failed";
    /// A turn arrived while a reply was still streaming for the session.
    pub const REPLY_IN_PROGRESS: &str = "reply_in_progress";
}

/// `event` values carried by `system` envelopes.
pub mod system_event {
    /// Server acknowledges a user turn; releases the client's pending entry.
    pub const TURN_ACCEPTED: &str = "turn_accepted";
    /// Client asks the server to stop generating the named stream.
    pub const CANCEL_STREAM: &str = "cancel_stream";
}

/// Wire envelope for every event on a channel.
/// `sequence` is per-channel per-direction, stamped by the sender at write
/// time, strictly increasing from 1. A receiver seeing a gap must resync
/// from history rather than continue silently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub timestamp: String,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Envelope {
    pub fn new(kind: EventKind, session_id: SessionId) -> Self {
        Self {
            kind,
            session_id,
            message_id: None,
            stream_id: None,
            sequence: 0,
            payload: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    // ── Constructors for each wire kind ──────────────────────────────────

    pub fn user_message(session_id: SessionId, message_id: MessageId, text: &str) -> Self {
        let mut e = Self::new(EventKind::UserMessage, session_id);
        e.message_id = Some(message_id);
        e.payload = Some(serde_json::json!({ "text": text }));
        e
    }

    pub fn ai_response(session_id: SessionId, message_id: MessageId, text: &str) -> Self {
        let mut e = Self::new(EventKind::AiResponse, session_id);
        e.message_id = Some(message_id);
        e.payload = Some(serde_json::json!({ "text": text }));
        e
    }

    pub fn stream_start(session_id: SessionId, stream_id: StreamId, replies_to: &MessageId) -> Self {
        let mut e = Self::new(EventKind::StreamStart, session_id);
        e.stream_id = Some(stream_id);
        e.payload = Some(serde_json::json!({ "replies_to": replies_to }));
        e
    }

    pub fn stream_chunk(session_id: SessionId, stream_id: StreamId, seq: u64, text: &str) -> Self {
        let mut e = Self::new(EventKind::StreamChunk, session_id);
        e.stream_id = Some(stream_id);
        e.payload = Some(serde_json::json!({ "seq": seq, "text": text }));
        e
    }

    pub fn stream_end(
        session_id: SessionId,
        stream_id: StreamId,
        outcome: StreamOutcome,
        chunks: u64,
    ) -> Self {
        let mut e = Self::new(EventKind::StreamEnd, session_id);
        e.stream_id = Some(stream_id);
        e.payload = Some(serde_json::json!({ "outcome": outcome, "chunks": chunks }));
        e
    }

    pub fn typing(session_id: SessionId, active: bool) -> Self {
        let mut e = Self::new(EventKind::Typing, session_id);
        e.payload = Some(serde_json::json!({ "active": active }));
        e
    }

    pub fn heartbeat_ping(session_id: SessionId, nonce: u64, sent_at_ms: i64) -> Self {
        let mut e = Self::new(EventKind::HeartbeatPing, session_id);
        e.payload = Some(serde_json::json!({ "nonce": nonce, "sent_at_ms": sent_at_ms }));
        e
    }

    /// Pong echoes the ping payload so the sender can compute round-trip time.
    pub fn heartbeat_pong(session_id: SessionId, nonce: u64, sent_at_ms: i64) -> Self {
        let mut e = Self::new(EventKind::HeartbeatPong, session_id);
        e.payload = Some(serde_json::json!({ "nonce": nonce, "sent_at_ms": sent_at_ms }));
        e
    }

    pub fn error(
        session_id: SessionId,
        code: &str,
        message: &str,
        message_id: Option<MessageId>,
    ) -> Self {
        let mut e = Self::new(EventKind::Error, session_id);
        e.message_id = message_id.clone();
        e.payload = Some(serde_json::json!({
            "code": code,
            "message": message,
            "message_id": message_id,
        }));
        e
    }

    pub fn turn_accepted(session_id: SessionId, message_id: MessageId) -> Self {
        let mut e = Self::new(EventKind::System, session_id);
        e.message_id = Some(message_id.clone());
        e.payload = Some(serde_json::json!({
            "event": system_event::TURN_ACCEPTED,
            "message_id": message_id,
        }));
        e
    }

    pub fn cancel_stream(session_id: SessionId, stream_id: StreamId) -> Self {
        let mut e = Self::new(EventKind::System, session_id);
        e.stream_id = Some(stream_id.clone());
        e.payload = Some(serde_json::json!({
            "event": system_event::CANCEL_STREAM,
            "stream_id": stream_id,
        }));
        e
    }

    // ── Codec ────────────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let Some(obj) = value.as_object() else {
            return Err(DecodeError::Malformed("envelope is not an object".into()));
        };
        if !obj.contains_key("type") {
            return Err(DecodeError::MissingField("type"));
        }
        if !obj.contains_key("session_id") {
            return Err(DecodeError::MissingField("session_id"));
        }
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    /// Decode the payload into a typed struct for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let Some(value) = &self.payload else {
            return Err(DecodeError::Payload {
                kind: self.kind.as_str(),
                detail: "missing payload".into(),
            });
        };
        serde_json::from_value(value.clone()).map_err(|e| DecodeError::Payload {
            kind: self.kind.as_str(),
            detail: e.to_string(),
        })
    }
}

// ── Typed payloads ───────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserMessagePayload {
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiResponsePayload {
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamStartPayload {
    /// User turn this reply answers.
    pub replies_to: MessageId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamChunkPayload {
    /// Per-stream chunk ordinal, starting at 1. Independent of the envelope
    /// sequence: it continues across reconnects.
    pub seq: u64,
    pub text: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    Complete,
    Cancelled,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamEndPayload {
    pub outcome: StreamOutcome,
    /// Total chunks the server emitted, for client-side gap accounting.
    pub chunks: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    pub active: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub nonce: u64,
    pub sent_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemPayload {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let sid = SessionId::new();
        let mid = MessageId::new();
        let e = Envelope::user_message(sid.clone(), mid.clone(), "hello there").with_sequence(7);
        let text = e.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded.kind, EventKind::UserMessage);
        assert_eq!(decoded.session_id, sid);
        assert_eq!(decoded.message_id, Some(mid));
        assert_eq!(decoded.sequence, 7);
        let payload: UserMessagePayload = decoded.payload_as().unwrap();
        assert_eq!(payload.text, "hello there");
    }

    #[test]
    fn unknown_kind_is_permissive() {
        let raw = r#"{"type":"hologram_frame","session_id":"sess_1","sequence":3,"timestamp":"2026-02-15T12:00:00.000Z"}"#;
        let decoded = Envelope::decode(raw).unwrap();
        assert_eq!(decoded.kind, EventKind::Unknown);
        assert_eq!(decoded.sequence, 3);
    }

    #[test]
    fn rejects_non_object() {
        let err = Envelope::decode("[1,2,3]").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)), "got: {err}");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Envelope::decode("not json at all").is_err());
    }

    #[test]
    fn rejects_missing_type() {
        let raw = r#"{"session_id":"sess_1","sequence":1,"timestamp":"2026-02-15T12:00:00.000Z"}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("type")), "got: {err}");
    }

    #[test]
    fn rejects_missing_session_id() {
        let raw = r#"{"type":"typing","sequence":1,"timestamp":"2026-02-15T12:00:00.000Z"}"#;
        let err = Envelope::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("session_id")), "got: {err}");
    }

    #[test]
    fn optional_fields_omitted_from_wire() {
        let e = Envelope::typing(SessionId::new(), true).with_sequence(1);
        let text = e.encode().unwrap();
        assert!(!text.contains("message_id"), "wire: {text}");
        assert!(!text.contains("stream_id"), "wire: {text}");
    }

    #[test]
    fn stream_chunk_payload_roundtrip() {
        let e = Envelope::stream_chunk(SessionId::new(), StreamId::new(), 12, "and then, ");
        let payload: StreamChunkPayload = e.payload_as().unwrap();
        assert_eq!(payload.seq, 12);
        assert_eq!(payload.text, "and then, ");
    }

    #[test]
    fn stream_end_outcomes_snake_case() {
        let e = Envelope::stream_end(SessionId::new(), StreamId::new(), StreamOutcome::Cancelled, 4);
        let text = e.encode().unwrap();
        assert!(text.contains(r#""outcome":"cancelled""#), "wire: {text}");
        let payload: StreamEndPayload = e.payload_as().unwrap();
        assert_eq!(payload.outcome, StreamOutcome::Cancelled);
        assert_eq!(payload.chunks, 4);
    }

    #[test]
    fn turn_accepted_system_event() {
        let mid = MessageId::new();
        let e = Envelope::turn_accepted(SessionId::new(), mid.clone());
        assert_eq!(e.kind, EventKind::System);
        let payload: SystemPayload = e.payload_as().unwrap();
        assert_eq!(payload.event, system_event::TURN_ACCEPTED);
        assert_eq!(payload.message_id, Some(mid));
    }

    #[test]
    fn cancel_stream_system_event() {
        let stid = StreamId::new();
        let e = Envelope::cancel_stream(SessionId::new(), stid.clone());
        let payload: SystemPayload = e.payload_as().unwrap();
        assert_eq!(payload.event, system_event::CANCEL_STREAM);
        assert_eq!(payload.stream_id, Some(stid));
    }

    #[test]
    fn pong_echoes_ping_payload() {
        let ping = Envelope::heartbeat_ping(SessionId::new(), 42, 1_700_000_000_000);
        let p: HeartbeatPayload = ping.payload_as().unwrap();
        let pong = Envelope::heartbeat_pong(ping.session_id.clone(), p.nonce, p.sent_at_ms);
        let q: HeartbeatPayload = pong.payload_as().unwrap();
        assert_eq!(q.nonce, 42);
        assert_eq!(q.sent_at_ms, 1_700_000_000_000);
    }

    #[test]
    fn error_payload_carries_message_id() {
        let mid = MessageId::new();
        let e = Envelope::error(
            SessionId::new(),
            error_code::QUOTA_EXCEEDED,
            "reply quota exhausted",
            Some(mid.clone()),
        );
        let payload: ErrorPayload = e.payload_as().unwrap();
        assert_eq!(payload.code, "quota_exceeded");
        assert_eq!(payload.message_id, Some(mid));
    }

    #[test]
    fn missing_payload_is_an_error() {
        let e = Envelope::new(EventKind::UserMessage, SessionId::new());
        let err = e.payload_as::<UserMessagePayload>().unwrap_err();
        assert!(matches!(err, DecodeError::Payload { .. }), "got: {err}");
    }

    #[test]
    fn kind_wire_strings() {
        assert_eq!(EventKind::from_wire("heartbeat_ping"), EventKind::HeartbeatPing);
        assert_eq!(EventKind::from_wire("stream_chunk"), EventKind::StreamChunk);
        assert_eq!(EventKind::from_wire("no_such_kind"), EventKind::Unknown);
        assert_eq!(EventKind::StreamEnd.as_str(), "stream_end");
    }
}
