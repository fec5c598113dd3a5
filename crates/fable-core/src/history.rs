use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, SessionId};

/// Who authored a transcript message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Persona,
}

/// One persisted message in a dialogue transcript.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub author: Author,
    pub text: String,
    pub created_at: String,
}

impl TranscriptMessage {
    pub fn new(
        session_id: SessionId,
        message_id: MessageId,
        author: Author,
        text: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            session_id,
            author,
            text: text.into(),
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

/// Persisted conversation history. The durable source of truth: after a
/// reconnect or a chunk gap, clients reload from here rather than trusting
/// whatever the channel managed to deliver.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Full transcript for a session, oldest first.
    async fn transcript(&self, session_id: &SessionId) -> Vec<TranscriptMessage>;

    /// A single message, if recorded.
    async fn message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Option<TranscriptMessage>;

    /// Append a completed message. Idempotent per message id.
    async fn record(&self, message: TranscriptMessage);
}

/// In-memory reference implementation.
#[derive(Default)]
pub struct MemoryHistory {
    by_session: DashMap<SessionId, Vec<TranscriptMessage>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn transcript(&self, session_id: &SessionId) -> Vec<TranscriptMessage> {
        self.by_session
            .get(session_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    async fn message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
    ) -> Option<TranscriptMessage> {
        self.by_session
            .get(session_id)?
            .iter()
            .find(|m| &m.message_id == message_id)
            .cloned()
    }

    async fn record(&self, message: TranscriptMessage) {
        let mut entry = self.by_session.entry(message.session_id.clone()).or_default();
        if entry.iter().any(|m| m.message_id == message.message_id) {
            return;
        }
        entry.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_and_fetch() {
        let history = MemoryHistory::new();
        let sid = SessionId::new();
        let mid = MessageId::new();
        history
            .record(TranscriptMessage::new(sid.clone(), mid.clone(), Author::User, "hello"))
            .await;

        let transcript = history.transcript(&sid).await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].text, "hello");

        let single = history.message(&sid, &mid).await.unwrap();
        assert_eq!(single.author, Author::User);
    }

    #[tokio::test]
    async fn record_is_idempotent_per_message_id() {
        let history = MemoryHistory::new();
        let sid = SessionId::new();
        let mid = MessageId::new();
        let msg = TranscriptMessage::new(sid.clone(), mid, Author::Persona, "once");
        history.record(msg.clone()).await;
        history.record(msg).await;

        assert_eq!(history.transcript(&sid).await.len(), 1);
    }

    #[tokio::test]
    async fn transcript_preserves_insertion_order() {
        let history = MemoryHistory::new();
        let sid = SessionId::new();
        for text in ["one", "two", "three"] {
            history
                .record(TranscriptMessage::new(sid.clone(), MessageId::new(), Author::User, text))
                .await;
        }
        let texts: Vec<_> = history
            .transcript(&sid)
            .await
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unknown_session_is_empty() {
        let history = MemoryHistory::new();
        assert!(history.transcript(&SessionId::new()).await.is_empty());
        assert!(history.message(&SessionId::new(), &MessageId::new()).await.is_none());
    }

    #[test]
    fn author_serde_snake_case() {
        assert_eq!(serde_json::to_string(&Author::User).unwrap(), r#""user""#);
        assert_eq!(serde_json::to_string(&Author::Persona).unwrap(), r#""persona""#);
    }
}
