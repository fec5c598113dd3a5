use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::errors::AuthError;
use crate::generate::PersonaRef;
use crate::ids::{PrincipalId, SessionId};

/// Ownership record for one dialogue session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub principal_id: PrincipalId,
    pub persona: PersonaRef,
    pub created_at: String,
}

/// Session-ownership lookup. The binder consults this after credential
/// verification: the credential proves who, the directory proves whose
/// session it is.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn lookup(&self, session_id: &SessionId) -> Option<SessionRecord>;

    async fn create(&self, principal_id: &PrincipalId, persona: PersonaRef) -> SessionRecord;
}

/// In-memory reference implementation.
#[derive(Default)]
pub struct MemoryDirectory {
    sessions: DashMap<SessionId, SessionRecord>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn lookup(&self, session_id: &SessionId) -> Option<SessionRecord> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    async fn create(&self, principal_id: &PrincipalId, persona: PersonaRef) -> SessionRecord {
        let record = SessionRecord {
            session_id: SessionId::new(),
            principal_id: principal_id.clone(),
            persona,
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        };
        self.sessions.insert(record.session_id.clone(), record.clone());
        record
    }
}

/// Primary account credential check, consumed by the session-creation
/// surface. Channel credentials are a separate, narrower thing.
#[async_trait]
pub trait PrimaryAuth: Send + Sync {
    async fn verify(&self, account_token: &str) -> Result<PrincipalId, AuthError>;
}

/// Fixed token table for demos and tests.
pub struct StaticPrimaryAuth {
    accounts: HashMap<String, PrincipalId>,
}

impl StaticPrimaryAuth {
    pub fn new(accounts: HashMap<String, PrincipalId>) -> Self {
        Self { accounts }
    }

    /// Single-account convenience.
    pub fn single(token: impl Into<String>, principal_id: PrincipalId) -> Self {
        let mut accounts = HashMap::new();
        accounts.insert(token.into(), principal_id);
        Self { accounts }
    }
}

#[async_trait]
impl PrimaryAuth for StaticPrimaryAuth {
    async fn verify(&self, account_token: &str) -> Result<PrincipalId, AuthError> {
        self.accounts
            .get(account_token)
            .cloned()
            .ok_or_else(|| AuthError::Malformed("unknown account token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_lookup() {
        let directory = MemoryDirectory::new();
        let pid = PrincipalId::new();
        let record = directory
            .create(&pid, PersonaRef::new("bk_dracula", "Count Dracula"))
            .await;

        let found = directory.lookup(&record.session_id).await.unwrap();
        assert_eq!(found.principal_id, pid);
        assert_eq!(found.persona.name, "Count Dracula");
    }

    #[tokio::test]
    async fn lookup_unknown_session() {
        let directory = MemoryDirectory::new();
        assert!(directory.lookup(&SessionId::new()).await.is_none());
    }

    #[tokio::test]
    async fn static_auth_accepts_known_token() {
        let pid = PrincipalId::new();
        let auth = StaticPrimaryAuth::single("tok-abc", pid.clone());
        assert_eq!(auth.verify("tok-abc").await.unwrap(), pid);
    }

    #[tokio::test]
    async fn static_auth_rejects_unknown_token() {
        let auth = StaticPrimaryAuth::single("tok-abc", PrincipalId::new());
        let err = auth.verify("tok-xyz").await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)), "got: {err}");
    }
}
