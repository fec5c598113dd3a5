use std::time::Duration;

use crate::envelope::{close_code, error_code, DecodeError};

/// Channel credential rejection. Fatal to the attempted connection, never to
/// the dialogue session itself.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential expired")]
    Expired,
    #[error("credential malformed: {0}")]
    Malformed(String),
    #[error("credential bound to a different session")]
    SessionMismatch,
}

impl AuthError {
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Self::Expired => RejectReason::Expired,
            Self::Malformed(_) => RejectReason::Malformed,
            Self::SessionMismatch => RejectReason::SessionMismatch,
        }
    }

    pub fn close_code(&self) -> u16 {
        self.reject_reason().close_code()
    }
}

/// Reason strings a server attaches when refusing a channel upgrade.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    Expired,
    Malformed,
    SessionMismatch,
    AlreadyBound,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Malformed => "malformed",
            Self::SessionMismatch => "session_mismatch",
            Self::AlreadyBound => "already_bound",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "expired" => Some(Self::Expired),
            "malformed" => Some(Self::Malformed),
            "session_mismatch" => Some(Self::SessionMismatch),
            "already_bound" => Some(Self::AlreadyBound),
            _ => None,
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            Self::Expired => close_code::EXPIRED,
            Self::Malformed => close_code::MALFORMED,
            Self::SessionMismatch => close_code::SESSION_MISMATCH,
            Self::AlreadyBound => close_code::ALREADY_BOUND,
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level faults on an established channel. All recoverable: decode
/// failures are dropped and counted, sequence gaps force a resync from
/// history. Never a channel close on its own.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },
    #[error("envelope arrived for foreign session {got}")]
    ForeignSession { got: String },
}

impl ProtocolError {
    /// A gap means events were lost in flight; the receiver must reload the
    /// transcript instead of continuing from a hole.
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::SequenceGap { .. })
    }
}

/// One-live-channel-per-session violations. Fatal to exactly one channel,
/// never to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// A newer channel bound the session; this one was closed under the
    /// displace policy.
    #[error("channel superseded by a newer channel for this session")]
    Superseded,
    /// The session keeps its current channel; the newcomer was refused
    /// under the reject policy.
    #[error("session is already bound to a live channel")]
    AlreadyBound,
}

impl PolicyError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Superseded => close_code::SUPERSEDED,
            Self::AlreadyBound => close_code::ALREADY_BOUND,
        }
    }

    /// Code carried in error envelopes and client error events.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Superseded => error_code::SUPERSEDED,
            Self::AlreadyBound => error_code::ALREADY_BOUND,
        }
    }

    /// The policy violation behind a close frame, if it is one.
    pub fn from_close_code(code: u16) -> Option<Self> {
        match code {
            close_code::SUPERSEDED => Some(Self::Superseded),
            close_code::ALREADY_BOUND => Some(Self::AlreadyBound),
            _ => None,
        }
    }
}

/// Failures from the reply generation collaborator.
/// Classifies errors as fatal (do not retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerateError {
    // Fatal, do not retry
    #[error("reply quota exhausted")]
    QuotaExceeded,
    #[error("invalid turn: {0}")]
    InvalidTurn(String),

    // Retryable
    #[error("upstream error {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("generation backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("reply stream interrupted: {0}")]
    Interrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GenerateError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. } | Self::Overloaded | Self::Network(_) | Self::Interrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::InvalidTurn(_))
    }

    /// Short classification string for logging/metrics and error envelopes.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::InvalidTurn(_) => "invalid_turn",
            Self::Upstream { .. } => "upstream_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::Interrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status from the generation backend.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            402 | 429 => Self::QuotaExceeded,
            400 => Self::InvalidTurn(body),
            529 => Self::Overloaded,
            500..=599 => Self::Upstream { status, body },
            _ => Self::InvalidTurn(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_reject_reasons() {
        assert_eq!(AuthError::Expired.reject_reason(), RejectReason::Expired);
        assert_eq!(
            AuthError::Malformed("bad sig".into()).reject_reason(),
            RejectReason::Malformed
        );
        assert_eq!(
            AuthError::SessionMismatch.reject_reason(),
            RejectReason::SessionMismatch
        );
    }

    #[test]
    fn auth_close_codes() {
        assert_eq!(AuthError::Expired.close_code(), 4001);
        assert_eq!(AuthError::Malformed("x".into()).close_code(), 4002);
        assert_eq!(AuthError::SessionMismatch.close_code(), 4003);
    }

    #[test]
    fn reject_reason_strings_roundtrip() {
        for reason in [
            RejectReason::Expired,
            RejectReason::Malformed,
            RejectReason::SessionMismatch,
            RejectReason::AlreadyBound,
        ] {
            assert_eq!(RejectReason::from_str(reason.as_str()), Some(reason));
        }
        assert_eq!(RejectReason::from_str("nope"), None);
    }

    #[test]
    fn sequence_gap_needs_resync() {
        let gap = ProtocolError::SequenceGap { expected: 5, got: 9 };
        assert!(gap.needs_resync());

        let decode = ProtocolError::Decode(DecodeError::MissingField("type"));
        assert!(!decode.needs_resync());
    }

    #[test]
    fn policy_close_codes_roundtrip() {
        assert_eq!(PolicyError::Superseded.close_code(), 4008);
        assert_eq!(PolicyError::AlreadyBound.close_code(), 4009);
        assert_eq!(
            PolicyError::from_close_code(4008),
            Some(PolicyError::Superseded)
        );
        assert_eq!(
            PolicyError::from_close_code(4009),
            Some(PolicyError::AlreadyBound)
        );
        assert_eq!(PolicyError::from_close_code(1000), None);
    }

    #[test]
    fn retryable_classification() {
        assert!(GenerateError::Upstream { status: 500, body: "err".into() }.is_retryable());
        assert!(GenerateError::Overloaded.is_retryable());
        assert!(GenerateError::Network("tcp".into()).is_retryable());
        assert!(GenerateError::Interrupted("eof".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(GenerateError::QuotaExceeded.is_fatal());
        assert!(GenerateError::InvalidTurn("empty".into()).is_fatal());
        assert!(!GenerateError::QuotaExceeded.is_retryable());
    }

    #[test]
    fn not_retryable_and_not_fatal() {
        let timeout = GenerateError::Timeout(Duration::from_secs(30));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());

        let cancelled = GenerateError::Cancelled;
        assert!(!cancelled.is_retryable());
        assert!(!cancelled.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(GenerateError::from_status(402, "payment".into()).is_fatal());
        assert!(GenerateError::from_status(429, "quota".into()).is_fatal());
        assert!(GenerateError::from_status(400, "bad request".into()).is_fatal());
        assert!(GenerateError::from_status(529, "overloaded".into()).is_retryable());
        assert!(GenerateError::from_status(500, "internal".into()).is_retryable());
        assert!(GenerateError::from_status(502, "bad gateway".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(GenerateError::QuotaExceeded.error_kind(), "quota_exceeded");
        assert_eq!(GenerateError::Cancelled.error_kind(), "cancelled");
        assert_eq!(GenerateError::Overloaded.error_kind(), "overloaded");
    }
}
