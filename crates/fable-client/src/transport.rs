use async_trait::async_trait;

use fable_core::errors::RejectReason;

/// Why a connect attempt or an established channel failed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    /// The server refused the upgrade and said why.
    #[error("channel rejected: {0}")]
    Rejected(RejectReason),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Rejections carry a reason the server chose deliberately; everything
    /// else is assumed transient.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Inbound frame surfaced by a transport. Control frames are handled below
/// this seam; only text and closure reach the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

/// One established duplex channel. Implementations are single-consumer:
/// the manager owns the box and is the only caller.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound frame. `None` means the peer is gone without a close
    /// frame.
    async fn next_frame(&mut self) -> Option<TransportFrame>;

    /// Best-effort close. Errors are swallowed; the channel is finished
    /// either way.
    async fn close(&mut self);
}

/// Dials new channels. Real deployments use the WebSocket connector; tests
/// substitute scripted in-memory transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}
