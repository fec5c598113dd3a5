use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use fable_core::envelope::Envelope;

use crate::transport::{Connector, Transport, TransportError, TransportFrame};

/// In-memory transport pair for driving a client without a network. The
/// returned [`RemoteEnd`] plays the server.
pub fn transport_pair() -> (MockTransport, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MockTransport {
            outbound: out_tx,
            inbound: in_rx,
            closed: false,
        },
        RemoteEnd {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

pub struct MockTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<TransportFrame>,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }

    async fn next_frame(&mut self) -> Option<TransportFrame> {
        if self.closed {
            return None;
        }
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Server side of a mock pair. Dropping it is a silent disconnect: the
/// client sees the frame stream end without a close code.
pub struct RemoteEnd {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<TransportFrame>,
}

impl RemoteEnd {
    /// Next text the client wrote, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next client text decoded as an envelope. Undecodable text is skipped.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        while let Some(text) = self.recv().await {
            if let Ok(envelope) = Envelope::decode(&text) {
                return Some(envelope);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.inbound.send(TransportFrame::Text(text.into()));
    }

    pub fn send_envelope(&self, envelope: &Envelope) {
        if let Ok(text) = envelope.encode() {
            self.send_text(text);
        }
    }

    /// Close the channel with a server-chosen code, as a displaced client
    /// would see it.
    pub fn close_with(&self, code: u16, reason: &str) {
        let _ = self.inbound.send(TransportFrame::Closed {
            code: Some(code),
            reason: reason.into(),
        });
    }
}

/// Connector that hands out pre-built transports in order. Each queued
/// entry is either an accepted connection or a scripted failure; running
/// past the script fails the attempt.
#[derive(Default)]
pub struct ScriptedConnector {
    outcomes: Mutex<VecDeque<Result<MockTransport, TransportError>>>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an accepted connection; returns the server end for the test.
    pub fn accept(&self) -> RemoteEnd {
        let (transport, remote) = transport_pair();
        self.outcomes.lock().push_back(Ok(transport));
        remote
    }

    pub fn refuse(&self, error: TransportError) {
        self.outcomes.lock().push_back(Err(error));
    }

    /// Connect attempts made so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.outcomes.lock().pop_front() {
            Some(Ok(transport)) => Ok(Box::new(transport)),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Connect("no scripted connection".into())),
        }
    }
}
