use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use fable_core::errors::RejectReason;

use crate::transport::{Connector, Transport, TransportError, TransportFrame};

/// Header the server sets when it refuses an upgrade.
pub const REJECT_REASON_HEADER: &str = "x-reject-reason";

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Production connector backed by tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        match connect_async(url).await {
            Ok((ws, _response)) => Ok(Box::new(WsTransport { inner: ws })),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                let reason = response
                    .headers()
                    .get(REJECT_REASON_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(RejectReason::from_str);
                match reason {
                    Some(reason) => Err(TransportError::Rejected(reason)),
                    None => Err(TransportError::Connect(format!(
                        "upgrade refused with status {}",
                        response.status()
                    ))),
                }
            }
            Err(e) => Err(TransportError::Connect(e.to_string())),
        }
    }
}

struct WsTransport {
    inner: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<TransportFrame> {
        while let Some(result) = self.inner.next().await {
            match result {
                Ok(Message::Text(text)) => return Some(TransportFrame::Text(text.to_string())),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(TransportFrame::Closed { code, reason });
                }
                // Ping and pong are answered below this layer; binary frames
                // are not part of the wire format.
                Ok(_) => continue,
                Err(e) => {
                    return Some(TransportFrame::Closed {
                        code: None,
                        reason: e.to_string(),
                    });
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
