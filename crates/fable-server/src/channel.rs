use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use fable_core::envelope::{Envelope, EventKind, HeartbeatPayload};
use fable_core::errors::PolicyError;
use fable_core::ids::{ChannelId, SessionId};

use crate::binder::{BindOutcome, ChannelHandle, SessionBinder};
use crate::turns::TurnPipeline;

/// What the binder and turn pipeline hand a channel worker to write out.
#[derive(Debug)]
pub enum Outbound {
    Event(Envelope),
    Close { code: u16, reason: String },
}

/// Per-channel knobs carved out of the server config.
#[derive(Clone, Copy, Debug)]
pub struct ChannelSettings {
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Inbound silence tolerated before the channel is dropped.
    pub liveness_timeout: Duration,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Bind the session and run the channel until either side closes. Under the
/// Reject policy a bind lost to a race is closed here with `already_bound`;
/// the pre-upgrade check catches the common case.
pub async fn serve_channel(
    mut socket: WebSocket,
    session_id: SessionId,
    binder: Arc<SessionBinder>,
    turns: Arc<TurnPipeline>,
    settings: ChannelSettings,
) {
    let channel_id = ChannelId::new();
    let (outbound_tx, mut outbound) = mpsc::channel(settings.queue_capacity);

    match binder.bind(&session_id, ChannelHandle::new(channel_id.clone(), outbound_tx.clone())) {
        BindOutcome::Rejected => {
            info!(session_id = %session_id, channel_id = %channel_id, "session already bound, refusing channel");
            let _ = socket
                .send(WsMessage::Close(Some(CloseFrame {
                    code: PolicyError::AlreadyBound.close_code(),
                    reason: PolicyError::AlreadyBound.error_code().into(),
                })))
                .await;
            return;
        }
        BindOutcome::Displaced(old) => {
            info!(session_id = %session_id, channel_id = %channel_id, displaced = %old, "channel bound, previous one displaced");
        }
        BindOutcome::Bound => {
            info!(session_id = %session_id, channel_id = %channel_id, "channel bound");
        }
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let last_seen = Arc::new(AtomicI64::new(now_ms()));

    // Writer: owns the send half and the per-channel outbound sequence,
    // stamped here so it restarts at 1 for every channel. Also drives the
    // server-side heartbeat and the liveness check.
    let writer_session = session_id.clone();
    let writer_channel = channel_id.clone();
    let writer_seen = Arc::clone(&last_seen);
    let mut writer = tokio::spawn(async move {
        let mut sequence: u64 = 0;
        let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
        heartbeat.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                item = outbound.recv() => match item {
                    Some(Outbound::Event(envelope)) => {
                        sequence += 1;
                        let stamped = envelope.with_sequence(sequence);
                        match stamped.encode() {
                            Ok(text) => {
                                if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(channel_id = %writer_channel, error = %e, "failed to encode envelope, skipping");
                            }
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        debug!(channel_id = %writer_channel, code, reason = %reason, "closing channel");
                        let _ = ws_tx
                            .send(WsMessage::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let idle = now_ms().saturating_sub(writer_seen.load(Ordering::Relaxed));
                    if idle > settings.liveness_timeout.as_millis() as i64 {
                        info!(channel_id = %writer_channel, session_id = %writer_session, idle_ms = idle, "channel silent too long, dropping");
                        break;
                    }
                    sequence += 1;
                    let ping = Envelope::heartbeat_ping(writer_session.clone(), rand::random(), now_ms())
                        .with_sequence(sequence);
                    if let Ok(text) = ping.encode() {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    // Reader: decodes, validates session and inbound sequence, then
    // dispatches. Any valid traffic counts as liveness.
    let reader_session = session_id.clone();
    let reader_channel = channel_id.clone();
    let reader_seen = Arc::clone(&last_seen);
    let mut reader = tokio::spawn(async move {
        let mut expected_seq: u64 = 1;
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(WsMessage::Text(text)) => {
                    let envelope = match Envelope::decode(text.as_str()) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            debug!(channel_id = %reader_channel, error = %e, "undecodable frame, ignoring");
                            continue;
                        }
                    };
                    if envelope.session_id != reader_session {
                        warn!(channel_id = %reader_channel, got = %envelope.session_id, "envelope for another session, ignoring");
                        continue;
                    }
                    reader_seen.store(now_ms(), Ordering::Relaxed);
                    if envelope.sequence > 0 {
                        if envelope.sequence > expected_seq {
                            warn!(
                                channel_id = %reader_channel,
                                expected = expected_seq,
                                got = envelope.sequence,
                                "inbound sequence gap"
                            );
                            expected_seq = envelope.sequence + 1;
                        } else if envelope.sequence < expected_seq {
                            debug!(channel_id = %reader_channel, got = envelope.sequence, "stale sequence, ignoring frame");
                            continue;
                        } else {
                            expected_seq += 1;
                        }
                    }
                    match envelope.kind {
                        EventKind::UserMessage => turns.user_turn(envelope).await,
                        EventKind::System => turns.handle_system(&envelope),
                        EventKind::HeartbeatPing => {
                            if let Ok(p) = envelope.payload_as::<HeartbeatPayload>() {
                                let pong = Envelope::heartbeat_pong(reader_session.clone(), p.nonce, p.sent_at_ms);
                                if outbound_tx.try_send(Outbound::Event(pong)).is_err() {
                                    debug!(channel_id = %reader_channel, "pong dropped, queue full");
                                }
                            }
                        }
                        // Pongs count as liveness above; nothing else to do.
                        EventKind::HeartbeatPong => {}
                        other => {
                            debug!(channel_id = %reader_channel, kind = %other, "unexpected inbound kind, ignoring");
                        }
                    }
                }
                Ok(WsMessage::Close(_)) => {
                    debug!(channel_id = %reader_channel, "client closed the channel");
                    break;
                }
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                    reader_seen.store(now_ms(), Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(channel_id = %reader_channel, error = %e, "socket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    binder.unbind(&session_id, &channel_id);
    info!(session_id = %session_id, channel_id = %channel_id, "channel closed");
}
