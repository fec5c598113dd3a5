use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use fable_core::envelope::{
    system_event, AiResponsePayload, Envelope, ErrorPayload, EventKind, HeartbeatPayload,
    StreamChunkPayload, StreamEndPayload, StreamOutcome, StreamStartPayload, SystemPayload,
};
use fable_core::errors::{PolicyError, ProtocolError};
use fable_core::history::{Author, HistoryStore, TranscriptMessage};
use fable_core::ids::{MessageId, SessionId, StreamId};

use crate::assembler::{ChunkOutcome, StreamAssembler};
use crate::config::ClientConfig;
use crate::events::ClientEvent;
use crate::outbox::Outbox;
use crate::status::{ConnectionState, ConnectionStatus};
use crate::transport::{Connector, Transport, TransportError, TransportFrame};

/// Cadence of the outbox sweep while connected.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

enum Command {
    Connect,
    Disconnect,
    Send { message_id: MessageId, text: String },
    CancelStream(StreamId),
    PauseStream(StreamId),
    ResumeStream(StreamId),
    Shutdown,
}

/// Why a connected channel ended.
enum ChannelEnd {
    /// Caller asked for a clean teardown to idle.
    Disconnected,
    /// Channel dropped; `code` is the server's close code when it sent one.
    Closed { code: Option<u16>, reason: String },
    Shutdown,
}

/// Handle to a running connection manager. Cloneable; every method is
/// non-blocking and safe from any task.
#[derive(Clone)]
pub struct ClientHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl ClientHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Tear down to idle. Pending turns stay queued for the next connect.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Queue a user turn. The returned id names the turn in later events
    /// and in the transcript, whether or not the channel is up right now.
    pub fn send_message(&self, text: impl Into<String>) -> MessageId {
        let message_id = MessageId::new();
        let _ = self.commands.send(Command::Send {
            message_id: message_id.clone(),
            text: text.into(),
        });
        message_id
    }

    pub fn cancel_stream(&self, stream_id: &StreamId) {
        let _ = self.commands.send(Command::CancelStream(stream_id.clone()));
    }

    pub fn pause_stream(&self, stream_id: &StreamId) {
        let _ = self.commands.send(Command::PauseStream(stream_id.clone()));
    }

    pub fn resume_stream(&self, stream_id: &StreamId) {
        let _ = self.commands.send(Command::ResumeStream(stream_id.clone()));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Stop the manager task. Dropping every handle has the same effect.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

/// Owns one dialogue channel end to end: connects, reconnects with backoff,
/// keeps the heartbeat, flushes the outbox, and assembles inbound streams.
pub struct ConnectionManager;

impl ConnectionManager {
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        history: Arc<dyn HistoryStore>,
    ) -> ClientHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);
        let status = Arc::new(RwLock::new(ConnectionStatus::default()));
        let handle = ClientHandle {
            session_id: config.session_id.clone(),
            commands: commands_tx,
            events: events.clone(),
            status: Arc::clone(&status),
        };
        let task = ManagerTask {
            outbox: Outbox::new(config.send_retry_limit),
            assembler: StreamAssembler::new(config.paused_buffer_limit),
            config,
            connector,
            history,
            commands: commands_rx,
            events,
            status,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            retry_at: None,
            next_outbound_seq: 1,
            last_inbound_seq: 0,
            resynced_this_channel: false,
            last_ping: None,
            unanswered_since: None,
        };
        tokio::spawn(task.run());
        handle
    }
}

struct ManagerTask {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    history: Arc<dyn HistoryStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<ClientEvent>,
    status: Arc<RwLock<ConnectionStatus>>,
    outbox: Outbox,
    assembler: StreamAssembler,
    state: ConnectionState,
    /// Failed connect attempts in the current outage.
    reconnect_attempt: u32,
    retry_at: Option<Instant>,
    next_outbound_seq: u64,
    last_inbound_seq: u64,
    resynced_this_channel: bool,
    /// Nonce and send time of the latest ping, for round-trip measurement.
    last_ping: Option<(u64, Instant)>,
    /// First ping since the last pong. Set means the server owes us one.
    unanswered_since: Option<Instant>,
}

impl ManagerTask {
    async fn run(mut self) {
        loop {
            match self.state {
                ConnectionState::Connecting => {
                    if !self.connect_cycle().await {
                        break;
                    }
                }
                ConnectionState::Reconnecting => {
                    if !self.backoff_cycle().await {
                        break;
                    }
                }
                _ => match self.commands.recv().await {
                    None => break,
                    Some(command) => {
                        if !self.handle_command_offline(command).await {
                            break;
                        }
                    }
                },
            }
        }
        debug!(session_id = %self.config.session_id, "connection manager stopped");
    }

    /// One connect attempt, and the whole life of the channel if it lands.
    /// False means shutdown.
    async fn connect_cycle(&mut self) -> bool {
        let url = self.config.channel_url();
        let connector = Arc::clone(&self.connector);
        let attempt = time::timeout(self.config.connect_timeout, async move {
            connector.connect(&url).await
        });
        tokio::pin!(attempt);
        loop {
            tokio::select! {
                result = &mut attempt => {
                    let result = match result {
                        Ok(inner) => inner,
                        Err(_) => Err(TransportError::Connect("handshake timed out".into())),
                    };
                    return match result {
                        Ok(transport) => {
                            self.on_connected().await;
                            let end = self.run_channel(transport).await;
                            self.after_channel(end)
                        }
                        Err(error) => {
                            self.on_connect_failed(&error);
                            true
                        }
                    };
                }
                maybe = self.commands.recv() => match maybe {
                    None => return false,
                    Some(Command::Shutdown) => return false,
                    Some(Command::Disconnect) => {
                        self.reset_attempts();
                        self.set_state(ConnectionState::Idle);
                        return true;
                    }
                    Some(Command::Connect) => {}
                    Some(other) => self.handle_command_anytime(other).await,
                },
            }
        }
    }

    /// Wait out the backoff delay, still serving commands. False means
    /// shutdown.
    async fn backoff_cycle(&mut self) -> bool {
        let deadline = self.retry_at.take().unwrap_or_else(Instant::now);
        loop {
            tokio::select! {
                _ = time::sleep_until(deadline) => {
                    self.set_state(ConnectionState::Connecting);
                    return true;
                }
                maybe = self.commands.recv() => match maybe {
                    None => return false,
                    Some(Command::Shutdown) => return false,
                    Some(Command::Disconnect) => {
                        self.reset_attempts();
                        self.set_state(ConnectionState::Idle);
                        return true;
                    }
                    Some(Command::Connect) => {
                        // Impatient caller: retry now.
                        self.set_state(ConnectionState::Connecting);
                        return true;
                    }
                    Some(other) => self.handle_command_anytime(other).await,
                },
            }
        }
    }

    async fn run_channel(&mut self, mut transport: Box<dyn Transport>) -> ChannelEnd {
        // Everything unacknowledged goes out again, in enqueue order.
        if let Some(end) = self.flush_outbox(transport.as_mut(), Duration::ZERO).await {
            return end;
        }
        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick
        let mut flush = time::interval(FLUSH_INTERVAL);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.commands.recv() => {
                    let Some(command) = maybe else { return ChannelEnd::Shutdown };
                    if let Some(end) = self.command_on_channel(command, transport.as_mut()).await {
                        return end;
                    }
                }
                maybe = transport.next_frame() => match maybe {
                    Some(TransportFrame::Text(text)) => {
                        if let Some(end) = self.on_text(text, transport.as_mut()).await {
                            return end;
                        }
                    }
                    Some(TransportFrame::Closed { code, reason }) => {
                        return ChannelEnd::Closed { code, reason };
                    }
                    None => {
                        return ChannelEnd::Closed { code: None, reason: "connection lost".into() };
                    }
                },
                _ = heartbeat.tick() => {
                    if let Some(end) = self.heartbeat_tick(transport.as_mut()).await {
                        return end;
                    }
                }
                _ = flush.tick() => {
                    if let Some(end) = self
                        .flush_outbox(transport.as_mut(), self.config.ack_timeout)
                        .await
                    {
                        return end;
                    }
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        info!(session_id = %self.config.session_id, "channel connected");
        self.reconnect_attempt = 0;
        self.retry_at = None;
        self.next_outbound_seq = 1;
        self.last_inbound_seq = 0;
        self.resynced_this_channel = false;
        self.last_ping = None;
        self.unanswered_since = None;
        self.status.write().reconnect_attempts = 0;
        self.set_state(ConnectionState::Connected);
        self.emit(ClientEvent::Open);

        let resumed = self.assembler.resume_all();
        for (stream_id, replay) in resumed {
            for (seq, text) in replay.replayed {
                self.emit(ClientEvent::StreamChunk {
                    stream_id: stream_id.clone(),
                    seq,
                    text,
                });
            }
            if replay.needs_refetch {
                self.refetch_stream(&stream_id).await;
            }
        }
    }

    fn on_connect_failed(&mut self, error: &TransportError) {
        self.reconnect_attempt += 1;
        warn!(
            attempt = self.reconnect_attempt,
            error = %error,
            "connect attempt failed"
        );
        {
            let mut status = self.status.write();
            status.reconnect_attempts = self.reconnect_attempt;
            status.push_error(error.to_string());
        }
        self.set_state(ConnectionState::Error);
        if self.reconnect_attempt >= self.config.reconnect.max_attempts {
            self.emit(ClientEvent::Error {
                code: "reconnect_exhausted".into(),
                message: format!("gave up after {} connect attempts", self.reconnect_attempt),
                message_id: None,
            });
            self.set_state(ConnectionState::Disconnected);
        } else {
            let delay = self.config.reconnect.delay_for(self.reconnect_attempt - 1);
            self.retry_at = Some(Instant::now() + delay);
            self.set_state(ConnectionState::Reconnecting);
        }
    }

    /// Route the channel's end to the next lifecycle state. False means
    /// shutdown.
    fn after_channel(&mut self, end: ChannelEnd) -> bool {
        self.assembler.pause_all();
        self.status.write().mark_latency_stale();
        match end {
            ChannelEnd::Shutdown => false,
            ChannelEnd::Disconnected => {
                self.emit(ClientEvent::Close {
                    code: None,
                    reason: "disconnected".into(),
                });
                self.reset_attempts();
                self.set_state(ConnectionState::Idle);
                true
            }
            ChannelEnd::Closed { code, reason } => {
                self.emit(ClientEvent::Close {
                    code,
                    reason: reason.clone(),
                });
                if let Some(policy) = code.and_then(PolicyError::from_close_code) {
                    info!(code = ?code, "channel closed by session policy; staying down");
                    self.emit(ClientEvent::Error {
                        code: policy.error_code().into(),
                        message: policy.to_string(),
                        message_id: None,
                    });
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    warn!(code = ?code, reason = %reason, "channel lost; will reconnect");
                    self.status.write().push_error(if reason.is_empty() {
                        "connection lost".into()
                    } else {
                        reason
                    });
                    self.retry_at = Some(Instant::now() + self.config.reconnect.delay_for(0));
                    self.set_state(ConnectionState::Reconnecting);
                }
                true
            }
        }
    }

    async fn command_on_channel(
        &mut self,
        command: Command,
        transport: &mut dyn Transport,
    ) -> Option<ChannelEnd> {
        match command {
            Command::Connect => None,
            Command::Disconnect => {
                transport.close().await;
                Some(ChannelEnd::Disconnected)
            }
            Command::Shutdown => {
                transport.close().await;
                Some(ChannelEnd::Shutdown)
            }
            Command::Send { message_id, text } => {
                self.outbox.enqueue(message_id, text);
                self.flush_outbox(transport, self.config.ack_timeout).await
            }
            Command::CancelStream(stream_id) => {
                let Some(content) = self.assembler.cancel(&stream_id) else {
                    debug!(stream_id = %stream_id, "cancel for unknown or finished stream");
                    return None;
                };
                let envelope =
                    Envelope::cancel_stream(self.config.session_id.clone(), stream_id.clone())
                        .with_sequence(self.next_seq());
                let end = self.send_envelope(transport, &envelope).await;
                self.emit(ClientEvent::StreamEnd {
                    stream_id,
                    outcome: StreamOutcome::Cancelled,
                    content,
                });
                end
            }
            Command::PauseStream(stream_id) => {
                self.assembler.pause(&stream_id);
                None
            }
            Command::ResumeStream(stream_id) => {
                self.resume_stream(stream_id).await;
                None
            }
        }
    }

    /// Commands that work without a live channel.
    async fn handle_command_anytime(&mut self, command: Command) {
        match command {
            Command::Send { message_id, text } => {
                self.outbox.enqueue(message_id, text);
            }
            Command::CancelStream(stream_id) => {
                if let Some(content) = self.assembler.cancel(&stream_id) {
                    self.emit(ClientEvent::StreamEnd {
                        stream_id,
                        outcome: StreamOutcome::Cancelled,
                        content,
                    });
                }
            }
            Command::PauseStream(stream_id) => {
                self.assembler.pause(&stream_id);
            }
            Command::ResumeStream(stream_id) => {
                self.resume_stream(stream_id).await;
            }
            Command::Connect | Command::Disconnect | Command::Shutdown => {}
        }
    }

    /// Resting-state command handling. False means shutdown.
    async fn handle_command_offline(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => {
                self.reset_attempts();
                self.set_state(ConnectionState::Connecting);
            }
            Command::Disconnect => {
                self.set_state(ConnectionState::Idle);
            }
            Command::Shutdown => return false,
            other => self.handle_command_anytime(other).await,
        }
        true
    }

    async fn resume_stream(&mut self, stream_id: StreamId) {
        let Some(replay) = self.assembler.resume(&stream_id) else {
            return;
        };
        for (seq, text) in replay.replayed {
            self.emit(ClientEvent::StreamChunk {
                stream_id: stream_id.clone(),
                seq,
                text,
            });
        }
        if replay.needs_refetch {
            self.refetch_stream(&stream_id).await;
        }
    }

    async fn on_text(&mut self, text: String, transport: &mut dyn Transport) -> Option<ChannelEnd> {
        self.status.write().record_received(text.len());
        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "discarding undecodable frame");
                self.status.write().push_error(e.to_string());
                return None;
            }
        };
        if envelope.session_id != self.config.session_id {
            warn!(got = %envelope.session_id, "envelope for foreign session discarded");
            return None;
        }
        self.track_inbound_sequence(&envelope).await;
        self.dispatch(envelope, transport).await
    }

    async fn track_inbound_sequence(&mut self, envelope: &Envelope) {
        let seq = envelope.sequence;
        if seq == 0 {
            return;
        }
        let expected = self.last_inbound_seq + 1;
        if seq < expected {
            debug!(seq, expected, "replayed envelope sequence");
            return;
        }
        if seq > expected {
            let gap = ProtocolError::SequenceGap { expected, got: seq };
            warn!(seq, expected, "inbound sequence gap");
            self.status.write().push_error(gap.to_string());
            if gap.needs_resync() && !self.resynced_this_channel {
                self.resynced_this_channel = true;
                let messages = self.history.transcript(&self.config.session_id).await;
                self.emit(ClientEvent::Resync { messages });
            }
        }
        self.last_inbound_seq = seq;
    }

    async fn dispatch(
        &mut self,
        envelope: Envelope,
        transport: &mut dyn Transport,
    ) -> Option<ChannelEnd> {
        match envelope.kind {
            EventKind::AiResponse => {
                self.on_ai_response(envelope);
                None
            }
            EventKind::StreamStart => {
                self.on_stream_start(envelope);
                None
            }
            EventKind::StreamChunk => {
                self.on_stream_chunk(envelope).await;
                None
            }
            EventKind::StreamEnd => {
                self.on_stream_end(envelope);
                None
            }
            EventKind::Typing => {
                self.emit(ClientEvent::Typing);
                None
            }
            EventKind::HeartbeatPing => self.on_server_ping(envelope, transport).await,
            EventKind::HeartbeatPong => {
                self.on_pong(&envelope);
                None
            }
            EventKind::Error => {
                self.on_error_envelope(envelope);
                None
            }
            EventKind::System => {
                self.on_system(&envelope);
                None
            }
            EventKind::UserMessage | EventKind::Unknown => {
                debug!(kind = %envelope.kind, "ignoring envelope kind");
                None
            }
        }
    }

    fn on_ai_response(&mut self, envelope: Envelope) {
        let Ok(payload) = envelope.payload_as::<AiResponsePayload>() else {
            debug!("ai_response with unusable payload");
            return;
        };
        let Some(message_id) = envelope.message_id else {
            debug!("ai_response without message_id");
            return;
        };
        // This full copy supersedes whatever the stream assembled, holes
        // included. Consumers take it as the transcript truth.
        let message = TranscriptMessage {
            message_id,
            session_id: envelope.session_id,
            author: Author::Persona,
            text: payload.text,
            created_at: envelope.timestamp,
        };
        self.emit(ClientEvent::Message { message });
    }

    fn on_stream_start(&mut self, envelope: Envelope) {
        let (Some(stream_id), Some(message_id)) =
            (envelope.stream_id.clone(), envelope.message_id.clone())
        else {
            debug!("stream_start missing stream_id or message_id");
            return;
        };
        let Ok(payload) = envelope.payload_as::<StreamStartPayload>() else {
            debug!(stream_id = %stream_id, "stream_start with unusable payload");
            return;
        };
        if self
            .assembler
            .on_start(stream_id.clone(), message_id.clone(), payload.replies_to.clone())
        {
            self.emit(ClientEvent::StreamStart {
                stream_id,
                message_id,
                replies_to: payload.replies_to,
            });
        }
    }

    async fn on_stream_chunk(&mut self, envelope: Envelope) {
        let Some(stream_id) = envelope.stream_id.clone() else {
            return;
        };
        let Ok(payload) = envelope.payload_as::<StreamChunkPayload>() else {
            debug!(stream_id = %stream_id, "stream_chunk with unusable payload");
            return;
        };
        match self.assembler.on_chunk(&stream_id, payload.seq, &payload.text) {
            ChunkOutcome::Applied => {
                self.emit(ClientEvent::StreamChunk {
                    stream_id,
                    seq: payload.seq,
                    text: payload.text,
                });
            }
            ChunkOutcome::Gap { expected, refetch } => {
                warn!(
                    stream_id = %stream_id,
                    expected,
                    got = payload.seq,
                    "chunk gap; content degraded"
                );
                self.emit(ClientEvent::StreamChunk {
                    stream_id: stream_id.clone(),
                    seq: payload.seq,
                    text: payload.text,
                });
                if refetch {
                    self.refetch_stream(&stream_id).await;
                }
            }
            ChunkOutcome::Duplicate => {
                debug!(stream_id = %stream_id, seq = payload.seq, "duplicate chunk dropped");
            }
            ChunkOutcome::Buffered { dropped_oldest } => {
                if dropped_oldest {
                    debug!(stream_id = %stream_id, "paused buffer full, oldest chunk shed");
                }
            }
            ChunkOutcome::Ignored => {
                debug!(stream_id = %stream_id, "chunk for unknown or finished stream");
            }
        }
    }

    fn on_stream_end(&mut self, envelope: Envelope) {
        let Some(stream_id) = envelope.stream_id.clone() else {
            return;
        };
        let Ok(payload) = envelope.payload_as::<StreamEndPayload>() else {
            debug!(stream_id = %stream_id, "stream_end with unusable payload");
            return;
        };
        if let Some(finished) = self.assembler.on_end(&stream_id, payload.outcome) {
            if finished.degraded {
                debug!(stream_id = %stream_id, "stream finished with missing chunks");
            }
            self.emit(ClientEvent::StreamEnd {
                stream_id,
                outcome: finished.outcome,
                content: finished.content,
            });
        }
    }

    /// One-shot recovery for a stream with a hole: take the full message
    /// from history if it is already there.
    async fn refetch_stream(&mut self, stream_id: &StreamId) {
        let Some(message_id) = self
            .assembler
            .get(stream_id)
            .map(|state| state.message_id.clone())
        else {
            return;
        };
        match self
            .history
            .message(&self.config.session_id, &message_id)
            .await
        {
            Some(message) => {
                if self.assembler.adopt_completed(stream_id, &message.text) {
                    debug!(stream_id = %stream_id, "degraded stream replaced from history");
                    self.emit(ClientEvent::StreamEnd {
                        stream_id: stream_id.clone(),
                        outcome: StreamOutcome::Complete,
                        content: message.text,
                    });
                }
            }
            None => {
                debug!(stream_id = %stream_id, "history refetch missed; waiting for full message");
            }
        }
    }

    async fn on_server_ping(
        &mut self,
        envelope: Envelope,
        transport: &mut dyn Transport,
    ) -> Option<ChannelEnd> {
        let Ok(payload) = envelope.payload_as::<HeartbeatPayload>() else {
            return None;
        };
        let pong = Envelope::heartbeat_pong(
            self.config.session_id.clone(),
            payload.nonce,
            payload.sent_at_ms,
        )
        .with_sequence(self.next_seq());
        self.send_envelope(transport, &pong).await
    }

    fn on_pong(&mut self, envelope: &Envelope) {
        if let Ok(payload) = envelope.payload_as::<HeartbeatPayload>() {
            if let Some((nonce, sent_at)) = self.last_ping {
                if payload.nonce == nonce {
                    self.status.write().record_latency(sent_at.elapsed());
                }
            }
        }
        self.unanswered_since = None;
    }

    fn on_error_envelope(&mut self, envelope: Envelope) {
        let Ok(payload) = envelope.payload_as::<ErrorPayload>() else {
            debug!("error envelope with unusable payload");
            return;
        };
        warn!(code = %payload.code, message = %payload.message, "server reported an error");
        self.status
            .write()
            .push_error(format!("{}: {}", payload.code, payload.message));
        if let Some(message_id) = &payload.message_id {
            // The turn failed for good server-side; retrying it would only
            // repeat the failure.
            self.outbox.ack(message_id);
        }
        self.emit(ClientEvent::Error {
            code: payload.code,
            message: payload.message,
            message_id: payload.message_id,
        });
    }

    fn on_system(&mut self, envelope: &Envelope) {
        let Ok(payload) = envelope.payload_as::<SystemPayload>() else {
            return;
        };
        match payload.event.as_str() {
            system_event::TURN_ACCEPTED => {
                if let Some(message_id) = &payload.message_id {
                    if self.outbox.ack(message_id) {
                        debug!(message_id = %message_id, "turn acknowledged");
                    }
                }
            }
            other => debug!(event = other, "ignoring system event"),
        }
    }

    async fn heartbeat_tick(&mut self, transport: &mut dyn Transport) -> Option<ChannelEnd> {
        if let Some(since) = self.unanswered_since {
            if since.elapsed() >= self.config.heartbeat_timeout {
                warn!("heartbeat starved; dropping channel");
                return Some(ChannelEnd::Closed {
                    code: None,
                    reason: "heartbeat timeout".into(),
                });
            }
        }
        let nonce = rand::random::<u64>();
        let now = Instant::now();
        let envelope = Envelope::heartbeat_ping(
            self.config.session_id.clone(),
            nonce,
            chrono::Utc::now().timestamp_millis(),
        )
        .with_sequence(self.next_seq());
        self.last_ping = Some((nonce, now));
        self.unanswered_since.get_or_insert(now);
        self.send_envelope(transport, &envelope).await
    }

    async fn flush_outbox(
        &mut self,
        transport: &mut dyn Transport,
        ack_timeout: Duration,
    ) -> Option<ChannelEnd> {
        let due = self.outbox.collect_due(Instant::now(), ack_timeout);
        for message_id in due.failed {
            warn!(message_id = %message_id, "turn dropped after retry budget");
            self.status
                .write()
                .push_error(format!("turn {message_id} dropped after retry budget"));
            self.emit(ClientEvent::SendFailed {
                message_id,
                reason: "retry budget exhausted".into(),
            });
        }
        for (message_id, text) in due.to_send {
            let envelope =
                Envelope::user_message(self.config.session_id.clone(), message_id, &text)
                    .with_sequence(self.next_seq());
            if let Some(end) = self.send_envelope(transport, &envelope).await {
                return Some(end);
            }
        }
        None
    }

    async fn send_envelope(
        &mut self,
        transport: &mut dyn Transport,
        envelope: &Envelope,
    ) -> Option<ChannelEnd> {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "envelope failed to encode");
                return None;
            }
        };
        let bytes = text.len();
        match transport.send_text(text).await {
            Ok(()) => {
                self.status.write().record_sent(bytes);
                None
            }
            Err(e) => {
                warn!(error = %e, "send failed; dropping channel");
                Some(ChannelEnd::Closed {
                    code: None,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_outbound_seq;
        self.next_outbound_seq += 1;
        seq
    }

    fn reset_attempts(&mut self) {
        self.reconnect_attempt = 0;
        self.retry_at = None;
        self.status.write().reconnect_attempts = 0;
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "connection state change");
        self.state = next;
        self.status.write().state = next;
        self.emit(ClientEvent::StatusChange { state: next });
    }

    fn emit(&self, event: ClientEvent) {
        // Err only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }
}
