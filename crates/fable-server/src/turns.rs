use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fable_core::directory::SessionDirectory;
use fable_core::envelope::{error_code, system_event, Envelope, StreamOutcome, SystemPayload, UserMessagePayload};
use fable_core::errors::GenerateError;
use fable_core::generate::{ReplyEvent, ReplyGenerator, TurnRequest};
use fable_core::history::{Author, HistoryStore, TranscriptMessage};
use fable_core::ids::{MessageId, SessionId, StreamId};

use crate::binder::SessionBinder;

struct ActiveReply {
    stream_id: StreamId,
    cancel: CancellationToken,
}

/// Turn pipeline: dedup, acknowledgement, transcript append, then a spawned
/// generation task that streams the reply back through whichever channel
/// currently holds the session. One reply at a time per session.
pub struct TurnPipeline {
    generator: Arc<dyn ReplyGenerator>,
    history: Arc<dyn HistoryStore>,
    directory: Arc<dyn SessionDirectory>,
    binder: Arc<SessionBinder>,
    active: Arc<DashMap<SessionId, ActiveReply>>,
}

impl TurnPipeline {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        history: Arc<dyn HistoryStore>,
        directory: Arc<dyn SessionDirectory>,
        binder: Arc<SessionBinder>,
    ) -> Self {
        Self {
            generator,
            history,
            directory,
            binder,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn has_active_reply(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    /// Process an inbound `user_message` envelope. Retransmits are
    /// re-acknowledged without re-forwarding; a turn that lands while a
    /// reply is still streaming is refused with `reply_in_progress`.
    pub async fn user_turn(&self, envelope: Envelope) {
        let session_id = envelope.session_id.clone();
        let Some(message_id) = envelope.message_id.clone() else {
            debug!(session_id = %session_id, "user_message without message_id, dropping");
            return;
        };
        let payload: UserMessagePayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "bad user_message payload, dropping");
                return;
            }
        };

        if self.binder.is_recent_turn(&session_id, &message_id) {
            debug!(session_id = %session_id, message_id = %message_id, "duplicate turn, re-acking");
            self.binder
                .send(&session_id, Envelope::turn_accepted(session_id.clone(), message_id));
            return;
        }

        if self.active.contains_key(&session_id) {
            warn!(session_id = %session_id, message_id = %message_id, "turn while a reply is streaming, refusing");
            self.binder.send(
                &session_id,
                Envelope::error(
                    session_id.clone(),
                    error_code::REPLY_IN_PROGRESS,
                    "a reply is already streaming for this session",
                    Some(message_id),
                ),
            );
            return;
        }

        self.binder.note_turn(&session_id, &message_id);
        self.binder
            .send(&session_id, Envelope::turn_accepted(session_id.clone(), message_id.clone()));
        self.history
            .record(TranscriptMessage::new(
                session_id.clone(),
                message_id.clone(),
                Author::User,
                payload.text.clone(),
            ))
            .await;
        self.binder
            .send(&session_id, Envelope::typing(session_id.clone(), true));

        let Some(record) = self.directory.lookup(&session_id).await else {
            let error = GenerateError::InvalidTurn("session not in the directory".into());
            warn!(session_id = %session_id, "turn for an unknown session");
            self.binder.send(
                &session_id,
                Envelope::error(session_id.clone(), error.error_kind(), &error.to_string(), Some(message_id)),
            );
            return;
        };

        let turn = TurnRequest {
            session_id: session_id.clone(),
            message_id,
            persona: record.persona,
            text: payload.text,
            history: self.history.transcript(&session_id).await,
        };

        let stream_id = StreamId::new();
        let cancel = CancellationToken::new();
        self.active.insert(
            session_id,
            ActiveReply {
                stream_id: stream_id.clone(),
                cancel: cancel.clone(),
            },
        );

        let generator = Arc::clone(&self.generator);
        let binder = Arc::clone(&self.binder);
        let history = Arc::clone(&self.history);
        let active = Arc::clone(&self.active);
        tokio::spawn(run_reply(generator, binder, history, active, turn, stream_id, cancel));
    }

    /// Process an inbound `system` envelope. Only `cancel_stream` means
    /// anything to the server today.
    pub fn handle_system(&self, envelope: &Envelope) {
        let session_id = &envelope.session_id;
        let payload: SystemPayload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "bad system payload, dropping");
                return;
            }
        };
        match payload.event.as_str() {
            system_event::CANCEL_STREAM => {
                let Some(stream_id) = payload.stream_id else {
                    debug!(session_id = %session_id, "cancel_stream without stream_id, dropping");
                    return;
                };
                self.cancel_reply(session_id, &stream_id);
            }
            other => {
                debug!(session_id = %session_id, event = other, "unhandled system event");
            }
        }
    }

    /// Cancel the in-flight reply if `stream_id` names it. The generation
    /// task observes the token on its next poll and emits
    /// `stream_end { cancelled }`.
    pub fn cancel_reply(&self, session_id: &SessionId, stream_id: &StreamId) -> bool {
        let Some(entry) = self.active.get(session_id) else {
            debug!(session_id = %session_id, "cancel for an idle session, ignoring");
            return false;
        };
        if &entry.stream_id != stream_id {
            debug!(
                session_id = %session_id,
                stream_id = %stream_id,
                active = %entry.stream_id,
                "cancel names a stream that is not running, ignoring"
            );
            return false;
        }
        entry.cancel.cancel();
        true
    }
}

/// One reply generation, from generator call to terminal envelope. Emits
/// through the binder so a mid-reply rebind reroutes the remaining chunks to
/// the new channel; if the session is unbound the sends drop and the
/// transcript stays the source of truth.
async fn run_reply(
    generator: Arc<dyn ReplyGenerator>,
    binder: Arc<SessionBinder>,
    history: Arc<dyn HistoryStore>,
    active: Arc<DashMap<SessionId, ActiveReply>>,
    turn: TurnRequest,
    stream_id: StreamId,
    cancel: CancellationToken,
) {
    let session_id = turn.session_id.clone();

    let mut stream = match generator.generate(&turn).await {
        Ok(stream) => stream,
        Err(e) => {
            active.remove(&session_id);
            warn!(session_id = %session_id, error = %e, kind = e.error_kind(), "generation refused");
            binder.send(
                &session_id,
                Envelope::error(
                    session_id.clone(),
                    e.error_kind(),
                    &e.to_string(),
                    Some(turn.message_id.clone()),
                ),
            );
            return;
        }
    };

    // The reply's message id rides on stream_start so the client can tie
    // chunks, the final ai_response, and any history refetch together.
    let reply_id = MessageId::new();
    let mut start = Envelope::stream_start(session_id.clone(), stream_id.clone(), &turn.message_id);
    start.message_id = Some(reply_id.clone());
    binder.send(&session_id, start);

    // Chunk ordinals are owned here, not by the channel, so they keep
    // counting up across rebinds and the client can spot holes.
    let mut chunk_seq: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                active.remove(&session_id);
                info!(session_id = %session_id, stream_id = %stream_id, chunks = chunk_seq, "reply cancelled");
                binder.send(
                    &session_id,
                    Envelope::stream_end(session_id.clone(), stream_id.clone(), StreamOutcome::Cancelled, chunk_seq),
                );
                return;
            }
            event = stream.next() => match event {
                Some(ReplyEvent::Start) => {}
                Some(ReplyEvent::Delta { text }) => {
                    chunk_seq += 1;
                    binder.send(
                        &session_id,
                        Envelope::stream_chunk(session_id.clone(), stream_id.clone(), chunk_seq, &text),
                    );
                }
                Some(ReplyEvent::Done { full_text }) => {
                    active.remove(&session_id);
                    history
                        .record(TranscriptMessage::new(
                            session_id.clone(),
                            reply_id.clone(),
                            Author::Persona,
                            full_text.clone(),
                        ))
                        .await;
                    binder.send(
                        &session_id,
                        Envelope::stream_end(session_id.clone(), stream_id.clone(), StreamOutcome::Complete, chunk_seq),
                    );
                    binder.send(
                        &session_id,
                        Envelope::ai_response(session_id.clone(), reply_id.clone(), &full_text),
                    );
                    info!(session_id = %session_id, stream_id = %stream_id, chunks = chunk_seq, "reply complete");
                    return;
                }
                Some(ReplyEvent::Error { error }) => {
                    active.remove(&session_id);
                    warn!(session_id = %session_id, stream_id = %stream_id, error = %error, kind = error.error_kind(), "generation failed mid-stream");
                    binder.send(
                        &session_id,
                        Envelope::stream_end(session_id.clone(), stream_id.clone(), StreamOutcome::Error, chunk_seq),
                    );
                    binder.send(
                        &session_id,
                        Envelope::error(
                            session_id.clone(),
                            error.error_kind(),
                            &error.to_string(),
                            Some(turn.message_id.clone()),
                        ),
                    );
                    return;
                }
                None => {
                    active.remove(&session_id);
                    let error = GenerateError::Interrupted("reply stream ended without a terminal event".into());
                    warn!(session_id = %session_id, stream_id = %stream_id, "reply stream ended early");
                    binder.send(
                        &session_id,
                        Envelope::stream_end(session_id.clone(), stream_id.clone(), StreamOutcome::Error, chunk_seq),
                    );
                    binder.send(
                        &session_id,
                        Envelope::error(
                            session_id.clone(),
                            error.error_kind(),
                            &error.to_string(),
                            Some(turn.message_id.clone()),
                        ),
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use fable_core::directory::MemoryDirectory;
    use fable_core::envelope::{
        ErrorPayload, EventKind, StreamChunkPayload, StreamEndPayload, StreamStartPayload,
    };
    use fable_core::generate::{PersonaRef, ReplyStream};
    use fable_core::history::MemoryHistory;
    use fable_core::ids::{ChannelId, PrincipalId};
    use fable_llm::{ScriptedGenerator, ScriptedReply};

    use crate::binder::{BindPolicy, ChannelHandle};
    use crate::channel::Outbound;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    struct Rig {
        pipeline: TurnPipeline,
        binder: Arc<SessionBinder>,
        history: Arc<MemoryHistory>,
        session_id: SessionId,
        rx: mpsc::Receiver<Outbound>,
    }

    async fn rig_with(generator: Arc<dyn ReplyGenerator>) -> Rig {
        let history = Arc::new(MemoryHistory::new());
        let directory = Arc::new(MemoryDirectory::new());
        let binder = Arc::new(SessionBinder::new(BindPolicy::Displace, 16));
        let record = directory
            .create(&PrincipalId::new(), PersonaRef::new("bk_moby_dick", "Ishmael"))
            .await;
        let (tx, rx) = mpsc::channel(64);
        binder.bind(&record.session_id, ChannelHandle::new(ChannelId::new(), tx));
        let pipeline = TurnPipeline::new(
            generator,
            history.clone(),
            directory,
            binder.clone(),
        );
        Rig {
            pipeline,
            binder,
            history,
            session_id: record.session_id,
            rx,
        }
    }

    async fn rig(replies: Vec<ScriptedReply>) -> (Rig, Arc<ScriptedGenerator>) {
        let generator = Arc::new(ScriptedGenerator::new(replies));
        let rig = rig_with(generator.clone()).await;
        (rig, generator)
    }

    async fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        match timeout(EVENT_TIMEOUT, rx.recv()).await {
            Ok(Some(Outbound::Event(envelope))) => envelope,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    /// Generator whose stream yields a prefix then hangs until cancelled.
    struct HangingGenerator;

    #[async_trait]
    impl ReplyGenerator for HangingGenerator {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn generate(&self, _turn: &TurnRequest) -> Result<ReplyStream, GenerateError> {
            let head = stream::iter(vec![
                ReplyEvent::Start,
                ReplyEvent::Delta { text: "Call ".into() },
            ]);
            Ok(Box::pin(head.chain(stream::pending())))
        }
    }

    #[tokio::test]
    async fn turn_flows_ack_typing_stream_then_response() {
        let (mut rig, _) = rig(vec![ScriptedReply::deltas(&["Call ", "me ", "Ishmael."])]).await;
        let user_mid = MessageId::new();
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), user_mid.clone(), "who are you?"))
            .await;

        let ack = next_event(&mut rig.rx).await;
        assert_eq!(ack.kind, EventKind::System);
        assert_eq!(ack.message_id, Some(user_mid.clone()));

        let typing = next_event(&mut rig.rx).await;
        assert_eq!(typing.kind, EventKind::Typing);

        let start = next_event(&mut rig.rx).await;
        assert_eq!(start.kind, EventKind::StreamStart);
        let start_payload: StreamStartPayload = start.payload_as().unwrap();
        assert_eq!(start_payload.replies_to, user_mid);
        let reply_id = start.message_id.clone().expect("reply id on stream_start");
        let stream_id = start.stream_id.clone().unwrap();

        for (i, piece) in ["Call ", "me ", "Ishmael."].iter().enumerate() {
            let chunk = next_event(&mut rig.rx).await;
            assert_eq!(chunk.kind, EventKind::StreamChunk);
            assert_eq!(chunk.stream_id, Some(stream_id.clone()));
            let payload: StreamChunkPayload = chunk.payload_as().unwrap();
            assert_eq!(payload.seq, i as u64 + 1);
            assert_eq!(payload.text, *piece);
        }

        let end = next_event(&mut rig.rx).await;
        assert_eq!(end.kind, EventKind::StreamEnd);
        let end_payload: StreamEndPayload = end.payload_as().unwrap();
        assert_eq!(end_payload.outcome, StreamOutcome::Complete);
        assert_eq!(end_payload.chunks, 3);

        let response = next_event(&mut rig.rx).await;
        assert_eq!(response.kind, EventKind::AiResponse);
        assert_eq!(response.message_id, Some(reply_id.clone()));

        let transcript = rig.history.transcript(&rig.session_id).await;
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].author, Author::User);
        assert_eq!(transcript[0].text, "who are you?");
        assert_eq!(transcript[1].author, Author::Persona);
        assert_eq!(transcript[1].message_id, reply_id);
        assert_eq!(transcript[1].text, "Call me Ishmael.");
    }

    #[tokio::test]
    async fn duplicate_turn_is_reacked_not_regenerated() {
        let (mut rig, generator) = rig(vec![ScriptedReply::text("once")]).await;
        let user_mid = MessageId::new();
        let turn = Envelope::user_message(rig.session_id.clone(), user_mid.clone(), "say it");

        rig.pipeline.user_turn(turn.clone()).await;
        loop {
            if next_event(&mut rig.rx).await.kind == EventKind::AiResponse {
                break;
            }
        }

        rig.pipeline.user_turn(turn).await;
        let re_ack = next_event(&mut rig.rx).await;
        assert_eq!(re_ack.kind, EventKind::System);
        assert_eq!(re_ack.message_id, Some(user_mid));
        assert!(rig.rx.try_recv().is_err(), "re-ack only, nothing re-forwarded");

        assert_eq!(generator.call_count(), 1);
        assert_eq!(rig.history.transcript(&rig.session_id).await.len(), 2);
    }

    #[tokio::test]
    async fn quota_refusal_maps_to_error_and_leaves_channel_up() {
        let (mut rig, _) = rig(vec![
            ScriptedReply::Error(GenerateError::QuotaExceeded),
            ScriptedReply::text("still here"),
        ])
        .await;
        let user_mid = MessageId::new();
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), user_mid.clone(), "one more"))
            .await;

        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::System);
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::Typing);
        let error = next_event(&mut rig.rx).await;
        assert_eq!(error.kind, EventKind::Error);
        let payload: ErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, "quota_exceeded");
        assert_eq!(payload.message_id, Some(user_mid));

        // The channel stays up: the next turn streams normally.
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), MessageId::new(), "again"))
            .await;
        loop {
            let event = next_event(&mut rig.rx).await;
            if event.kind == EventKind::AiResponse {
                break;
            }
        }
    }

    #[tokio::test]
    async fn cancel_mid_stream_ends_with_cancelled() {
        let mut rig = rig_with(Arc::new(HangingGenerator)).await;
        let user_mid = MessageId::new();
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), user_mid, "tell me everything"))
            .await;

        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::System);
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::Typing);
        let start = next_event(&mut rig.rx).await;
        let stream_id = start.stream_id.clone().unwrap();
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::StreamChunk);

        rig.pipeline
            .handle_system(&Envelope::cancel_stream(rig.session_id.clone(), stream_id.clone()));

        let end = next_event(&mut rig.rx).await;
        assert_eq!(end.kind, EventKind::StreamEnd);
        let payload: StreamEndPayload = end.payload_as().unwrap();
        assert_eq!(payload.outcome, StreamOutcome::Cancelled);
        assert_eq!(payload.chunks, 1);

        assert!(rig.rx.try_recv().is_err(), "nothing after the cancelled end");
        assert!(!rig.pipeline.has_active_reply(&rig.session_id));
        // A cancelled reply never reaches the transcript.
        assert_eq!(rig.history.transcript(&rig.session_id).await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_for_an_unknown_stream_is_ignored() {
        let mut rig = rig_with(Arc::new(HangingGenerator)).await;
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), MessageId::new(), "go"))
            .await;
        for _ in 0..4 {
            next_event(&mut rig.rx).await; // ack, typing, start, chunk
        }

        assert!(!rig.pipeline.cancel_reply(&rig.session_id, &StreamId::new()));
        assert!(rig.pipeline.has_active_reply(&rig.session_id));
    }

    #[tokio::test]
    async fn turn_while_streaming_is_refused() {
        let mut rig = rig_with(Arc::new(HangingGenerator)).await;
        rig.pipeline
            .user_turn(Envelope::user_message(rig.session_id.clone(), MessageId::new(), "first"))
            .await;
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::System);
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::Typing);
        let start = next_event(&mut rig.rx).await;
        let stream_id = start.stream_id.clone().unwrap();
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::StreamChunk);

        let second = Envelope::user_message(rig.session_id.clone(), MessageId::new(), "second");
        rig.pipeline.user_turn(second.clone()).await;

        let error = next_event(&mut rig.rx).await;
        assert_eq!(error.kind, EventKind::Error);
        let payload: ErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, error_code::REPLY_IN_PROGRESS);
        assert_eq!(payload.message_id, second.message_id);
        assert!(rig.rx.try_recv().is_err(), "no ack for the refused turn");

        // Refusal does not burn the id: once the stream is cancelled the
        // same turn is accepted.
        rig.pipeline.cancel_reply(&rig.session_id, &stream_id);
        assert_eq!(next_event(&mut rig.rx).await.kind, EventKind::StreamEnd);

        rig.pipeline.user_turn(second.clone()).await;
        let ack = next_event(&mut rig.rx).await;
        assert_eq!(ack.kind, EventKind::System);
        assert_eq!(ack.message_id, second.message_id);
    }

    #[tokio::test]
    async fn unknown_session_turn_gets_an_error_envelope() {
        let (rig, generator) = rig(vec![]).await;
        let ghost = SessionId::new();
        let (tx, mut ghost_rx) = mpsc::channel(16);
        rig.binder.bind(&ghost, ChannelHandle::new(ChannelId::new(), tx));

        rig.pipeline
            .user_turn(Envelope::user_message(ghost.clone(), MessageId::new(), "anyone?"))
            .await;

        assert_eq!(next_event(&mut ghost_rx).await.kind, EventKind::System);
        assert_eq!(next_event(&mut ghost_rx).await.kind, EventKind::Typing);
        let error = next_event(&mut ghost_rx).await;
        assert_eq!(error.kind, EventKind::Error);
        let payload: ErrorPayload = error.payload_as().unwrap();
        assert_eq!(payload.code, "invalid_turn");
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn malformed_turns_are_dropped_silently() {
        let (mut rig, generator) = rig(vec![]).await;

        // No message id.
        let mut envelope = Envelope::new(EventKind::UserMessage, rig.session_id.clone());
        envelope.payload = Some(serde_json::json!({ "text": "hi" }));
        rig.pipeline.user_turn(envelope).await;

        // No payload.
        let mut envelope = Envelope::new(EventKind::UserMessage, rig.session_id.clone());
        envelope.message_id = Some(MessageId::new());
        rig.pipeline.user_turn(envelope).await;

        assert!(rig.rx.try_recv().is_err());
        assert_eq!(generator.call_count(), 0);
    }
}
