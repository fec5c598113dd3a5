use std::collections::{HashMap, VecDeque};

use fable_core::envelope::StreamOutcome;
use fable_core::ids::{MessageId, StreamId};

/// Terminal streams kept around so late replays still hit the dedup path.
pub(crate) const TERMINAL_RETAINED: usize = 32;

/// Delivery phase of one in-flight reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPhase {
    Streaming,
    Paused,
    Cancelled,
    Completed,
}

/// What the assembler did with one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Appended to the assembled content.
    Applied,
    /// At or below the high-water mark. Replay noise, dropped.
    Duplicate,
    /// Jumped past `expected`. The chunk is still applied, but the content
    /// now has a hole; `refetch` is true the first time only.
    Gap { expected: u64, refetch: bool },
    /// Stream is paused; held for replay. `dropped_oldest` reports a full
    /// buffer shedding its oldest held chunk.
    Buffered { dropped_oldest: bool },
    /// Stream unknown or already terminal.
    Ignored,
}

/// Chunks re-applied by a resume, in order, plus whether replay uncovered
/// a gap that warrants a history refetch.
#[derive(Debug, Default)]
pub struct ResumeReplay {
    pub replayed: Vec<(u64, String)>,
    pub needs_refetch: bool,
}

/// A stream that just reached a terminal phase.
#[derive(Debug)]
pub struct FinishedStream {
    pub content: String,
    pub outcome: StreamOutcome,
    pub degraded: bool,
}

#[derive(Debug)]
pub struct StreamState {
    pub stream_id: StreamId,
    /// Reply message this stream assembles.
    pub message_id: MessageId,
    /// User turn the reply answers.
    pub replies_to: MessageId,
    content: String,
    /// Highest applied chunk seq. Chunk seqs start at 1.
    hwm: u64,
    pub phase: StreamPhase,
    /// Content may be missing text until the full message arrives.
    pub degraded: bool,
    refetch_issued: bool,
    held: VecDeque<(u64, String)>,
    pub dropped_held_chunks: u64,
}

impl StreamState {
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn hwm(&self) -> u64 {
        self.hwm
    }

    fn apply(&mut self, seq: u64, text: &str) -> ChunkOutcome {
        if seq <= self.hwm {
            return ChunkOutcome::Duplicate;
        }
        if seq > self.hwm + 1 {
            let expected = self.hwm + 1;
            let refetch = !self.refetch_issued;
            self.degraded = true;
            self.refetch_issued = true;
            self.content.push_str(text);
            self.hwm = seq;
            return ChunkOutcome::Gap { expected, refetch };
        }
        self.content.push_str(text);
        self.hwm = seq;
        ChunkOutcome::Applied
    }
}

/// Reassembles incremental replies per stream. Owned by the manager task;
/// no interior locking.
pub struct StreamAssembler {
    streams: HashMap<StreamId, StreamState>,
    terminal_order: VecDeque<StreamId>,
    paused_buffer_limit: usize,
}

impl StreamAssembler {
    pub fn new(paused_buffer_limit: usize) -> Self {
        Self {
            streams: HashMap::new(),
            terminal_order: VecDeque::new(),
            paused_buffer_limit,
        }
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<&StreamState> {
        self.streams.get(stream_id)
    }

    /// Track a new stream. False when the id is already known, which is
    /// plain replay of the start event.
    pub fn on_start(
        &mut self,
        stream_id: StreamId,
        message_id: MessageId,
        replies_to: MessageId,
    ) -> bool {
        if self.streams.contains_key(&stream_id) {
            return false;
        }
        self.streams.insert(
            stream_id.clone(),
            StreamState {
                stream_id,
                message_id,
                replies_to,
                content: String::new(),
                hwm: 0,
                phase: StreamPhase::Streaming,
                degraded: false,
                refetch_issued: false,
                held: VecDeque::new(),
                dropped_held_chunks: 0,
            },
        );
        true
    }

    pub fn on_chunk(&mut self, stream_id: &StreamId, seq: u64, text: &str) -> ChunkOutcome {
        let Some(state) = self.streams.get_mut(stream_id) else {
            return ChunkOutcome::Ignored;
        };
        match state.phase {
            StreamPhase::Cancelled | StreamPhase::Completed => ChunkOutcome::Ignored,
            StreamPhase::Paused => {
                state.held.push_back((seq, text.to_string()));
                let dropped_oldest = state.held.len() > self.paused_buffer_limit;
                if dropped_oldest {
                    state.held.pop_front();
                    state.dropped_held_chunks += 1;
                }
                ChunkOutcome::Buffered { dropped_oldest }
            }
            StreamPhase::Streaming => state.apply(seq, text),
        }
    }

    /// Finish a stream. Held chunks are applied first so a pause right
    /// before the end loses nothing. `None` when the stream is unknown or
    /// already terminal.
    pub fn on_end(&mut self, stream_id: &StreamId, outcome: StreamOutcome) -> Option<FinishedStream> {
        let state = self.streams.get_mut(stream_id)?;
        if matches!(state.phase, StreamPhase::Cancelled | StreamPhase::Completed) {
            return None;
        }
        while let Some((seq, text)) = state.held.pop_front() {
            state.apply(seq, &text);
        }
        state.phase = match outcome {
            StreamOutcome::Cancelled => StreamPhase::Cancelled,
            _ => StreamPhase::Completed,
        };
        let finished = FinishedStream {
            content: state.content.clone(),
            outcome,
            degraded: state.degraded,
        };
        self.note_terminal(stream_id.clone());
        Some(finished)
    }

    pub fn pause(&mut self, stream_id: &StreamId) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(state) if state.phase == StreamPhase::Streaming => {
                state.phase = StreamPhase::Paused;
                true
            }
            _ => false,
        }
    }

    /// Resume a paused stream, replaying held chunks through the normal
    /// apply path so duplicates stay deduplicated.
    pub fn resume(&mut self, stream_id: &StreamId) -> Option<ResumeReplay> {
        let state = self.streams.get_mut(stream_id)?;
        if state.phase != StreamPhase::Paused {
            return None;
        }
        state.phase = StreamPhase::Streaming;
        let mut replay = ResumeReplay::default();
        while let Some((seq, text)) = state.held.pop_front() {
            match state.apply(seq, &text) {
                ChunkOutcome::Applied => replay.replayed.push((seq, text)),
                ChunkOutcome::Gap { refetch, .. } => {
                    replay.needs_refetch |= refetch;
                    replay.replayed.push((seq, text));
                }
                _ => {}
            }
        }
        Some(replay)
    }

    /// Stop a stream locally. Returns the partial content; the server's
    /// own terminal event for this stream will be ignored later.
    pub fn cancel(&mut self, stream_id: &StreamId) -> Option<String> {
        let state = self.streams.get_mut(stream_id)?;
        if matches!(state.phase, StreamPhase::Cancelled | StreamPhase::Completed) {
            return None;
        }
        state.phase = StreamPhase::Cancelled;
        state.held.clear();
        let content = state.content.clone();
        self.note_terminal(stream_id.clone());
        Some(content)
    }

    /// Replace a degraded stream with the authoritative full message and
    /// finish it. Later chunks and the real end event become no-ops.
    pub fn adopt_completed(&mut self, stream_id: &StreamId, text: &str) -> bool {
        let Some(state) = self.streams.get_mut(stream_id) else {
            return false;
        };
        if matches!(state.phase, StreamPhase::Cancelled | StreamPhase::Completed) {
            return false;
        }
        state.content = text.to_string();
        state.degraded = false;
        state.held.clear();
        state.phase = StreamPhase::Completed;
        self.note_terminal(stream_id.clone());
        true
    }

    /// Park every live stream, as on a connection drop.
    pub fn pause_all(&mut self) {
        for state in self.streams.values_mut() {
            if state.phase == StreamPhase::Streaming {
                state.phase = StreamPhase::Paused;
            }
        }
    }

    /// Wake every paused stream, as on a reconnect.
    pub fn resume_all(&mut self) -> Vec<(StreamId, ResumeReplay)> {
        let paused: Vec<StreamId> = self
            .streams
            .values()
            .filter(|state| state.phase == StreamPhase::Paused)
            .map(|state| state.stream_id.clone())
            .collect();
        let mut out = Vec::with_capacity(paused.len());
        for stream_id in paused {
            if let Some(replay) = self.resume(&stream_id) {
                out.push((stream_id, replay));
            }
        }
        out
    }

    fn note_terminal(&mut self, stream_id: StreamId) {
        self.terminal_order.push_back(stream_id);
        while self.terminal_order.len() > TERMINAL_RETAINED {
            if let Some(oldest) = self.terminal_order.pop_front() {
                self.streams.remove(&oldest);
            }
        }
    }
}
