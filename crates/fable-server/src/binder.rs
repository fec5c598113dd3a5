use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use fable_core::envelope::Envelope;
use fable_core::errors::PolicyError;
use fable_core::ids::{ChannelId, MessageId, SessionId};

use crate::channel::Outbound;

/// What happens when a second channel arrives for an already-bound session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BindPolicy {
    /// The newcomer wins: the previous channel is closed with `superseded`.
    #[default]
    Displace,
    /// The holder wins: the newcomer is refused with `already_bound`.
    Reject,
}

impl std::str::FromStr for BindPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "displace" => Ok(Self::Displace),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown bind policy: {other}")),
        }
    }
}

/// Write side of a live channel. The binder routes through this; the channel
/// worker owns the receiving end and the socket.
#[derive(Clone)]
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    outbound: mpsc::Sender<Outbound>,
}

impl ChannelHandle {
    pub fn new(channel_id: ChannelId, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            channel_id,
            outbound,
        }
    }

    fn push(&self, item: Outbound) -> bool {
        match self.outbound.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(channel_id = %self.channel_id, "send queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindOutcome {
    /// The slot was free.
    Bound,
    /// Displace policy evicted the named previous channel.
    Displaced(ChannelId),
    /// Reject policy left the existing channel in place.
    Rejected,
}

struct SessionSlot {
    channel: Option<ChannelHandle>,
    /// Recently accepted turn ids, oldest first. Survives rebinds so a
    /// retransmit arriving on a fresh channel is still recognized.
    seen_turns: VecDeque<MessageId>,
}

impl SessionSlot {
    fn empty() -> Self {
        Self {
            channel: None,
            seen_turns: VecDeque::new(),
        }
    }
}

/// Session registry enforcing at most one live channel per session, plus the
/// per-session turn dedup window.
pub struct SessionBinder {
    slots: DashMap<SessionId, SessionSlot>,
    policy: BindPolicy,
    dedup_window: usize,
}

impl SessionBinder {
    pub fn new(policy: BindPolicy, dedup_window: usize) -> Self {
        Self {
            slots: DashMap::new(),
            policy,
            dedup_window,
        }
    }

    pub fn policy(&self) -> BindPolicy {
        self.policy
    }

    /// Compare-and-bind. Under `Displace` the previous holder, if any, is
    /// sent a `superseded` close before the slot changes hands, so exactly
    /// one channel survives.
    pub fn bind(&self, session_id: &SessionId, handle: ChannelHandle) -> BindOutcome {
        let mut slot = self
            .slots
            .entry(session_id.clone())
            .or_insert_with(SessionSlot::empty);
        match slot.channel.take() {
            None => {
                slot.channel = Some(handle);
                BindOutcome::Bound
            }
            Some(old) if self.policy == BindPolicy::Reject => {
                slot.channel = Some(old);
                BindOutcome::Rejected
            }
            Some(old) => {
                old.push(Outbound::Close {
                    code: PolicyError::Superseded.close_code(),
                    reason: PolicyError::Superseded.error_code().into(),
                });
                slot.channel = Some(handle);
                BindOutcome::Displaced(old.channel_id)
            }
        }
    }

    /// Release the slot, but only if `channel_id` still holds it. A displaced
    /// channel tearing down must not evict its successor.
    pub fn unbind(&self, session_id: &SessionId, channel_id: &ChannelId) {
        if let Some(mut slot) = self.slots.get_mut(session_id) {
            if slot
                .channel
                .as_ref()
                .is_some_and(|c| &c.channel_id == channel_id)
            {
                slot.channel = None;
            }
        }
    }

    pub fn is_bound(&self, session_id: &SessionId) -> bool {
        self.slots
            .get(session_id)
            .is_some_and(|slot| slot.channel.is_some())
    }

    pub fn bound_channel(&self, session_id: &SessionId) -> Option<ChannelId> {
        self.slots
            .get(session_id)?
            .channel
            .as_ref()
            .map(|c| c.channel_id.clone())
    }

    pub fn live_channels(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.channel.is_some())
            .count()
    }

    /// Route an event to the session's current channel. Returns false when
    /// the session is unbound or the queue is full; the event is dropped
    /// either way and the transcript stays the source of truth.
    pub fn send(&self, session_id: &SessionId, envelope: Envelope) -> bool {
        let Some(slot) = self.slots.get(session_id) else {
            debug!(session_id = %session_id, "no slot for session, dropping event");
            return false;
        };
        let Some(channel) = &slot.channel else {
            debug!(session_id = %session_id, "session unbound, dropping event");
            return false;
        };
        channel.push(Outbound::Event(envelope))
    }

    /// True when the turn id is still in the session's dedup window, i.e.
    /// the turn is a retransmit of one already accepted.
    pub fn is_recent_turn(&self, session_id: &SessionId, message_id: &MessageId) -> bool {
        self.slots
            .get(session_id)
            .is_some_and(|slot| slot.seen_turns.iter().any(|m| m == message_id))
    }

    /// Record an accepted turn id in the dedup window, evicting the oldest
    /// beyond the configured size.
    pub fn note_turn(&self, session_id: &SessionId, message_id: &MessageId) {
        let mut slot = self
            .slots
            .entry(session_id.clone())
            .or_insert_with(SessionSlot::empty);
        if slot.seen_turns.iter().any(|m| m == message_id) {
            return;
        }
        if slot.seen_turns.len() >= self.dedup_window {
            slot.seen_turns.pop_front();
        }
        slot.seen_turns.push_back(message_id.clone());
    }
}
