use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use fable_core::ids::MessageId;

/// A user turn awaiting the server's `turn_accepted`. Stays queued across
/// reconnects; only a positive acknowledgement releases it.
#[derive(Clone, Debug)]
pub struct PendingTurn {
    pub message_id: MessageId,
    pub text: String,
    pub enqueued_at: Instant,
    /// Transmissions so far.
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
}

/// One flush round: turns to put on the wire now, and turns that ran out
/// of attempts and were dropped from the queue.
#[derive(Debug, Default)]
pub struct DueTurns {
    pub to_send: Vec<(MessageId, String)>,
    pub failed: Vec<MessageId>,
}

/// Ordered queue of unacknowledged turns. Flushes strictly in enqueue
/// order; duplicates on the wire are expected and deduplicated server-side.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<PendingTurn>,
    retry_limit: u32,
}

impl Outbox {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            retry_limit,
        }
    }

    pub fn enqueue(&mut self, message_id: MessageId, text: String) {
        self.queue.push_back(PendingTurn {
            message_id,
            text,
            enqueued_at: Instant::now(),
            attempts: 0,
            last_attempt: None,
        });
    }

    /// Release a turn the server acknowledged. False if it was not queued,
    /// which happens on duplicate acks.
    pub fn ack(&mut self, message_id: &MessageId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|turn| turn.message_id != *message_id);
        self.queue.len() != before
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.queue.iter().any(|turn| turn.message_id == *message_id)
    }

    /// Collect turns due for (re)transmission: never sent, or unacknowledged
    /// for at least `ack_timeout`. Passing a zero timeout makes every queued
    /// turn due, which is the reconnect flush. Turns past the retry limit
    /// are removed and reported in `failed` instead.
    pub fn collect_due(&mut self, now: Instant, ack_timeout: Duration) -> DueTurns {
        let mut due = DueTurns::default();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for mut turn in self.queue.drain(..) {
            let ready = match turn.last_attempt {
                None => true,
                Some(at) => now.duration_since(at) >= ack_timeout,
            };
            if !ready {
                kept.push_back(turn);
                continue;
            }
            if turn.attempts >= self.retry_limit {
                due.failed.push(turn.message_id);
                continue;
            }
            turn.attempts += 1;
            turn.last_attempt = Some(now);
            due.to_send.push((turn.message_id.clone(), turn.text.clone()));
            kept.push_back(turn);
        }
        self.queue = kept;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<MessageId> {
        (0..n).map(|i| MessageId::from_raw(format!("msg_{i}"))).collect()
    }

    #[test]
    fn flushes_in_enqueue_order() {
        let mut outbox = Outbox::new(5);
        let ids = ids(3);
        for (i, id) in ids.iter().enumerate() {
            outbox.enqueue(id.clone(), format!("turn {i}"));
        }
        let due = outbox.collect_due(Instant::now(), Duration::ZERO);
        let sent: Vec<_> = due.to_send.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(sent, ids);
        assert!(due.failed.is_empty());
    }

    #[test]
    fn ack_releases_exactly_one_turn() {
        let mut outbox = Outbox::new(5);
        let ids = ids(3);
        for id in &ids {
            outbox.enqueue(id.clone(), "text".into());
        }
        assert!(outbox.ack(&ids[1]));
        assert!(!outbox.ack(&ids[1]));
        assert_eq!(outbox.len(), 2);

        let due = outbox.collect_due(Instant::now(), Duration::ZERO);
        let sent: Vec<_> = due.to_send.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(sent, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[test]
    fn unacknowledged_turns_wait_out_the_ack_timeout() {
        let mut outbox = Outbox::new(5);
        let ids = ids(1);
        outbox.enqueue(ids[0].clone(), "hello".into());

        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        assert_eq!(outbox.collect_due(t0, timeout).to_send.len(), 1);
        assert_eq!(outbox.collect_due(t0 + Duration::from_secs(5), timeout).to_send.len(), 0);
        assert_eq!(outbox.collect_due(t0 + Duration::from_secs(10), timeout).to_send.len(), 1);
    }

    #[test]
    fn reconnect_flush_resends_everything_unacked() {
        let mut outbox = Outbox::new(5);
        let ids = ids(2);
        outbox.enqueue(ids[0].clone(), "one".into());
        outbox.enqueue(ids[1].clone(), "two".into());

        let t0 = Instant::now();
        outbox.collect_due(t0, Duration::from_secs(10));
        outbox.ack(&ids[0]);

        let due = outbox.collect_due(t0 + Duration::from_millis(1), Duration::ZERO);
        let sent: Vec<_> = due.to_send.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(sent, vec![ids[1].clone()]);
    }

    #[test]
    fn retry_budget_exhaustion_drops_the_turn() {
        let mut outbox = Outbox::new(2);
        let ids = ids(1);
        outbox.enqueue(ids[0].clone(), "stubborn".into());

        let t0 = Instant::now();
        assert_eq!(outbox.collect_due(t0, Duration::ZERO).to_send.len(), 1);
        assert_eq!(outbox.collect_due(t0, Duration::ZERO).to_send.len(), 1);

        let due = outbox.collect_due(t0, Duration::ZERO);
        assert!(due.to_send.is_empty());
        assert_eq!(due.failed, vec![ids[0].clone()]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn acked_turn_never_resends() {
        let mut outbox = Outbox::new(5);
        let ids = ids(1);
        outbox.enqueue(ids[0].clone(), "once".into());

        let t0 = Instant::now();
        outbox.collect_due(t0, Duration::ZERO);
        assert!(outbox.ack(&ids[0]));

        let due = outbox.collect_due(t0 + Duration::from_secs(60), Duration::ZERO);
        assert!(due.to_send.is_empty());
        assert!(due.failed.is_empty());
        assert!(!outbox.contains(&ids[0]));
    }
}
