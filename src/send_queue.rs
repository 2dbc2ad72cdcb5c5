//! Locally-originated / relay transmit queue (§4.9).
//!
//! Grounded on `freakwan.py`'s send-queue handling: a FIFO of pending
//! [`Message`](crate::message::Message)s, each carrying its own
//! `send_time` so a message can be deferred (re-queued at the tail
//! instead of the head) when it isn't due yet — used both for the
//! initial random send-delay and for inter-retransmission backoff.

use std::collections::VecDeque;
use std::time::Instant;

use crate::message::Message;

/// Queue capacity; `!cmd_queue` style back-pressure beyond this point is
/// reported to the caller as [`SendQueueFull`](super::error::FreakMeshError::QueueFull).
pub const MAX_QUEUE_LEN: usize = 100;

pub struct SendQueue {
    items: VecDeque<Message>,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue { items: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Enqueue a message at the tail. Fails once the queue is at
    /// capacity.
    pub fn push(&mut self, msg: Message) -> Result<(), Message> {
        if self.items.len() >= MAX_QUEUE_LEN {
            return Err(msg);
        }
        self.items.push_back(msg);
        Ok(())
    }

    /// Pop the first due (`send_time <= now`), non-canceled message,
    /// scanning past entries that aren't due yet rather than stopping at
    /// the head. Messages with a future `send_time` — e.g. a relay queued
    /// with a random hold-off — would otherwise stall an immediately-due
    /// message queued behind them. Entries skipped over this way are
    /// re-appended at the tail, in their original relative order, after
    /// this one pass; canceled entries encountered along the way are
    /// dropped silently rather than transmitted or re-queued.
    pub fn pop_due(&mut self, now: Instant) -> Option<Message> {
        let mut deferred = VecDeque::new();
        let mut found = None;
        for _ in 0..self.items.len() {
            let msg = self.items.pop_front().unwrap();
            if msg.send_canceled {
                continue;
            }
            if msg.send_time <= now {
                found = Some(msg);
                break;
            }
            deferred.push_back(msg);
        }
        self.items.extend(deferred);
        found
    }

    /// Re-enqueue a message for a later attempt (e.g. after a
    /// retransmission), updating its `send_time` and pushing it to the
    /// tail so earlier-deadline messages aren't starved.
    pub fn defer(&mut self, mut msg: Message, new_send_time: Instant) -> Result<(), Message> {
        msg.send_time = new_send_time;
        self.push(msg)
    }

    pub fn front(&self) -> Option<&Message> {
        self.items.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.items.iter()
    }

    /// Cancel a pending message in place (e.g. an Ack was received before
    /// its next retransmission came due). Returns `true` if found.
    pub fn cancel(&mut self, predicate: impl Fn(&Message) -> bool) -> bool {
        if let Some(m) = self.items.iter_mut().find(|m| predicate(m)) {
            m.send_canceled = true;
            true
        } else {
            false
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    fn msg() -> Message {
        Message::new_data(NodeId::from_bytes([1; 6]), "a".into(), "hi".into(), None)
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut q = SendQueue::new();
        let now = Instant::now();
        let mut m1 = msg();
        m1.send_time = now;
        let mut m2 = msg();
        m2.send_time = now;
        q.push(m1).unwrap();
        q.push(m2).unwrap();
        assert_eq!(q.pop_due(now).unwrap().send_time, now);
        assert!(q.pop_due(now).is_some());
    }

    #[test]
    fn not_due_messages_are_not_popped() {
        let mut q = SendQueue::new();
        let now = Instant::now();
        let mut m = msg();
        m.send_time = now + std::time::Duration::from_secs(5);
        q.push(m).unwrap();
        assert!(q.pop_due(now).is_none());
    }

    #[test]
    fn queue_rejects_push_past_capacity() {
        let mut q = SendQueue::new();
        for _ in 0..MAX_QUEUE_LEN {
            q.push(msg()).unwrap();
        }
        assert!(q.push(msg()).is_err());
    }

    /// A relay queued with a future `send_time` must not stall a later
    /// but immediately-due message queued behind it (§4.7).
    #[test]
    fn a_not_yet_due_head_does_not_stall_a_due_message_behind_it() {
        let mut q = SendQueue::new();
        let now = Instant::now();

        let mut relay = msg();
        relay.send_time = now + std::time::Duration::from_millis(2500);
        q.push(relay).unwrap();

        let mut due = msg();
        due.send_time = now;
        q.push(due.clone()).unwrap();

        let popped = q.pop_due(now).expect("the due message behind the relay should still be returned");
        assert_eq!(popped.send_time, now);

        // The relay is still queued, deferred to the tail, not lost.
        assert_eq!(q.len(), 1);
        assert!(q.front().unwrap().send_time > now);
    }

    #[test]
    fn canceled_messages_are_dropped_not_sent() {
        let mut q = SendQueue::new();
        let now = Instant::now();
        let mut m = msg();
        m.send_time = now;
        m.send_canceled = true;
        q.push(m).unwrap();
        assert!(q.pop_due(now).is_none());
    }
}
