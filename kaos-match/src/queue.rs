//! Bounded inbound message queue.
//!
//! Transport connections enqueue through cloned [`InboundSender`]s; the tick
//! thread drains through the single [`InboundQueue`]. A drain removes exactly
//! the number of messages present when it starts, so anything enqueued while
//! the handler runs is left for the next tick.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{MatchError, Result};
use crate::presence::Presence;

/// Default input queue capacity per match.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Message received from a match participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: Presence,
    pub op_code: i64,
    pub data: Option<Vec<u8>>,
    pub reliable: bool,
    pub receive_time_ms: i64,
}

impl InboundMessage {
    pub fn new(sender: Presence, op_code: i64, data: Option<Vec<u8>>) -> Self {
        Self {
            sender,
            op_code,
            data,
            reliable: true,
            receive_time_ms: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Producer half, safe to clone across connections.
#[derive(Debug, Clone)]
pub struct InboundSender {
    tx: Sender<InboundMessage>,
}

impl InboundSender {
    /// Enqueue without blocking. Fails with `QueueFull` at capacity and with
    /// `Stopped` once the consumer is gone.
    pub fn send(&self, msg: InboundMessage) -> Result<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MatchError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(MatchError::Stopped),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Consumer half, owned by the match core.
#[derive(Debug)]
pub struct InboundQueue {
    rx: Receiver<InboundMessage>,
    tx: Sender<InboundMessage>,
    capacity: usize,
}

impl InboundQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "InboundQueue capacity must be at least 1");
        let (tx, rx) = bounded(capacity);
        Self { rx, tx, capacity }
    }

    pub fn sender(&self) -> InboundSender {
        InboundSender { tx: self.tx.clone() }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Remove the messages queued at call time, in arrival order.
    pub fn drain_snapshot(&self) -> Vec<InboundMessage> {
        let size = self.rx.len();
        let mut messages = Vec::with_capacity(size);
        for _ in 0..size {
            match self.rx.try_recv() {
                Ok(msg) => messages.push(msg),
                Err(_) => break,
            }
        }
        messages
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn msg(op_code: i64) -> InboundMessage {
        let sender = Presence::new(Uuid::new_v4(), Uuid::new_v4(), "p", "node");
        InboundMessage::new(sender, op_code, None)
    }

    #[test]
    fn test_drain_is_fifo() {
        let queue = InboundQueue::new(8);
        let tx = queue.sender();
        for op in 1..=3 {
            tx.send(msg(op)).unwrap();
        }

        let ops: Vec<i64> = queue.drain_snapshot().iter().map(|m| m.op_code).collect();
        assert_eq!(ops, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = InboundQueue::new(2);
        let tx = queue.sender();
        tx.send(msg(1)).unwrap();
        tx.send(msg(2)).unwrap();
        assert!(matches!(tx.send(msg(3)), Err(MatchError::QueueFull)));
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = InboundQueue::new(64);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tx = queue.sender();
                std::thread::spawn(move || {
                    for op in 0..8 {
                        tx.send(msg(op)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.drain_snapshot().len(), 32);
    }

    #[test]
    fn test_empty_drain() {
        let queue = InboundQueue::default();
        assert!(queue.drain_snapshot().is_empty());
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
    }
}
