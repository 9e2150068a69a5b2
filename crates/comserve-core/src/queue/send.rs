//! Outbound payload queue

use bytes::Bytes;
use std::collections::VecDeque;

use super::{QueueError, SEND_QUEUE_MAX_SIZE};

/// FIFO of payloads waiting to be written to the transport.
///
/// Only the connection core appends to it; the I/O loop reads with
/// [`SendQueue::front`] and removes with [`SendQueue::pop`].
#[derive(Debug, Clone, Default)]
pub struct SendQueue {
    items: VecDeque<Bytes>,
}

impl SendQueue {
    /// Create an empty send queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload. Returns false and drops it when the queue is full.
    pub(crate) fn push(&mut self, payload: impl Into<Bytes>) -> bool {
        if self.items.len() >= SEND_QUEUE_MAX_SIZE {
            return false;
        }
        self.items.push_back(payload.into());
        true
    }

    /// First payload in the queue
    pub fn front(&self) -> Result<&Bytes, QueueError> {
        self.items.front().ok_or(QueueError::EmptyQueue)
    }

    /// Remove and return the first payload
    pub fn pop(&mut self) -> Result<Bytes, QueueError> {
        self.items.pop_front().ok_or(QueueError::EmptyQueue)
    }

    /// Drop up to `count` payloads from the front
    pub(crate) fn discard_front(&mut self, count: usize) {
        let count = count.min(self.items.len());
        self.items.drain(..count);
    }

    /// Copy of the pending payloads, oldest first
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.items.iter().cloned().collect()
    }

    /// Copy of the pending payloads with freshly allocated storage
    pub fn deep_snapshot(&self) -> Vec<Bytes> {
        self.items
            .iter()
            .map(|b| Bytes::copy_from_slice(b))
            .collect()
    }

    /// Number of pending payloads
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}
