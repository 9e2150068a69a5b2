//! Bounded, timestamped receive history

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use super::{Frame, QueueError};
use crate::clock::{Clock, SystemClock};

/// Ring buffer of inbound frames, oldest evicted first.
///
/// Timestamps are non-decreasing in insertion order, which is what makes
/// [`ReceiveQueue::find_after`] a binary search.
#[derive(Clone)]
pub struct ReceiveQueue {
    frames: VecDeque<Frame>,
    capacity: usize,
    pushed: u64,
    clock: Arc<dyn Clock>,
}

impl ReceiveQueue {
    /// Create an empty queue holding at most `capacity` frames
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        Self::with_clock(capacity, Arc::new(SystemClock::new()))
    }

    /// Create an empty queue that timestamps frames with `clock`
    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::InvalidCapacity(capacity));
        }
        Ok(Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            pushed: 0,
            clock,
        })
    }

    /// Append a batch of payloads, timestamping each one.
    ///
    /// Every payload gets its own clock reading, clamped so the queue stays
    /// sorted even if the clock steps backwards. Frames beyond capacity are
    /// evicted from the front.
    pub fn push<I, B>(&mut self, batch: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        for payload in batch {
            let mut timestamp = self.clock.now();
            if let Some(last) = self.frames.back() {
                if timestamp < last.timestamp() {
                    timestamp = last.timestamp();
                }
            }
            self.frames.push_back(Frame::new(timestamp, payload));
            self.pushed += 1;

            while self.frames.len() > self.capacity {
                self.frames.pop_front();
            }
        }
    }

    /// Frame `index_from_end` positions back from the most recent (0 = latest)
    pub fn at(&self, index_from_end: usize) -> Option<&Frame> {
        let len = self.frames.len();
        if index_from_end >= len {
            return None;
        }
        self.frames.get(len - 1 - index_from_end)
    }

    /// Most recent frame
    pub fn latest(&self) -> Option<&Frame> {
        self.frames.back()
    }

    /// Index of the first frame with a timestamp strictly greater than `timestamp`.
    ///
    /// Returns `len()` when there is none.
    pub fn position_after(&self, timestamp: f64) -> usize {
        self.frames.partition_point(|f| f.timestamp() <= timestamp)
    }

    /// First frame with a timestamp strictly greater than `timestamp`
    pub fn find_after(&self, timestamp: f64) -> Option<&Frame> {
        self.frames.get(self.position_after(timestamp))
    }

    /// All frames with a timestamp strictly greater than `timestamp`, oldest first
    pub fn frames_after(&self, timestamp: f64) -> impl Iterator<Item = &Frame> {
        self.frames.range(self.position_after(timestamp)..)
    }

    /// Copy of the frames, oldest first. Payloads share storage with the queue
    /// but are immutable.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    /// Copy of the frames with freshly allocated payloads
    pub fn deep_snapshot(&self) -> Vec<Frame> {
        self.frames.iter().map(Frame::detached).collect()
    }

    /// Number of frames held
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no frame is held
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Maximum number of frames held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames ever pushed, including evicted ones
    pub fn total_pushed(&self) -> u64 {
        self.pushed
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
    }
}

impl fmt::Debug for ReceiveQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveQueue")
            .field("len", &self.frames.len())
            .field("capacity", &self.capacity)
            .field("frames", &self.frames)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pretty_assertions::assert_eq;
    use rand::Rng;
    use std::time::Duration;

    fn payloads(q: &ReceiveQueue) -> Vec<Vec<u8>> {
        q.snapshot().iter().map(|f| f.payload().to_vec()).collect()
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert_eq!(
            ReceiveQueue::new(0).unwrap_err(),
            QueueError::InvalidCapacity(0)
        );
        assert!(ReceiveQueue::new(1).is_ok());
    }

    #[test]
    fn test_at_counts_from_latest() {
        let mut q = ReceiveQueue::new(8).unwrap();
        q.push([b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

        assert_eq!(q.at(0).unwrap().payload().as_ref(), b"3");
        assert_eq!(q.at(1).unwrap().payload().as_ref(), b"2");
        assert_eq!(q.at(2).unwrap().payload().as_ref(), b"1");
        assert!(q.at(3).is_none());
    }

    #[test]
    fn test_at_on_empty_queue() {
        let q = ReceiveQueue::new(4).unwrap();
        assert!(q.at(0).is_none());
        assert!(q.latest().is_none());
    }

    #[test]
    fn test_overflow_keeps_last_n_in_order() {
        for capacity in [1usize, 3, 7] {
            let mut q = ReceiveQueue::new(capacity).unwrap();
            let pushed: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
            // Mix single pushes and batches
            q.push(pushed[..5].to_vec());
            for p in &pushed[5..12] {
                q.push([p.clone()]);
            }
            q.push(pushed[12..].to_vec());

            assert_eq!(q.len(), capacity);
            assert_eq!(payloads(&q), pushed[pushed.len() - capacity..].to_vec());
        }
    }

    #[test]
    fn test_timestamps_clamped_when_clock_steps_back() {
        let clock = Arc::new(ManualClock::new(100.0));
        let mut q = ReceiveQueue::with_clock(16, clock.clone()).unwrap();
        q.push([b"a".to_vec()]);
        clock.set(50.0);
        q.push([b"b".to_vec(), b"c".to_vec()]);

        let stamps: Vec<f64> = q.snapshot().iter().map(Frame::timestamp).collect();
        assert_eq!(stamps, vec![100.0, 100.0, 100.0]);
    }

    #[test]
    fn test_find_after_is_strict() {
        let clock = Arc::new(ManualClock::new(1.0));
        let mut q = ReceiveQueue::with_clock(16, clock.clone()).unwrap();
        q.push([b"a".to_vec()]);
        clock.advance(Duration::from_secs(1));
        q.push([b"b".to_vec(), b"c".to_vec()]);
        clock.advance(Duration::from_secs(1));
        q.push([b"d".to_vec()]);

        assert_eq!(q.find_after(0.5).unwrap().payload().as_ref(), b"a");
        assert_eq!(q.find_after(1.0).unwrap().payload().as_ref(), b"b");
        assert_eq!(q.find_after(2.0).unwrap().payload().as_ref(), b"d");
        assert!(q.find_after(3.0).is_none());
        assert_eq!(q.frames_after(1.0).count(), 3);
    }

    #[test]
    fn test_find_after_matches_linear_scan() {
        let mut rng = rand::thread_rng();
        let clock = Arc::new(ManualClock::new(0.0));

        for _ in 0..200 {
            let mut q = ReceiveQueue::with_clock(64, clock.clone()).unwrap();
            clock.set(0.0);
            let count = rng.gen_range(0..80);
            for i in 0..count {
                // Ties are frequent on purpose
                if rng.gen_bool(0.6) {
                    clock.advance(Duration::from_millis(rng.gen_range(1..50)));
                }
                q.push([vec![i as u8]]);
            }

            let frames = q.snapshot();
            for _ in 0..20 {
                let t = rng.gen_range(-0.1..(count as f64 * 0.05 + 0.1));
                let expected = frames.iter().find(|f| f.timestamp() > t);
                assert_eq!(q.find_after(t), expected);
            }
        }
    }

    #[test]
    fn test_deep_snapshot_detaches_payloads() {
        let mut q = ReceiveQueue::new(4).unwrap();
        q.push([b"payload".to_vec()]);

        let shallow = q.snapshot();
        let deep = q.deep_snapshot();
        assert_eq!(shallow, deep);
        assert_ne!(
            shallow[0].payload().as_ptr(),
            deep[0].payload().as_ptr()
        );
    }
}
