use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::clock::to_datetime;

/// One timestamped unit of inbound data
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    timestamp: f64,
    payload: Bytes,
}

impl Frame {
    /// Create a frame received at `timestamp` seconds
    pub fn new(timestamp: f64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
        }
    }

    /// Time the frame was received, in seconds
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Receive time as a UTC date-time
    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        to_datetime(self.timestamp)
    }

    /// Copy of this frame that shares no storage with it
    pub fn detached(&self) -> Self {
        Self {
            timestamp: self.timestamp,
            payload: Bytes::copy_from_slice(&self.payload),
        }
    }

    /// Split into `(timestamp, payload)`
    pub fn into_parts(self) -> (f64, Bytes) {
        (self.timestamp, self.payload)
    }
}
