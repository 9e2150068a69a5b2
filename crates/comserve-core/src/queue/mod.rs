//! Send and receive queues
//!
//! Both queues are owned by the connection core. The I/O loop works on
//! private copies of them each cycle and the core reconciles the copies
//! back under its lock.

mod frame;
mod receive;
mod send;

pub use frame::Frame;
pub use receive::ReceiveQueue;
pub use send::SendQueue;

use thiserror::Error;

/// Maximum number of payloads waiting in the send queue
pub const SEND_QUEUE_MAX_SIZE: usize = 65536;

/// Receive queue that keeps only the latest frame
pub const RCV_QUEUE_SIZE_NONE: usize = 1;
/// Extra small receive queue
pub const RCV_QUEUE_SIZE_XSMALL: usize = 32;
/// Small receive queue
pub const RCV_QUEUE_SIZE_SMALL: usize = 128;
/// Default receive queue size
pub const RCV_QUEUE_SIZE_NORMAL: usize = 256;
/// Large receive queue
pub const RCV_QUEUE_SIZE_LARGE: usize = 512;
/// Extra large receive queue
pub const RCV_QUEUE_SIZE_XLARGE: usize = 1024;

/// Errors raised by queue operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A queue was created with capacity zero
    #[error("Queue capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),

    /// Peek or pop on an empty queue
    #[error("Queue is empty")]
    EmptyQueue,
}
