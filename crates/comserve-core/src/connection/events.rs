//! Connection lifecycle events
//!
//! Events are published on a `tokio::sync::broadcast` channel. Subscribers
//! that fall behind miss old events rather than blocking the connection.

/// Why a connection went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Requested,
    /// The transport failed while the I/O loop was running
    TransportLost(String),
    /// The port disappeared from the system's port list
    PortRemoved,
}

/// Lifecycle change of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A port was opened and the I/O loop started
    Connected {
        /// Port that was opened
        port: String,
    },
    /// The I/O loop stopped
    Disconnected {
        /// Port that was in use
        port: String,
        /// What ended the connection
        reason: DisconnectReason,
    },
    /// A reconnect attempt is about to scan the candidate ports
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
}

/// Buffered events per subscriber
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;
