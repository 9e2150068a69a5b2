use std::io;
use std::time::Duration;
use thiserror::Error;

use super::ConfigError;
use crate::queue::QueueError;

/// Errors raised by connection operations
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Connect or reconnect while the I/O loop is running
    #[error("Already connected")]
    AlreadyConnected,

    /// The operation needs a running connection
    #[error("Not connected")]
    NotConnected,

    /// Every candidate port failed to open
    #[error("No port available (tried: {})", .tried.join(", "))]
    NoPortAvailable {
        /// Candidates in the order they were tried
        tried: Vec<String>,
    },

    /// No port opened before the reconnect deadline
    #[error("Reconnect gave up after {0:?}")]
    ReconnectTimeout(Duration),

    /// Negative or NaN timeout
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(f64),

    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Queue could not be created
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The I/O thread could not be spawned
    #[error("Failed to start I/O loop: {0}")]
    Spawn(#[source] io::Error),
}
