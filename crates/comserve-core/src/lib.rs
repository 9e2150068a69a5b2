//! # comserve Core Library
//!
//! Connection core for exposing a serial (COM) port to client processes.
//!
//! This library provides:
//! - A bounded, timestamped receive history and a capped send queue
//! - A background I/O loop that owns the serial transport exclusively
//! - Connect / disconnect / reconnect over a list of candidate ports
//! - Rate-limited sends and blocking wait/match primitives
//! - A port supervisor and an advisory-lock façade for request/response servers
//!
//! ## Example
//!
//! ```rust,ignore
//! use comserve_core::prelude::*;
//!
//! let config = ConnectionConfig::new(["/dev/ttyACM0", "/dev/ttyUSB0"]);
//! let conn = Connection::new(config)?;
//! conn.connect()?;
//!
//! if conn.send(&["hello".into()]) {
//!     if let Some(frame) = conn.get() {
//!         println!("{} -> {:?}", frame.timestamp(), frame.payload());
//!     }
//! }
//! conn.disconnect();
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clock;
pub mod connection;
pub mod facade;
pub mod io_loop;
pub mod queue;
pub mod supervisor;
pub mod transport;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
        DisconnectReason, Expected, SendOptions, SendValue,
    };
    pub use crate::facade::{Session, SharedConnection};
    pub use crate::io_loop::{DefaultCycle, FramingConfig, IoCycle};
    pub use crate::queue::{Frame, QueueError, ReceiveQueue, SendQueue};
    pub use crate::supervisor::{Supervisor, SupervisorConfig};
    pub use crate::transport::{PortInfo, PortSettings, Transport, TransportProvider};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
