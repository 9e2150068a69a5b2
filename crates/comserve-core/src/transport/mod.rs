//! Transport abstraction
//!
//! A [`Transport`] is the opened device. It is owned by the I/O loop and
//! never touched from caller threads. A [`TransportProvider`] opens one
//! given a port name and line settings.

pub mod mock;
pub mod serial;

use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use thiserror::Error;

pub use serial::{list_ports, PortInfo, SerialProvider};

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Common baud rate for slower microcontroller links
pub const NORMAL_BAUD_RATE: u32 = 9600;

/// Errors raised while opening a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The port could not be opened
    #[error("Failed to open {port}: {reason}")]
    Open {
        /// Port name
        port: String,
        /// Driver message
        reason: String,
    },

    /// I/O failure while configuring the port
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    /// 5 bits
    Five,
    /// 6 bits
    Six,
    /// 7 bits
    Seven,
    /// 8 bits
    #[default]
    Eight,
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    /// One stop bit
    #[default]
    One,
    /// Two stop bits
    Two,
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// No flow control
    #[default]
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// Line settings passed to [`TransportProvider::open`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Read timeout, `None` for no timeout
    pub timeout: Option<Duration>,
    /// Character size
    pub data_bits: DataBits,
    /// Parity checking
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Some(Duration::from_secs(1)),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }
}

/// An opened, exclusively owned byte channel
pub trait Transport: Send {
    /// Port name this transport was opened on
    fn name(&self) -> &str;

    /// Baud rate in use
    fn baud_rate(&self) -> u32;

    /// Write a whole payload.
    ///
    /// `WouldBlock` and `TimedOut` mean nothing was written and are treated
    /// by the I/O loop as "try again next cycle"; any other error ends the
    /// connection. Implementations must not return a transient error after
    /// part of `data` went out, or the retry would repeat it.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read everything currently buffered without waiting for more.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Release the device
    fn close(&mut self) -> io::Result<()>;

    /// Current read timeout, `None` for no timeout
    fn timeout(&self) -> Option<Duration>;

    /// Change the read timeout
    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

/// Opens transports by port name
pub trait TransportProvider: Send + Sync {
    /// Open `port` with the given line settings
    fn open(&self, port: &str, settings: &PortSettings) -> Result<Box<dyn Transport>, TransportError>;

    /// List ports currently present on the system
    fn available_ports(&self) -> Vec<PortInfo> {
        Vec::new()
    }
}

/// True for errors that only mean "nothing moved this time"
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
