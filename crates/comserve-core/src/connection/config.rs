//! Connection configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::io_loop::FramingConfig;
use crate::queue::RCV_QUEUE_SIZE_NORMAL;
use crate::transport::{
    DataBits, FlowControl, Parity, PortSettings, StopBits, DEFAULT_BAUD_RATE,
};

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default minimum spacing between accepted sends in milliseconds
pub const DEFAULT_SEND_INTERVAL_MS: u64 = 1000;

/// Default wait after opening a port, giving the other end time to boot
pub const DEFAULT_SETTLE_MS: u64 = 2000;

/// Default spacing between reconnect attempts
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 1000;

/// Errors loading or validating a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this shape
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values that can never work
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Candidate serial ports, tried in order
    pub ports: Vec<String>,
    /// Baud rate
    pub baud_rate: u32,
    /// Response timeout in milliseconds, `None` to wait forever
    pub timeout_ms: Option<u64>,
    /// Minimum spacing between accepted sends in milliseconds, 0 for no limit
    pub send_interval_ms: u64,
    /// Number of received frames to keep
    pub queue_size: usize,
    /// Rest between I/O cycles instead of spinning
    pub rest_cpu: bool,
    /// Rest length in milliseconds when `rest_cpu` is set
    pub cycle_rest_ms: u64,
    /// Wait after opening a port before starting the I/O loop
    pub settle_ms: u64,
    /// Spacing between reconnect attempts
    pub retry_interval_ms: u64,
    /// Longest time one cycle may spend writing
    pub drain_budget_ms: u64,
    /// How inbound bytes are split into frames
    pub framing: FramingConfig,
    /// Character size
    pub data_bits: DataBits,
    /// Parity checking
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            send_interval_ms: DEFAULT_SEND_INTERVAL_MS,
            queue_size: RCV_QUEUE_SIZE_NORMAL,
            rest_cpu: true,
            cycle_rest_ms: 10,
            settle_ms: DEFAULT_SETTLE_MS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            drain_budget_ms: 500,
            framing: FramingConfig::default(),
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }
}

impl ConnectionConfig {
    /// Default configuration over the given candidate ports
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ports: ports.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as pretty JSON
    pub fn save_json_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// Reject settings that can never work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.is_empty() {
            return Err(ConfigError::Invalid("at least one port is required".into()));
        }
        if self.ports.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid("port names must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud rate must be positive".into()));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid("queue size must be at least 1".into()));
        }
        if let FramingConfig::Delimiter { delimiter, .. } = &self.framing {
            if delimiter.is_empty() {
                return Err(ConfigError::Invalid("framing delimiter must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Response timeout, `None` for no timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Minimum spacing between accepted sends
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    /// Rest between I/O cycles
    pub fn cycle_rest(&self) -> Duration {
        if self.rest_cpu {
            Duration::from_millis(self.cycle_rest_ms)
        } else {
            Duration::ZERO
        }
    }

    /// Line settings handed to the transport provider
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            baud_rate: self.baud_rate,
            timeout: self.timeout(),
            data_bits: self.data_bits,
            parity: self.parity,
            stop_bits: self.stop_bits,
            flow_control: self.flow_control,
        }
    }
}
