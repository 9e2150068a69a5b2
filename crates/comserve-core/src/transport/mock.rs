//! In-memory transport for tests and demos.
//!
//! [`MockProvider`] hands out [`Transport`]s backed by [`MockPort`]s. A test
//! keeps a clone of the port to inject device output, inspect what was
//! written, throttle writes, or simulate the device being unplugged.
//!
//! # Example
//!
//! ```
//! use comserve_core::transport::mock::MockProvider;
//!
//! let provider = MockProvider::new();
//! let port = provider.add_port("/dev/ttyMOCK0");
//! port.add_reply(b"PING\r\n", b"PONG\r\n");
//! ```

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{PortInfo, PortSettings, Transport, TransportError, TransportProvider};

#[derive(Debug, Default)]
struct PortState {
    inbound: VecDeque<u8>,
    written: Vec<Bytes>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    echo: bool,
    writes_per_cycle: Option<usize>,
    writes_left: Option<usize>,
    unplugged: bool,
    open: bool,
    opens: usize,
    timeout: Option<Duration>,
}

/// Device side of a mock serial port
#[derive(Debug, Clone)]
pub struct MockPort {
    name: String,
    state: Arc<Mutex<PortState>>,
}

impl MockPort {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(PortState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Port name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make bytes available to the next read, as if the device sent them
    pub fn inject(&self, data: &[u8]) {
        self.lock().inbound.extend(data.iter().copied());
    }

    /// Every payload written so far, one entry per write call
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.iter().map(|b| b.to_vec()).collect()
    }

    /// Answer `response` whenever exactly `request` is written
    pub fn add_reply(&self, request: &[u8], response: &[u8]) {
        self.lock()
            .replies
            .push((request.to_vec(), response.to_vec()));
    }

    /// Loop every written payload back as inbound data
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    /// Accept at most `limit` writes between two reads.
    ///
    /// The I/O loop reads once per cycle, so this caps writes per cycle.
    /// Writes past the limit fail with `WouldBlock`.
    pub fn limit_writes_per_cycle(&self, limit: Option<usize>) {
        let mut state = self.lock();
        state.writes_per_cycle = limit;
        state.writes_left = limit;
    }

    /// Simulate the device being removed
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    /// Put the device back after [`MockPort::unplug`]
    pub fn replug(&self) {
        self.lock().unplugged = false;
    }

    /// True while a transport holds the port open
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Number of times the port was opened
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Read timeout last applied by the connection
    pub fn timeout(&self) -> Option<Duration> {
        self.lock().timeout
    }
}

/// Transport returned by [`MockProvider::open`]
#[derive(Debug)]
pub struct MockTransport {
    port: MockPort,
    baud_rate: u32,
    closed: bool,
}

impl MockTransport {
    fn check(&self, state: &PortState) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock port closed"));
        }
        if state.unplugged {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock device unplugged"));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        self.port.name()
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.port.lock();
        self.check(&state)?;

        if let Some(left) = state.writes_left.as_mut() {
            if *left == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "write budget spent"));
            }
            *left -= 1;
        }

        state.written.push(Bytes::copy_from_slice(data));
        if state.echo {
            state.inbound.extend(data.iter().copied());
        }
        let reply = state
            .replies
            .iter()
            .find(|(request, _)| request.as_slice() == data)
            .map(|(_, response)| response.clone());
        if let Some(response) = reply {
            state.inbound.extend(response);
        }
        Ok(())
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let mut state = self.port.lock();
        self.check(&state)?;
        state.writes_left = state.writes_per_cycle;
        Ok(state.inbound.drain(..).collect())
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.port.lock().open = false;
        }
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.port.timeout()
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut state = self.port.lock();
        self.check(&state)?;
        state.timeout = timeout;
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[derive(Debug, Default)]
struct ProviderState {
    ports: HashMap<String, MockPort>,
    attempts: Vec<String>,
}

/// Provider of mock ports, cheap to clone and share with a connection
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockProvider {
    /// Provider with no ports
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an openable port and return its device side
    pub fn add_port(&self, name: &str) -> MockPort {
        self.lock()
            .ports
            .entry(name.to_string())
            .or_insert_with(|| MockPort::new(name))
            .clone()
    }

    /// Device side of a registered port
    pub fn port(&self, name: &str) -> Option<MockPort> {
        self.lock().ports.get(name).cloned()
    }

    /// Port names passed to `open`, in call order
    pub fn open_attempts(&self) -> Vec<String> {
        self.lock().attempts.clone()
    }
}

impl TransportProvider for MockProvider {
    fn open(&self, port: &str, settings: &PortSettings) -> Result<Box<dyn Transport>, TransportError> {
        let mut provider = self.lock();
        provider.attempts.push(port.to_string());

        let mock = provider.ports.get(port).cloned().ok_or_else(|| TransportError::Open {
            port: port.to_string(),
            reason: "no such device".to_string(),
        })?;
        drop(provider);

        {
            let mut state = mock.lock();
            if state.unplugged {
                return Err(TransportError::Open {
                    port: port.to_string(),
                    reason: "device unplugged".to_string(),
                });
            }
            if state.open {
                return Err(TransportError::Open {
                    port: port.to_string(),
                    reason: "device busy".to_string(),
                });
            }
            state.open = true;
            state.opens += 1;
            state.timeout = settings.timeout;
            state.inbound.clear();
            state.writes_left = state.writes_per_cycle;
        }

        Ok(Box::new(MockTransport {
            port: mock,
            baud_rate: settings.baud_rate,
            closed: false,
        }))
    }

    fn available_ports(&self) -> Vec<PortInfo> {
        let provider = self.lock();
        let mut ports: Vec<PortInfo> = provider
            .ports
            .values()
            .filter(|p| !p.lock().unplugged)
            .map(|p| PortInfo {
                description: "Mock serial port".to_string(),
                ..PortInfo::named(p.name())
            })
            .collect();
        ports.sort_by(|a, b| a.name.cmp(&b.name));
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_open_unknown_port_fails() {
        let provider = MockProvider::new();
        assert!(provider.open("nope", &PortSettings::default()).is_err());
        assert_eq!(provider.open_attempts(), vec!["nope".to_string()]);
    }

    #[test]
    fn test_reply_and_echo() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        port.add_reply(b"PING", b"PONG");

        let mut t = provider.open("A", &PortSettings::default()).unwrap();
        t.write(b"PING").unwrap();
        assert_eq!(t.read_available().unwrap(), b"PONG".to_vec());

        port.set_echo(true);
        t.write(b"hi").unwrap();
        assert_eq!(t.read_available().unwrap(), b"hi".to_vec());
        assert_eq!(port.written(), vec![b"PING".to_vec(), b"hi".to_vec()]);
    }

    #[test]
    fn test_write_budget_resets_on_read() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        port.limit_writes_per_cycle(Some(1));

        let mut t = provider.open("A", &PortSettings::default()).unwrap();
        t.write(b"1").unwrap();
        let err = t.write(b"2").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        t.read_available().unwrap();
        t.write(b"2").unwrap();
    }

    #[test]
    fn test_unplug_breaks_io_and_hides_port() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let mut t = provider.open("A", &PortSettings::default()).unwrap();

        port.unplug();
        assert_eq!(t.read_available().unwrap_err().kind(), io::ErrorKind::BrokenPipe);
        assert!(provider.available_ports().is_empty());

        t.close().unwrap();
        assert!(!port.is_open());
        assert!(provider.open("A", &PortSettings::default()).is_err());
    }
}
