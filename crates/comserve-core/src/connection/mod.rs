//! Connection core
//!
//! A [`Connection`] owns one serial port at a time, chosen from a list of
//! candidates. While connected, a background I/O loop moves bytes between
//! the port and two queues; callers enqueue payloads with
//! [`Connection::send`] and read timestamped frames back with
//! [`Connection::receive`], [`Connection::get`] and the `wait_*` helpers.
//!
//! All methods take `&self`, so a connection can be shared across threads
//! behind an `Arc`.

mod config;
mod error;
mod events;
mod normalize;
mod response;

pub use config::{
    ConfigError, ConnectionConfig, DEFAULT_RETRY_INTERVAL_MS, DEFAULT_SEND_INTERVAL_MS,
    DEFAULT_SETTLE_MS, DEFAULT_TIMEOUT_MS,
};
pub use error::ConnectionError;
pub use events::{ConnectionEvent, DisconnectReason};
pub use normalize::{encode, normalize, SendOptions, SendValue};
pub use response::{conv_bytes_to_str, Expected};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::io_loop::{DefaultCycle, IoCycle, IoLoop, LoopExit, Queues, Shared};
use crate::queue::{Frame, ReceiveQueue};
use crate::transport::{PortInfo, SerialProvider, Transport, TransportProvider};

/// Longest single condvar wait; waits re-check connection state this often
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Shortest resend window used by [`Connection::send_for_response`]
const MIN_RESEND_WINDOW: Duration = Duration::from_millis(100);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No I/O loop is running
    Disconnected,
    /// Opening candidate ports
    Connecting,
    /// A port is open and the I/O loop is running
    Connected,
}

/// Running loop plus the cycle parked between connections
struct Link {
    io: Option<IoLoop>,
    cycle: Option<Box<dyn IoCycle>>,
}

/// Settings that may change while connected
#[derive(Debug, Clone, Copy)]
struct Timing {
    timeout: Option<Duration>,
    send_interval: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Builder for a [`Connection`] with a non-default provider, clock or cycle
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    provider: Arc<dyn TransportProvider>,
    clock: Arc<dyn Clock>,
    cycle: Option<Box<dyn IoCycle>>,
}

impl ConnectionBuilder {
    /// Open ports through `provider` instead of the system serial ports
    pub fn provider(mut self, provider: Arc<dyn TransportProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Timestamp frames and rate-limit sends with `clock`
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default drain-then-fill cycle
    pub fn cycle(mut self, cycle: impl IoCycle + 'static) -> Self {
        self.cycle = Some(Box::new(cycle));
        self
    }

    /// Validate the configuration and create a disconnected connection
    pub fn build(self) -> Result<Connection, ConnectionError> {
        self.config.validate()?;

        let receive = ReceiveQueue::with_clock(self.config.queue_size, self.clock.clone())?;
        let (events, _) = broadcast::channel(events::EVENT_CHANNEL_CAPACITY);
        let timing = Timing {
            timeout: self.config.timeout(),
            send_interval: self.config.send_interval(),
        };

        Ok(Connection {
            id: Uuid::new_v4(),
            config: self.config,
            provider: self.provider,
            clock: self.clock,
            shared: Arc::new(Shared::new(receive)),
            link: Mutex::new(Link {
                io: None,
                cycle: self.cycle,
            }),
            connecting: AtomicBool::new(false),
            active_port: Mutex::new(None),
            timing: Mutex::new(timing),
            last_sent: Mutex::new(None),
            last_received: Mutex::new(f64::NEG_INFINITY),
            events,
        })
    }
}

/// Serial connection over one of several candidate ports
pub struct Connection {
    id: Uuid,
    config: ConnectionConfig,
    provider: Arc<dyn TransportProvider>,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    /// Held across connect, reconnect and disconnect
    link: Mutex<Link>,
    connecting: AtomicBool,
    active_port: Mutex<Option<String>>,
    timing: Mutex<Timing>,
    last_sent: Mutex<Option<f64>>,
    last_received: Mutex<f64>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Connection {
    /// Connection over the system serial ports with the system clock
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        Self::builder(config).build()
    }

    /// Start building a connection
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder {
            config,
            provider: Arc::new(SerialProvider),
            clock: Arc::new(SystemClock::new()),
            cycle: None,
        }
    }

    /// Connection using the given transport provider
    pub fn with_provider(
        config: ConnectionConfig,
        provider: Arc<dyn TransportProvider>,
    ) -> Result<Self, ConnectionError> {
        Self::builder(config).provider(provider).build()
    }

    /// Unique id of this connection, used in log fields
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the connection was built with
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Candidate ports in the order they are tried
    pub fn ports(&self) -> &[String] {
        &self.config.ports
    }

    /// Baud rate
    pub fn baud_rate(&self) -> u32 {
        self.config.baud_rate
    }

    /// Receive history capacity
    pub fn queue_capacity(&self) -> usize {
        self.config.queue_size
    }

    /// Ports currently visible to the transport provider
    pub fn list_ports(&self) -> Vec<PortInfo> {
        self.provider.available_ports()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        if self.shared.is_alive() {
            ConnectionState::Connected
        } else if self.connecting.load(Ordering::Acquire) {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// True while the I/O loop is running
    pub fn is_connected(&self) -> bool {
        self.shared.is_alive()
    }

    /// Port opened by the most recent successful connect
    pub fn port(&self) -> Option<String> {
        lock(&self.active_port).clone()
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Response timeout, `None` for no timeout
    pub fn timeout(&self) -> Option<Duration> {
        lock(&self.timing).timeout
    }

    /// Change the response timeout. Also applied to an open port.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        lock(&self.timing).timeout = timeout;
        if self.is_connected() {
            self.shared.set_transport_timeout(timeout);
        }
    }

    /// Change the response timeout in seconds. Infinity means no timeout.
    pub fn set_timeout_secs(&self, secs: f64) -> Result<(), ConnectionError> {
        let timeout = secs_to_duration(secs)?;
        self.set_timeout(timeout);
        Ok(())
    }

    /// Minimum spacing between accepted sends
    pub fn send_interval(&self) -> Duration {
        lock(&self.timing).send_interval
    }

    /// Change the minimum spacing between accepted sends; zero disables it
    pub fn set_send_interval(&self, interval: Duration) {
        lock(&self.timing).send_interval = interval;
    }

    /// Change the minimum send spacing in seconds
    pub fn set_send_interval_secs(&self, secs: f64) -> Result<(), ConnectionError> {
        let interval = secs_to_duration(secs)?.unwrap_or(Duration::MAX);
        self.set_send_interval(interval);
        Ok(())
    }

    /// Payloads waiting to be written
    pub fn pending_sends(&self) -> usize {
        self.shared.lock().send.len()
    }

    /// Frames held in the receive history
    pub fn received_count(&self) -> usize {
        self.shared.lock().receive.len()
    }

    /// Copy of the receive history, oldest first
    pub fn received_frames(&self) -> Vec<Frame> {
        self.shared.lock().receive.snapshot()
    }

    /// Open the first candidate port that works and start the I/O loop.
    ///
    /// Fails with [`ConnectionError::AlreadyConnected`] while connected and
    /// with [`ConnectionError::NoPortAvailable`] when no candidate opens.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        let mut link = lock(&self.link);
        self.reap(&mut link);
        if link.io.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.connecting.store(true, Ordering::Release);
        let result = self.open_first(&mut link);
        self.connecting.store(false, Ordering::Release);
        result
    }

    /// Stop the I/O loop, close the port and clear both queues.
    ///
    /// Does nothing when already disconnected.
    pub fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::Requested);
    }

    pub(crate) fn disconnect_with(&self, reason: DisconnectReason) {
        let mut link = lock(&self.link);
        let Some(io) = link.io.take() else {
            return;
        };

        let was_alive = self.shared.is_alive();
        link.cycle = io.stop();
        self.clear_queues();

        let port = self.port().unwrap_or_default();
        if was_alive {
            tracing::info!(id = %self.id, port = %port, ?reason, "disconnected");
            self.emit(ConnectionEvent::Disconnected { port, reason });
        }
    }

    /// Retry [`Connection::connect`] until a port opens or `timeout` passes.
    ///
    /// `None` retries forever. Candidates are rescanned every
    /// `retry_interval_ms`.
    pub fn reconnect(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let mut link = lock(&self.link);
        self.reap(&mut link);
        if link.io.is_some() {
            return Err(ConnectionError::AlreadyConnected);
        }

        self.connecting.store(true, Ordering::Release);
        let result = self.retry_open(&mut link, timeout);
        self.connecting.store(false, Ordering::Release);
        result
    }

    fn retry_open(&self, link: &mut Link, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let deadline = timeout.and_then(|t| started.checked_add(t));
        let retry_interval = Duration::from_millis(self.config.retry_interval_ms);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.emit(ConnectionEvent::Reconnecting { attempt });
            match self.open_first(link) {
                Ok(()) => return Ok(()),
                Err(ConnectionError::NoPortAvailable { tried }) => {
                    tracing::debug!(id = %self.id, attempt, ?tried, "reconnect attempt failed");
                }
                Err(e) => return Err(e),
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(id = %self.id, attempts = attempt, "reconnect timed out");
                        return Err(ConnectionError::ReconnectTimeout(started.elapsed()));
                    }
                    retry_interval.min(deadline - now)
                }
                None => retry_interval,
            };
            thread::sleep(pause);
        }
    }

    /// Clean up after a loop that died on its own
    fn reap(&self, link: &mut Link) {
        let dead = matches!(&link.io, Some(_) if !self.shared.is_alive());
        if !dead {
            return;
        }
        if let Some(io) = link.io.take() {
            link.cycle = io.stop();
            self.clear_queues();
        }
    }

    fn open_first(&self, link: &mut Link) -> Result<(), ConnectionError> {
        let settings = {
            let mut settings = self.config.port_settings();
            settings.timeout = self.timeout();
            settings
        };

        let mut tried = Vec::with_capacity(self.config.ports.len());
        for port in &self.config.ports {
            match self.provider.open(port, &settings) {
                Ok(transport) => return self.start(link, port, transport),
                Err(e) => {
                    tracing::debug!(id = %self.id, port = %port, error = %e, "port unavailable");
                    tried.push(port.clone());
                }
            }
        }
        Err(ConnectionError::NoPortAvailable { tried })
    }

    fn start(
        &self,
        link: &mut Link,
        port: &str,
        transport: Box<dyn Transport>,
    ) -> Result<(), ConnectionError> {
        if self.config.settle_ms > 0 {
            tracing::debug!(port, settle_ms = self.config.settle_ms, "waiting for device to settle");
            thread::sleep(Duration::from_millis(self.config.settle_ms));
        }

        self.clear_queues();
        *lock(&self.last_sent) = None;
        *lock(&self.last_received) = f64::NEG_INFINITY;

        let cycle = link.cycle.take().unwrap_or_else(|| self.default_cycle());
        let events = self.events.clone();
        let id = self.id;
        let port_name = port.to_string();
        let io = IoLoop::spawn(
            self.shared.clone(),
            transport,
            cycle,
            self.config.cycle_rest(),
            move |exit| {
                if let LoopExit::Failed(e) = exit {
                    tracing::warn!(id = %id, port = %port_name, error = %e, "connection lost");
                    let _ = events.send(ConnectionEvent::Disconnected {
                        port: port_name,
                        reason: DisconnectReason::TransportLost(e.to_string()),
                    });
                }
            },
        )
        .map_err(ConnectionError::Spawn)?;

        link.io = Some(io);
        *lock(&self.active_port) = Some(port.to_string());
        tracing::info!(id = %self.id, port, baud = self.config.baud_rate, "connected");
        self.emit(ConnectionEvent::Connected {
            port: port.to_string(),
        });
        Ok(())
    }

    fn default_cycle(&self) -> Box<dyn IoCycle> {
        Box::new(
            DefaultCycle::new(self.config.framing.clone())
                .with_drain_budget(Duration::from_millis(self.config.drain_budget_ms)),
        )
    }

    fn clear_queues(&self) {
        let mut q = self.shared.lock();
        q.send.clear();
        q.receive.clear();
    }

    /// Queue values for writing with the default ending and joiner.
    ///
    /// Returns `false` when disconnected or when the previous accepted send
    /// was less than the send interval ago.
    pub fn send(&self, values: &[SendValue]) -> bool {
        self.send_with(values, &SendOptions::default())
    }

    /// [`Connection::send`] with an explicit ending and joiner
    pub fn send_with(&self, values: &[SendValue], options: &SendOptions) -> bool {
        if !self.is_connected() {
            tracing::debug!(id = %self.id, "send while disconnected");
            return false;
        }

        let interval = self.send_interval();
        let now = self.clock.now();
        {
            let mut last_sent = lock(&self.last_sent);
            if let Some(previous) = *last_sent {
                if now - previous < interval.as_secs_f64() {
                    tracing::trace!(id = %self.id, since_last = now - previous, "send throttled");
                    return false;
                }
            }
            *last_sent = Some(now);
        }

        let payload = encode(values, options);
        let len = payload.len();
        if !self.shared.lock().send.push(payload) {
            tracing::warn!(id = %self.id, "send queue full, payload dropped");
        } else {
            tracing::trace!(id = %self.id, len, "payload queued");
        }
        true
    }

    /// Frame `offset` positions back from the newest (0 = newest).
    ///
    /// `None` when disconnected or when the history is too short.
    pub fn receive(&self, offset: usize) -> Option<Frame> {
        if !self.is_connected() {
            return None;
        }
        let frame = self.shared.lock().receive.at(offset).cloned();
        if let Some(frame) = &frame {
            *lock(&self.last_received) = frame.timestamp();
        }
        frame
    }

    /// [`Connection::receive`] decoded with [`conv_bytes_to_str`]
    pub fn receive_str(
        &self,
        offset: usize,
        read_until: Option<&str>,
        strip: bool,
    ) -> Option<(f64, String)> {
        self.receive(offset).map(|frame| {
            let text = conv_bytes_to_str(frame.payload(), read_until, strip);
            (frame.timestamp(), text)
        })
    }

    /// Frames that arrived after the one last returned by `receive`
    pub fn available(&self) -> Result<usize, ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let since = *lock(&self.last_received);
        let q = self.shared.lock();
        Ok(q.receive.len() - q.receive.position_after(since))
    }

    /// Block until a frame newer than the call arrives, or the timeout passes
    pub fn get(&self) -> Option<Frame> {
        let since = self.clock.now();
        self.next_frame_after(since, self.timeout())
    }

    /// Block until a frame matching `expected` arrives after `after`
    /// (default: now), or the timeout passes.
    pub fn wait_for_response(&self, expected: &Expected, after: Option<f64>) -> bool {
        let after = after.unwrap_or_else(|| self.clock.now());
        self.wait_matching(expected, after, self.timeout())
    }

    /// Send `values` repeatedly until a matching response arrives or the
    /// timeout passes.
    ///
    /// Each send is followed by a wait of one send interval (at least
    /// 100 ms). Responses to any of the sends count.
    pub fn send_for_response(&self, expected: &Expected, values: &[SendValue]) -> bool {
        let started = self.clock.now();
        let deadline = deadline_after(self.timeout());

        loop {
            if !self.is_connected() {
                return false;
            }
            self.send(values);

            let mut window = self.send_interval().max(MIN_RESEND_WINDOW);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                window = window.min(deadline - now);
            }
            if self.wait_matching(expected, started, Some(window)) {
                return true;
            }
        }
    }

    /// Send `values` once and return the first frame that follows
    pub fn get_first_response(&self, values: &[SendValue]) -> Option<Frame> {
        let since = self.clock.now();
        if !self.send(values) {
            return None;
        }
        self.next_frame_after(since, self.timeout())
    }

    fn next_frame_after(&self, since: f64, timeout: Option<Duration>) -> Option<Frame> {
        self.wait_until(timeout, |q| q.receive.find_after(since).cloned())
    }

    fn wait_matching(&self, expected: &Expected, after: f64, timeout: Option<Duration>) -> bool {
        self.wait_until(timeout, |q| {
            q.receive
                .frames_after(after)
                .any(|frame| expected.matches(frame.payload()))
                .then_some(())
        })
        .is_some()
    }

    /// Re-run `check` under the queue lock after every arrival until it
    /// yields, the deadline passes or the loop dies.
    fn wait_until<T>(
        &self,
        timeout: Option<Duration>,
        mut check: impl FnMut(&Queues) -> Option<T>,
    ) -> Option<T> {
        let deadline = deadline_after(timeout);
        let mut queues = self.shared.lock();
        loop {
            if let Some(found) = check(&queues) {
                return Some(found);
            }
            if !self.shared.is_alive() {
                return None;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(WAIT_SLICE)
                }
                None => WAIT_SLICE,
            };
            queues = self.shared.wait(queues, slice);
        }
    }
}

/// Deadline `timeout` from now. Timeouts too long to represent as an
/// `Instant` wait forever.
fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Seconds to a timeout. Infinity and values beyond `Duration` mean none.
fn secs_to_duration(secs: f64) -> Result<Option<Duration>, ConnectionError> {
    if secs.is_nan() || secs < 0.0 {
        return Err(ConnectionError::InvalidTimeout(secs));
    }
    Ok(Duration::try_from_secs_f64(secs).ok())
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("port", &self.port())
            .field("ports", &self.config.ports)
            .field("timeout", &self.timeout())
            .field("send_interval", &self.send_interval())
            .field("queue_size", &self.config.queue_size)
            .finish()
    }
}
