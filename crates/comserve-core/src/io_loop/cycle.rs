use std::io;
use std::time::{Duration, Instant};

use super::{Framer, FramingConfig, IoCycle};
use crate::queue::{ReceiveQueue, SendQueue};
use crate::transport::{is_transient, Transport};

/// Default time the send drain may hold the transport in one cycle
pub const DEFAULT_DRAIN_BUDGET: Duration = Duration::from_millis(500);

/// Drain the send queue, then pull in whatever the device has buffered.
#[derive(Debug, Clone)]
pub struct DefaultCycle {
    framer: Framer,
    drain_budget: Duration,
}

impl DefaultCycle {
    /// Cycle with the given framing and the default drain budget
    pub fn new(framing: FramingConfig) -> Self {
        Self {
            framer: Framer::new(framing),
            drain_budget: DEFAULT_DRAIN_BUDGET,
        }
    }

    /// Limit how long one cycle may spend writing
    pub fn with_drain_budget(mut self, budget: Duration) -> Self {
        self.drain_budget = budget;
        self
    }

    /// Write queued payloads until the queue is empty, the budget is spent,
    /// or the transport pushes back. Returns how many were written.
    pub fn drain(
        &self,
        transport: &mut dyn Transport,
        send: &mut SendQueue,
    ) -> io::Result<usize> {
        let started = Instant::now();
        let mut written = 0;

        while let Ok(payload) = send.front() {
            if written > 0 && started.elapsed() >= self.drain_budget {
                tracing::trace!(written, pending = send.len(), "send drain budget spent");
                break;
            }
            let payload = payload.clone();
            match transport.write(&payload) {
                Ok(()) => {
                    let _ = send.pop();
                    written += 1;
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Read all buffered bytes, frame them and append to `receive`.
    /// Returns the number of frames added.
    pub fn fill(
        &mut self,
        transport: &mut dyn Transport,
        receive: &mut ReceiveQueue,
    ) -> io::Result<usize> {
        let data = match transport.read_available() {
            Ok(data) => data,
            Err(e) if is_transient(&e) => return Ok(0),
            Err(e) => return Err(e),
        };
        if data.is_empty() {
            return Ok(0);
        }

        let frames = self.framer.feed(&data);
        let count = frames.len();
        receive.push(frames);
        Ok(count)
    }
}

impl Default for DefaultCycle {
    fn default() -> Self {
        Self::new(FramingConfig::default())
    }
}

impl IoCycle for DefaultCycle {
    fn run(
        &mut self,
        transport: &mut dyn Transport,
        send: &mut SendQueue,
        receive: &mut ReceiveQueue,
    ) -> io::Result<()> {
        self.drain(transport, send)?;
        self.fill(transport, receive)?;
        Ok(())
    }

    fn reset(&mut self) {
        self.framer.reset();
    }
}
