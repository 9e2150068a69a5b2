//! Background I/O loop
//!
//! One thread per connection owns the transport. Each cycle it:
//! 1. copies both live queues into private working copies under the lock,
//! 2. runs an [`IoCycle`] on the working copies (write, then read),
//! 3. reconciles the copies back under the lock,
//! 4. rests for a configurable interval.
//!
//! The lock is never held while the transport is busy. The loop ends when
//! the stop flag is raised or the cycle returns a fatal transport error.

mod cycle;
mod framing;

pub use cycle::{DefaultCycle, DEFAULT_DRAIN_BUDGET};
pub use framing::{Framer, FramingConfig};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::queue::{ReceiveQueue, SendQueue};
use crate::transport::Transport;

/// Default rest between cycles
pub const DEFAULT_CYCLE_REST: Duration = Duration::from_millis(10);

/// One iteration of the I/O loop, run on private copies of the queues.
///
/// Implementations may pop from `send` and push to `receive`. Whatever was
/// popped is removed from the live send queue afterwards; anything pushed
/// to the live queue meanwhile is kept.
///
/// Closures with the same signature implement this trait:
///
/// ```
/// use comserve_core::io_loop::IoCycle;
/// use comserve_core::queue::{ReceiveQueue, SendQueue};
/// use comserve_core::transport::Transport;
///
/// let cycle = |t: &mut dyn Transport, send: &mut SendQueue, rcv: &mut ReceiveQueue| -> std::io::Result<()> {
///     while let Ok(payload) = send.pop() {
///         t.write(&payload)?;
///     }
///     let data = t.read_available()?;
///     if !data.is_empty() {
///         rcv.push([data]);
///     }
///     Ok(())
/// };
/// let _boxed: Box<dyn IoCycle> = Box::new(cycle);
/// ```
pub trait IoCycle: Send {
    /// Run one cycle. An error ends the connection.
    fn run(
        &mut self,
        transport: &mut dyn Transport,
        send: &mut SendQueue,
        receive: &mut ReceiveQueue,
    ) -> io::Result<()>;

    /// Called each time a loop starts on a freshly opened transport
    fn reset(&mut self) {}
}

impl<F> IoCycle for F
where
    F: FnMut(&mut dyn Transport, &mut SendQueue, &mut ReceiveQueue) -> io::Result<()> + Send,
{
    fn run(
        &mut self,
        transport: &mut dyn Transport,
        send: &mut SendQueue,
        receive: &mut ReceiveQueue,
    ) -> io::Result<()> {
        self(transport, send, receive)
    }
}

/// The live queues, always touched together under one lock
#[derive(Debug)]
pub(crate) struct Queues {
    pub send: SendQueue,
    pub receive: ReceiveQueue,
}

/// State shared between caller threads and the I/O thread
#[derive(Debug)]
pub(crate) struct Shared {
    queues: Mutex<Queues>,
    /// Signalled after every cycle that added frames, and when the loop exits
    arrived: Condvar,
    stop: AtomicBool,
    alive: AtomicBool,
    pending_timeout: Mutex<Option<Option<Duration>>>,
}

impl Shared {
    pub fn new(receive: ReceiveQueue) -> Self {
        Self {
            queues: Mutex::new(Queues {
                send: SendQueue::new(),
                receive,
            }),
            arrived: Condvar::new(),
            stop: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            pending_timeout: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the next arrival or until `timeout` passes
    pub fn wait<'a>(&self, guard: MutexGuard<'a, Queues>, timeout: Duration) -> MutexGuard<'a, Queues> {
        match self.arrived.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// True while the I/O thread is running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Ask the loop to apply a new read timeout at the start of its next cycle
    pub fn set_transport_timeout(&self, timeout: Option<Duration>) {
        *self
            .pending_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(timeout);
    }

    fn take_pending_timeout(&self) -> Option<Option<Duration>> {
        self.pending_timeout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Why a loop ended
#[derive(Debug)]
pub(crate) enum LoopExit {
    Stopped,
    Failed(io::Error),
}

/// Marks the loop dead and wakes waiters however the thread ends, including by panic
struct AliveGuard(Arc<Shared>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
        self.0.arrived.notify_all();
    }
}

/// Handle to a running I/O thread
pub(crate) struct IoLoop {
    shared: Arc<Shared>,
    handle: JoinHandle<Box<dyn IoCycle>>,
}

impl IoLoop {
    /// Start the loop on its own thread.
    ///
    /// `on_exit` runs on the I/O thread after the transport is closed. When
    /// the transport failed, both queues are emptied before the loop is
    /// marked dead.
    pub fn spawn(
        shared: Arc<Shared>,
        mut transport: Box<dyn Transport>,
        mut cycle: Box<dyn IoCycle>,
        rest: Duration,
        on_exit: impl FnOnce(LoopExit) + Send + 'static,
    ) -> io::Result<Self> {
        shared.stop.store(false, Ordering::Release);
        shared.alive.store(true, Ordering::Release);

        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("serial-io-{}", transport.name()))
            .spawn(move || {
                let guard = AliveGuard(thread_shared.clone());
                cycle.reset();
                let exit = run(&thread_shared, transport.as_mut(), cycle.as_mut(), rest);
                if let Err(e) = transport.close() {
                    tracing::warn!(port = transport.name(), error = %e, "closing transport failed");
                }
                drop(transport);
                if matches!(exit, LoopExit::Failed(_)) {
                    // Nothing queued survives a lost port
                    let mut q = thread_shared.lock();
                    q.send.clear();
                    q.receive.clear();
                }
                drop(guard);
                on_exit(exit);
                cycle
            });

        match spawned {
            Ok(handle) => Ok(Self { shared, handle }),
            Err(e) => {
                shared.alive.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// True once the thread has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Raise the stop flag and wait for the thread.
    ///
    /// Returns the cycle so the next connection can reuse it, or `None` if
    /// the cycle panicked.
    pub fn stop(self) -> Option<Box<dyn IoCycle>> {
        self.shared.request_stop();
        match self.handle.join() {
            Ok(cycle) => Some(cycle),
            Err(_) => {
                tracing::error!("I/O cycle panicked");
                None
            }
        }
    }
}

fn run(
    shared: &Shared,
    transport: &mut dyn Transport,
    cycle: &mut dyn IoCycle,
    rest: Duration,
) -> LoopExit {
    tracing::debug!(port = transport.name(), "I/O loop started");

    loop {
        if shared.stop.load(Ordering::Acquire) {
            tracing::debug!(port = transport.name(), "I/O loop stopped");
            return LoopExit::Stopped;
        }

        if let Some(timeout) = shared.take_pending_timeout() {
            if let Err(e) = transport.set_timeout(timeout) {
                tracing::warn!(error = %e, "failed to apply transport timeout");
            }
        }

        let (mut send, mut receive, pushed_before) = {
            let q = shared.lock();
            (q.send.clone(), q.receive.clone(), q.receive.total_pushed())
        };
        let send_before = send.len();

        let result = cycle.run(transport, &mut send, &mut receive);

        let arrived = receive.total_pushed().saturating_sub(pushed_before);
        {
            let mut q = shared.lock();
            q.send.discard_front(send_before.saturating_sub(send.len()));
            q.receive = receive;
        }
        if arrived > 0 {
            shared.arrived.notify_all();
        }

        if let Err(e) = result {
            tracing::warn!(port = transport.name(), error = %e, "transport failed, I/O loop exiting");
            return LoopExit::Failed(e);
        }

        if rest.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockProvider;
    use crate::transport::{PortSettings, TransportProvider};
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_loop_moves_data_both_ways() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let transport = provider.open("A", &PortSettings::default()).unwrap();
        let shared = Arc::new(Shared::new(ReceiveQueue::new(16).unwrap()));

        let io = IoLoop::spawn(
            shared.clone(),
            transport,
            Box::new(DefaultCycle::default()),
            Duration::from_millis(1),
            |_| {},
        )
        .unwrap();

        shared.lock().send.push(b"hello".to_vec());
        port.inject(b"world");

        assert!(wait_for(|| shared.lock().receive.len() == 1));
        assert!(wait_for(|| shared.lock().send.is_empty()));
        assert_eq!(port.written(), vec![b"hello".to_vec()]);

        assert!(io.stop().is_some());
        assert!(!shared.is_alive());
        assert!(!port.is_open());
    }

    #[test]
    fn test_concurrent_pushes_survive_partial_drain() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        port.limit_writes_per_cycle(Some(1));
        let transport = provider.open("A", &PortSettings::default()).unwrap();
        let shared = Arc::new(Shared::new(ReceiveQueue::new(16).unwrap()));

        for i in 0..5u8 {
            shared.lock().send.push(vec![i]);
        }

        // Push more while the first cycle is inside the transport
        let inner_shared = shared.clone();
        let mut first = true;
        let cycle = move |t: &mut dyn Transport, send: &mut SendQueue, rcv: &mut ReceiveQueue| {
            if first {
                first = false;
                inner_shared.lock().send.push(vec![100]);
            }
            DefaultCycle::default().run(t, send, rcv)
        };

        let io = IoLoop::spawn(
            shared.clone(),
            transport,
            Box::new(cycle),
            Duration::from_millis(1),
            |_| {},
        )
        .unwrap();

        assert!(wait_for(|| shared.lock().send.is_empty()));
        io.stop();

        let expected: Vec<Vec<u8>> = vec![vec![0], vec![1], vec![2], vec![3], vec![4], vec![100]];
        assert_eq!(port.written(), expected);
    }

    #[test]
    fn test_transport_failure_ends_loop() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let transport = provider.open("A", &PortSettings::default()).unwrap();
        let shared = Arc::new(Shared::new(ReceiveQueue::new(16).unwrap()));
        let (tx, rx) = mpsc::channel();

        let io = IoLoop::spawn(
            shared.clone(),
            transport,
            Box::new(DefaultCycle::default()),
            Duration::from_millis(1),
            move |exit| {
                let _ = tx.send(matches!(exit, LoopExit::Failed(_)));
            },
        )
        .unwrap();

        port.unplug();
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(wait_for(|| io.is_finished()));
        assert!(!shared.is_alive());
        assert!(!port.is_open());
    }

    #[test]
    fn test_transport_failure_empties_queues() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let transport = provider.open("A", &PortSettings::default()).unwrap();
        let shared = Arc::new(Shared::new(ReceiveQueue::new(16).unwrap()));

        // Every write is refused, so sends stay queued
        port.limit_writes_per_cycle(Some(0));
        let io = IoLoop::spawn(
            shared.clone(),
            transport,
            Box::new(DefaultCycle::default()),
            Duration::from_millis(1),
            |_| {},
        )
        .unwrap();

        port.inject(b"late");
        assert!(wait_for(|| shared.lock().receive.len() == 1));
        shared.lock().send.push(b"stuck".to_vec());

        port.unplug();
        assert!(wait_for(|| !shared.is_alive()));
        let q = shared.lock();
        assert!(q.send.is_empty());
        assert!(q.receive.is_empty());
        drop(q);
        assert!(wait_for(|| io.is_finished()));
    }

    #[test]
    fn test_pending_timeout_is_applied() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let transport = provider.open("A", &PortSettings::default()).unwrap();
        let shared = Arc::new(Shared::new(ReceiveQueue::new(16).unwrap()));

        let io = IoLoop::spawn(
            shared.clone(),
            transport,
            Box::new(DefaultCycle::default()),
            Duration::from_millis(1),
            |_| {},
        )
        .unwrap();

        shared.set_transport_timeout(None);
        assert!(wait_for(|| port.timeout().is_none()));
        io.stop();
    }
}
