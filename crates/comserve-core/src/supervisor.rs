//! Port supervisor
//!
//! Watches the system port list for a connection. When the connected port
//! disappears the connection is torn down with
//! [`DisconnectReason::PortRemoved`]; with `auto_reconnect` the supervisor
//! then keeps trying the candidate ports until one comes back.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::{Connection, DisconnectReason};

/// Supervisor settings
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// How often the port list is checked
    pub poll_interval: Duration,
    /// Reconnect after the port is lost
    pub auto_reconnect: bool,
    /// Budget for one reconnect pass per poll
    pub reconnect_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            auto_reconnect: false,
            reconnect_timeout: Duration::from_millis(500),
        }
    }
}

/// Background watcher for one connection. Stops when dropped.
pub struct Supervisor {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Start watching `conn`
    pub fn spawn(conn: Arc<Connection>, config: SupervisorConfig) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("serial-supervisor".to_string())
            .spawn(move || {
                tracing::debug!(id = %conn.id(), "supervisor started");
                loop {
                    match stop_rx.recv_timeout(config.poll_interval) {
                        Err(RecvTimeoutError::Timeout) => poll(&conn, &config),
                        // Stop requested or the handle is gone
                        _ => break,
                    }
                }
                tracing::debug!(id = %conn.id(), "supervisor stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the watcher and wait for it
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("supervisor thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One supervision pass
fn poll(conn: &Connection, config: &SupervisorConfig) {
    if conn.is_connected() {
        let Some(port) = conn.port() else {
            return;
        };
        let present = conn.list_ports().iter().any(|p| p.name == port);
        if !present {
            tracing::warn!(id = %conn.id(), port = %port, "port removed");
            conn.disconnect_with(DisconnectReason::PortRemoved);
        }
        return;
    }

    if config.auto_reconnect {
        match conn.reconnect(Some(config.reconnect_timeout)) {
            Ok(()) => tracing::info!(id = %conn.id(), port = ?conn.port(), "supervisor reconnected"),
            Err(e) => tracing::debug!(id = %conn.id(), error = %e, "supervisor reconnect failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, ConnectionEvent};
    use crate::transport::mock::MockProvider;
    use std::time::Instant;

    fn fast() -> SupervisorConfig {
        SupervisorConfig {
            poll_interval: Duration::from_millis(10),
            auto_reconnect: false,
            reconnect_timeout: Duration::from_millis(20),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn connection(provider: &MockProvider) -> Arc<Connection> {
        let config = ConnectionConfig {
            settle_ms: 0,
            cycle_rest_ms: 1,
            retry_interval_ms: 5,
            ..ConnectionConfig::new(["A"])
        };
        Arc::new(Connection::with_provider(config, Arc::new(provider.clone())).unwrap())
    }

    #[test]
    fn test_detects_removed_port() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let conn = connection(&provider);
        conn.connect().unwrap();
        let mut events = conn.subscribe();

        let supervisor = Supervisor::spawn(conn.clone(), fast()).unwrap();
        port.unplug();
        assert!(wait_for(|| !conn.is_connected()));
        supervisor.stop();

        // The I/O loop may notice the broken port first
        match events.blocking_recv().unwrap() {
            ConnectionEvent::Disconnected { port, reason } => {
                assert_eq!(port, "A");
                assert!(matches!(
                    reason,
                    DisconnectReason::PortRemoved | DisconnectReason::TransportLost(_)
                ));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_auto_reconnect_after_replug() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        let conn = connection(&provider);
        conn.connect().unwrap();

        let config = SupervisorConfig {
            auto_reconnect: true,
            ..fast()
        };
        let _supervisor = Supervisor::spawn(conn.clone(), config).unwrap();

        port.unplug();
        assert!(wait_for(|| !conn.is_connected()));
        port.replug();
        assert!(wait_for(|| conn.is_connected()));
        assert_eq!(port.open_count(), 2);
    }
}
