//! Shared access for request/response servers
//!
//! A server exposing one serial device to many clients needs two things the
//! bare [`Connection`] does not give it: async-friendly versions of the
//! blocking waits, and a way for one client to hold the device across a
//! whole request/response exchange. [`SharedConnection`] adds an advisory
//! lock for the latter; a [`Session`] is proof of holding it.
//!
//! The lock is advisory. Code that bypasses it and calls the connection
//! directly is not stopped.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task;

use crate::connection::{Connection, ConnectionError, Expected, SendValue};
use crate::queue::Frame;

/// Cloneable handle to a connection and its advisory lock
#[derive(Debug, Clone)]
pub struct SharedConnection {
    conn: Arc<Connection>,
    lock: Arc<Mutex<()>>,
}

impl SharedConnection {
    /// Wrap a connection
    pub fn new(conn: Connection) -> Self {
        Self::from_arc(Arc::new(conn))
    }

    /// Wrap a connection that is already shared
    pub fn from_arc(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying connection
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Take the lock if nobody holds it
    pub fn try_session(&self) -> Option<Session> {
        let guard = self.lock.clone().try_lock_owned().ok()?;
        Some(Session {
            conn: self.conn.clone(),
            _guard: guard,
        })
    }

    /// Wait for the lock
    pub async fn session(&self) -> Session {
        let guard = self.lock.clone().lock_owned().await;
        Session {
            conn: self.conn.clone(),
            _guard: guard,
        }
    }

    /// True while some session holds the lock
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

/// Exclusive use of a connection until dropped.
///
/// Derefs to [`Connection`] for the non-blocking calls. The blocking waits
/// have async versions here that run on tokio's blocking pool.
#[derive(Debug)]
pub struct Session {
    conn: Arc<Connection>,
    _guard: OwnedMutexGuard<()>,
}

impl Deref for Session {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

async fn blocking<T, F>(conn: &Arc<Connection>, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> T + Send + 'static,
{
    let conn = conn.clone();
    match task::spawn_blocking(move || f(&conn)).await {
        Ok(value) => value,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

impl Session {
    /// Async [`Connection::get`]
    pub async fn get(&self) -> Option<Frame> {
        blocking(&self.conn, |c| c.get()).await
    }

    /// Async [`Connection::wait_for_response`]
    pub async fn wait_for_response(&self, expected: Expected, after: Option<f64>) -> bool {
        blocking(&self.conn, move |c| c.wait_for_response(&expected, after)).await
    }

    /// Async [`Connection::send_for_response`]
    pub async fn send_for_response(&self, expected: Expected, values: Vec<SendValue>) -> bool {
        blocking(&self.conn, move |c| c.send_for_response(&expected, &values)).await
    }

    /// Async [`Connection::get_first_response`]
    pub async fn get_first_response(&self, values: Vec<SendValue>) -> Option<Frame> {
        blocking(&self.conn, move |c| c.get_first_response(&values)).await
    }

    /// Async [`Connection::reconnect`]
    pub async fn reconnect(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        blocking(&self.conn, move |c| c.reconnect(timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use crate::transport::mock::MockProvider;
    use pretty_assertions::assert_eq;

    fn shared(provider: &MockProvider) -> SharedConnection {
        let config = ConnectionConfig {
            settle_ms: 0,
            cycle_rest_ms: 1,
            send_interval_ms: 0,
            timeout_ms: Some(1000),
            ..ConnectionConfig::new(["A"])
        };
        let conn = Connection::with_provider(config, Arc::new(provider.clone())).unwrap();
        conn.connect().unwrap();
        SharedConnection::new(conn)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_try_session_is_exclusive() {
        let provider = MockProvider::new();
        provider.add_port("A");
        let shared = shared(&provider);

        let session = shared.try_session().unwrap();
        assert!(shared.is_busy());
        assert!(shared.clone().try_session().is_none());

        drop(session);
        assert!(!shared.is_busy());
        assert!(shared.try_session().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_waits_for_release() {
        let provider = MockProvider::new();
        provider.add_port("A");
        let shared = shared(&provider);

        let first = shared.session().await;
        let other = shared.clone();
        let waiter = tokio::spawn(async move {
            let session = other.session().await;
            session.is_connected()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(first);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_request_response() {
        let provider = MockProvider::new();
        let port = provider.add_port("A");
        port.add_reply(b"PING\r\n", b"PONG\r\n");
        let shared = shared(&provider);

        let session = shared.session().await;
        let frame = session
            .get_first_response(vec!["PING".into()])
            .await
            .unwrap();
        assert_eq!(frame.payload().as_ref(), b"PONG\r\n");

        assert!(
            session
                .send_for_response(Expected::text("PONG"), vec!["PING".into()])
                .await
        );
    }
}
