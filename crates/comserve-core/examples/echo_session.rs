//! Request/response over a serial port.
//!
//! Usage: `echo_session [PORT...]`
//!
//! With no ports given, runs against an in-memory echo device.
//! Set `RUST_LOG=comserve_core=debug` to watch the connection work.

use anyhow::Context;
use comserve_core::prelude::*;
use comserve_core::transport::mock::MockProvider;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ports: Vec<String> = std::env::args().skip(1).collect();
    let conn = if ports.is_empty() {
        let provider = MockProvider::new();
        provider.add_port("mock0").set_echo(true);
        let config = ConnectionConfig {
            settle_ms: 0,
            send_interval_ms: 0,
            ..ConnectionConfig::new(["mock0"])
        };
        Connection::with_provider(config, Arc::new(provider))?
    } else {
        Connection::new(ConnectionConfig::new(ports))?
    };

    let mut events = conn.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!(?event, "connection event");
        }
    });

    let conn = Arc::new(conn);
    let connector = conn.clone();
    tokio::task::spawn_blocking(move || connector.connect())
        .await?
        .context("no serial port could be opened")?;

    let shared = SharedConnection::from_arc(conn);
    let session = shared.session().await;
    match session.get_first_response(vec!["hello".into()]).await {
        Some(frame) => println!("{:.3}  {}", frame.timestamp(), frame.text().trim()),
        None => println!("no response within {:?}", session.timeout()),
    }

    let ok = session
        .send_for_response(Expected::text("ping"), vec!["ping".into()])
        .await;
    println!("ping answered: {ok}");

    session.disconnect();
    Ok(())
}
