//! The proxy itself: TCP listener, virtual-host dispatch, the idle watcher,
//! and graceful drain on shutdown.

use crate::backend::Backend;
use crate::cloud::CloudStatus;
use crate::connection::{Connection, ConnectionHooks};
use crate::minecraft::Client;
use anyhow::Context;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Cadence of the idle watcher. Independent of, and required to be well
/// under, any backend's shutdown-after duration.
const WATCH_INTERVAL: Duration = Duration::from_secs(15);

/// How long graceful shutdown waits for logged-in connections to drain
/// before force-closing the remainder.
const DRAIN_DEADLINE: Duration = Duration::from_secs(15);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The proxy server: one listener fronting all configured backends.
pub struct Proxy {
    listener: TcpListener,
    backends: Arc<HashMap<String, Arc<Backend>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Proxy {
    /// Bind the listener. Separate from [`run`](Proxy::run) so callers can
    /// learn the bound address before serving.
    pub async fn bind(
        listen_address: &str,
        backends: Vec<Arc<Backend>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen_address)
            .await
            .with_context(|| format!("failed to listen on {listen_address}"))?;

        let backends = Arc::new(
            backends
                .into_iter()
                .map(|b| (b.hostname().to_string(), b))
                .collect::<HashMap<_, _>>(),
        );

        Ok(Self {
            listener,
            backends,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the shutdown channel fires, then drain and return.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            listener,
            backends,
            shutdown_rx,
        } = self;
        let mut shutdown_rx = shutdown_rx;

        info!(
            addr = %listener.local_addr()?,
            backends = backends.len(),
            "proxy listening"
        );

        let watcher = tokio::spawn(watch_loop(Arc::clone(&backends), shutdown_rx.clone()));

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let backends = Arc::clone(&backends);
                            // A panicking connection task dies alone inside
                            // the JoinSet; the accept loop never joins it.
                            connections.spawn(async move {
                                if let Err(e) = handle_socket(stream, addr, backends).await {
                                    error!(client = %addr, error = %e, "failed to proxy connection");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("proxy shutting down");
                        break;
                    }
                }
            }
        }

        // Stop accepting, wait for logged-in connections to drain, then
        // force-close whatever is left.
        drop(listener);
        drain(&backends).await;
        connections.shutdown().await;

        watcher.abort();
        let _ = watcher.await;

        Ok(())
    }
}

/// Poll until every backend reports zero connections or the deadline hits.
async fn drain(backends: &HashMap<String, Arc<Backend>>) {
    let deadline = Instant::now() + DRAIN_DEADLINE;

    loop {
        let open: u64 = backends.values().map(|b| b.connections()).sum();
        if open == 0 {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                connections = open,
                "drain deadline exceeded, force-closing remaining connections"
            );
            return;
        }

        debug!(connections = open, "waiting for connections to drain");
        tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
    }
}

/// Read the handshake, resolve the backend, and hand off to a connection.
async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    backends: Arc<HashMap<String, Arc<Backend>>>,
) -> anyhow::Result<()> {
    let mut client = Client::new(stream);

    let handshake = match client.handshake().await {
        Ok(handshake) => handshake,
        // Port scanners and liveness checks connect and hang up.
        Err(e) if e.is_peer_closed() => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let backend = match backends.get(&handshake.server_address) {
        Some(backend) => Arc::clone(backend),
        None => {
            warn!(client = %addr, server = %handshake.server_address, "unknown server");
            return client
                .send_disconnect(&format!("Unknown server: {}", handshake.server_address))
                .await;
        }
    };

    // Only connections that reached the login state count toward the
    // backend; the close hook must know which kind this one was.
    let reached_login = Arc::new(AtomicBool::new(false));

    let hooks = ConnectionHooks {
        on_connect: Some(Box::new({
            let backend = Arc::clone(&backend);
            move || debug!(client = %addr, server = backend.hostname(), "handling connection")
        })),
        on_status: Some(Box::new({
            let backend = Arc::clone(&backend);
            move || debug!(client = %addr, server = backend.hostname(), "status requested")
        })),
        on_login: Some(Box::new({
            let backend = Arc::clone(&backend);
            let reached_login = Arc::clone(&reached_login);
            move |login| {
                info!(
                    server = backend.hostname(),
                    player = %login.name,
                    "login initiated"
                );
                reached_login.store(true, Ordering::SeqCst);
                backend.client_connected();
            }
        })),
        on_close: Some(Box::new({
            let backend = Arc::clone(&backend);
            let reached_login = Arc::clone(&reached_login);
            move || {
                debug!(client = %addr, "connection closed");
                if reached_login.load(Ordering::SeqCst) {
                    backend.client_disconnected();
                }
            }
        })),
    };

    Connection::new(client, backend, handshake, hooks).run().await
}

/// The idle watcher: on a fixed cadence, stop any backend that has been
/// running and empty for longer than its configured shutdown-after.
async fn watch_loop(
    backends: Arc<HashMap<String, Arc<Backend>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
        }

        for backend in backends.values() {
            watch_backend(backend).await;
        }
    }
}

/// One watcher pass over a single backend.
///
/// Provider failures are logged and left alone; the next tick retries.
pub(crate) async fn watch_backend(backend: &Arc<Backend>) {
    let connections = backend.connections();
    if connections > 0 {
        info!(server = backend.hostname(), connections, "proxy status");
        return;
    }

    let status = match backend.cloud_status().await {
        Ok(status) => status,
        Err(e) => {
            error!(server = backend.hostname(), error = %e, "failed to get server status");
            return;
        }
    };
    if status != CloudStatus::Running {
        return;
    }

    let empty_since = backend.empty_since_or_now();
    let idle = empty_since.elapsed();
    let shutdown_after = backend.shutdown_after();

    if idle > shutdown_after {
        info!(
            server = backend.hostname(),
            "no connections in configured time, stopping server"
        );
        if let Err(e) = backend.stop().await {
            error!(server = backend.hostname(), error = %e, "failed to stop server");
        }
        // Restart the idle clock either way; a failed stop retries from a
        // fresh period rather than hammering the provider every tick.
        backend.clear_empty_since();
    } else {
        info!(
            server = backend.hostname(),
            connections,
            shutdown_in = ?(shutdown_after - idle),
            "proxy status"
        );
    }
}
