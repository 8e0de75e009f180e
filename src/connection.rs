//! Per-connection handling after the dispatcher has routed a handshake.
//!
//! A connection either serves a synthesized status response and closes, or
//! reaches login, gets the backend started (or a disconnect notice), and on
//! the happy path turns into a blind byte pipe between client and backend.

use crate::backend::Backend;
use crate::cloud::CloudStatus;
use crate::minecraft::{Client, ClientState, Handshake, LoginStart, ServerStatus};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Deadline for dialing the backend listener.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle callbacks a connection fires as it progresses.
///
/// A fixed record of optional callbacks with known signatures; the dispatcher
/// uses these to keep the backend's connection accounting out of the
/// connection handler itself.
#[derive(Default)]
pub struct ConnectionHooks {
    /// Fired when handling of an accepted, routed connection begins.
    pub on_connect: Option<Box<dyn Fn() + Send + Sync>>,
    /// Fired when the connection turns out to be a status query.
    pub on_status: Option<Box<dyn Fn() + Send + Sync>>,
    /// Fired when a login is admitted and about to be piped to the backend.
    pub on_login: Option<Box<dyn Fn(&LoginStart) + Send + Sync>>,
    /// Fired exactly once when the connection is done, on every exit path.
    pub on_close: Option<Box<dyn Fn() + Send + Sync>>,
}

impl ConnectionHooks {
    fn fire_connect(&self) {
        if let Some(hook) = &self.on_connect {
            hook();
        }
    }

    fn fire_status(&self) {
        if let Some(hook) = &self.on_status {
            hook();
        }
    }

    fn fire_login(&self, login: &LoginStart) {
        if let Some(hook) = &self.on_login {
            hook(login);
        }
    }

    fn fire_close(&self) {
        if let Some(hook) = &self.on_close {
            hook();
        }
    }
}

/// One accepted client connection, already routed to its backend.
pub struct Connection<S> {
    client: Client<S>,
    backend: Arc<Backend>,
    handshake: Handshake,
    hooks: ConnectionHooks,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        client: Client<S>,
        backend: Arc<Backend>,
        handshake: Handshake,
        hooks: ConnectionHooks,
    ) -> Self {
        Self {
            client,
            backend,
            handshake,
            hooks,
        }
    }

    /// Drive the connection to completion. The close hook fires exactly
    /// once, whichever way the connection ends.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            mut client,
            backend,
            handshake,
            hooks,
        } = self;

        hooks.fire_connect();

        let result = match handshake.state() {
            Some(ClientState::Status) => handle_status(&mut client, &backend, &hooks).await,
            Some(ClientState::Login) => handle_login(client, &backend, &handshake, &hooks).await,
            None => Err(anyhow::anyhow!(
                "unknown next state: {}",
                handshake.next_state
            )),
        };

        hooks.fire_close();
        result
    }
}

/// Answer a status query, synthesizing a response when the backend cannot.
async fn handle_status<S: AsyncRead + AsyncWrite + Unpin>(
    client: &mut Client<S>,
    backend: &Arc<Backend>,
    hooks: &ConnectionHooks,
) -> anyhow::Result<()> {
    hooks.fire_status();

    let mut status = match backend.cloud_status().await {
        Ok(status) => status,
        Err(e) => {
            warn!(server = backend.hostname(), error = %e, "failed to get cloud status");
            CloudStatus::Unknown
        }
    };

    let mut live = None;
    if status == CloudStatus::Running {
        match backend.minecraft_status().await {
            Ok(mc_status) => live = Some(mc_status),
            Err(e) => {
                warn!(server = backend.hostname(), error = %e, "failed to get minecraft status");
                status = CloudStatus::Unknown;
            }
        }
    }

    let response = live.unwrap_or_else(|| {
        // Reuse the last observed version so client UIs don't flag a
        // protocol mismatch while the backend is down.
        let version = backend.last_minecraft_status().and_then(|s| s.version);
        ServerStatus::offline(version, format!("Server status: {status}"))
    });

    client.serve_status(&response).await
}

/// Route a login: whitelist, then backend state, then replay-and-pipe.
async fn handle_login<S: AsyncRead + AsyncWrite + Unpin>(
    mut client: Client<S>,
    backend: &Arc<Backend>,
    handshake: &Handshake,
    hooks: &ConnectionHooks,
) -> anyhow::Result<()> {
    let login = client.read_login_start().await?;
    info!(
        server = backend.hostname(),
        player = %login.name,
        "login requested"
    );

    if !backend.admits(&login.name) {
        info!(
            server = backend.hostname(),
            player = %login.name,
            "player is not whitelisted"
        );
        return client
            .send_disconnect("You are not whitelisted on this server")
            .await;
    }

    let status = match backend.cloud_status().await {
        Ok(status) => status,
        Err(e) => {
            warn!(server = backend.hostname(), error = %e, "failed to get cloud status");
            CloudStatus::Unknown
        }
    };

    match status {
        CloudStatus::Running => {}
        CloudStatus::Stopped => {
            info!(server = backend.hostname(), "server is stopped, starting");
            if let Err(e) = backend.start().await {
                warn!(server = backend.hostname(), error = %e, "failed to start server");
            }
            return client
                .send_disconnect("Server is being started, please try again later")
                .await;
        }
        other => {
            return client
                .send_disconnect(&format!("Waiting for server to start (Status: {other})"))
                .await;
        }
    }

    let addr = backend.remote_addr();
    debug!(server = backend.hostname(), %addr, "connecting to remote server");
    let mut remote = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(server = backend.hostname(), %addr, error = %e, "failed to connect to remote server");
            return Ok(());
        }
        Err(_) => {
            warn!(server = backend.hostname(), %addr, "timed out connecting to remote server");
            return Ok(());
        }
    };

    // The backend never saw the consumed packets; replay the captured
    // frames verbatim so launcher-specific trailing bytes survive.
    handshake
        .packet()
        .write_to(&mut remote)
        .await
        .context("failed to replay handshake to remote")?;
    login
        .packet()
        .write_to(&mut remote)
        .await
        .context("failed to replay login start to remote")?;

    hooks.fire_login(&login);

    let mut client_stream = client.into_inner();
    match tokio::io::copy_bidirectional(&mut client_stream, &mut remote).await {
        Ok((to_remote, to_client)) => {
            debug!(
                server = backend.hostname(),
                player = %login.name,
                to_remote,
                to_client,
                "connection closed"
            );
        }
        Err(e) => {
            // Whichever half loses the race to close produces a spurious
            // error on the other; not worth more than a debug line.
            debug!(server = backend.hostname(), player = %login.name, error = %e, "connection closed with error");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::{test_backend, FakeProvider};
    use crate::protocol::{FieldReader, Packet, PacketBuilder};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn handshake_packet(address: &str, next_state: i32) -> Packet {
        PacketBuilder::new()
            .put_varint(754)
            .put_string(address)
            .put_u16(25565)
            .put_varint(next_state)
            .build(0x00)
    }

    fn login_start_packet(name: &str) -> Packet {
        PacketBuilder::new().put_string(name).build(0x00)
    }

    /// Decode a handshake from the peer side of a duplex pair.
    async fn handshake_over(
        stream: DuplexStream,
    ) -> (Client<DuplexStream>, Handshake) {
        let mut client = Client::new(stream);
        let handshake = client.handshake().await.unwrap();
        (client, handshake)
    }

    async fn read_disconnect_reason(peer: &mut DuplexStream) -> String {
        let packet = Packet::read_from(peer).await.unwrap();
        assert_eq!(packet.id(), 0x00);
        let mut fields = FieldReader::new(packet.body());
        fields.read_string().unwrap()
    }

    fn counting_hooks(
        backend: &Arc<Backend>,
        closes: Arc<AtomicUsize>,
    ) -> ConnectionHooks {
        let reached_login = Arc::new(AtomicBool::new(false));
        let login_flag = reached_login.clone();
        let login_backend = backend.clone();
        let close_backend = backend.clone();

        ConnectionHooks {
            on_connect: None,
            on_status: None,
            on_login: Some(Box::new(move |_login| {
                login_flag.store(true, Ordering::SeqCst);
                login_backend.client_connected();
            })),
            on_close: Some(Box::new(move || {
                closes.fetch_add(1, Ordering::SeqCst);
                if reached_login.load(Ordering::SeqCst) {
                    close_backend.client_disconnected();
                }
            })),
        }
    }

    #[tokio::test]
    async fn whitelist_rejects_without_provider_call() {
        let provider = FakeProvider::new(CloudStatus::Running);
        let backend = test_backend(provider.clone(), vec!["alice".to_string()]);
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 2)
            .write_to(&mut peer)
            .await
            .unwrap();
        login_start_packet("mallory")
            .write_to(&mut peer)
            .await
            .unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        Connection::new(client, backend.clone(), handshake, hooks)
            .run()
            .await
            .unwrap();

        let reason = read_disconnect_reason(&mut peer).await;
        assert!(reason.contains("You are not whitelisted on this server"));

        assert_eq!(provider.status_calls.load(Ordering::SeqCst), 0);
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.connections(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_against_stopped_backend_triggers_start() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        let backend = test_backend(provider.clone(), Vec::new());
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 2)
            .write_to(&mut peer)
            .await
            .unwrap();
        login_start_packet("alice")
            .write_to(&mut peer)
            .await
            .unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        Connection::new(client, backend.clone(), handshake, hooks)
            .run()
            .await
            .unwrap();

        let reason = read_disconnect_reason(&mut peer).await;
        assert!(reason.contains("Server is being started"));

        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.cached_cloud_status(), CloudStatus::Starting);
        assert_eq!(backend.connections(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_against_starting_backend_disconnects_without_start() {
        let provider = FakeProvider::new(CloudStatus::Starting);
        let backend = test_backend(provider.clone(), Vec::new());
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 2)
            .write_to(&mut peer)
            .await
            .unwrap();
        login_start_packet("alice")
            .write_to(&mut peer)
            .await
            .unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        Connection::new(client, backend.clone(), handshake, hooks)
            .run()
            .await
            .unwrap();

        let reason = read_disconnect_reason(&mut peer).await;
        assert!(reason.contains("Waiting for server to start (Status: STARTING)"));
        assert_eq!(provider.start_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.connections(), 0);
    }

    #[tokio::test]
    async fn status_query_synthesizes_stopped_response() {
        let provider = FakeProvider::new(CloudStatus::Stopped);
        let backend = test_backend(provider.clone(), Vec::new());
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 1)
            .write_to(&mut peer)
            .await
            .unwrap();
        Packet::new(0x00, Vec::new()).write_to(&mut peer).await.unwrap();
        let ping = Packet::new(0x01, vec![0, 0, 0, 0, 0, 0, 0, 1]);
        ping.write_to(&mut peer).await.unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        Connection::new(client, backend.clone(), handshake, hooks)
            .run()
            .await
            .unwrap();

        let response = Packet::read_from(&mut peer).await.unwrap();
        assert_eq!(response.id(), 0x00);
        let mut fields = FieldReader::new(response.body());
        let body = fields.read_string().unwrap();
        assert!(body.contains(r#""description":{"text":"Server status: STOPPED"}"#));
        assert!(body.contains(r#""version":{"name":"unknown","protocol":754}"#));

        let echoed = Packet::read_from(&mut peer).await.unwrap();
        assert_eq!(echoed.raw(), ping.raw());

        // Status pings never count as connections.
        assert_eq!(backend.connections(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn login_replays_captured_frames_and_pipes() {
        // A fake backend that records the replayed frames and then echoes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handshake_frame = PacketBuilder::new()
            .put_varint(754)
            .put_string("mc.example.com")
            .put_u16(25565)
            .put_varint(2)
            .put_bytes(b"\x00FML2\x00")
            .build(0x00);
        let login_frame = login_start_packet("alice");

        let expected_handshake = handshake_frame.raw().to_vec();
        let expected_login = login_frame.raw().to_vec();
        let backend_task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut replayed = vec![0u8; expected_handshake.len() + expected_login.len()];
            socket.read_exact(&mut replayed).await.unwrap();
            assert_eq!(&replayed[..expected_handshake.len()], &expected_handshake[..]);
            assert_eq!(&replayed[expected_handshake.len()..], &expected_login[..]);

            // Echo one post-login payload back, then close.
            let mut payload = [0u8; 4];
            socket.read_exact(&mut payload).await.unwrap();
            socket.write_all(&payload).await.unwrap();
        });

        let provider = FakeProvider::new(CloudStatus::Running);
        let config = crate::config::ServerConfig {
            hostname: "mc.example.com".to_string(),
            shutdown_after: Some("1s".to_string()),
            whitelist: Vec::new(),
            minecraft: crate::config::MinecraftConfig {
                hostname: "127.0.0.1".to_string(),
                port,
            },
            gcp: None,
            docker: Some(crate::config::DockerConfig {
                container_id: "test".to_string(),
            }),
        };
        let backend = Backend::new(config, provider, "test".to_string()).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_frame.write_to(&mut peer).await.unwrap();
        login_frame.write_to(&mut peer).await.unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        let conn_task = tokio::spawn(
            Connection::new(client, backend.clone(), handshake, hooks).run(),
        );

        // Post-login bytes flow through the pipe in both directions.
        peer.write_all(&[0xCA, 0xFE, 0xBA, 0xBE]).await.unwrap();
        let mut echoed = [0u8; 4];
        peer.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, [0xCA, 0xFE, 0xBA, 0xBE]);

        drop(peer);
        conn_task.await.unwrap().unwrap();
        backend_task.await.unwrap();

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(backend.connections(), 0);
        assert!(backend.empty_since().is_some());
    }

    #[tokio::test]
    async fn dial_failure_closes_without_counting() {
        let provider = FakeProvider::new(CloudStatus::Running);
        // Port 1 on localhost refuses connections.
        let config = crate::config::ServerConfig {
            hostname: "mc.example.com".to_string(),
            shutdown_after: Some("1s".to_string()),
            whitelist: Vec::new(),
            minecraft: crate::config::MinecraftConfig {
                hostname: "127.0.0.1".to_string(),
                port: 1,
            },
            gcp: None,
            docker: Some(crate::config::DockerConfig {
                container_id: "test".to_string(),
            }),
        };
        let backend = Backend::new(config, provider, "test".to_string()).unwrap();
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 2)
            .write_to(&mut peer)
            .await
            .unwrap();
        login_start_packet("alice")
            .write_to(&mut peer)
            .await
            .unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        Connection::new(client, backend.clone(), handshake, hooks)
            .run()
            .await
            .unwrap();

        assert_eq!(backend.connections(), 0);
        assert!(backend.empty_since().is_none());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_next_state_errors_but_still_closes() {
        let provider = FakeProvider::new(CloudStatus::Running);
        let backend = test_backend(provider, Vec::new());
        let closes = Arc::new(AtomicUsize::new(0));

        let (mut peer, stream) = tokio::io::duplex(4096);
        handshake_packet("mc.example.com", 9)
            .write_to(&mut peer)
            .await
            .unwrap();

        let (client, handshake) = handshake_over(stream).await;
        let hooks = counting_hooks(&backend, closes.clone());
        let result = Connection::new(client, backend, handshake, hooks).run().await;

        assert!(result.is_err());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
