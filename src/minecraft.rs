//! Minecraft-aware connection handling: the handshake and login packets the
//! proxy decodes, the status/disconnect responses it synthesizes, and the
//! server list ping it uses to probe backends.

use crate::protocol::{FieldReader, Packet, PacketBuilder, ProtocolError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Hard deadline for the server list ping. Failure is never fatal; callers
/// fall back to a fabricated status.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol version reported when no live status has ever been observed.
/// 754 is 1.16.5+; client UIs show a version mismatch rather than an error.
pub const FALLBACK_PROTOCOL_VERSION: i32 = 754;

/// The sub-protocol a client selects in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Server list status query.
    Status = 1,
    /// Player login.
    Login = 2,
}

impl ClientState {
    pub fn from_next_state(value: i32) -> Option<Self> {
        match value {
            1 => Some(ClientState::Status),
            2 => Some(ClientState::Login),
            _ => None,
        }
    }
}

/// Parsed handshake packet (0x00 in the handshaking state).
///
/// The original frame is retained: routing consumes the handshake, so the
/// backend never sees it unless the proxy replays the captured bytes.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
    packet: Packet,
}

impl Handshake {
    pub fn state(&self) -> Option<ClientState> {
        ClientState::from_next_state(self.next_state)
    }

    /// The captured frame, for verbatim replay.
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// Parsed login start packet (0x00 in the login state).
///
/// The name is untrusted; the client has not authenticated yet. Newer
/// protocol versions append further fields, which survive in the raw frame.
#[derive(Debug, Clone)]
pub struct LoginStart {
    pub name: String,
    packet: Packet,
}

impl LoginStart {
    pub fn packet(&self) -> &Packet {
        &self.packet
    }
}

/// Status response payload for a server list ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<StatusVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<StatusPlayers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<StatusDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: i32,
    pub online: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDescription {
    pub text: String,
}

impl ServerStatus {
    /// Fabricate a credible status for a backend that cannot be reached.
    ///
    /// Uses the last observed version when one is available so client UIs
    /// don't flag a protocol mismatch while the backend is down.
    pub fn offline(version: Option<StatusVersion>, description: impl Into<String>) -> Self {
        Self {
            version: Some(version.unwrap_or(StatusVersion {
                name: "unknown".to_string(),
                protocol: FALLBACK_PROTOCOL_VERSION,
            })),
            players: Some(StatusPlayers {
                max: 0,
                online: 0,
                sample: Vec::new(),
            }),
            description: Some(StatusDescription {
                text: description.into(),
            }),
            favicon: None,
        }
    }
}

/// A Minecraft-protocol-aware wrapper over a raw byte stream.
///
/// Reads are unbuffered so that handing the stream off to the byte pipe
/// after login never strands data inside the codec.
pub struct Client<S> {
    stream: S,
    pub protocol_version: i32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            protocol_version: 0,
        }
    }

    /// Read and decode the handshake packet.
    pub async fn handshake(&mut self) -> Result<Handshake, ProtocolError> {
        let packet = Packet::read_from(&mut self.stream).await?;
        if packet.id() != 0x00 {
            return Err(ProtocolError::Malformed("first packet is not a handshake"));
        }

        let mut fields = FieldReader::new(packet.body());
        let protocol_version = fields.read_varint()?;
        let server_address = fields.read_string()?;
        let server_port = fields.read_u16()?;
        let next_state = fields.read_varint()?;

        self.protocol_version = protocol_version;

        Ok(Handshake {
            protocol_version,
            server_address,
            server_port,
            next_state,
            packet,
        })
    }

    /// Read and decode the login start packet.
    pub async fn read_login_start(&mut self) -> Result<LoginStart, ProtocolError> {
        let packet = Packet::read_from(&mut self.stream).await?;
        if packet.id() != 0x00 {
            return Err(ProtocolError::Malformed("packet is not login start"));
        }

        let mut fields = FieldReader::new(packet.body());
        let name = fields.read_string()?;

        Ok(LoginStart { name, packet })
    }

    /// Answer a status query: send the response for a StatusRequest and echo
    /// a Ping payload verbatim, then stop. At most two packets are read.
    pub async fn serve_status(&mut self, status: &ServerStatus) -> anyhow::Result<()> {
        for _ in 0..2 {
            let packet = match Packet::read_from(&mut self.stream).await {
                Ok(p) => p,
                // Clients may hang up after either packet.
                Err(_) => break,
            };

            match packet.id() {
                0x00 => {
                    let body = serde_json::to_string(status)?;
                    let response = PacketBuilder::new().put_string(&body).build(0x00);
                    response.write_to(&mut self.stream).await?;
                }
                0x01 => {
                    packet.write_to(&mut self.stream).await?;
                }
                _ => break,
            }
        }
        Ok(())
    }

    /// Send a Disconnect packet with a human-readable reason.
    pub async fn send_disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        let message = serde_json::json!({
            "translate": "chat.type.text",
            "with": [{ "text": reason }],
        });

        let packet = PacketBuilder::new()
            .put_string(&message.to_string())
            .build(0x00);
        packet.write_to(&mut self.stream).await?;
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Ping a server and return its status payload, bounded by `timeout`.
pub async fn server_status(
    host: &str,
    port: u16,
    timeout: Duration,
) -> anyhow::Result<ServerStatus> {
    tokio::time::timeout(timeout, probe_status(host, port))
        .await
        .map_err(|_| anyhow::anyhow!("status ping to {}:{} timed out", host, port))?
}

async fn probe_status(host: &str, port: u16) -> anyhow::Result<ServerStatus> {
    let mut stream = TcpStream::connect((host, port)).await?;

    let handshake = PacketBuilder::new()
        .put_varint(FALLBACK_PROTOCOL_VERSION)
        .put_string(host)
        .put_u16(port)
        .put_varint(ClientState::Status as i32)
        .build(0x00);
    handshake.write_to(&mut stream).await?;

    // StatusRequest has an empty body.
    Packet::new(0x00, Vec::new()).write_to(&mut stream).await?;

    let response = Packet::read_from(&mut stream).await?;
    if response.id() != 0x00 {
        anyhow::bail!("unexpected status response packet 0x{:02X}", response.id());
    }

    let mut fields = FieldReader::new(response.body());
    let body = fields.read_string()?;
    let status = serde_json::from_str(&body)?;
    Ok(status)
}
