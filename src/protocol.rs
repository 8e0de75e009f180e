//! Minecraft wire framing: varint length-prefixed frames and typed fields.
//!
//! The proxy only ever decodes the handshaking, status, and login packets;
//! everything after login start is relayed as opaque bytes. Frames keep their
//! original bytes around so a consumed packet can be replayed to a backend
//! verbatim, including any trailing bytes modded launchers append.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame the proxy will read. Vanilla caps frames at the largest
/// three-byte varint; status responses with favicons fit well inside it.
pub const MAX_FRAME_LEN: usize = 2_097_151;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame or field could not be decoded.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Clean EOF before the first byte of a frame. Port scanners and pinging
    /// load balancers produce these constantly; callers drop them silently.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this error is a clean pre-frame EOF.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, ProtocolError::PeerClosed)
    }
}

/// A single length-prefixed frame.
///
/// `raw` holds the exact bytes read off (or destined for) the wire, length
/// prefix included, so replaying a packet never re-encodes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    id: i32,
    body: Vec<u8>,
    raw: Vec<u8>,
}

impl Packet {
    /// Build an outgoing packet from an id and body.
    pub fn new(id: i32, body: Vec<u8>) -> Self {
        let mut payload = Vec::with_capacity(body.len() + 5);
        put_varint(&mut payload, id);
        payload.extend_from_slice(&body);

        let mut raw = Vec::with_capacity(payload.len() + 5);
        put_varint(&mut raw, payload.len() as i32);
        raw.extend_from_slice(&payload);

        Self { id, body, raw }
    }

    /// Read one frame off the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self, ProtocolError> {
        let mut raw = Vec::with_capacity(32);
        let len = read_varint_wire(r, &mut raw).await?;
        if len <= 0 {
            return Err(ProtocolError::Malformed("non-positive frame length"));
        }
        let len = len as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Malformed("frame length exceeds maximum"));
        }

        let mut frame = vec![0u8; len];
        r.read_exact(&mut frame).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtocolError::Malformed("truncated frame")
            } else {
                ProtocolError::Io(e)
            }
        })?;
        raw.extend_from_slice(&frame);

        let mut fields = FieldReader::new(&frame);
        let id = fields.read_varint()?;
        let body = fields.remaining().to_vec();

        Ok(Self { id, body, raw })
    }

    /// Write the frame exactly as it was read or built.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<(), ProtocolError> {
        w.write_all(&self.raw).await?;
        Ok(())
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Frame body after the packet id.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The full frame, length prefix included.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Reads a varint off the wire, appending consumed bytes to `raw`.
///
/// EOF on the very first byte is a clean close; EOF mid-varint is not.
async fn read_varint_wire<R: AsyncRead + Unpin>(
    r: &mut R,
    raw: &mut Vec<u8>,
) -> Result<i32, ProtocolError> {
    let mut value: u32 = 0;
    for i in 0..5 {
        let byte = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(if i == 0 {
                    ProtocolError::PeerClosed
                } else {
                    ProtocolError::Malformed("truncated varint")
                });
            }
            Err(e) => return Err(ProtocolError::Io(e)),
        };
        raw.push(byte);
        value |= ((byte & SEGMENT_BITS) as u32) << (7 * i);
        if byte & CONTINUE_BIT == 0 {
            return Ok(value as i32);
        }
    }
    Err(ProtocolError::Malformed("varint too long"))
}

/// Append a varint to a buffer.
pub fn put_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & SEGMENT_BITS as u32) as u8;
        v >>= 7;
        if v != 0 {
            byte |= CONTINUE_BIT;
        }
        buf.push(byte);
        if v == 0 {
            return;
        }
    }
}

/// Decodes typed fields from a packet body in order.
///
/// Trailing bytes beyond the requested fields are allowed and left in
/// [`FieldReader::remaining`]; some launchers pad the handshake frame.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_varint(&mut self) -> Result<i32, ProtocolError> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(ProtocolError::Malformed("truncated varint"))?;
            self.pos += 1;
            value |= ((byte & SEGMENT_BITS) as u32) << (7 * i);
            if byte & CONTINUE_BIT == 0 {
                return Ok(value as i32);
            }
        }
        Err(ProtocolError::Malformed("varint too long"))
    }

    /// Varint-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_varint()?;
        if len < 0 {
            return Err(ProtocolError::Malformed("negative string length"));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ProtocolError::Malformed("string is not valid UTF-8"))
    }

    /// Big-endian unsigned short.
    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::Malformed("field runs past end of packet"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Bytes not consumed by any field read.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Builds a packet body field by field.
#[derive(Default)]
pub struct PacketBuilder {
    body: Vec<u8>,
}

impl PacketBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_varint(mut self, value: i32) -> Self {
        put_varint(&mut self.body, value);
        self
    }

    pub fn put_string(mut self, value: &str) -> Self {
        put_varint(&mut self.body, value.len() as i32);
        self.body.extend_from_slice(value.as_bytes());
        self
    }

    pub fn put_u16(mut self, value: u16) -> Self {
        self.body.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn put_bytes(mut self, bytes: &[u8]) -> Self {
        self.body.extend_from_slice(bytes);
        self
    }

    pub fn build(self, id: i32) -> Packet {
        Packet::new(id, self.body)
    }
}
