//! Wire protocol for shrd.
//!
//! Two framing layers exist on a transfer connection:
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────┐
//! │    Length     │                 Payload                  │
//! │   4 bytes     │            (Length bytes)                │
//! └───────────────┴──────────────────────────────────────────┘
//! ```
//!
//! - During the handshake the payload is a plaintext JSON [`Hello`].
//! - Afterwards every frame is sealed by the
//!   [`SecureChannel`](crate::crypto::SecureChannel); the plaintext inside a
//!   sealed frame is a [`Message`], prefixed by a one-byte kind:
//!
//! ```text
//! 0x01 | JSON control message   {"type": "header" | "headerAck" | ...}
//! 0x02 | chunk index (4) | chunk length (4) | payload | xxHash64 (8)
//! ```
//!
//! All integers are big-endian. Discovery uses unencrypted JSON
//! [`PresenceRecord`] datagrams.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::xxhash64;
use crate::error::{Error, Result};

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest plaintext handshake frame.
pub const MAX_HANDSHAKE_FRAME: usize = 64 * 1024;

/// Room for JSON framing around a chunk when sizing sealed frames.
pub const FRAME_OVERHEAD: usize = 64 * 1024;

/// Chunk frame bytes that are not payload (index, length, checksum).
pub const CHUNK_HEADER_SIZE: usize = 8;

const KIND_CONTROL: u8 = 0x01;
const KIND_CHUNK: u8 = 0x02;

/// Plaintext key-agreement message, sent once in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Protocol version
    pub version: u8,
    /// Key agreement and AEAD suite identifier
    pub algorithm: String,
    /// Base64 X25519 ephemeral public key
    pub ephemeral_key: String,
    /// Sender device id
    pub device_id: String,
    /// Sender display name
    pub display_name: String,
    /// Base64 Ed25519 long-term public key
    pub identity_key: String,
}

/// Channel confirmation, the first sealed message in each direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfirm {
    /// Base64 Ed25519 signature over the transcript hash and role
    pub signature: String,
}

/// Offer sent by the sender while negotiating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferHeader {
    /// Bare file name, sanitized again by the receiver
    pub file_name: String,
    /// Total size in bytes
    pub file_size: u64,
    /// Payload bytes per chunk
    pub chunk_size: u32,
    /// Full-file digest algorithm, always [`DIGEST_ALGORITHM`](crate::crypto::DIGEST_ALGORITHM)
    pub digest_algorithm: String,
    /// Expected hex digest, when the sender could compute it up front
    pub digest: Option<String>,
}

impl TransferHeader {
    /// Number of chunk messages this transfer takes.
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.file_size, self.chunk_size)
    }

    /// Payload length chunk `index` must carry.
    #[must_use]
    pub fn expected_chunk_len(&self, index: u32) -> usize {
        let start = u64::from(index) * u64::from(self.chunk_size);
        let remaining = self.file_size.saturating_sub(start);
        #[allow(clippy::cast_possible_truncation)]
        let len = remaining.min(u64::from(self.chunk_size)) as usize;
        len
    }
}

/// Chunks needed for `file_size` bytes: `ceil(file_size / chunk_size)`.
#[must_use]
pub fn total_chunks(file_size: u64, chunk_size: u32) -> u32 {
    if chunk_size == 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation)]
    let chunks = file_size.div_ceil(u64::from(chunk_size)) as u32;
    chunks
}

/// JSON control messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlMessage {
    /// Transfer offer
    Header(TransferHeader),
    /// Answer to the offer
    HeaderAck {
        /// Whether the receiver takes the file
        accept: bool,
        /// Reason code when rejected
        reason: Option<String>,
    },
    /// Either side gives up
    Cancel,
    /// Receiver asks for a chunk again after a checksum mismatch
    Retransmit {
        /// Chunk index to resend
        index: u32,
    },
    /// Receiver verified the digest and kept the file
    Complete,
    /// Fatal error, the connection closes after this
    Error {
        /// Reason code, see [`reason`]
        reason: String,
    },
    /// Liveness check, answered with `pong`
    Ping,
    /// Answer to `ping`
    Pong,
    /// Ask for the entries of a directory under the peer's shared root
    ListDir {
        /// Relative path, empty for the root
        path: String,
    },
    /// Answer to `listDir`
    Listing {
        /// Normalized relative path that was listed
        path: String,
        /// Entries sorted by name
        entries: Vec<DirEntry>,
    },
    /// Ask the peer to send one of its shared files; the peer answers with
    /// a `header` and the transfer runs with the roles swapped
    Download {
        /// Relative path of the file
        path: String,
    },
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    /// File or directory name
    pub name: String,
    /// Whether the entry is a directory
    pub is_dir: bool,
    /// Size in bytes, zero for directories
    pub size: u64,
}

impl ControlMessage {
    /// Short name used in errors and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Header(_) => "header",
            Self::HeaderAck { .. } => "headerAck",
            Self::Cancel => "cancel",
            Self::Retransmit { .. } => "retransmit",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::ListDir { .. } => "listDir",
            Self::Listing { .. } => "listing",
            Self::Download { .. } => "download",
        }
    }
}

/// One slice of the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    /// Zero-based chunk index
    pub index: u32,
    /// Chunk payload
    pub data: Vec<u8>,
    /// xxHash64 of `data`
    pub checksum: u64,
}

impl ChunkFrame {
    /// Build a frame and compute its checksum.
    #[must_use]
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        let checksum = xxhash64(&data);
        Self {
            index,
            data,
            checksum,
        }
    }

    /// Whether the payload still matches the checksum.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        xxhash64(&self.data) == self.checksum
    }
}

/// Everything that travels inside a sealed frame after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// JSON control message
    Control(ControlMessage),
    /// Binary chunk
    Chunk(ChunkFrame),
}

impl Message {
    /// Short name used in errors and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Control(control) => control.kind(),
            Self::Chunk(_) => "chunk",
        }
    }
}

impl From<ControlMessage> for Message {
    fn from(control: ControlMessage) -> Self {
        Self::Control(control)
    }
}

/// Presence datagram broadcast by the discovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Device id
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Transfer port (TCP)
    pub port: u16,
}

/// Reason codes carried by `headerAck` and `error` messages.
pub mod reason {
    use crate::error::ErrorClass;

    /// The user or the consent policy declined the file
    pub const DECLINED: &str = "declined";
    /// Not enough free space for the file
    pub const INSUFFICIENT_SPACE: &str = "insufficient_space";
    /// Too many concurrent sessions with this peer
    pub const BUSY: &str = "busy";
    /// Header fields out of range
    pub const INVALID_HEADER: &str = "invalid_header";
    /// Checksum or digest mismatch
    pub const INTEGRITY: &str = "integrity";
    /// Malformed or unexpected message
    pub const PROTOCOL: &str = "protocol";
    /// Local disk or permission failure
    pub const RESOURCE: &str = "resource";
    /// The other side cancelled
    pub const CANCELLED: &str = "cancelled";
    /// Remote browsing is disabled or the peer is not paired
    pub const FORBIDDEN: &str = "forbidden";
    /// Requested path does not exist in the shared directory
    pub const NOT_FOUND: &str = "not_found";
    /// Anything else
    pub const INTERNAL: &str = "internal";

    /// Reason code to send for a failure of `class`.
    #[must_use]
    pub const fn for_class(class: ErrorClass) -> &'static str {
        match class {
            ErrorClass::Integrity => INTEGRITY,
            ErrorClass::ProtocolViolation | ErrorClass::Authentication => PROTOCOL,
            ErrorClass::Resource => RESOURCE,
            _ => INTERNAL,
        }
    }

    /// Class of a reason code received from a peer.
    #[must_use]
    pub fn classify(reason: &str) -> ErrorClass {
        match reason {
            INTEGRITY => ErrorClass::Integrity,
            PROTOCOL | INVALID_HEADER => ErrorClass::ProtocolViolation,
            RESOURCE | INSUFFICIENT_SPACE | BUSY | NOT_FOUND => ErrorClass::Resource,
            DECLINED | FORBIDDEN => ErrorClass::Rejected,
            CANCELLED => ErrorClass::Cancelled,
            _ => ErrorClass::Network,
        }
    }
}

/// Encode a message payload to JSON bytes.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message payload from JSON bytes.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a sealed-frame plaintext.
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    match message {
        Message::Control(control) => {
            let json = encode_payload(control)?;
            let mut buf = Vec::with_capacity(1 + json.len());
            buf.push(KIND_CONTROL);
            buf.extend_from_slice(&json);
            Ok(buf)
        }
        Message::Chunk(chunk) => Ok(encode_chunk(chunk)),
    }
}

/// Decode a sealed-frame plaintext.
///
/// Unknown kinds, unknown `type` tags and malformed bodies are all
/// protocol violations.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    let (&kind, body) = data
        .split_first()
        .ok_or_else(|| Error::ProtocolError("empty message".to_string()))?;

    match kind {
        KIND_CONTROL => serde_json::from_slice(body)
            .map(Message::Control)
            .map_err(|e| Error::ProtocolError(format!("malformed control message: {e}"))),
        KIND_CHUNK => decode_chunk(body).map(Message::Chunk),
        other => Err(Error::ProtocolError(format!(
            "unknown message kind: {other:#x}"
        ))),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_chunk(chunk: &ChunkFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + CHUNK_HEADER_SIZE + chunk.data.len() + 8);
    buf.push(KIND_CHUNK);
    buf.extend_from_slice(&chunk.index.to_be_bytes());
    buf.extend_from_slice(&(chunk.data.len() as u32).to_be_bytes());
    buf.extend_from_slice(&chunk.data);
    buf.extend_from_slice(&chunk.checksum.to_be_bytes());
    buf
}

fn decode_chunk(data: &[u8]) -> Result<ChunkFrame> {
    if data.len() < CHUNK_HEADER_SIZE + 8 {
        return Err(Error::ProtocolError("chunk frame too short".to_string()));
    }

    let index = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;

    if data.len() != CHUNK_HEADER_SIZE + len + 8 {
        return Err(Error::ProtocolError(format!(
            "chunk {index} declares {len} bytes but frame holds {}",
            data.len().saturating_sub(CHUNK_HEADER_SIZE + 8)
        )));
    }

    let payload_end = CHUNK_HEADER_SIZE + len;
    let mut checksum_bytes = [0u8; 8];
    checksum_bytes.copy_from_slice(&data[payload_end..]);

    Ok(ChunkFrame {
        index,
        data: data[CHUNK_HEADER_SIZE..payload_end].to_vec(),
        checksum: u64::from_be_bytes(checksum_bytes),
    })
}

/// Read one length-prefixed frame.
///
/// Frames longer than `max_len` are a protocol violation.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(Error::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(Error::ProtocolError(format!(
            "frame too large: {len} bytes (limit {max_len})"
        )));
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).await?;
    }
    Ok(payload)
}

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::ProtocolError("frame exceeds 4 GiB".to_string()))?;

    writer.write_all(&len.to_be_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}
