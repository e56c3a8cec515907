//! Encrypted, authenticated channel over any byte stream.
//!
//! ## Handshake
//!
//! ```text
//! initiator                                   responder
//!   Hello{ephemeral X25519, id, name, Ed25519 pk} ──▶
//!                       ◀── Hello{ephemeral X25519, id, name, Ed25519 pk}
//!   keys = HKDF-SHA256(salt = H(hello_i ‖ hello_r), ikm = X25519(e_i, e_r))
//!   sealed Confirm{sign(transcript, "initiator")} ──▶
//!                       ◀── sealed Confirm{sign(transcript, "responder")}
//! ```
//!
//! Each direction has its own ChaCha20-Poly1305 key and a sequence counter
//! starting at zero. A sealed frame is `seq (8 bytes) ‖ ciphertext ‖ tag`;
//! the nonce is four zero bytes followed by `seq`, and `seq` is also the
//! associated data. A frame whose `seq` is not exactly the next expected
//! value is rejected, as is any frame that fails to open. Both are fatal.

use base64::prelude::*;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::DeviceIdentity;
use crate::error::{Error, Result};
use crate::protocol::{
    self, decode_message, decode_payload, encode_message, encode_payload, ChannelConfirm, Hello,
    Message, FRAME_OVERHEAD, MAX_HANDSHAKE_FRAME,
};

/// Suite identifier sent in every [`Hello`].
pub const SUITE: &str = "x25519-hkdf-sha256-chacha20poly1305";

const SEQ_SIZE: usize = 8;
const TAG_SIZE: usize = 16;
const INFO_I2R: &[u8] = b"shrd/v1 initiator->responder";
const INFO_R2I: &[u8] = b"shrd/v1 responder->initiator";
const CONFIRM_LABEL: &[u8] = b"shrd/v1 confirm ";

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the TCP connection
    Initiator,
    /// Accepted the TCP connection
    Responder,
}

impl Role {
    const fn label(self) -> &'static [u8] {
        match self {
            Self::Initiator => b"initiator",
            Self::Responder => b"responder",
        }
    }

    const fn other(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Authenticated identity of the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Device id claimed in the hello
    pub device_id: String,
    /// Display name claimed in the hello
    pub display_name: String,
    /// Ed25519 public key the peer proved possession of
    pub public_key: [u8; 32],
}

impl PeerIdentity {
    /// Public key in the base64 form stored by the trust store.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public_key)
    }
}

/// Decides whether an authenticated peer may continue.
///
/// Called once per handshake, after the peer's signature checked out.
pub trait PeerVerifier: Send + Sync {
    /// Reject the peer by returning an authentication-class error.
    fn verify(&self, peer: &PeerIdentity) -> Result<()>;
}

/// Verifier that lets every authenticated peer through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyPeer;

impl PeerVerifier for AcceptAnyPeer {
    fn verify(&self, _peer: &PeerIdentity) -> Result<()> {
        Ok(())
    }
}

/// Sealing half of the negotiated key material.
struct Sealer {
    cipher: ChaCha20Poly1305,
    next_seq: u64,
}

impl Sealer {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            next_seq: 0,
        }
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let seq = self.next_seq;
        let seq_bytes = seq.to_be_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce_for(seq),
                Payload {
                    msg: plaintext,
                    aad: &seq_bytes,
                },
            )
            .map_err(|_| Error::Internal("AEAD seal failed".to_string()))?;

        self.next_seq = seq
            .checked_add(1)
            .ok_or_else(|| Error::HandshakeFailed("sequence number exhausted".to_string()))?;

        let mut frame = Vec::with_capacity(SEQ_SIZE + ciphertext.len());
        frame.extend_from_slice(&seq_bytes);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }
}

/// Opening half of the negotiated key material.
struct Opener {
    cipher: ChaCha20Poly1305,
    expected_seq: u64,
}

impl Opener {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            expected_seq: 0,
        }
    }

    fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < SEQ_SIZE + TAG_SIZE {
            return Err(Error::DecryptionFailed);
        }

        let (seq_bytes, ciphertext) = frame.split_at(SEQ_SIZE);
        let mut seq_arr = [0u8; SEQ_SIZE];
        seq_arr.copy_from_slice(seq_bytes);
        let seq = u64::from_be_bytes(seq_arr);

        if seq != self.expected_seq {
            return Err(Error::ReplayDetected {
                expected: self.expected_seq,
                actual: seq,
            });
        }

        let plaintext = self
            .cipher
            .decrypt(
                &nonce_for(seq),
                Payload {
                    msg: ciphertext,
                    aad: seq_bytes,
                },
            )
            .map_err(|_| Error::DecryptionFailed)?;

        self.expected_seq += 1;
        Ok(plaintext)
    }
}

fn nonce_for(seq: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    *Nonce::from_slice(&nonce)
}

/// Per-connection key material and sequence counters.
///
/// Produced by the handshake and consumed when the channel is built; never
/// persisted.
pub struct SecureChannelState {
    sealer: Sealer,
    opener: Opener,
}

impl SecureChannelState {
    fn derive(shared_secret: &[u8; 32], transcript: &[u8; 32], role: Role) -> Result<Self> {
        let hk = Hkdf::<Sha256>::new(Some(transcript.as_slice()), shared_secret);

        let mut i2r = Zeroizing::new([0u8; 32]);
        let mut r2i = Zeroizing::new([0u8; 32]);
        hk.expand(INFO_I2R, i2r.as_mut())
            .map_err(|_| Error::HandshakeFailed("key derivation failed".to_string()))?;
        hk.expand(INFO_R2I, r2i.as_mut())
            .map_err(|_| Error::HandshakeFailed("key derivation failed".to_string()))?;

        let (send_key, recv_key) = match role {
            Role::Initiator => (&i2r, &r2i),
            Role::Responder => (&r2i, &i2r),
        };

        Ok(Self {
            sealer: Sealer::new(send_key),
            opener: Opener::new(recv_key),
        })
    }
}

/// Receiving half of a [`SecureChannel`].
pub struct SealedReader<R> {
    reader: R,
    opener: Opener,
    max_frame: usize,
    pending: Option<Message>,
}

impl<R: AsyncRead + Unpin> SealedReader<R> {
    /// Receive and decode the next message.
    pub async fn recv(&mut self) -> Result<Message> {
        if let Some(message) = self.pending.take() {
            return Ok(message);
        }
        let plaintext = self.recv_plaintext().await?;
        decode_message(&plaintext)
    }

    /// Limit the size of accepted sealed frames.
    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.max_frame = max_frame;
    }

    async fn recv_plaintext(&mut self) -> Result<Vec<u8>> {
        let frame = protocol::read_frame(&mut self.reader, self.max_frame).await?;
        self.opener.open(&frame)
    }
}

/// Sending half of a [`SecureChannel`].
pub struct SealedWriter<W> {
    writer: W,
    sealer: Sealer,
}

impl<W: AsyncWrite + Unpin> SealedWriter<W> {
    /// Encode, seal and write a message.
    ///
    /// Returns once the transport accepted the whole frame.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let plaintext = encode_message(message)?;
        self.send_plaintext(&plaintext).await
    }

    /// Close the write side of the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn send_plaintext(&mut self, plaintext: &[u8]) -> Result<()> {
        let frame = self.sealer.seal(plaintext)?;
        protocol::write_frame(&mut self.writer, &frame).await
    }
}

/// A byte stream after a successful handshake.
pub struct SecureChannel<S> {
    reader: SealedReader<ReadHalf<S>>,
    writer: SealedWriter<WriteHalf<S>>,
    peer: PeerIdentity,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake as the side that opened the connection.
    pub async fn initiate(
        stream: S,
        identity: &DeviceIdentity,
        display_name: &str,
        verifier: &dyn PeerVerifier,
    ) -> Result<Self> {
        Self::handshake(stream, Role::Initiator, identity, display_name, verifier).await
    }

    /// Run the handshake as the side that accepted the connection.
    pub async fn accept(
        stream: S,
        identity: &DeviceIdentity,
        display_name: &str,
        verifier: &dyn PeerVerifier,
    ) -> Result<Self> {
        Self::handshake(stream, Role::Responder, identity, display_name, verifier).await
    }

    async fn handshake(
        mut stream: S,
        role: Role,
        identity: &DeviceIdentity,
        display_name: &str,
        verifier: &dyn PeerVerifier,
    ) -> Result<Self> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);

        let local_hello = Hello {
            version: crate::PROTOCOL_VERSION,
            algorithm: SUITE.to_string(),
            ephemeral_key: BASE64_STANDARD.encode(ephemeral_public.as_bytes()),
            device_id: identity.device_id().to_string(),
            display_name: display_name.to_string(),
            identity_key: identity.public_key_base64(),
        };
        let local_bytes = encode_payload(&local_hello)?;

        let remote_bytes = match role {
            Role::Initiator => {
                protocol::write_frame(&mut stream, &local_bytes).await?;
                protocol::read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?
            }
            Role::Responder => {
                let remote = protocol::read_frame(&mut stream, MAX_HANDSHAKE_FRAME).await?;
                protocol::write_frame(&mut stream, &local_bytes).await?;
                remote
            }
        };

        let remote_hello: Hello = decode_payload(&remote_bytes)
            .map_err(|e| Error::HandshakeFailed(format!("malformed hello: {e}")))?;
        let (peer, peer_ephemeral) = validate_hello(&remote_hello, identity.device_id())?;

        let shared = ephemeral.diffie_hellman(&PublicKey::from(peer_ephemeral));
        if !shared.was_contributory() {
            return Err(Error::HandshakeFailed(
                "degenerate key agreement".to_string(),
            ));
        }
        let shared_bytes = Zeroizing::new(shared.to_bytes());

        let transcript = match role {
            Role::Initiator => transcript_hash(&local_bytes, &remote_bytes),
            Role::Responder => transcript_hash(&remote_bytes, &local_bytes),
        };

        let state = SecureChannelState::derive(&shared_bytes, &transcript, role)?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut channel = Self {
            reader: SealedReader {
                reader: read_half,
                opener: state.opener,
                max_frame: MAX_HANDSHAKE_FRAME,
                pending: None,
            },
            writer: SealedWriter {
                writer: write_half,
                sealer: state.sealer,
            },
            peer,
        };

        let confirm = ChannelConfirm {
            signature: BASE64_STANDARD.encode(identity.sign(&confirm_input(&transcript, role))),
        };
        channel
            .writer
            .send_plaintext(&encode_payload(&confirm)?)
            .await?;

        let remote_confirm: ChannelConfirm = decode_payload(&channel.reader.recv_plaintext().await?)
            .map_err(|e| Error::HandshakeFailed(format!("malformed confirmation: {e}")))?;
        let signature: [u8; 64] = BASE64_STANDARD
            .decode(&remote_confirm.signature)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(Error::SignatureInvalid)?;

        if !DeviceIdentity::verify(
            &channel.peer.public_key,
            &confirm_input(&transcript, role.other()),
            &signature,
        ) {
            return Err(Error::SignatureInvalid);
        }

        verifier.verify(&channel.peer)?;

        channel.reader.max_frame = crate::config::MAX_CHUNK_SIZE + FRAME_OVERHEAD;
        tracing::debug!(
            "Secure channel established with {} ({:?})",
            channel.peer.device_id,
            role
        );
        Ok(channel)
    }

    /// Identity of the remote side.
    #[must_use]
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Encode, seal and write a message.
    pub async fn send(&mut self, message: &Message) -> Result<()> {
        self.writer.send(message).await
    }

    /// Receive and decode the next message.
    pub async fn recv(&mut self) -> Result<Message> {
        self.reader.recv().await
    }

    /// Limit the size of accepted sealed frames.
    pub fn set_max_frame(&mut self, max_frame: usize) {
        self.reader.set_max_frame(max_frame);
    }

    /// Hand back a message already received; the next `recv` returns it.
    pub fn unread(&mut self, message: Message) {
        self.reader.pending = Some(message);
    }

    /// Split into independently owned halves.
    pub fn into_split(
        self,
    ) -> (
        SealedReader<ReadHalf<S>>,
        SealedWriter<WriteHalf<S>>,
        PeerIdentity,
    ) {
        (self.reader, self.writer, self.peer)
    }
}

fn validate_hello(hello: &Hello, local_id: &str) -> Result<(PeerIdentity, [u8; 32])> {
    if hello.version != crate::PROTOCOL_VERSION {
        return Err(Error::UnsupportedVersion(hello.version));
    }
    if hello.algorithm != SUITE {
        return Err(Error::HandshakeFailed(format!(
            "unsupported algorithm '{}'",
            hello.algorithm
        )));
    }
    if hello.device_id.is_empty() {
        return Err(Error::HandshakeFailed("empty device id".to_string()));
    }
    if hello.device_id == local_id {
        return Err(Error::HandshakeFailed(
            "peer claims our own device id".to_string(),
        ));
    }

    let ephemeral = decode_key(&hello.ephemeral_key, "ephemeral key")?;
    let public_key = decode_key(&hello.identity_key, "identity key")?;

    Ok((
        PeerIdentity {
            device_id: hello.device_id.clone(),
            display_name: hello.display_name.clone(),
            public_key,
        },
        ephemeral,
    ))
}

fn decode_key(encoded: &str, what: &str) -> Result<[u8; 32]> {
    BASE64_STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| Error::HandshakeFailed(format!("invalid {what}")))
}

fn transcript_hash(initiator_hello: &[u8], responder_hello: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in [initiator_hello, responder_hello] {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn confirm_input(transcript: &[u8; 32], role: Role) -> Vec<u8> {
    let mut input = Vec::with_capacity(CONFIRM_LABEL.len() + 9 + transcript.len());
    input.extend_from_slice(CONFIRM_LABEL);
    input.extend_from_slice(role.label());
    input.extend_from_slice(transcript);
    input
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChunkFrame, ControlMessage};
    use tokio::io::DuplexStream;

    struct RejectKey([u8; 32]);

    impl PeerVerifier for RejectKey {
        fn verify(&self, peer: &PeerIdentity) -> Result<()> {
            if peer.public_key == self.0 {
                Ok(())
            } else {
                Err(Error::KeyMismatch(peer.device_id.clone()))
            }
        }
    }

    async fn connected_pair() -> (SecureChannel<DuplexStream>, SecureChannel<DuplexStream>) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let id_a = DeviceIdentity::generate().with_device_id("A");
        let id_b = DeviceIdentity::generate().with_device_id("B");

        let (ra, rb) = tokio::join!(
            SecureChannel::initiate(a, &id_a, "Alpha", &AcceptAnyPeer),
            SecureChannel::accept(b, &id_b, "Beta", &AcceptAnyPeer),
        );
        (ra.expect("initiator"), rb.expect("responder"))
    }

    #[tokio::test]
    async fn test_handshake_exchanges_identities() {
        let (a, b) = connected_pair().await;

        assert_eq!(a.peer().device_id, "B");
        assert_eq!(a.peer().display_name, "Beta");
        assert_eq!(b.peer().device_id, "A");
        assert_eq!(b.peer().display_name, "Alpha");
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (mut a, mut b) = connected_pair().await;

        let chunk = Message::Chunk(ChunkFrame::new(0, b"hello".to_vec()));
        a.send(&chunk).await.expect("send chunk");
        assert_eq!(b.recv().await.expect("recv chunk"), chunk);

        let ack = Message::Control(ControlMessage::Complete);
        b.send(&ack).await.expect("send complete");
        assert_eq!(a.recv().await.expect("recv complete"), ack);
    }

    #[tokio::test]
    async fn test_unread_message_is_returned_first() {
        let (mut a, mut b) = connected_pair().await;

        a.send(&ControlMessage::Ping.into()).await.unwrap();
        a.send(&ControlMessage::Cancel.into()).await.unwrap();

        let first = b.recv().await.unwrap();
        b.unread(first.clone());
        let (mut reader, _writer, _peer) = b.into_split();
        assert_eq!(reader.recv().await.unwrap(), first);
        assert_eq!(
            reader.recv().await.unwrap(),
            Message::Control(ControlMessage::Cancel)
        );
    }

    #[tokio::test]
    async fn test_replayed_frame_rejected() {
        let (mut a, mut b) = connected_pair().await;

        let plaintext = encode_message(&Message::Control(ControlMessage::Cancel)).unwrap();
        let frame = a.writer.sealer.seal(&plaintext).expect("seal");
        protocol::write_frame(&mut a.writer.writer, &frame)
            .await
            .expect("write");
        protocol::write_frame(&mut a.writer.writer, &frame)
            .await
            .expect("write replay");

        assert!(b.recv().await.is_ok());
        match b.recv().await {
            Err(Error::ReplayDetected { expected, actual }) => {
                assert_eq!(expected, actual + 1);
            }
            other => panic!("Expected ReplayDetected, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_skipped_sequence_rejected() {
        let (mut a, mut b) = connected_pair().await;

        let plaintext = encode_message(&Message::Control(ControlMessage::Complete)).unwrap();
        let _dropped = a.writer.sealer.seal(&plaintext).expect("seal");
        let later = a.writer.sealer.seal(&plaintext).expect("seal");
        protocol::write_frame(&mut a.writer.writer, &later)
            .await
            .expect("write");

        let err = b.recv().await.unwrap_err();
        assert!(err.is_security_warning());
    }

    #[tokio::test]
    async fn test_tampered_frame_rejected() {
        let (mut a, mut b) = connected_pair().await;

        let plaintext = encode_message(&Message::Control(ControlMessage::Complete)).unwrap();
        let mut frame = a.writer.sealer.seal(&plaintext).expect("seal");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        protocol::write_frame(&mut a.writer.writer, &frame)
            .await
            .expect("write");

        assert!(matches!(b.recv().await, Err(Error::DecryptionFailed)));
    }

    #[tokio::test]
    async fn test_pinned_key_mismatch_fails_closed() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let id_a = DeviceIdentity::generate().with_device_id("A");
        let id_b = DeviceIdentity::generate().with_device_id("B");
        let someone_else = DeviceIdentity::generate();
        let verifier = RejectKey(someone_else.public_key_bytes());

        let (ra, _rb) = tokio::join!(
            SecureChannel::initiate(a, &id_a, "Alpha", &verifier),
            SecureChannel::accept(b, &id_b, "Beta", &AcceptAnyPeer),
        );

        assert!(matches!(ra, Err(Error::KeyMismatch(id)) if id == "B"));
    }

    #[tokio::test]
    async fn test_wrong_suite_rejected() {
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let id_b = DeviceIdentity::generate().with_device_id("B");

        let bogus = Hello {
            version: crate::PROTOCOL_VERSION,
            algorithm: "rot13".to_string(),
            ephemeral_key: BASE64_STANDARD.encode([9u8; 32]),
            device_id: "A".to_string(),
            display_name: "Alpha".to_string(),
            identity_key: BASE64_STANDARD.encode([1u8; 32]),
        };
        protocol::write_frame(&mut a, &encode_payload(&bogus).unwrap())
            .await
            .unwrap();

        let result = SecureChannel::accept(b, &id_b, "Beta", &AcceptAnyPeer).await;
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_split_halves_work() {
        let (a, b) = connected_pair().await;
        let (_ra, mut wa, peer) = a.into_split();
        let (mut rb, _wb, _) = b.into_split();
        assert_eq!(peer.device_id, "B");

        wa.send(&Message::Control(ControlMessage::Retransmit { index: 4 }))
            .await
            .unwrap();
        assert_eq!(
            rb.recv().await.unwrap(),
            Message::Control(ControlMessage::Retransmit { index: 4 })
        );
    }
}
