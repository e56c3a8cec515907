//! File transfer engine for shrd.
//!
//! One engine instance runs per [`TransferSession`], on top of an already
//! negotiated [`SecureChannel`](crate::crypto::SecureChannel):
//!
//! ```text
//! Negotiating ──► Transferring ──► Verifying ──► Completed
//!      │               │               │
//!      └───────────────┴───────────────┴──────► Aborted
//! ```
//!
//! ## Protocol
//!
//! 1. Sender sends `header` (name, size, chunk size, SHA-256 of the file)
//! 2. Receiver answers `headerAck`, rejecting with a reason code or accepting
//! 3. Sender streams chunks `0..n`, one in flight, each with an xxHash64
//! 4. On a bad checksum the receiver sends `retransmit(i)` once; the sender
//!    goes back to chunk `i` and the receiver drops chunks past `i` until it
//!    arrives. A second bad copy of the same chunk aborts the session
//! 5. Receiver compares the full-file digest, moves the staging file to its
//!    final name and sends `complete`
//!
//! Either side may send `cancel` or `error` at any time; both are terminal.

mod receiver;
mod sender;
mod staging;

pub use receiver::{receive_file, ReceiveContext};
pub use sender::{inspect_file, send_file};
pub use staging::{available_space, sanitize_file_name, unique_destination, StagingFile};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::TransferConfig;
use crate::crypto::{PeerIdentity, SealedWriter};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{EventBus, StatusEvent};
use crate::protocol::{reason, ControlMessage, TransferHeader};

/// Upper bound for best-effort goodbye messages on a failing connection.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Configure TCP keep-alive on a transfer connection.
///
/// - Start probing after 10 seconds of idle time
/// - Send probes every 5 seconds
pub fn configure_tcp_keepalive(stream: &TcpStream) -> Result<()> {
    let socket_ref = SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));

    socket_ref
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;

    tracing::debug!("TCP keep-alive enabled on socket");
    Ok(())
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// This device sends the file
    Send,
    /// This device receives the file
    Receive,
}

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransferState {
    /// Exchanging the header
    Negotiating,
    /// Streaming chunks
    Transferring,
    /// Checking the full-file digest
    Verifying,
    /// File verified and in place
    Completed,
    /// Stopped early; no output left behind
    Aborted,
}

impl TransferState {
    /// `Completed` and `Aborted` are final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Negotiating => "negotiating",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Why a session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferFailure {
    /// Error class
    pub class: ErrorClass,
    /// Human-readable reason
    pub reason: String,
}

impl From<&Error> for TransferFailure {
    fn from(error: &Error) -> Self {
        Self {
            class: error.class(),
            reason: error.to_string(),
        }
    }
}

/// Snapshot of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    /// Session identifier
    pub session_id: Uuid,
    /// Send or receive
    pub direction: Direction,
    /// Remote device id
    pub peer_id: String,
    /// File name (final name on the receiving side once completed)
    pub file_name: String,
    /// Total size in bytes
    pub file_size: u64,
    /// Payload bytes per chunk
    pub chunk_size: u32,
    /// Bytes sent or written so far
    pub bytes_transferred: u64,
    /// Current state
    pub state: TransferState,
    /// Expected full-file digest (hex SHA-256)
    pub integrity_digest: Option<String>,
    /// Where the received file ended up
    pub saved_path: Option<PathBuf>,
    /// Set once the session is aborted
    pub failure: Option<TransferFailure>,
    /// When the session was created
    pub started_at: DateTime<Utc>,
}

impl TransferSession {
    /// New session in `Negotiating`.
    #[must_use]
    pub fn new(direction: Direction, peer_id: impl Into<String>, chunk_size: u32) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            direction,
            peer_id: peer_id.into(),
            file_name: String::new(),
            file_size: 0,
            chunk_size,
            bytes_transferred: 0,
            state: TransferState::Negotiating,
            integrity_digest: None,
            saved_path: None,
            failure: None,
            started_at: Utc::now(),
        }
    }

    /// Set the file being moved.
    #[must_use]
    pub fn with_file(mut self, file_name: impl Into<String>, file_size: u64) -> Self {
        self.file_name = file_name.into();
        self.file_size = file_size;
        self
    }

    /// Progress as a percentage (0.0 - 100.0).
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.file_size == 0 {
            if self.state == TransferState::Completed {
                100.0
            } else {
                0.0
            }
        } else {
            (self.bytes_transferred as f64 / self.file_size as f64) * 100.0
        }
    }

    /// Whether the session reached a final state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Per-session transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    /// Payload bytes per chunk
    pub chunk_size: u32,
    /// Limit for the header exchange
    pub negotiate_timeout: Duration,
    /// Limit between the last chunk and the verdict
    pub verify_timeout: Duration,
}

impl TransferOptions {
    /// Options from the transfer configuration.
    #[must_use]
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            chunk_size: u32::try_from(config.chunk_size).unwrap_or(u32::MAX),
            negotiate_timeout: config.negotiate_timeout,
            verify_timeout: config.verify_timeout,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// An incoming offer awaiting consent.
#[derive(Debug, Clone, Copy)]
pub struct TransferOffer<'a> {
    /// Authenticated sender
    pub peer: &'a PeerIdentity,
    /// Whether the sender is a paired device
    pub trusted: bool,
    /// What it wants to send
    pub header: &'a TransferHeader,
}

/// Decides whether an incoming file is accepted.
pub trait ConsentPolicy: Send + Sync {
    /// `true` to accept the offer.
    fn decide(&self, offer: &TransferOffer<'_>) -> bool;
}

/// Accept everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAccept;

impl ConsentPolicy for AlwaysAccept {
    fn decide(&self, _offer: &TransferOffer<'_>) -> bool {
        true
    }
}

/// Accept only files from paired devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustedOnly;

impl ConsentPolicy for TrustedOnly {
    fn decide(&self, offer: &TransferOffer<'_>) -> bool {
        offer.trusted
    }
}

impl<F> ConsentPolicy for F
where
    F: Fn(&TransferOffer<'_>) -> bool + Send + Sync,
{
    fn decide(&self, offer: &TransferOffer<'_>) -> bool {
        self(offer)
    }
}

/// Policy matching the `auto_accept` setting.
#[must_use]
pub fn default_consent(auto_accept: bool) -> Arc<dyn ConsentPolicy> {
    if auto_accept {
        Arc::new(AlwaysAccept)
    } else {
        Arc::new(TrustedOnly)
    }
}

/// Publishes session snapshots to watchers and the event bus.
///
/// No event is emitted for a session until [`Progress::started`] was called,
/// so connections that close before any offer leave no trace on the bus.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: Arc<watch::Sender<TransferSession>>,
    events: EventBus,
    announced: Arc<AtomicBool>,
}

impl Progress {
    /// Start tracking `session`.
    #[must_use]
    pub fn new(session: TransferSession, events: EventBus) -> Self {
        let (tx, _rx) = watch::channel(session);
        Self {
            tx: Arc::new(tx),
            events,
            announced: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receiver that always holds the latest snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TransferSession> {
        self.tx.subscribe()
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TransferSession {
        self.tx.borrow().clone()
    }

    /// Session id.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.tx.borrow().session_id
    }

    /// Apply `f` unless the session already reached a final state.
    pub fn update(&self, f: impl FnOnce(&mut TransferSession)) {
        self.tx.send_if_modified(|session| {
            if session.is_terminal() {
                return false;
            }
            f(session);
            true
        });
    }

    /// Announce the session once file details are known. Later calls do
    /// nothing.
    pub fn started(&self) {
        if self.announced.swap(true, Ordering::AcqRel) {
            return;
        }
        self.events.emit(StatusEvent::TransferStarted {
            session: self.snapshot(),
        });
    }

    /// Whether [`Progress::started`] was called.
    #[must_use]
    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Move to `state`.
    pub fn set_state(&self, state: TransferState) {
        self.update(|session| session.state = state);
    }

    /// Record bytes moved so far, emitting an event per whole percent.
    pub fn advance(&self, bytes_transferred: u64) {
        let mut crossed = false;
        self.update(|session| {
            let before = percent_step(session.bytes_transferred, session.file_size);
            session.bytes_transferred = bytes_transferred;
            crossed = percent_step(bytes_transferred, session.file_size) != before;
        });
        if crossed && self.is_announced() {
            self.events.emit(StatusEvent::TransferProgress {
                session: self.snapshot(),
            });
        }
    }

    /// Mark the session completed.
    pub fn complete(&self) {
        let mut changed = false;
        self.update(|session| {
            session.bytes_transferred = session.file_size;
            session.state = TransferState::Completed;
            changed = true;
        });
        if !changed {
            return;
        }

        let session = self.snapshot();
        tracing::info!(
            session = %session.session_id,
            file = %session.file_name,
            bytes = session.file_size,
            "Transfer completed"
        );
        if self.is_announced() {
            self.events
                .emit(StatusEvent::TransferCompleted { session });
        }
    }

    /// Mark the session aborted because of `error`.
    pub fn abort(&self, error: &Error) {
        let failure = TransferFailure::from(error);
        let mut changed = false;
        self.update(|session| {
            session.state = TransferState::Aborted;
            session.failure = Some(failure.clone());
            changed = true;
        });
        if !changed {
            return;
        }

        let session = self.snapshot();
        if !self.is_announced() {
            tracing::debug!(
                session = %session.session_id,
                "Connection ended before any offer: {}",
                failure.reason
            );
            return;
        }
        if error.class() == ErrorClass::Cancelled {
            tracing::info!(session = %session.session_id, "Transfer cancelled");
        } else {
            tracing::warn!(
                session = %session.session_id,
                class = %failure.class,
                "Transfer aborted: {}",
                failure.reason
            );
        }
        self.events.emit(StatusEvent::TransferAborted {
            session,
            class: failure.class,
            reason: failure.reason,
        });
    }

    /// Record the outcome of an engine run.
    pub fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.complete(),
            Err(e) => self.abort(e),
        }
    }
}

fn percent_step(bytes: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        u64::try_from(u128::from(bytes) * 100 / u128::from(total)).unwrap_or(100)
    }
}

/// Tell the peer why the session is ending, when the connection is still
/// usable.
///
/// Nothing is sent for network and authentication failures, for peer-side
/// aborts and rejections, or for cancellation (handled where it is observed).
pub(crate) async fn notify_failure<W>(writer: &mut SealedWriter<W>, error: &Error)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let class = error.class();
    if matches!(
        error,
        Error::RemoteAbort(_) | Error::TransferRejected(_) | Error::TransferCancelled
    ) || matches!(class, ErrorClass::Network | ErrorClass::Authentication)
    {
        return;
    }

    let message = ControlMessage::Error {
        reason: reason::for_class(class).to_string(),
    };
    send_best_effort(writer, message).await;
}

/// Send a final control message without letting a stuck peer hold us.
pub(crate) async fn send_best_effort<W>(writer: &mut SealedWriter<W>, message: ControlMessage)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let kind = message.kind();
    match tokio::time::timeout(NOTIFY_TIMEOUT, writer.send(&message.into())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to send {} to peer: {}", kind, e),
        Err(_) => tracing::debug!("Timed out sending {} to peer", kind),
    }
    let _ = tokio::time::timeout(NOTIFY_TIMEOUT, writer.shutdown()).await;
}
