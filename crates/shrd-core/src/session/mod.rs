//! Bookkeeping for concurrent transfers.
//!
//! The [`SessionManager`] owns every running transfer engine. Each session
//! runs on its own task with its own cancellation token; the manager only
//! keeps the handle needed to cancel it and the [`Progress`] it publishes.
//! Finished sessions leave a final snapshot in a bounded history so the UI
//! can still show how they ended.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{DeviceIdentity, SecureChannel};
use crate::error::{Error, Result};
use crate::events::{EventBus, StatusEvent};
use crate::protocol::{reason, ControlMessage, Message};
use crate::registry::{Device, DeviceRegistry};
use crate::transfer::{
    configure_tcp_keepalive, default_consent, inspect_file, receive_file, send_file,
    AlwaysAccept, ConsentPolicy, Direction, Progress, ReceiveContext, TransferOptions,
    TransferSession,
};
use crate::trust::SharedTrustStore;

/// Finished sessions kept for [`SessionManager::status`].
const HISTORY_LIMIT: usize = 256;

/// Limits and timeouts applied to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Sessions allowed per peer, both directions combined
    pub max_concurrent_per_peer: usize,
    /// TCP connect timeout for outgoing transfers
    pub connect_timeout: Duration,
    /// Crypto handshake timeout
    pub handshake_timeout: Duration,
    /// Where received files are saved
    pub download_dir: PathBuf,
    /// Accept every offer instead of only those from paired devices
    pub auto_accept: bool,
    /// Chunk size and protocol timeouts
    pub transfer: TransferOptions,
}

impl SessionSettings {
    /// Settings taken from the configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_per_peer: config.transfer.max_concurrent_per_peer,
            connect_timeout: config.network.connect_timeout,
            handshake_timeout: config.network.handshake_timeout,
            download_dir: config.general.download_dir.clone(),
            auto_accept: config.general.auto_accept,
            transfer: TransferOptions::from_config(&config.transfer),
        }
    }
}

struct ActiveSession {
    peer_id: String,
    progress: Progress,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SessionTable {
    active: HashMap<Uuid, ActiveSession>,
    history: VecDeque<TransferSession>,
}

impl SessionTable {
    fn count_for(&self, peer_id: &str) -> usize {
        self.active
            .values()
            .filter(|session| session.peer_id == peer_id)
            .count()
    }
}

struct Inner {
    identity: Arc<DeviceIdentity>,
    display_name: String,
    registry: DeviceRegistry,
    trust: SharedTrustStore,
    events: EventBus,
    settings: SessionSettings,
    consent: Arc<dyn ConsentPolicy>,
    table: Mutex<SessionTable>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Starts, tracks and cancels transfer sessions.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device_id", &self.inner.identity.device_id())
            .field("settings", &self.inner.settings)
            .field("tasks", &self.inner.tasks.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager acting as `identity`.
    #[must_use]
    pub fn new(
        identity: Arc<DeviceIdentity>,
        display_name: impl Into<String>,
        registry: DeviceRegistry,
        trust: SharedTrustStore,
        events: EventBus,
        settings: SessionSettings,
    ) -> Self {
        let consent = default_consent(settings.auto_accept);
        Self {
            inner: Arc::new(Inner {
                identity,
                display_name: display_name.into(),
                registry,
                trust,
                events,
                settings,
                consent,
                table: Mutex::default(),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replace the consent policy. Only valid before the manager is shared.
    #[must_use]
    pub fn with_consent(self, consent: Arc<dyn ConsentPolicy>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.consent = consent;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("Consent policy not replaced: session manager already shared");
                Self { inner }
            }
        }
    }

    /// Start sending `path` to `peer_id`.
    ///
    /// Fails immediately, without opening a connection, when the peer is
    /// not `Online` in the registry, the file cannot be read, or the
    /// per-peer limit is reached. Everything after that is reported through
    /// the session itself.
    pub fn start_send(&self, peer_id: &str, path: &Path) -> Result<Uuid> {
        let device = self.online_device(peer_id)?;
        let (file_name, file_size) = inspect_file(path)?;

        let session = TransferSession::new(
            Direction::Send,
            peer_id,
            self.inner.settings.transfer.chunk_size,
        )
        .with_file(file_name, file_size);
        let progress = Progress::new(session, self.inner.events.clone());
        let cancel = self.inner.shutdown.child_token();
        let session_id = self.reserve(peer_id, &progress, &cancel)?;

        tracing::info!(
            session = %session_id,
            peer = %peer_id,
            file = %path.display(),
            "Starting transfer"
        );
        progress.started();

        let manager = self.clone();
        let path = path.to_path_buf();
        self.inner.tasks.spawn(async move {
            if let Err(e) = manager.run_send(&device, &path, &progress, &cancel).await {
                progress.abort(&e);
            }
            manager.release(session_id);
        });

        Ok(session_id)
    }

    /// Start fetching `remote_path` from the shared directory of `peer_id`.
    ///
    /// The same fail-fast rules as [`SessionManager::start_send`] apply. The
    /// peer answers with a regular offer, accepted without asking since the
    /// user requested the file.
    pub fn start_download(&self, peer_id: &str, remote_path: &str) -> Result<Uuid> {
        let device = self.online_device(peer_id)?;
        let remote_path = crate::share::normalize(remote_path)?;
        let file_name = remote_path
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| Error::InvalidPath("no file name given".to_string()))?
            .to_string();

        let session = TransferSession::new(
            Direction::Receive,
            peer_id,
            self.inner.settings.transfer.chunk_size,
        )
        .with_file(file_name, 0);
        let progress = Progress::new(session, self.inner.events.clone());
        let cancel = self.inner.shutdown.child_token();
        let session_id = self.reserve(peer_id, &progress, &cancel)?;

        tracing::info!(
            session = %session_id,
            peer = %peer_id,
            path = %remote_path,
            "Requesting file"
        );
        progress.started();

        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = manager
                .run_download(&device, &remote_path, &progress, &cancel)
                .await
            {
                progress.abort(&e);
            }
            manager.release(session_id);
        });

        Ok(session_id)
    }

    /// Run the receive side of an authenticated inbound connection.
    ///
    /// When the peer already has the maximum number of sessions, its offer
    /// is answered with a `busy` rejection and [`Error::PeerBusy`] is
    /// returned.
    pub fn accept_incoming<S>(&self, channel: SecureChannel<S>) -> Result<Uuid>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = channel.peer().clone();
        let options = self.inner.settings.transfer;
        let session = TransferSession::new(Direction::Receive, &peer.device_id, options.chunk_size);
        let progress = Progress::new(session, self.inner.events.clone());
        let cancel = self.inner.shutdown.child_token();

        let session_id = match self.reserve(&peer.device_id, &progress, &cancel) {
            Ok(id) => id,
            Err(e) => {
                self.inner
                    .tasks
                    .spawn(reject_busy(channel, options.negotiate_timeout));
                return Err(e);
            }
        };

        let context = ReceiveContext {
            download_dir: self.inner.settings.download_dir.clone(),
            consent: Arc::clone(&self.inner.consent),
            trusted: self.inner.trust.read(|store| store.is_trusted(&peer.device_id)),
            options,
        };

        let manager = self.clone();
        self.inner.tasks.spawn(async move {
            let _ = receive_file(channel, &context, &progress, &cancel).await;
            manager.release(session_id);
        });

        Ok(session_id)
    }

    /// Send a shared file to the peer that asked for it over `channel`.
    ///
    /// `path` must already be resolved inside the shared directory. When
    /// the peer has too many sessions the request is refused with `busy`.
    pub fn serve_download<S>(&self, channel: SecureChannel<S>, path: &Path) -> Result<Uuid>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let peer_id = channel.peer().device_id.clone();
        let options = self.inner.settings.transfer;
        let (file_name, file_size) = match inspect_file(path) {
            Ok(file) => file,
            Err(e) => {
                self.inner.tasks.spawn(refuse(channel, reason::NOT_FOUND));
                return Err(e);
            }
        };

        let session = TransferSession::new(Direction::Send, &peer_id, options.chunk_size)
            .with_file(file_name, file_size);
        let progress = Progress::new(session, self.inner.events.clone());
        let cancel = self.inner.shutdown.child_token();
        let session_id = match self.reserve(&peer_id, &progress, &cancel) {
            Ok(id) => id,
            Err(e) => {
                self.inner.tasks.spawn(refuse(channel, reason::BUSY));
                return Err(e);
            }
        };

        tracing::info!(
            session = %session_id,
            peer = %peer_id,
            file = %path.display(),
            "Serving shared file"
        );

        let manager = self.clone();
        let path = path.to_path_buf();
        self.inner.tasks.spawn(async move {
            let _ = send_file(channel, &path, &options, &progress, &cancel).await;
            manager.release(session_id);
        });

        Ok(session_id)
    }

    /// Connect to `device` and authenticate it.
    ///
    /// The peer must present the id the registry knows it by. Authentication
    /// failures are published as security warnings.
    pub async fn open_channel(&self, device: &Device) -> Result<SecureChannel<TcpStream>> {
        let addr = device.socket_addr();
        let stream = connect(addr, self.inner.settings.connect_timeout).await?;

        let limit = self.inner.settings.handshake_timeout;
        let handshake = SecureChannel::initiate(
            stream,
            &self.inner.identity,
            &self.inner.display_name,
            &self.inner.trust,
        );
        let channel = tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| Error::Timeout(limit.as_secs()))?
            .inspect_err(|e| {
                report_security_failure(&self.inner.events, Some(addr), Some(&device.id), e);
            })?;

        if channel.peer().device_id != device.id {
            let error = Error::HandshakeFailed(format!(
                "expected device '{}' at {addr}, reached '{}'",
                device.id,
                channel.peer().device_id
            ));
            report_security_failure(&self.inner.events, Some(addr), Some(&device.id), &error);
            return Err(error);
        }
        Ok(channel)
    }

    /// Ask a session to stop. Finished sessions are left as they are.
    pub fn cancel(&self, session_id: Uuid) -> Result<()> {
        let table = self.table();
        if let Some(session) = table.active.get(&session_id) {
            tracing::info!(session = %session_id, "Cancelling transfer");
            session.cancel.cancel();
            return Ok(());
        }
        if table.history.iter().any(|s| s.session_id == session_id) {
            return Ok(());
        }
        Err(Error::SessionNotFound(session_id))
    }

    /// Latest snapshot of a running or recently finished session.
    pub fn status(&self, session_id: Uuid) -> Result<TransferSession> {
        let table = self.table();
        if let Some(session) = table.active.get(&session_id) {
            return Ok(session.progress.snapshot());
        }
        table
            .history
            .iter()
            .find(|s| s.session_id == session_id)
            .cloned()
            .ok_or(Error::SessionNotFound(session_id))
    }

    /// Snapshots of every running session that has been announced.
    #[must_use]
    pub fn list_active(&self) -> Vec<TransferSession> {
        self.table()
            .active
            .values()
            .filter(|session| session.progress.is_announced())
            .map(|session| session.progress.snapshot())
            .collect()
    }

    /// Receiver that follows a session until it ends.
    pub fn watch(&self, session_id: Uuid) -> Result<watch::Receiver<TransferSession>> {
        if let Some(session) = self.table().active.get(&session_id) {
            return Ok(session.progress.subscribe());
        }
        let finished = self.status(session_id)?;
        Ok(watch::channel(finished).1)
    }

    /// Cancel every session and wait for their tasks, at most `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.tasks.len(),
                "Transfers still running after shutdown grace period"
            );
        }
    }

    async fn run_send(
        &self,
        device: &Device,
        path: &Path,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let channel = tokio::select! {
            () = cancel.cancelled() => return Err(Error::TransferCancelled),
            channel = self.open_channel(device) => channel?,
        };

        let options = self.inner.settings.transfer;
        send_file(channel, path, &options, progress, cancel).await
    }

    async fn run_download(
        &self,
        device: &Device,
        remote_path: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut channel = tokio::select! {
            () = cancel.cancelled() => return Err(Error::TransferCancelled),
            channel = self.open_channel(device) => channel?,
        };
        let request = ControlMessage::Download {
            path: remote_path.to_string(),
        };
        channel.send(&request.into()).await?;

        let context = ReceiveContext {
            download_dir: self.inner.settings.download_dir.clone(),
            consent: Arc::new(AlwaysAccept),
            trusted: self.inner.trust.read(|store| store.is_trusted(&device.id)),
            options: self.inner.settings.transfer,
        };
        receive_file(channel, &context, progress, cancel).await?;
        Ok(())
    }

    fn online_device(&self, peer_id: &str) -> Result<Device> {
        self.inner
            .registry
            .get(peer_id)
            .filter(Device::is_online)
            .ok_or_else(|| Error::PeerUnavailable(peer_id.to_string()))
    }

    fn reserve(
        &self,
        peer_id: &str,
        progress: &Progress,
        cancel: &CancellationToken,
    ) -> Result<Uuid> {
        let mut table = self.table();
        if table.count_for(peer_id) >= self.inner.settings.max_concurrent_per_peer {
            tracing::info!(peer = %peer_id, "Per-peer transfer limit reached");
            return Err(Error::PeerBusy(peer_id.to_string()));
        }

        let session_id = progress.session_id();
        table.active.insert(
            session_id,
            ActiveSession {
                peer_id: peer_id.to_string(),
                progress: progress.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(session_id)
    }

    fn release(&self, session_id: Uuid) {
        let mut table = self.table();
        let Some(session) = table.active.remove(&session_id) else {
            return;
        };
        if !session.progress.is_announced() {
            return;
        }

        table.history.push_back(session.progress.snapshot());
        while table.history.len() > HISTORY_LIMIT {
            table.history.pop_front();
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, SessionTable> {
        self.inner
            .table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Open a transfer connection to `addr`.
pub(crate) async fn connect(addr: SocketAddr, limit: Duration) -> Result<TcpStream> {
    let stream = match tokio::time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(Error::ConnectFailed {
                addr,
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(Error::ConnectFailed {
                addr,
                reason: format!("no answer within {}s", limit.as_secs()),
            })
        }
    };

    if let Err(e) = configure_tcp_keepalive(&stream) {
        tracing::warn!("Failed to set TCP keep-alive: {}", e);
    }
    Ok(stream)
}

/// Log and publish an authentication failure.
///
/// Other error classes are ignored.
pub(crate) fn report_security_failure(
    events: &EventBus,
    address: Option<SocketAddr>,
    device_id: Option<&str>,
    error: &Error,
) {
    if !error.is_security_warning() {
        return;
    }

    tracing::warn!(
        address = ?address,
        device = ?device_id,
        "Authentication failed, possible impersonation: {}",
        error
    );
    events.emit(StatusEvent::SecurityWarning {
        address,
        device_id: device_id.map(str::to_string),
        reason: error.to_string(),
    });
}

/// Refuse a request with an `error` message and close the connection.
pub(crate) async fn refuse<S>(mut channel: SecureChannel<S>, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(peer = %channel.peer().device_id, reason, "Refusing request");
    let message = ControlMessage::Error {
        reason: reason.to_string(),
    };
    match tokio::time::timeout(Duration::from_secs(2), channel.send(&message.into())).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Failed to send refusal: {}", e),
        Err(_) => tracing::debug!("Timed out sending refusal"),
    }
}

/// Answer the next offer on `channel` with a `busy` rejection.
async fn reject_busy<S>(mut channel: SecureChannel<S>, limit: Duration)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(limit, channel.recv()).await {
        Ok(Ok(Message::Control(ControlMessage::Header(header)))) => {
            tracing::info!(file = %header.file_name, "Rejecting offer, peer is busy");
            let ack = ControlMessage::HeaderAck {
                accept: false,
                reason: Some(reason::BUSY.to_string()),
            };
            if let Err(e) = channel.send(&ack.into()).await {
                tracing::debug!("Failed to send busy rejection: {}", e);
            }
        }
        Ok(Ok(other)) => tracing::debug!("Expected a header, got {}", other.kind()),
        Ok(Err(e)) => tracing::debug!("Connection ended before the offer: {}", e),
        Err(_) => tracing::debug!("No offer within {}s", limit.as_secs()),
    }
}
