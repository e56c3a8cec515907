//! Process-wide lifecycle.
//!
//! A [`Node`] owns everything that runs in the background: the transfer
//! listener, discovery, the health monitor and the session manager. It is
//! also the interface UI collaborators talk to. [`Node::shutdown`] cancels
//! every loop and session and waits for them, so no socket outlives it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto::{pairing_code, DeviceIdentity, SecureChannel};
use crate::discovery::{DiscoveryService, DiscoverySettings};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{EventBus, EventStream};
use crate::health::HealthMonitor;
use crate::protocol::{reason, ControlMessage, Message, PresenceRecord};
use crate::registry::{Device, DeviceRegistry, Snapshot};
use crate::session::{self, SessionManager, SessionSettings};
use crate::share::{self as shared, RemoteDir, SharedDir};
use crate::transfer::{configure_tcp_keepalive, ConsentPolicy, TransferSession};
use crate::trust::{SharedTrustStore, TrustStore, TrustedDevice};

/// File holding the device key inside the data directory.
pub const IDENTITY_FILE: &str = "identity.json";

/// File holding pinned peers inside the data directory.
pub const TRUST_FILE: &str = "trust.json";

/// How long shutdown waits for sessions and loops to stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running device.
pub struct Node {
    identity: Arc<DeviceIdentity>,
    config: Config,
    events: EventBus,
    registry: DeviceRegistry,
    trust: SharedTrustStore,
    sessions: SessionManager,
    local_addr: SocketAddr,
    pairing_code: String,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_id", &self.identity.device_id())
            .field("local_addr", &self.local_addr)
            .field("pairing_code", &self.pairing_code)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Start a node with identity and trust kept in the default data directory.
    pub async fn start(config: Config) -> Result<Self> {
        Self::start_with(config, &Config::data_dir(), None).await
    }

    /// Start a node keeping its identity and trust store in `data_dir`.
    ///
    /// `consent` replaces the policy derived from `general.auto_accept`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the identity or
    /// trust store cannot be loaded, or the transfer port cannot be bound.
    /// Discovery failures are logged and do not prevent the start.
    pub async fn start_with(
        config: Config,
        data_dir: &Path,
        consent: Option<Arc<dyn ConsentPolicy>>,
    ) -> Result<Self> {
        config.validate()?;

        let identity = Arc::new(DeviceIdentity::load_or_generate(
            &data_dir.join(IDENTITY_FILE),
        )?);
        let trust = SharedTrustStore::new(TrustStore::load_from(data_dir.join(TRUST_FILE))?);
        let events = EventBus::new();
        let registry = DeviceRegistry::new(events.clone());
        restore_trusted(&registry, &trust);

        let bind = SocketAddr::new(config.network.bind_address, config.network.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            tracing::error!(%bind, "Cannot bind transfer listener: {}", e);
            Error::Io(e)
        })?;
        let local_addr = listener.local_addr()?;

        let advertised_ip = advertised_ip(config.network.bind_address);
        let code = pairing_code(identity.device_id(), advertised_ip, local_addr.port());
        let display_name = config.general.device_name.clone();

        let mut sessions = SessionManager::new(
            Arc::clone(&identity),
            display_name.clone(),
            registry.clone(),
            trust.clone(),
            events.clone(),
            SessionSettings::from_config(&config),
        );
        if let Some(consent) = consent {
            sessions = sessions.with_consent(consent);
        }

        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();

        if config.network.discovery || config.network.mdns {
            let local = PresenceRecord {
                id: identity.device_id().to_string(),
                display_name: display_name.clone(),
                port: local_addr.port(),
            };
            let discovery = DiscoveryService::new(
                local,
                code.clone(),
                DiscoverySettings::from_config(&config.network),
                registry.clone(),
            );
            if let Err(e) = discovery.spawn(&mut tasks, &shutdown).await {
                tracing::warn!(
                    "Discovery unavailable, only paired devices will be reachable: {}",
                    e
                );
            }
        }

        let health = HealthMonitor::new(registry.clone(), config.health.clone());
        tasks.spawn(health.run(shutdown.clone()));

        let share = config.general.share_dir.clone().map(SharedDir::new);
        if let Some(share) = &share {
            tracing::info!(dir = %share.root().display(), "Sharing directory with paired devices");
        }

        let inbound = Inbound {
            identity: Arc::clone(&identity),
            display_name,
            trust: trust.clone(),
            registry: registry.clone(),
            events: events.clone(),
            sessions: sessions.clone(),
            handshake_timeout: config.network.handshake_timeout,
            request_timeout: config.transfer.negotiate_timeout,
            share,
        };
        tasks.spawn(accept_loop(listener, inbound, shutdown.clone()));

        tracing::info!(
            device = %identity.device_id(),
            address = %local_addr,
            code = %code,
            "Node started"
        );

        Ok(Self {
            identity,
            config,
            events,
            registry,
            trust,
            sessions,
            local_addr,
            pairing_code: code,
            shutdown,
            tasks,
        })
    }

    /// This device's id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        self.identity.device_id()
    }

    /// This device's display name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.config.general.device_name
    }

    /// Address the transfer listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Code users compare when pairing.
    #[must_use]
    pub fn pairing_code(&self) -> &str {
        &self.pairing_code
    }

    /// The configuration the node runs with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The shared device registry.
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Pinned peers.
    #[must_use]
    pub const fn trust(&self) -> &SharedTrustStore {
        &self.trust
    }

    /// Every known device.
    #[must_use]
    pub fn list_devices(&self) -> Snapshot {
        self.registry.list_all()
    }

    /// Pair with the device listening at `ip:port`.
    ///
    /// Runs a handshake, pins the peer's identity key and marks it trusted.
    /// A device that was paired before must present the same key.
    pub async fn add_device(&self, ip: IpAddr, port: u16) -> Result<Device> {
        let addr = SocketAddr::new(ip, port);
        let stream = session::connect(addr, self.config.network.connect_timeout).await?;

        let limit = self.config.network.handshake_timeout;
        let channel = tokio::time::timeout(
            limit,
            SecureChannel::initiate(
                stream,
                &self.identity,
                self.display_name(),
                &self.trust,
            ),
        )
        .await
        .map_err(|_| Error::Timeout(limit.as_secs()))?
        .inspect_err(|e| session::report_security_failure(&self.events, Some(addr), None, e))?;
        let peer = channel.peer().clone();
        drop(channel);

        self.trust
            .write(|store| store.add(TrustedDevice::from_peer(&peer).with_address(ip, port)))?;

        let mut device =
            Device::new(&peer.device_id, &peer.display_name, ip, port).online_at(Utc::now());
        device.trusted = true;
        self.registry.upsert(device.clone());
        self.registry.set_trusted(&peer.device_id, true);

        tracing::info!(device = %peer.device_id, %addr, "Paired with device");
        Ok(self.registry.get(&peer.device_id).unwrap_or(device))
    }

    /// Unpin a device. It stays in the registry until it goes stale.
    pub fn forget_device(&self, device_id: &str) -> Result<bool> {
        let removed = self.trust.write(|store| store.remove(device_id))?;
        self.registry.set_trusted(device_id, false);
        Ok(removed)
    }

    /// Start sending a file. See [`SessionManager::start_send`].
    pub fn send(&self, peer_id: &str, path: &Path) -> Result<Uuid> {
        self.sessions.start_send(peer_id, path)
    }

    /// Check that a known device answers, returning the round-trip time.
    ///
    /// Unlike [`Node::send`] this works for devices not currently `Online`;
    /// an answer marks them online again.
    pub async fn ping(&self, peer_id: &str) -> Result<Duration> {
        let device = self
            .registry
            .get(peer_id)
            .ok_or_else(|| Error::PeerUnavailable(peer_id.to_string()))?;
        let mut channel = self.sessions.open_channel(&device).await?;

        let started = Instant::now();
        channel.send(&ControlMessage::Ping.into()).await?;
        let limit = self.config.transfer.negotiate_timeout;
        match request_reply(&mut channel, limit).await? {
            ControlMessage::Pong => {}
            other => return Err(unexpected_reply(other.kind(), "pong")),
        }
        let elapsed = started.elapsed();

        self.registry.record_probe_success(peer_id, Utc::now());
        tracing::debug!(peer = %peer_id, ms = elapsed.as_millis(), "Ping answered");
        Ok(elapsed)
    }

    /// List a directory shared by an online device.
    ///
    /// `path` is relative to the peer's shared directory; empty lists its
    /// root. Only paired devices are answered.
    pub async fn browse(&self, peer_id: &str, path: &str) -> Result<RemoteDir> {
        let path = shared::normalize(path)?;
        let device = self
            .registry
            .get(peer_id)
            .filter(Device::is_online)
            .ok_or_else(|| Error::PeerUnavailable(peer_id.to_string()))?;
        let mut channel = self.sessions.open_channel(&device).await?;

        let request = ControlMessage::ListDir { path: path.clone() };
        channel.send(&request.into()).await?;
        let limit = self.config.transfer.negotiate_timeout;
        match request_reply(&mut channel, limit).await? {
            ControlMessage::Listing { path, entries } => Ok(RemoteDir { path, entries }),
            other => Err(unexpected_reply(other.kind(), "listing")),
        }
    }

    /// Download a file from an online device's shared directory. See
    /// [`SessionManager::start_download`].
    pub fn download(&self, peer_id: &str, remote_path: &str) -> Result<Uuid> {
        self.sessions.start_download(peer_id, remote_path)
    }

    /// Cancel a transfer.
    pub fn cancel(&self, session_id: Uuid) -> Result<()> {
        self.sessions.cancel(session_id)
    }

    /// Snapshot of a transfer.
    pub fn status(&self, session_id: Uuid) -> Result<TransferSession> {
        self.sessions.status(session_id)
    }

    /// Running transfers.
    #[must_use]
    pub fn list_transfers(&self) -> Vec<TransferSession> {
        self.sessions.list_active()
    }

    /// Follow one transfer.
    pub fn watch_session(&self, session_id: Uuid) -> Result<watch::Receiver<TransferSession>> {
        self.sessions.watch(session_id)
    }

    /// Every status event from now on.
    #[must_use]
    pub fn subscribe_status(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Stop every loop and session and wait for them to finish.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down");
        self.shutdown.cancel();
        self.sessions.shutdown(SHUTDOWN_GRACE).await;

        let mut tasks = std::mem::take(&mut self.tasks);
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Background tasks did not stop in time, aborting them");
            tasks.shutdown().await;
        }
        tracing::debug!("Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Parse `host`, `host:port`, `[v6]` or `[v6]:port`, defaulting to the
/// standard transfer port.
pub fn parse_peer_address(host: &str) -> Result<SocketAddr> {
    let host = host.trim();
    let invalid = || {
        Error::InvalidInput(format!(
            "invalid address '{host}', expected IP or IP:PORT (e.g. 192.168.1.20:{})",
            crate::DEFAULT_PORT
        ))
    };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Some(inner) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        let ip: IpAddr = inner.parse().map_err(|_| invalid())?;
        return Ok(SocketAddr::new(ip, crate::DEFAULT_PORT));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, crate::DEFAULT_PORT));
    }
    if let Some((ip, port)) = host.rsplit_once(':') {
        let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid port '{port}'")))?;
        return Ok(SocketAddr::new(ip, port));
    }
    Err(invalid())
}

/// Load pinned devices with a known address as `Unknown`.
fn restore_trusted(registry: &DeviceRegistry, trust: &SharedTrustStore) {
    let restored: Vec<Device> = trust.read(|store| {
        store
            .list()
            .iter()
            .filter_map(|paired| {
                let (ip, port) = paired.address()?;
                let mut device = Device::new(&paired.device_id, &paired.device_name, ip, port);
                device.trusted = true;
                Some(device)
            })
            .collect()
    });

    tracing::debug!(count = restored.len(), "Restored paired devices");
    for device in restored {
        registry.upsert(device);
    }
}

/// The address peers most likely reach us at.
///
/// A concrete bind address is used as is; for a wildcard bind, the address
/// of the interface holding the default route.
#[must_use]
pub fn advertised_ip(bind_address: IpAddr) -> IpAddr {
    if !bind_address.is_unspecified() {
        return bind_address;
    }

    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}

/// Read the answer to a request sent on `channel`.
async fn request_reply(
    channel: &mut SecureChannel<TcpStream>,
    limit: Duration,
) -> Result<ControlMessage> {
    match tokio::time::timeout(limit, channel.recv()).await {
        Ok(Ok(Message::Control(ControlMessage::Error { reason }))) => {
            Err(Error::RemoteAbort(reason))
        }
        Ok(Ok(Message::Control(message))) => Ok(message),
        Ok(Ok(other)) => Err(unexpected_reply(other.kind(), "control message")),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout(limit.as_secs())),
    }
}

fn unexpected_reply(kind: &str, expected: &str) -> Error {
    Error::ProtocolError(format!("expected {expected}, got {kind}"))
}

/// What inbound connections need from the node.
#[derive(Clone)]
struct Inbound {
    identity: Arc<DeviceIdentity>,
    display_name: String,
    trust: SharedTrustStore,
    registry: DeviceRegistry,
    events: EventBus,
    sessions: SessionManager,
    handshake_timeout: Duration,
    /// Wait for the first message after the handshake
    request_timeout: Duration,
    share: Option<SharedDir>,
}

async fn accept_loop(listener: TcpListener, inbound: Inbound, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!("Transfer listener received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    connections.spawn(inbound.clone().handle(stream, addr));
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

impl Inbound {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = configure_tcp_keepalive(&stream) {
            tracing::debug!("Failed to set TCP keep-alive: {}", e);
        }

        let handshake =
            SecureChannel::accept(stream, &self.identity, &self.display_name, &self.trust);
        let channel = match tokio::time::timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) if e.is_security_warning() => {
                session::report_security_failure(&self.events, Some(addr), None, &e);
                return;
            }
            // Health probes connect and hang up without a handshake.
            Ok(Err(e)) if e.class() == ErrorClass::Network => {
                tracing::debug!(%addr, "Connection closed during handshake: {}", e);
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(%addr, "Rejected connection: {}", e);
                return;
            }
            Err(_) => {
                tracing::debug!(%addr, "Handshake timed out");
                return;
            }
        };

        let peer_id = channel.peer().device_id.clone();
        self.registry.record_probe_success(&peer_id, Utc::now());

        if let Err(e) = self.dispatch(channel, addr).await {
            tracing::info!(peer = %peer_id, %addr, "Declined connection: {}", e);
        }
    }

    /// Route an authenticated connection by its first message.
    async fn dispatch(
        &self,
        mut channel: SecureChannel<TcpStream>,
        addr: SocketAddr,
    ) -> Result<()> {
        let peer_id = channel.peer().device_id.clone();
        let first = match tokio::time::timeout(self.request_timeout, channel.recv()).await {
            Ok(Ok(message)) => message,
            // Pairing connects, authenticates and hangs up.
            Ok(Err(e)) if e.class() == ErrorClass::Network => {
                tracing::debug!(peer = %peer_id, "Connection closed after handshake: {}", e);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Timeout(self.request_timeout.as_secs())),
        };

        if matches!(first, Message::Control(ControlMessage::Header(_))) {
            channel.unread(first);
            let session_id = self.sessions.accept_incoming(channel)?;
            tracing::debug!(session = %session_id, peer = %peer_id, %addr, "Accepted transfer");
            return Ok(());
        }

        match first {
            Message::Control(ControlMessage::Ping) => {
                channel.send(&ControlMessage::Pong.into()).await?;
            }
            Message::Control(ControlMessage::ListDir { path }) => {
                let Some(share) = self.share_for(&peer_id) else {
                    session::refuse(channel, reason::FORBIDDEN).await;
                    return Ok(());
                };
                match share.list(&path).await {
                    Ok(listing) => {
                        let reply = ControlMessage::Listing {
                            path: listing.path,
                            entries: listing.entries,
                        };
                        channel.send(&reply.into()).await?;
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, %path, "Listing refused: {}", e);
                        session::refuse(channel, shared::refusal_reason(&e)).await;
                    }
                }
            }
            Message::Control(ControlMessage::Download { path }) => {
                let Some(share) = self.share_for(&peer_id) else {
                    session::refuse(channel, reason::FORBIDDEN).await;
                    return Ok(());
                };
                match share.file(&path).await {
                    Ok(file) => {
                        let session_id = self.sessions.serve_download(channel, &file)?;
                        tracing::debug!(
                            session = %session_id,
                            peer = %peer_id,
                            %path,
                            "Serving download"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer_id, %path, "Download refused: {}", e);
                        session::refuse(channel, shared::refusal_reason(&e)).await;
                    }
                }
            }
            other => {
                let kind = other.kind();
                session::refuse(channel, reason::PROTOCOL).await;
                return Err(Error::ProtocolError(format!(
                    "unexpected {kind} as first message"
                )));
            }
        }
        Ok(())
    }

    /// The shared directory, if `peer_id` may use it.
    fn share_for(&self, peer_id: &str) -> Option<&SharedDir> {
        let share = self.share.as_ref()?;
        if !self.trust.read(|store| store.is_trusted(peer_id)) {
            tracing::info!(peer = %peer_id, "Refusing shared directory access to unpaired device");
            return None;
        }
        Some(share)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer_address() {
        assert_eq!(
            parse_peer_address("192.168.1.20").unwrap(),
            "192.168.1.20:52637".parse().unwrap()
        );
        assert_eq!(
            parse_peer_address(" 192.168.1.20:9000 ").unwrap(),
            "192.168.1.20:9000".parse().unwrap()
        );
        assert_eq!(
            parse_peer_address("[::1]").unwrap(),
            "[::1]:52637".parse().unwrap()
        );
        assert_eq!(
            parse_peer_address("[::1]:9000").unwrap(),
            "[::1]:9000".parse().unwrap()
        );
        assert!(matches!(
            parse_peer_address("laptop.local"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            parse_peer_address("10.0.0.1:http"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_advertised_ip_prefers_bind_address() {
        let bound: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(advertised_ip(bound), bound);
        assert!(!advertised_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).is_unspecified());
    }

    #[test]
    fn test_restore_trusted_devices() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = TrustStore::load_from(dir.path().join(TRUST_FILE)).unwrap();
        let trust = SharedTrustStore::new(store);
        let peer = crate::crypto::PeerIdentity {
            device_id: "B".into(),
            display_name: "Desk".into(),
            public_key: [1; 32],
        };
        trust
            .write(|store| {
                let ip = "10.0.0.2".parse().unwrap();
                store.add(TrustedDevice::from_peer(&peer).with_address(ip, 9001))
            })
            .unwrap();

        let registry = DeviceRegistry::new(EventBus::new());
        restore_trusted(&registry, &trust);

        let device = registry.get("B").unwrap();
        assert!(device.trusted);
        assert_eq!(device.status, crate::registry::DeviceStatus::Unknown);
        assert_eq!(device.port, 9001);
    }
}
