//! UDP presence beacons.
//!
//! The announcer broadcasts a [`PresenceRecord`] on a fixed interval; the
//! listener turns every datagram it hears into a registry upsert.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{self, PresenceRecord};
use crate::registry::DeviceRegistry;

/// Largest datagram we read.
const MAX_DATAGRAM: usize = 2048;

/// Pause after a failed receive before trying again.
const RECV_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Sends presence beacons.
#[derive(Debug)]
pub struct BeaconAnnouncer {
    socket: UdpSocket,
    target: SocketAddr,
}

impl BeaconAnnouncer {
    /// Create a broadcast-capable socket that sends to `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created.
    pub async fn bind(target: SocketAddr) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| Error::BroadcastFailed(e.to_string()))?;

        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        socket.bind(&addr.into())?;

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self { socket, target })
    }

    /// Send one beacon.
    pub async fn announce(&self, record: &PresenceRecord) -> Result<()> {
        let json = protocol::encode_payload(record)?;
        self.socket
            .send_to(&json, self.target)
            .await
            .map_err(|e| Error::BroadcastFailed(e.to_string()))?;
        Ok(())
    }

    /// Announce every `interval` until `shutdown` is cancelled.
    pub async fn run(
        self,
        record: PresenceRecord,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Beacon announcer received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.announce(&record).await {
                        tracing::warn!("Failed to send beacon: {}", e);
                    }
                }
            }
        }
    }
}

/// Receives presence beacons.
#[derive(Debug)]
pub struct BeaconListener {
    socket: UdpSocket,
}

impl BeaconListener {
    /// Bind the listener to `port` on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created.
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket.bind(&addr.into())?;

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        Ok(Self { socket })
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next well-formed record.
    ///
    /// Datagrams that do not parse are skipped.
    pub async fn recv(&self) -> Result<(PresenceRecord, IpAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            match protocol::decode_payload::<PresenceRecord>(&buf[..len]) {
                Ok(record) => return Ok((record, source.ip())),
                Err(e) => {
                    tracing::debug!(%source, "Ignoring malformed presence datagram: {}", e);
                }
            }
        }
    }

    /// Feed every record heard into `registry` until `shutdown` is cancelled.
    pub async fn run(
        self,
        registry: DeviceRegistry,
        local_id: String,
        shutdown: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Beacon listener received shutdown signal");
                    break;
                }
                received = self.recv() => received,
            };

            match received {
                Ok((record, source)) => {
                    tracing::debug!(id = %record.id, %source, "Presence beacon");
                    super::handle_record(&registry, &local_id, record, source, Utc::now());
                }
                Err(e) => {
                    tracing::warn!("Failed to receive beacon: {}", e);
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(RECV_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::DeviceStatus;

    #[tokio::test]
    async fn test_beacon_loopback() {
        let listener = BeaconListener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let announcer = BeaconAnnouncer::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();

        let record = PresenceRecord {
            id: "A".to_string(),
            display_name: "Laptop".to_string(),
            port: 9000,
        };
        announcer.announce(&record).await.unwrap();

        let (received, source) = tokio::time::timeout(Duration::from_secs(5), listener.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, record);
        assert!(source.is_loopback());
    }

    #[tokio::test]
    async fn test_listener_skips_garbage_and_stops() {
        let listener = BeaconListener::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = DeviceRegistry::new(EventBus::new());
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(listener.run(registry.clone(), "me".to_string(), shutdown.clone()));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        sender.send_to(b"not json", target).await.unwrap();
        sender
            .send_to(br#"{"id":"B","displayName":"Desktop","port":9001}"#, target)
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.get("B").is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let device = registry.get("B").unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.port, 9001);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
