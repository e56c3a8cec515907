//! Presence announcements for shrd.
//!
//! This module keeps the [`DeviceRegistry`] fed with peers on the same LAN
//! segment using:
//! - UDP broadcast beacons (always)
//! - mDNS/DNS-SD (when the `mdns` feature is enabled and configured)
//!
//! ## Protocol
//!
//! - Port: 52638 (UDP)
//! - Announce interval: every 30 seconds by default
//!
//! ## Presence Packet
//!
//! ```json
//! { "id": "3f9a1c2b7d4e8f60", "displayName": "Marcus-Laptop", "port": 52637 }
//! ```
//!
//! Every record heard from another device is upserted as `Online` with
//! `lastSeen = now`. Records carrying our own id are dropped. Send and
//! receive errors are logged and retried on the next tick; nothing here
//! ends the process.

mod beacon;
#[cfg(feature = "mdns")]
pub mod mdns;

pub use beacon::{BeaconAnnouncer, BeaconListener};

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::protocol::PresenceRecord;
use crate::registry::{Device, DeviceRegistry, UpsertOutcome};

/// Where and how often to announce.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// UDP port beacons are received on
    pub listen_port: u16,
    /// Destination of outgoing beacons
    pub announce_target: SocketAddr,
    /// Time between beacons
    pub announce_interval: Duration,
    /// Send and receive UDP beacons
    pub beacons: bool,
    /// Also publish and browse over mDNS
    pub mdns: bool,
}

impl DiscoverySettings {
    /// Settings derived from the network configuration.
    #[must_use]
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            listen_port: network.discovery_port,
            announce_target: SocketAddr::new(network.announce_address, network.discovery_port),
            announce_interval: network.announce_interval,
            beacons: network.discovery,
            mdns: network.mdns,
        }
    }
}

/// Announces this device and learns about others.
#[derive(Debug, Clone)]
pub struct DiscoveryService {
    local: PresenceRecord,
    #[cfg_attr(not(feature = "mdns"), allow(dead_code))]
    pairing_code: String,
    settings: DiscoverySettings,
    registry: DeviceRegistry,
}

impl DiscoveryService {
    /// Create a service announcing `local`.
    #[must_use]
    pub fn new(
        local: PresenceRecord,
        pairing_code: impl Into<String>,
        settings: DiscoverySettings,
        registry: DeviceRegistry,
    ) -> Self {
        Self {
            local,
            pairing_code: pairing_code.into(),
            settings,
            registry,
        }
    }

    /// The record this device announces.
    #[must_use]
    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    /// Bind the sockets and spawn the announce and listen loops onto `tasks`.
    ///
    /// UDP beacons and mDNS start independently: a failure of one is logged
    /// and the other still runs. An error is returned only when something
    /// was enabled and nothing started. Once the loops run, they only stop
    /// when `shutdown` is cancelled.
    pub async fn spawn(&self, tasks: &mut JoinSet<()>, shutdown: &CancellationToken) -> Result<()> {
        let mut started = false;
        let mut failure = None;

        if self.settings.beacons {
            match self.spawn_beacons(tasks, shutdown).await {
                Ok(()) => started = true,
                Err(e) => {
                    let port = self.settings.listen_port;
                    tracing::warn!(port, "UDP discovery unavailable: {}", e);
                    failure = Some(e);
                }
            }
        }

        #[cfg(feature = "mdns")]
        if self.settings.mdns {
            match mdns::MdnsPresence::start(&self.local, &self.pairing_code) {
                Ok(presence) => {
                    tasks.spawn(presence.run(self.registry.clone(), shutdown.clone()));
                    started = true;
                }
                Err(e) => {
                    tracing::warn!("mDNS discovery unavailable: {}", e);
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) if !started => Err(e),
            _ => Ok(()),
        }
    }

    async fn spawn_beacons(
        &self,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let announcer = BeaconAnnouncer::bind(self.settings.announce_target).await?;
        let listener = BeaconListener::bind(self.settings.listen_port).await?;

        tracing::info!(
            port = self.settings.listen_port,
            target = %self.settings.announce_target,
            "Discovery started"
        );

        tasks.spawn(announcer.run(
            self.local.clone(),
            self.settings.announce_interval,
            shutdown.clone(),
        ));
        tasks.spawn(listener.run(
            self.registry.clone(),
            self.local.id.clone(),
            shutdown.clone(),
        ));
        Ok(())
    }
}

/// Apply one received presence record to the registry.
///
/// Returns `None` when the record was dropped (our own id or an empty id).
pub fn handle_record(
    registry: &DeviceRegistry,
    local_id: &str,
    record: PresenceRecord,
    source: IpAddr,
    now: DateTime<Utc>,
) -> Option<UpsertOutcome> {
    if record.id.is_empty() || record.id == local_id {
        return None;
    }

    let device = Device::new(record.id, record.display_name, source, record.port).online_at(now);
    let outcome = registry.upsert(device);
    if outcome == UpsertOutcome::Inserted {
        tracing::info!(address = %source, "Discovered new device");
    }
    Some(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::DeviceStatus;

    fn record(id: &str) -> PresenceRecord {
        PresenceRecord {
            id: id.to_string(),
            display_name: format!("Device {id}"),
            port: 9000,
        }
    }

    fn service(listen_port: u16, mdns: bool) -> DiscoveryService {
        let settings = DiscoverySettings {
            listen_port,
            announce_target: SocketAddr::from(([127, 0, 0, 1], listen_port)),
            announce_interval: Duration::from_secs(30),
            beacons: true,
            mdns,
        };
        DiscoveryService::new(
            record("me"),
            "ABCD-1234",
            settings,
            DeviceRegistry::new(EventBus::new()),
        )
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_taken_beacon_port_without_mdns_is_an_error() {
        // Bound without SO_REUSEADDR, so the listener cannot share it.
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut tasks = JoinSet::new();
        let shutdown = CancellationToken::new();
        let result = service(port, false).spawn(&mut tasks, &shutdown).await;

        assert!(matches!(result, Err(crate::Error::Io(_))), "got {result:?}");
        assert!(tasks.is_empty());
    }

    #[cfg(all(target_os = "linux", feature = "mdns"))]
    #[tokio::test]
    async fn test_taken_beacon_port_still_starts_mdns() {
        let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut tasks = JoinSet::new();
        let shutdown = CancellationToken::new();
        let result = service(port, true).spawn(&mut tasks, &shutdown).await;

        // mDNS itself may be unavailable on the test host; either way the
        // beacon failure must not have ended the setup early.
        match result {
            Ok(()) => assert_eq!(tasks.len(), 1),
            Err(e) => assert!(matches!(e, crate::Error::Internal(_)), "got {e:?}"),
        }
        shutdown.cancel();
        while tasks.join_next().await.is_some() {}
    }

    #[test]
    fn test_own_record_is_dropped() {
        let registry = DeviceRegistry::new(EventBus::new());
        let ip: IpAddr = "192.168.1.10".parse().unwrap();

        assert!(handle_record(&registry, "me", record("me"), ip, Utc::now()).is_none());
        assert!(handle_record(&registry, "me", record(""), ip, Utc::now()).is_none());
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn test_record_forces_online() {
        let registry = DeviceRegistry::new(EventBus::new());
        let ip: IpAddr = "192.168.1.10".parse().unwrap();
        let now = Utc::now();

        let mut offline = Device::new("A", "Old name", ip, 9000);
        offline.status = DeviceStatus::Offline;
        offline.last_seen = now - chrono::Duration::minutes(5);
        registry.upsert(offline);

        let outcome = handle_record(&registry, "me", record("A"), ip, now);
        assert_eq!(outcome, Some(UpsertOutcome::Updated));

        let device = registry.get("A").unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_seen, now);
        assert_eq!(device.display_name, "Device A");
    }

    #[test]
    fn test_settings_from_config() {
        let network = NetworkConfig::default();
        let settings = DiscoverySettings::from_config(&network);

        assert_eq!(settings.listen_port, crate::DEFAULT_DISCOVERY_PORT);
        assert_eq!(settings.announce_target.port(), crate::DEFAULT_DISCOVERY_PORT);
        assert_eq!(settings.announce_interval, Duration::from_secs(30));
    }
}
