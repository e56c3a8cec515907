//! The table of known peers.
//!
//! [`DeviceRegistry`] is shared by discovery, the health monitor and the
//! session manager. Writers take a short exclusive lock and apply the change
//! to a copy-on-write map; readers clone an `Arc` to the current map, so a
//! [`Snapshot`] stays consistent while the registry moves on. Nothing in
//! here performs I/O.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, StatusEvent};

/// Reachability of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Announced recently or answered the last probe
    Online,
    /// Missed too many probes
    Offline,
    /// Known but not verified yet
    Unknown,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable identifier
    pub id: String,
    /// Human-readable name
    pub display_name: String,
    /// Last known IP address
    pub address: IpAddr,
    /// Transfer port
    pub port: u16,
    /// Reachability
    pub status: DeviceStatus,
    /// Last time the device was heard from
    pub last_seen: DateTime<Utc>,
    /// Paired by the user; never evicted
    pub trusted: bool,
    /// Failed probes in a row
    #[serde(default)]
    pub missed_probes: u32,
    /// When the device went offline
    #[serde(default)]
    pub offline_since: Option<DateTime<Utc>>,
}

impl Device {
    /// A device in `Unknown` state, last seen now.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        address: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            address,
            port,
            status: DeviceStatus::Unknown,
            last_seen: Utc::now(),
            trusted: false,
            missed_probes: 0,
            offline_since: None,
        }
    }

    /// Same device marked online at `seen`.
    #[must_use]
    pub fn online_at(mut self, seen: DateTime<Utc>) -> Self {
        self.status = DeviceStatus::Online;
        self.last_seen = seen;
        self
    }

    /// Address the transfer listener is reachable at.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Whether a transfer may be started toward this device.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == DeviceStatus::Online
    }
}

/// What [`DeviceRegistry::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New record
    Inserted,
    /// Existing record replaced by newer data
    Updated,
    /// Incoming data was older than the stored record
    Stale,
}

type DeviceMap = HashMap<String, Device>;

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct Snapshot {
    devices: Arc<DeviceMap>,
}

impl Snapshot {
    /// Iterate over the devices in this snapshot.
    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Number of devices in this snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the snapshot holds no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up one device in this snapshot.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Device;
    type IntoIter = std::collections::hash_map::Values<'a, String, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.values()
    }
}

/// Shared table of peers.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<Arc<DeviceMap>>>,
    events: EventBus,
}

impl DeviceRegistry {
    /// Create an empty registry that reports changes on `events`.
    #[must_use]
    pub fn new(events: EventBus) -> Self {
        Self {
            devices: Arc::default(),
            events,
        }
    }

    /// Insert or merge a device.
    ///
    /// The record with the more recent `last_seen` wins; `last_seen` never
    /// moves backward and `trusted` is never cleared by a merge.
    pub fn upsert(&self, incoming: Device) -> UpsertOutcome {
        let mut pending = Vec::new();
        let outcome = self.mutate(|devices| match devices.get_mut(&incoming.id) {
            None => {
                pending.push(StatusEvent::DeviceDiscovered {
                    device: incoming.clone(),
                });
                devices.insert(incoming.id.clone(), incoming);
                UpsertOutcome::Inserted
            }
            Some(existing) if incoming.last_seen < existing.last_seen => {
                existing.trusted |= incoming.trusted;
                UpsertOutcome::Stale
            }
            Some(existing) => {
                let was_online = existing.is_online();
                let trusted = existing.trusted || incoming.trusted;
                let (missed, offline_since) = if incoming.is_online() {
                    (0, None)
                } else {
                    (existing.missed_probes, existing.offline_since)
                };

                *existing = Device {
                    trusted,
                    missed_probes: missed,
                    offline_since,
                    ..incoming
                };

                if existing.is_online() && !was_online {
                    pending.push(StatusEvent::DeviceOnline {
                        id: existing.id.clone(),
                    });
                }
                UpsertOutcome::Updated
            }
        });

        self.emit_all(pending);
        outcome
    }

    /// Look up a device by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Device> {
        self.read().get(id).cloned()
    }

    /// Consistent snapshot of every device.
    #[must_use]
    pub fn list_all(&self) -> Snapshot {
        Snapshot {
            devices: self.read(),
        }
    }

    /// Drop a device.
    pub fn remove(&self, id: &str) -> Option<Device> {
        let removed = self.mutate(|devices| devices.remove(id));
        if removed.is_some() {
            self.events
                .emit(StatusEvent::DeviceRemoved { id: id.to_string() });
        }
        removed
    }

    /// Mark or unmark a device as paired.
    pub fn set_trusted(&self, id: &str, trusted: bool) -> bool {
        self.mutate(|devices| {
            devices
                .get_mut(id)
                .map(|device| device.trusted = trusted)
                .is_some()
        })
    }

    /// A probe reached the device at `now`.
    pub fn record_probe_success(&self, id: &str, now: DateTime<Utc>) {
        let came_online = self.mutate(|devices| {
            let Some(device) = devices.get_mut(id) else {
                return false;
            };
            let was_online = device.is_online();
            device.status = DeviceStatus::Online;
            device.last_seen = device.last_seen.max(now);
            device.missed_probes = 0;
            device.offline_since = None;
            !was_online
        });

        if came_online {
            self.events
                .emit(StatusEvent::DeviceOnline { id: id.to_string() });
        }
    }

    /// A probe failed. Returns the status after applying the miss.
    pub fn record_probe_failure(
        &self,
        id: &str,
        max_misses: u32,
        now: DateTime<Utc>,
    ) -> Option<DeviceStatus> {
        let mut went_offline = false;
        let status = self.mutate(|devices| {
            let device = devices.get_mut(id)?;
            device.missed_probes = device.missed_probes.saturating_add(1);
            if device.missed_probes >= max_misses && device.status != DeviceStatus::Offline {
                device.status = DeviceStatus::Offline;
                device.offline_since = Some(now);
                went_offline = true;
            }
            Some(device.status)
        });

        if went_offline {
            self.events
                .emit(StatusEvent::DeviceOffline { id: id.to_string() });
        }
        status
    }

    /// Remove non-trusted devices that have been offline for longer than
    /// `retention`. Returns the removed ids.
    pub fn evict_stale(&self, now: DateTime<Utc>, retention: Duration) -> Vec<String> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let evicted = self.mutate(|devices| {
            let stale: Vec<String> = devices
                .values()
                .filter(|d| !d.trusted && d.status == DeviceStatus::Offline)
                .filter(|d| {
                    d.offline_since
                        .is_some_and(|since| now.signed_duration_since(since) > retention)
                })
                .map(|d| d.id.clone())
                .collect();
            for id in &stale {
                devices.remove(id);
            }
            stale
        });

        for id in &evicted {
            self.events
                .emit(StatusEvent::DeviceRemoved { id: id.clone() });
        }
        evicted
    }

    fn read(&self) -> Arc<DeviceMap> {
        Arc::clone(&self.devices.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut DeviceMap) -> T) -> T {
        let mut guard = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    fn emit_all(&self, events: Vec<StatusEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn device(id: &str) -> Device {
        Device::new(id, format!("Device {id}"), IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn test_upsert_and_get() {
        let registry = DeviceRegistry::default();
        assert_eq!(registry.upsert(device("A")), UpsertOutcome::Inserted);

        let found = registry.get("A").expect("device");
        assert_eq!(found.display_name, "Device A");
        assert!(registry.get("B").is_none());
    }

    #[test]
    fn test_upsert_prefers_newer_last_seen() {
        let registry = DeviceRegistry::default();
        let now = Utc::now();

        let newer = Device {
            display_name: "New name".into(),
            ..device("A").online_at(now)
        };
        let older = Device {
            display_name: "Old name".into(),
            ..device("A").online_at(now - chrono::Duration::seconds(30))
        };

        registry.upsert(newer);
        assert_eq!(registry.upsert(older), UpsertOutcome::Stale);

        let stored = registry.get("A").unwrap();
        assert_eq!(stored.display_name, "New name");
        assert_eq!(stored.last_seen, now);
    }

    #[test]
    fn test_upsert_keeps_trust() {
        let registry = DeviceRegistry::default();
        let mut trusted = device("A");
        trusted.trusted = true;
        registry.upsert(trusted);

        registry.upsert(device("A").online_at(Utc::now() + chrono::Duration::seconds(1)));
        assert!(registry.get("A").unwrap().trusted);
    }

    #[test]
    fn test_snapshot_is_stable() {
        let registry = DeviceRegistry::default();
        registry.upsert(device("A"));

        let snapshot = registry.list_all();
        registry.upsert(device("B"));
        registry.remove("A");

        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("A").is_some());
        assert_eq!(registry.list_all().len(), 1);
        assert!(registry.list_all().get("B").is_some());
    }

    #[test]
    fn test_probe_failures_go_offline() {
        let registry = DeviceRegistry::default();
        let now = Utc::now();
        registry.upsert(device("A").online_at(now));

        assert_eq!(
            registry.record_probe_failure("A", 3, now),
            Some(DeviceStatus::Online)
        );
        assert_eq!(
            registry.record_probe_failure("A", 3, now),
            Some(DeviceStatus::Online)
        );
        assert_eq!(
            registry.record_probe_failure("A", 3, now),
            Some(DeviceStatus::Offline)
        );
        assert_eq!(registry.get("A").unwrap().offline_since, Some(now));

        registry.record_probe_success("A", now);
        let back = registry.get("A").unwrap();
        assert_eq!(back.status, DeviceStatus::Online);
        assert_eq!(back.missed_probes, 0);
        assert!(back.offline_since.is_none());
    }

    #[test]
    fn test_probe_success_never_moves_last_seen_back() {
        let registry = DeviceRegistry::default();
        let now = Utc::now();
        registry.upsert(device("A").online_at(now));

        registry.record_probe_success("A", now - chrono::Duration::seconds(5));
        assert_eq!(registry.get("A").unwrap().last_seen, now);
    }

    #[test]
    fn test_evict_stale_spares_trusted() {
        let registry = DeviceRegistry::default();
        let then = Utc::now();
        let mut paired = device("T");
        paired.trusted = true;
        registry.upsert(paired);
        registry.upsert(device("U"));

        for id in ["T", "U"] {
            registry.record_probe_failure(id, 1, then);
        }

        let retention = Duration::from_secs(3600);
        assert!(registry
            .evict_stale(then + chrono::Duration::seconds(60), retention)
            .is_empty());

        let evicted = registry.evict_stale(then + chrono::Duration::seconds(3601), retention);
        assert_eq!(evicted, vec!["U".to_string()]);
        assert_eq!(registry.get("T").unwrap().status, DeviceStatus::Offline);
        assert!(registry.get("U").is_none());
    }

    #[tokio::test]
    async fn test_registry_emits_events() {
        use tokio_stream::StreamExt;

        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let registry = DeviceRegistry::new(bus);

        registry.upsert(device("A"));
        registry.record_probe_success("A", Utc::now());
        registry.remove("A");

        assert!(matches!(
            events.next().await,
            Some(StatusEvent::DeviceDiscovered { .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(StatusEvent::DeviceOnline { .. })
        ));
        assert!(matches!(
            events.next().await,
            Some(StatusEvent::DeviceRemoved { .. })
        ));
    }

    #[test]
    fn test_concurrent_writers() {
        let registry = DeviceRegistry::default();
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        registry.upsert(device(&format!("{n}-{i}")));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.list_all().len(), 400);
    }
}
