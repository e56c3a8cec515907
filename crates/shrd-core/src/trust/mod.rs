//! Paired devices and their pinned identity keys.
//!
//! ## Security Model
//!
//! - Each device has an Ed25519 keypair (generated on first run)
//! - Pairing (`add_device`) runs a handshake and pins the key the peer proved
//! - Later handshakes with that device id must present the same key, otherwise
//!   the connection fails closed with [`Error::KeyMismatch`]
//! - Devices that were never paired may still connect; they are simply not
//!   trusted
//!
//! The store is a JSON file next to the identity file, never synced.

use std::fs;
use std::io::{BufReader, BufWriter};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{constant_time_eq, PeerIdentity, PeerVerifier};
use crate::error::{Error, Result};

/// A paired device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedDevice {
    /// Device identifier
    pub device_id: String,
    /// Display name at pairing time
    pub device_name: String,
    /// Ed25519 public key (base64 encoded)
    pub public_key: String,
    /// When the key was pinned
    pub paired_at: DateTime<Utc>,
    /// Last known IP address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_ip: Option<IpAddr>,
    /// Last known transfer port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_port: Option<u16>,
}

impl TrustedDevice {
    /// Record for a peer that just completed a handshake.
    #[must_use]
    pub fn from_peer(peer: &PeerIdentity) -> Self {
        Self {
            device_id: peer.device_id.clone(),
            device_name: peer.display_name.clone(),
            public_key: peer.public_key_base64(),
            paired_at: Utc::now(),
            last_known_ip: None,
            last_known_port: None,
        }
    }

    /// Set the last known address.
    #[must_use]
    pub fn with_address(mut self, ip: IpAddr, port: u16) -> Self {
        self.last_known_ip = Some(ip);
        self.last_known_port = Some(port);
        self
    }

    /// Get the stored address if available.
    #[must_use]
    pub fn address(&self) -> Option<(IpAddr, u16)> {
        self.last_known_ip.zip(self.last_known_port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TrustDatabase {
    version: u32,
    devices: Vec<TrustedDevice>,
}

/// Trust database for managing paired devices.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    devices: Vec<TrustedDevice>,
}

impl TrustStore {
    /// Load from a specific path. A missing file is an empty store.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                devices: Vec::new(),
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::TrustDbError(format!(
                "Failed to open trust store at {}: {e}",
                path.display()
            ))
        })?;

        let db: TrustDatabase = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::TrustDbError(format!(
                "Failed to parse trust store at {}: {e}",
                path.display()
            ))
        })?;

        Ok(Self {
            path,
            devices: db.devices,
        })
    }

    /// Save the trust store.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::TrustDbError(format!(
                    "Failed to create trust store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let db = TrustDatabase {
            version: 1,
            devices: self.devices.clone(),
        };

        let file = fs::File::create(&self.path).map_err(|e| {
            Error::TrustDbError(format!(
                "Failed to create trust store at {}: {e}",
                self.path.display()
            ))
        })?;

        serde_json::to_writer_pretty(BufWriter::new(file), &db).map_err(|e| {
            Error::TrustDbError(format!(
                "Failed to write trust store at {}: {e}",
                self.path.display()
            ))
        })
    }

    /// List all paired devices.
    #[must_use]
    pub fn list(&self) -> &[TrustedDevice] {
        &self.devices
    }

    /// Find a device by id.
    #[must_use]
    pub fn find_by_id(&self, device_id: &str) -> Option<&TrustedDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Pin a device, replacing any earlier record with the same id.
    pub fn add(&mut self, device: TrustedDevice) -> Result<()> {
        self.devices.retain(|d| d.device_id != device.device_id);
        self.devices.push(device);
        self.save()
    }

    /// Remove a paired device by id.
    pub fn remove(&mut self, device_id: &str) -> Result<bool> {
        let len_before = self.devices.len();
        self.devices.retain(|d| d.device_id != device_id);
        let removed = self.devices.len() < len_before;
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    /// Check if a device is paired.
    #[must_use]
    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.find_by_id(device_id).is_some()
    }

    /// `true` if the device is paired and `public_key` is the pinned key.
    #[must_use]
    pub fn verify_key(&self, device_id: &str, public_key: &str) -> bool {
        self.find_by_id(device_id)
            .is_some_and(|d| constant_time_eq(d.public_key.as_bytes(), public_key.as_bytes()))
    }

    /// Remember where a paired device was last reached.
    pub fn update_address(&mut self, device_id: &str, ip: IpAddr, port: u16) -> Result<bool> {
        let Some(device) = self.devices.iter_mut().find(|d| d.device_id == device_id) else {
            return Ok(false);
        };
        if device.address() == Some((ip, port)) {
            return Ok(true);
        }
        device.last_known_ip = Some(ip);
        device.last_known_port = Some(port);
        self.save()?;
        Ok(true)
    }

    /// Get the path to the trust store file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Trust store shared between the node and its handshakes.
#[derive(Debug, Clone)]
pub struct SharedTrustStore {
    inner: Arc<RwLock<TrustStore>>,
}

impl SharedTrustStore {
    /// Wrap a loaded store.
    #[must_use]
    pub fn new(store: TrustStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    /// Run `f` with read access.
    pub fn read<T>(&self, f: impl FnOnce(&TrustStore) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Run `f` with write access.
    pub fn write<T>(&self, f: impl FnOnce(&mut TrustStore) -> T) -> T {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }
}

impl PeerVerifier for SharedTrustStore {
    fn verify(&self, peer: &PeerIdentity) -> Result<()> {
        let public_key = peer.public_key_base64();
        self.read(|store| match store.find_by_id(&peer.device_id) {
            Some(_) if store.verify_key(&peer.device_id, &public_key) => Ok(()),
            Some(_) => {
                tracing::warn!(
                    "Device {} presented an identity key that does not match the pinned key",
                    peer.device_id
                );
                Err(Error::KeyMismatch(peer.device_id.clone()))
            }
            None => Ok(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn peer(id: &str, key: u8) -> PeerIdentity {
        PeerIdentity {
            device_id: id.to_string(),
            display_name: format!("Device {id}"),
            public_key: [key; 32],
        }
    }

    fn temp_store() -> (TempDir, TrustStore) {
        let dir = TempDir::new().unwrap();
        let store = TrustStore::load_from(dir.path().join("trust.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_and_reload() {
        let (dir, mut store) = temp_store();
        let device = TrustedDevice::from_peer(&peer("A", 1))
            .with_address("192.168.1.5".parse().unwrap(), 9000);
        store.add(device.clone()).unwrap();

        let reloaded = TrustStore::load_from(dir.path().join("trust.json")).unwrap();
        assert_eq!(reloaded.list(), &[device]);
        assert!(reloaded.is_trusted("A"));
    }

    #[test]
    fn test_add_replaces_same_id() {
        let (_dir, mut store) = temp_store();
        store.add(TrustedDevice::from_peer(&peer("A", 1))).unwrap();
        store.add(TrustedDevice::from_peer(&peer("A", 2))).unwrap();

        assert_eq!(store.list().len(), 1);
        assert!(store.verify_key("A", &peer("A", 2).public_key_base64()));
        assert!(!store.verify_key("A", &peer("A", 1).public_key_base64()));
    }

    #[test]
    fn test_remove() {
        let (_dir, mut store) = temp_store();
        store.add(TrustedDevice::from_peer(&peer("A", 1))).unwrap();

        assert!(store.remove("A").unwrap());
        assert!(!store.remove("A").unwrap());
        assert!(!store.is_trusted("A"));
    }

    #[test]
    fn test_verifier_fails_closed_on_mismatch() {
        let (_dir, mut store) = temp_store();
        store.add(TrustedDevice::from_peer(&peer("A", 1))).unwrap();
        let shared = SharedTrustStore::new(store);

        assert!(shared.verify(&peer("A", 1)).is_ok());
        assert!(matches!(
            shared.verify(&peer("A", 9)),
            Err(Error::KeyMismatch(id)) if id == "A"
        ));
        assert!(shared.verify(&peer("stranger", 9)).is_ok());
    }

    #[test]
    fn test_update_address() {
        let (_dir, mut store) = temp_store();
        store.add(TrustedDevice::from_peer(&peer("A", 1))).unwrap();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(store.update_address("A", ip, 9001).unwrap());
        assert_eq!(store.find_by_id("A").unwrap().address(), Some((ip, 9001)));
        assert!(!store.update_address("B", ip, 9001).unwrap());
    }
}
