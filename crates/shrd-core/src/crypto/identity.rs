//! Device identity management.
//!
//! Each device owns an Ed25519 key pair. The public half is what a peer pins
//! when pairing; the secret half signs every handshake transcript.
//!
//! ## Key Storage
//!
//! The identity is stored as `identity.json` in the platform data directory
//! (see [`Config::data_dir`](crate::config::Config::data_dir)). The secret key
//! is base64 encoded. The device id is stored next to it, so it survives
//! restarts even when the host is renamed.

use std::fs;
use std::path::{Path, PathBuf};

use base64::prelude::*;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Device identity containing an Ed25519 key pair.
#[derive(Debug)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    device_id: String,
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    secret_key: String,
    device_id: String,
}

impl DeviceIdentity {
    /// Generate a new random device identity.
    ///
    /// The device id is derived from the public key hash.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let device_id = Self::derive_device_id(&signing_key.verifying_key());

        Self {
            signing_key,
            device_id,
            path: None,
        }
    }

    /// Replace the device id. Used when the id is assigned externally.
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// Load device identity from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to read identity file {}: {e}",
                path.display()
            ))
        })?;

        let file: IdentityFile = serde_json::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse identity file: {e}")))?;

        let secret_bytes = BASE64_STANDARD
            .decode(&file.secret_key)
            .map_err(|e| Error::ConfigError(format!("Failed to decode secret key: {e}")))?;

        let secret_array: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| Error::ConfigError("Invalid secret key length".to_string()))?;

        if file.device_id.is_empty() {
            return Err(Error::ConfigError(
                "Identity file has an empty device id".to_string(),
            ));
        }

        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret_array),
            device_id: file.device_id,
            path: Some(path.to_path_buf()),
        })
    }

    /// Load the identity at `path`, or generate and save a new one.
    ///
    /// On first run a new identity is created; afterwards the same id and
    /// key are returned every time.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from(path)
        } else {
            let mut identity = Self::generate();
            identity.path = Some(path.to_path_buf());
            identity.save()?;
            tracing::info!("Generated new device identity {}", identity.device_id);
            Ok(identity)
        }
    }

    /// Save the device identity to its path.
    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::ConfigError("No path set for identity".to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to create identity directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let file = IdentityFile {
            version: 1,
            secret_key: BASE64_STANDARD.encode(self.signing_key.to_bytes()),
            device_id: self.device_id.clone(),
        };

        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Serialization(format!("Failed to serialize identity: {e}")))?;

        write_private(path, content.as_bytes())
            .map_err(|e| Error::ConfigError(format!("Failed to write identity file: {e}")))?;

        Ok(())
    }

    /// Sign data with this identity's private key.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a signature against a public key.
    #[must_use]
    pub fn verify(public_key_bytes: &[u8; 32], data: &[u8], signature_bytes: &[u8; 64]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(public_key_bytes) else {
            return false;
        };

        let signature = Signature::from_bytes(signature_bytes);
        verifying_key.verify(data, &signature).is_ok()
    }

    /// Get the public key as raw bytes.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the public key as a base64-encoded string.
    #[must_use]
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.public_key_bytes())
    }

    /// Get the stable device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// First 16 hex chars of SHA-256 over a domain tag and the public key.
    fn derive_device_id(verifying_key: &VerifyingKey) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(b"shrd:device_id:");
        hasher.update(verifying_key.as_bytes());
        let hash = hasher.finalize();

        super::to_hex(&hash[..8])
    }
}

/// Write `content` readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies to newly created files.
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        let identity = DeviceIdentity::generate();

        assert_eq!(identity.device_id().len(), 16);
        let decoded = BASE64_STANDARD
            .decode(identity.public_key_base64())
            .expect("should decode");
        assert_eq!(decoded.len(), 32);
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = DeviceIdentity::generate();
        let data = b"transcript";

        let signature = identity.sign(data);
        let public_key = identity.public_key_bytes();
        assert!(DeviceIdentity::verify(&public_key, data, &signature));
        assert!(!DeviceIdentity::verify(&public_key, b"other", &signature));

        let mut bad_signature = signature;
        bad_signature[0] ^= 0xff;
        assert!(!DeviceIdentity::verify(&public_key, data, &bad_signature));
    }

    #[test]
    fn test_device_id_is_deterministic() {
        let identity = DeviceIdentity::generate();
        let derived = DeviceIdentity::derive_device_id(&identity.signing_key.verifying_key());
        assert_eq!(derived, identity.device_id());
    }

    #[test]
    fn test_load_or_generate_is_stable() {
        let temp_dir = tempfile::tempdir().expect("should create temp dir");
        let path = temp_dir.path().join("nested").join("identity.json");

        let first = DeviceIdentity::load_or_generate(&path).expect("generate");
        let second = DeviceIdentity::load_or_generate(&path).expect("load");

        assert_eq!(first.device_id(), second.device_id());
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());
    }

    #[test]
    fn test_custom_device_id_persists() {
        let temp_dir = tempfile::tempdir().expect("should create temp dir");
        let path = temp_dir.path().join("identity.json");

        let mut identity = DeviceIdentity::generate().with_device_id("A");
        identity.path = Some(path.clone());
        identity.save().expect("save");

        let loaded = DeviceIdentity::load_from(&path).expect("load");
        assert_eq!(loaded.device_id(), "A");
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir().expect("should create temp dir");
        let path = temp_dir.path().join("identity.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let mut identity = DeviceIdentity::generate();
        identity.path = Some(path.clone());
        identity.save().expect("save");

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let loaded = DeviceIdentity::load_from(&path).expect("load");
        assert_eq!(loaded.device_id(), identity.device_id());
    }

    #[test]
    fn test_cross_identity_verification_fails() {
        let id1 = DeviceIdentity::generate();
        let id2 = DeviceIdentity::generate();

        let signature = id1.sign(b"data");
        assert!(!DeviceIdentity::verify(
            &id2.public_key_bytes(),
            b"data",
            &signature
        ));
    }
}
