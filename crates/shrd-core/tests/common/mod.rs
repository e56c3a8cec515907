//! Helpers shared by the node and transfer integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};

use shrd_core::config::Config;

/// Next free discovery port pair.
static TEST_PORT_COUNTER: AtomicU16 = AtomicU16::new(53600);

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Assert that two files have identical content.
pub fn assert_files_equal(path1: &Path, path2: &Path) {
    let content1 = std::fs::read(path1).expect("Failed to read first file");
    let content2 = std::fs::read(path2).expect("Failed to read second file");
    assert_eq!(content1, content2, "File contents differ");
}

/// Get unique ports for a test to avoid conflicts between parallel tests.
/// Returns (`discovery_port`, `transfer_port`).
pub fn get_test_ports() -> (u16, u16) {
    let base = TEST_PORT_COUNTER.fetch_add(2, Ordering::SeqCst);
    (base, base + 1)
}

/// Names of all entries in `dir`, staging files included, sorted.
pub fn list_files(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Configuration for a loopback node: ephemeral transfer port, no
/// discovery, fast health checks, downloads into `download_dir`.
pub fn node_config(name: &str, download_dir: &Path) -> Config {
    let mut config = Config::default();
    config.general.device_name = name.to_string();
    config.general.download_dir = download_dir.to_path_buf();
    config.general.auto_accept = true;
    config.network.bind_address = "127.0.0.1".parse().unwrap();
    config.network.port = 0;
    config.network.discovery = false;
    config.network.mdns = false;
    config
}
