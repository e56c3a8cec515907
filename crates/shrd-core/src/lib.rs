//! # shrd Core Library
//!
//! `shrd-core` lets machines on one LAN find each other and exchange files
//! directly, without a coordinating server.
//!
//! ## Features
//!
//! - **Presence**: UDP broadcast beacons and mDNS feed a shared device registry
//! - **Health checks**: bounded-concurrency probes mark peers offline and evict stale ones
//! - **Encrypted transfers**: X25519 + ChaCha20-Poly1305 channels with pinned identities
//! - **Verified transfers**: per-chunk checksums, one retransmission, full-file SHA-256
//! - **Remote browsing**: paired devices can list and download from a shared directory
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`crypto`] - Device identity, hashing and the encrypted channel
//! - [`discovery`] - Presence announcements via UDP broadcast and mDNS
//! - [`events`] - Status events for UI collaborators
//! - [`health`] - Periodic reachability probes
//! - [`node`] - Process-wide lifecycle and collaborator interface
//! - [`protocol`] - Wire protocol messages and framing
//! - [`registry`] - The table of known devices
//! - [`session`] - Concurrent transfer bookkeeping
//! - [`share`] - Remote browsing of a shared directory
//! - [`transfer`] - Send and receive state machines
//! - [`trust`] - Paired devices and pinned keys
//!
//! ## Example
//!
//! ```rust,ignore
//! use shrd_core::{config::Config, node::Node};
//!
//! let node = Node::start(Config::load()?).await?;
//! for device in &node.list_devices() {
//!     println!("{} ({})", device.display_name, device.status);
//! }
//! let session_id = node.send("3f9a1c2b7d4e8f60", "report.pdf".as_ref())?;
//! node.shutdown().await;
//! ```

#![allow(clippy::unused_async)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::future_not_send)]

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod events;
pub mod health;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod share;
pub mod transfer;
pub mod trust;

pub use error::{Error, ErrorClass, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version carried in every hello
pub const PROTOCOL_VERSION: u8 = 1;

/// Default transfer port (TCP)
pub const DEFAULT_PORT: u16 = 52637;

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 52638;

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
