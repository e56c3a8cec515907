//! Status events for UI collaborators.
//!
//! Every subscriber owns an unbounded queue, so a slow consumer never blocks
//! the registry or a transfer. Subscribers that dropped their stream are
//! pruned on the next emit.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::ErrorClass;
use crate::registry::Device;
use crate::transfer::TransferSession;

/// Stream returned by [`EventBus::subscribe`].
pub type EventStream = UnboundedReceiverStream<StatusEvent>;

/// A change the UI may want to show.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StatusEvent {
    /// First time a device entered the registry
    DeviceDiscovered {
        /// The new record
        device: Device,
    },
    /// Device became reachable
    DeviceOnline {
        /// Device id
        id: String,
    },
    /// Device stopped answering probes
    DeviceOffline {
        /// Device id
        id: String,
    },
    /// Device was dropped from the registry
    DeviceRemoved {
        /// Device id
        id: String,
    },
    /// A session entered Negotiating
    TransferStarted {
        /// Snapshot at start
        session: TransferSession,
    },
    /// Bytes moved
    TransferProgress {
        /// Latest snapshot
        session: TransferSession,
    },
    /// Session reached Completed
    TransferCompleted {
        /// Final snapshot
        session: TransferSession,
    },
    /// Session reached Aborted
    TransferAborted {
        /// Final snapshot
        session: TransferSession,
        /// Failure class
        class: ErrorClass,
        /// Human-readable reason
        reason: String,
    },
    /// A peer failed authentication, possibly an impersonation attempt
    SecurityWarning {
        /// Remote address, when known
        address: Option<SocketAddr>,
        /// Claimed device id, when known
        device_id: Option<String>,
        /// What failed
        reason: String,
    },
}

/// Fan-out of [`StatusEvent`]s to any number of subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StatusEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving every event emitted from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Deliver an event to every live subscriber.
    pub fn emit(&self, event: StatusEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}
