//! mDNS/DNS-SD presence for shrd.
//!
//! Complements the UDP beacons in networks where broadcast is filtered.
//!
//! ## Service Type
//!
//! shrd registers as `_shrd._tcp.local.` with TXT records carrying the
//! device id, display name and pairing code. Removal events are ignored:
//! the health monitor alone decides when a device goes offline.

use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::PresenceRecord;
use crate::registry::DeviceRegistry;

/// mDNS service type for shrd.
pub const SERVICE_TYPE: &str = "_shrd._tcp.local.";

/// TXT record keys for service properties.
pub mod txt_keys {
    /// Device id key
    pub const ID: &str = "id";
    /// Display name key
    pub const NAME: &str = "name";
    /// Pairing code key
    pub const CODE: &str = "code";
}

/// Registered service plus an active browse.
pub struct MdnsPresence {
    daemon: ServiceDaemon,
    receiver: flume::Receiver<ServiceEvent>,
    fullname: String,
    local_id: String,
}

impl MdnsPresence {
    /// Register `local` and start browsing for other devices.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon cannot be created or registration fails.
    pub fn start(local: &PresenceRecord, pairing_code: &str) -> Result<Self> {
        let daemon =
            ServiceDaemon::new().map_err(|e| Error::Internal(format!("mDNS daemon error: {e}")))?;

        let instance_name = format!("shrd-{}", local.id);
        let txt_props = vec![
            (txt_keys::ID, local.id.clone()),
            (txt_keys::NAME, local.display_name.clone()),
            (txt_keys::CODE, pairing_code.to_string()),
        ];

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &local_hostname(),
            (),
            local.port,
            txt_props.as_slice(),
        )
        .map_err(|e| Error::Internal(format!("Failed to create mDNS service info: {e}")))?
        .enable_addr_auto();
        let fullname = service_info.get_fullname().to_string();

        daemon
            .register(service_info)
            .map_err(|e| Error::Internal(format!("Failed to register mDNS service: {e}")))?;

        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| Error::Internal(format!("Failed to browse mDNS services: {e}")))?;

        tracing::info!(instance = %instance_name, "Registered mDNS service");

        Ok(Self {
            daemon,
            receiver,
            fullname,
            local_id: local.id.clone(),
        })
    }

    /// Feed resolved services into `registry` until `shutdown` is cancelled,
    /// then unregister and stop the daemon.
    pub async fn run(self, registry: DeviceRegistry, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => break,
                event = self.receiver.recv_async() => event,
            };

            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    if let Some((record, ip)) = presence_from_service_info(&info) {
                        tracing::debug!(id = %record.id, %ip, "Resolved mDNS service");
                        super::handle_record(&registry, &self.local_id, record, ip, Utc::now());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("mDNS browse channel closed: {}", e);
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(self) {
        if let Err(e) = self.daemon.stop_browse(SERVICE_TYPE) {
            tracing::debug!("Failed to stop mDNS browse: {e}");
        }

        match self.daemon.unregister(&self.fullname) {
            Ok(receiver) => {
                if tokio::time::timeout(Duration::from_millis(500), receiver.recv_async())
                    .await
                    .is_err()
                {
                    tracing::debug!("mDNS unregister timed out");
                }
            }
            Err(e) => tracing::debug!("Failed to unregister mDNS service: {e}"),
        }

        match self.daemon.shutdown() {
            Ok(receiver) => {
                if tokio::time::timeout(Duration::from_millis(500), receiver.recv_async())
                    .await
                    .is_err()
                {
                    tracing::debug!("mDNS daemon shutdown timed out");
                }
            }
            Err(e) => tracing::debug!("mDNS daemon shutdown failed: {e}"),
        }

        tracing::info!("Unregistered mDNS service");
    }
}

/// Extract a presence record and an IPv4 address from a resolved service.
pub fn presence_from_service_info(info: &ServiceInfo) -> Option<(PresenceRecord, IpAddr)> {
    let properties = info.get_properties();
    let get_str =
        |key: &str| -> Option<String> { properties.get(key).map(|p| p.val_str().to_string()) };

    let id = get_str(txt_keys::ID).filter(|id| !id.is_empty())?;
    let display_name = get_str(txt_keys::NAME).unwrap_or_else(|| id.clone());
    let ip = info
        .get_addresses()
        .iter()
        .find(|addr| addr.is_ipv4())
        .copied()?;

    Some((
        PresenceRecord {
            id,
            display_name,
            port: info.get_port(),
        },
        ip,
    ))
}

fn local_hostname() -> String {
    let raw = hostname::get().map_or_else(
        |_| "localhost".to_string(),
        |h| h.to_string_lossy().to_string(),
    );

    if raw.ends_with(".local.") {
        raw
    } else if raw.to_lowercase().ends_with(".local") {
        format!("{raw}.")
    } else {
        format!("{raw}.local.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(props: &[(&str, String)]) -> ServiceInfo {
        ServiceInfo::new(
            SERVICE_TYPE,
            "shrd-test",
            "test-host.local.",
            "192.168.1.20",
            9000,
            props,
        )
        .unwrap()
    }

    #[test]
    fn test_presence_from_service_info() {
        let info = service(&[
            (txt_keys::ID, "A".to_string()),
            (txt_keys::NAME, "Laptop".to_string()),
            (txt_keys::CODE, "ABCD-1234".to_string()),
        ]);

        let (record, ip) = presence_from_service_info(&info).unwrap();
        assert_eq!(record.id, "A");
        assert_eq!(record.display_name, "Laptop");
        assert_eq!(record.port, 9000);
        assert_eq!(ip, "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_service_without_id_is_ignored() {
        let info = service(&[(txt_keys::NAME, "Laptop".to_string())]);
        assert!(presence_from_service_info(&info).is_none());
    }

    #[test]
    fn test_local_hostname_is_fqdn() {
        assert!(local_hostname().ends_with(".local."));
    }
}
