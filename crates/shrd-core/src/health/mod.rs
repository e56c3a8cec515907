//! Periodic reachability probes.
//!
//! Every round probes each device that is `Online` or `Unknown`, with at
//! most `max_concurrent_probes` probes in flight. A success marks the device
//! online; `max_consecutive_misses` failures in a row mark it offline.
//! After probing, non-trusted devices that stayed offline for longer than
//! `stale_retention` are evicted.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::HealthConfig;
use crate::registry::{DeviceRegistry, DeviceStatus};

/// Checks whether a device answers at `addr`.
pub trait Prober: Send + Sync + 'static {
    /// `true` if the device is reachable.
    fn probe(&self, addr: SocketAddr) -> impl Future<Output = bool> + Send;
}

/// Probes by opening and immediately closing a TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    /// Create a prober that gives up after `timeout`.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Prober for TcpProber {
    async fn probe(&self, addr: SocketAddr) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(%addr, "Probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!(%addr, "Probe timed out");
                false
            }
        }
    }
}

/// Outcome of one probe round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Devices probed
    pub probed: usize,
    /// Probes that succeeded
    pub reachable: usize,
    /// Devices that went offline this round
    pub went_offline: Vec<String>,
    /// Devices evicted this round
    pub evicted: Vec<String>,
}

/// Keeps device status in the registry current.
#[derive(Debug)]
pub struct HealthMonitor<P = TcpProber> {
    registry: DeviceRegistry,
    config: HealthConfig,
    prober: Arc<P>,
}

impl HealthMonitor<TcpProber> {
    /// Monitor probing over TCP.
    #[must_use]
    pub fn new(registry: DeviceRegistry, config: HealthConfig) -> Self {
        let prober = TcpProber::new(config.probe_timeout);
        Self::with_prober(registry, config, prober)
    }
}

impl<P: Prober> HealthMonitor<P> {
    /// Monitor using a custom prober.
    #[must_use]
    pub fn with_prober(registry: DeviceRegistry, config: HealthConfig, prober: P) -> Self {
        Self {
            registry,
            config,
            prober: Arc::new(prober),
        }
    }

    /// Run one probe round followed by stale eviction.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let targets: Vec<(String, SocketAddr)> = self
            .registry
            .list_all()
            .iter()
            .filter(|d| matches!(d.status, DeviceStatus::Online | DeviceStatus::Unknown))
            .map(|d| (d.id.clone(), d.socket_addr()))
            .collect();

        let mut report = CycleReport {
            probed: targets.len(),
            ..CycleReport::default()
        };

        let mut results = futures::stream::iter(targets)
            .map(|(id, addr)| {
                let prober = Arc::clone(&self.prober);
                async move {
                    let reachable = prober.probe(addr).await;
                    (id, reachable)
                }
            })
            .buffer_unordered(self.config.max_concurrent_probes.max(1));

        while let Some((id, reachable)) = results.next().await {
            if reachable {
                report.reachable += 1;
                self.registry.record_probe_success(&id, now);
                continue;
            }

            let before = self.registry.get(&id).map(|d| d.status);
            let after =
                self.registry
                    .record_probe_failure(&id, self.config.max_consecutive_misses, now);
            if after == Some(DeviceStatus::Offline) && before != Some(DeviceStatus::Offline) {
                tracing::info!(device = %id, "Device went offline");
                report.went_offline.push(id);
            }
        }

        report.evicted = self.registry.evict_stale(now, self.config.stale_retention);
        for id in &report.evicted {
            tracing::info!(device = %id, "Evicted stale device");
        }

        report
    }

    /// Probe every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval = ?self.config.interval,
            "Health monitor started"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    tracing::debug!("Health monitor received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    let report = tokio::select! {
                        () = shutdown.cancelled() => break,
                        report = self.run_cycle(Utc::now()) => report,
                    };
                    tracing::debug!(
                        probed = report.probed,
                        reachable = report.reachable,
                        "Health round finished"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::Device;
    use std::collections::HashSet;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedProber {
        reachable: Mutex<HashSet<SocketAddr>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedProber {
        fn set_reachable(&self, addr: SocketAddr, reachable: bool) {
            let mut set = self.reachable.lock().unwrap();
            if reachable {
                set.insert(addr);
            } else {
                set.remove(&addr);
            }
        }
    }

    impl Prober for Arc<ScriptedProber> {
        async fn probe(&self, addr: SocketAddr) -> bool {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.reachable.lock().unwrap().contains(&addr)
        }
    }

    fn device(id: &str, port: u16, now: DateTime<Utc>) -> Device {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        Device::new(id, id, ip, port).online_at(now)
    }

    fn monitor(
        registry: &DeviceRegistry,
        max_concurrent_probes: usize,
    ) -> (HealthMonitor<Arc<ScriptedProber>>, Arc<ScriptedProber>) {
        let prober = Arc::new(ScriptedProber::default());
        let config = HealthConfig {
            max_concurrent_probes,
            ..HealthConfig::default()
        };
        let monitor = HealthMonitor::with_prober(registry.clone(), config, Arc::clone(&prober));
        (monitor, prober)
    }

    #[tokio::test]
    async fn test_offline_after_max_misses() {
        let registry = DeviceRegistry::new(EventBus::new());
        let start = Utc::now();
        registry.upsert(device("A", 9000, start));
        let (monitor, _prober) = monitor(&registry, 4);
        let interval = chrono::Duration::seconds(10);

        let first = monitor.run_cycle(start + interval).await;
        assert!(first.went_offline.is_empty());
        monitor.run_cycle(start + interval * 2).await;
        assert_eq!(registry.get("A").unwrap().status, DeviceStatus::Online);

        let third = monitor.run_cycle(start + interval * 3).await;
        assert_eq!(third.went_offline, vec!["A".to_string()]);
        assert_eq!(registry.get("A").unwrap().status, DeviceStatus::Offline);

        // Offline devices are not probed again.
        let fourth = monitor.run_cycle(start + interval * 4).await;
        assert_eq!(fourth.probed, 0);
    }

    #[tokio::test]
    async fn test_success_resets_misses() {
        let registry = DeviceRegistry::new(EventBus::new());
        let start = Utc::now();
        let a = device("A", 9000, start);
        let addr = a.socket_addr();
        registry.upsert(a);
        let (monitor, prober) = monitor(&registry, 4);

        monitor.run_cycle(start).await;
        monitor.run_cycle(start).await;
        prober.set_reachable(addr, true);
        let later = start + chrono::Duration::seconds(30);
        let report = monitor.run_cycle(later).await;

        assert_eq!(report.reachable, 1);
        let device = registry.get("A").unwrap();
        assert_eq!(device.missed_probes, 0);
        assert_eq!(device.last_seen, later);
    }

    #[tokio::test]
    async fn test_stale_eviction_spares_trusted() {
        let registry = DeviceRegistry::new(EventBus::new());
        let start = Utc::now();
        registry.upsert(device("stranger", 9000, start));
        let mut friend = device("friend", 9001, start);
        friend.trusted = true;
        registry.upsert(friend);
        let (monitor, _prober) = monitor(&registry, 4);

        for _ in 0..3 {
            monitor.run_cycle(start).await;
        }
        assert_eq!(registry.get("friend").unwrap().status, DeviceStatus::Offline);

        let report = monitor.run_cycle(start + chrono::Duration::hours(25)).await;
        assert_eq!(report.evicted, vec!["stranger".to_string()]);
        assert!(registry.get("stranger").is_none());
        assert_eq!(registry.get("friend").unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn test_probe_concurrency_is_bounded() {
        let registry = DeviceRegistry::new(EventBus::new());
        let now = Utc::now();
        for i in 0..20u16 {
            registry.upsert(device(&format!("D{i}"), 9000 + i, now));
        }
        let (monitor, prober) = monitor(&registry, 3);

        let report = monitor.run_cycle(now).await;
        assert_eq!(report.probed, 20);
        assert!(prober.peak.load(Ordering::SeqCst) <= 3);
        assert!(prober.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_tcp_prober() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap();
        let prober = TcpProber::new(Duration::from_secs(1));
        assert!(prober.probe(open).await);

        drop(listener);
        assert!(!prober.probe(open).await);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = DeviceRegistry::new(EventBus::new());
        let (monitor, _prober) = monitor(&registry, 1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(monitor.run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
