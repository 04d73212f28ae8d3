//! Network state monitor
//!
//! Polls a connectivity probe on a fixed interval, keeps the last observed
//! [`NetworkStatus`] and broadcasts every poll result. A poll that flips the
//! status from unusable to usable is flagged as `came_online`; the background
//! worker drains on exactly those events.
//!
//! Hosts with native connectivity-change notifications can feed them through
//! a [`ManualProbe`] and call [`NetworkMonitor::check_now`] instead of polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::types::NetworkStatus;

/// Platform connectivity primitive
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> NetworkStatus;
}

/// Probe whose answer is set by the host (or a test)
#[derive(Debug, Default)]
pub struct ManualProbe {
    connected: AtomicBool,
    reachable: AtomicBool,
}

impl ManualProbe {
    pub fn new(status: NetworkStatus) -> Self {
        let probe = Self::default();
        probe.set(status);
        probe
    }

    pub fn online() -> Self {
        Self::new(NetworkStatus::online())
    }

    pub fn offline() -> Self {
        Self::new(NetworkStatus::offline())
    }

    pub fn set(&self, status: NetworkStatus) {
        self.connected.store(status.is_connected, Ordering::SeqCst);
        self.reachable
            .store(status.is_internet_reachable, Ordering::SeqCst);
    }

    pub fn set_online(&self) {
        self.set(NetworkStatus::online());
    }

    pub fn set_offline(&self) {
        self.set(NetworkStatus::offline());
    }
}

#[async_trait]
impl ConnectivityProbe for ManualProbe {
    async fn probe(&self) -> NetworkStatus {
        NetworkStatus {
            is_connected: self.connected.load(Ordering::SeqCst),
            is_internet_reachable: self.reachable.load(Ordering::SeqCst),
        }
    }
}

/// Probe that opens a TCP connection to a reachability target.
///
/// A completed handshake means connected and reachable. A refused connection
/// means a link exists but the target is not reachable through it (captive
/// portal, firewall). A timeout or any other error means disconnected.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> NetworkStatus {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_stream)) => NetworkStatus::online(),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => NetworkStatus {
                is_connected: true,
                is_internet_reachable: false,
            },
            Ok(Err(e)) => {
                tracing::debug!(target = %self.target, error = %e, "connectivity probe failed");
                NetworkStatus::offline()
            }
            Err(_) => {
                tracing::debug!(target = %self.target, "connectivity probe timed out");
                NetworkStatus::offline()
            }
        }
    }
}

/// Result of one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkEvent {
    pub status: NetworkStatus,
    pub previous: NetworkStatus,
    /// The status went from unusable to usable on this poll
    pub came_online: bool,
}

/// Best-effort view of connectivity
pub struct NetworkMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    current: RwLock<NetworkStatus>,
    tx: broadcast::Sender<NetworkEvent>,
    poll_interval: Duration,
}

impl NetworkMonitor {
    /// Create a monitor. The initial status is offline until the first poll.
    pub fn new(probe: Arc<dyn ConnectivityProbe>, poll_interval: Duration) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            probe,
            current: RwLock::new(NetworkStatus::offline()),
            tx,
            poll_interval,
        }
    }

    /// Last observed status
    pub fn current(&self) -> NetworkStatus {
        *self.current.read()
    }

    pub fn is_usable(&self) -> bool {
        self.current().is_usable()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Receive every poll result
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Probe now, record the result and notify subscribers
    pub async fn check_now(&self) -> NetworkEvent {
        let status = self.probe.probe().await;
        // Swap under the write lock so only one caller observes a given flip
        let previous = std::mem::replace(&mut *self.current.write(), status);
        let event = NetworkEvent {
            status,
            previous,
            came_online: !previous.is_usable() && status.is_usable(),
        };

        if event.came_online {
            tracing::info!("network became usable");
        } else if previous.is_usable() && !status.is_usable() {
            tracing::info!(
                connected = status.is_connected,
                reachable = status.is_internet_reachable,
                "network lost"
            );
        }

        // No receivers is fine
        let _ = self.tx.send(event);
        event
    }

    /// Spawn the polling loop
    pub fn spawn_polling(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(monitor.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        })
    }
}
