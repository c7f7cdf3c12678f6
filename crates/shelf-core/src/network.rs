//! Connectivity monitor: classifies raw platform reachability events, fans them
//! out to listeners and triggers an automatic sync when the device comes back
//! online.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::SyncTrigger;
use crate::scheduler::{schedule_after, TaskHandle};
use crate::status::SyncStatusStore;

pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

/// Raw reachability report from the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub is_connected: bool,
    /// `None` while the platform has not determined reachability yet
    pub is_internet_reachable: Option<bool>,
    #[serde(rename = "type")]
    pub connection_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatusInfo {
    pub status: NetworkStatus,
    pub is_connected: bool,
    pub is_internet_reachable: Option<bool>,
    #[serde(rename = "type")]
    pub connection_type: String,
}

impl From<ConnectivityState> for NetworkStatusInfo {
    fn from(state: ConnectivityState) -> Self {
        Self {
            status: classify(state.is_connected, state.is_internet_reachable),
            is_connected: state.is_connected,
            is_internet_reachable: state.is_internet_reachable,
            connection_type: state.connection_type,
        }
    }
}

/// A disconnected interface is offline whatever reachability says; online
/// requires confirmed reachability; everything else is unknown.
pub fn classify(is_connected: bool, is_internet_reachable: Option<bool>) -> NetworkStatus {
    match (is_connected, is_internet_reachable) {
        (false, _) => NetworkStatus::Offline,
        (true, Some(true)) => NetworkStatus::Online,
        _ => NetworkStatus::Unknown,
    }
}

/// On-demand reachability query against the platform.
#[async_trait]
pub trait ConnectivitySource: Send + Sync {
    async fn fetch(&self) -> Result<ConnectivityState>;
}

pub type Listener = Arc<dyn Fn(&NetworkStatusInfo) + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// Returned by [`NetworkMonitor::add_listener`].
pub struct ListenerHandle {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if let Ok(mut list) = listeners.lock() {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

pub struct NetworkMonitor {
    source: Arc<dyn ConnectivitySource>,
    status_store: Arc<SyncStatusStore>,
    sync: Arc<dyn SyncTrigger>,
    current: Mutex<NetworkStatus>,
    listeners: Arc<ListenerList>,
    next_listener_id: AtomicU64,
    auto_sync_enabled: AtomicBool,
    auto_sync_interval_ms: AtomicU64,
    stabilization_delay: Duration,
    pending_sync: Mutex<Option<TaskHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State behind these locks stays consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl NetworkMonitor {
    pub fn new(
        source: Arc<dyn ConnectivitySource>,
        status_store: Arc<SyncStatusStore>,
        sync: Arc<dyn SyncTrigger>,
    ) -> Self {
        Self {
            source,
            status_store,
            sync,
            current: Mutex::new(NetworkStatus::Unknown),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(0),
            auto_sync_enabled: AtomicBool::new(true),
            auto_sync_interval_ms: AtomicU64::new(DEFAULT_AUTO_SYNC_INTERVAL.as_millis() as u64),
            stabilization_delay: DEFAULT_STABILIZATION_DELAY,
            pending_sync: Mutex::new(None),
        }
    }

    pub fn with_stabilization_delay(mut self, delay: Duration) -> Self {
        self.stabilization_delay = delay;
        self
    }

    /// Seed the current status from the platform without notifying anyone.
    pub async fn initialize(&self) -> Result<NetworkStatusInfo> {
        let info = NetworkStatusInfo::from(self.source.fetch().await?);
        *lock(&self.current) = info.status;
        info!(status = ?info.status, "network monitor initialized");
        Ok(info)
    }

    /// Feed platform events into the monitor until the channel closes.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: UnboundedReceiver<ConnectivityState>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(state) = events.recv().await {
                monitor.handle_connectivity_change(state).await;
            }
            debug!("connectivity event stream closed");
        })
    }

    /// Last computed status; no I/O.
    pub fn get_current_status(&self) -> NetworkStatus {
        *lock(&self.current)
    }

    /// Fresh platform query. Does not update the tracked status.
    pub async fn get_detailed_status(&self) -> Result<NetworkStatusInfo> {
        Ok(NetworkStatusInfo::from(self.source.fetch().await?))
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&NetworkStatusInfo) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.listeners).push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn set_auto_sync_enabled(&self, enabled: bool) {
        self.auto_sync_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.cancel_pending_sync();
        }
    }

    pub fn is_auto_sync_enabled(&self) -> bool {
        self.auto_sync_enabled.load(Ordering::SeqCst)
    }

    pub fn set_auto_sync_interval(&self, interval: Duration) {
        self.auto_sync_interval_ms
            .store(interval.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_millis(self.auto_sync_interval_ms.load(Ordering::SeqCst))
    }

    /// Recompute the status from a platform event, notify listeners and, on an
    /// offline to online edge, schedule an automatic sync.
    pub async fn handle_connectivity_change(&self, state: ConnectivityState) {
        let info = NetworkStatusInfo::from(state);
        let previous = std::mem::replace(&mut *lock(&self.current), info.status);
        if previous != info.status {
            info!(from = ?previous, to = ?info.status, "network status changed");
        }

        self.notify(&info);

        match (previous, info.status) {
            (NetworkStatus::Offline, NetworkStatus::Online) => {
                self.maybe_schedule_auto_sync().await
            }
            (_, NetworkStatus::Offline) => self.cancel_pending_sync(),
            _ => {}
        }
    }

    fn notify(&self, info: &NetworkStatusInfo) {
        // Snapshot so listeners may unsubscribe from inside the callback
        let listeners: Vec<Listener> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(info))).is_err() {
                error!("network status listener panicked");
            }
        }
    }

    async fn maybe_schedule_auto_sync(&self) {
        if !self.is_auto_sync_enabled() {
            debug!("auto-sync disabled, not syncing on reconnect");
            return;
        }
        if !self
            .status_store
            .should_auto_sync(self.auto_sync_interval())
            .await
        {
            debug!("synced recently, not syncing on reconnect");
            return;
        }

        info!(delay_ms = self.stabilization_delay.as_millis() as u64, "scheduling auto-sync");
        let sync = Arc::clone(&self.sync);
        let handle = schedule_after(self.stabilization_delay, async move {
            match sync.trigger_sync().await {
                Ok(result) => info!(
                    pulled = result.pulled,
                    pushed = result.pushed,
                    "auto-sync finished"
                ),
                Err(e) => warn!(error = %e, "auto-sync failed"),
            }
        });
        if let Some(previous) = lock(&self.pending_sync).replace(handle) {
            previous.cancel();
        }
    }

    fn cancel_pending_sync(&self) {
        if let Some(handle) = lock(&self.pending_sync).take() {
            if handle.cancel() {
                debug!("cancelled pending auto-sync");
            }
        }
    }

    /// Run a sync right away if online. Returns whether a round completed successfully.
    pub async fn trigger_sync_if_online(&self) -> bool {
        if self.get_current_status() != NetworkStatus::Online {
            debug!("offline, skipping sync");
            return false;
        }
        match self.sync.trigger_sync().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "sync failed");
                false
            }
        }
    }
}
