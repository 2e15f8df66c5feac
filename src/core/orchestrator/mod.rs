//! Orchestrator
//!
//! Sequences device and broker operations and folds their results into one
//! observable [`OrchestrationState`]. The orchestrator holds no hardware or
//! network handles of its own, only ids and derived flags.
//!
//! Device work runs on the blocking pool; broker work runs on the runtime.
//! Concurrent operations are not serialised: the last snapshot wins.

mod state;
pub mod transition;

pub use state::{DeviceInfo, OrchestrationState, PayloadSummary, StateStore, PREVIEW_LIMIT};

use crate::core::broker::{BrokerBridge, BrokerListener};
use crate::core::device::{DeviceError, DeviceId, DeviceRegistry, PermissionCallback};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

struct Inner {
    registry: Arc<DeviceRegistry>,
    bridge: Arc<BrokerBridge>,
    store: StateStore,
    in_flight: AtomicUsize,
    forward_inbound: AtomicBool,
    watching_broker: AtomicBool,
}

/// Marks one operation in flight; `loading` stays true while any exists
struct Busy<'a> {
    inner: &'a Inner,
    finished: bool,
}

impl Busy<'_> {
    fn finish(mut self, f: impl FnOnce(&mut OrchestrationState)) -> Arc<OrchestrationState> {
        self.finished = true;
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        let in_flight = &self.inner.in_flight;
        self.inner.store.update(|s| {
            f(s);
            s.loading = in_flight.load(Ordering::SeqCst) > 0;
        })
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Abandoned before completion.
            self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            let in_flight = &self.inner.in_flight;
            self.inner
                .store
                .update(|s| s.loading = in_flight.load(Ordering::SeqCst) > 0);
        }
    }
}

/// Coordinates the device registry and the broker bridge
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator over a registry and a bridge
    pub fn new(registry: Arc<DeviceRegistry>, bridge: Arc<BrokerBridge>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                bridge,
                store: StateStore::new(),
                in_flight: AtomicUsize::new(0),
                forward_inbound: AtomicBool::new(false),
                watching_broker: AtomicBool::new(false),
            }),
        }
    }

    /// Write every inbound broker payload to the selected device
    #[must_use]
    pub fn forward_inbound(self, enable: bool) -> Self {
        self.inner.forward_inbound.store(enable, Ordering::SeqCst);
        self
    }

    /// Device registry
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    /// Broker bridge
    pub fn bridge(&self) -> &Arc<BrokerBridge> {
        &self.inner.bridge
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<OrchestrationState> {
        self.inner.store.snapshot()
    }

    /// Receive every new snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<OrchestrationState>> {
        self.inner.store.subscribe()
    }

    /// Enumerate devices and connect the broker, independently of each other
    pub async fn load(&self) -> Arc<OrchestrationState> {
        let busy = self.begin();
        let (devices, ()) = tokio::join!(self.enumerate(), self.connect_broker_inner());
        busy.finish(|s| transition::devices_loaded(s, devices))
    }

    /// Enumerate devices without touching the broker
    pub async fn refresh_devices(&self) -> Arc<OrchestrationState> {
        let busy = self.begin();
        let devices = self.enumerate().await;
        busy.finish(|s| transition::devices_loaded(s, devices))
    }

    /// Make `id` the target of device operations; unknown ids leave the selection unchanged
    pub fn select_device(&self, id: &DeviceId) -> Arc<OrchestrationState> {
        self.inner.store.update(|s| transition::device_selected(s, id))
    }

    /// (Re)connect the broker
    pub async fn connect_broker(&self) -> Arc<OrchestrationState> {
        let busy = self.begin();
        self.connect_broker_inner().await;
        busy.finish(|_| {})
    }

    /// Disconnect the broker
    pub async fn disconnect_broker(&self) -> Arc<OrchestrationState> {
        let busy = self.begin();
        self.inner.bridge.disconnect().await;
        let status = self.inner.bridge.status();
        busy.finish(|s| transition::broker_status_changed(s, status))
    }

    /// Open the selected device
    pub async fn connect_device(&self) -> Arc<OrchestrationState> {
        let Some(id) = self.selected() else {
            return self.snapshot();
        };
        let busy = self.begin();
        let result = self
            .blocking(move |registry| registry.open_connection(&id))
            .await
            .map(|device| DeviceInfo::from(&device));
        busy.finish(|s| transition::device_opened(s, result))
    }

    /// Close the selected device
    pub async fn disconnect_device(&self) -> Arc<OrchestrationState> {
        let Some(id) = self.selected() else {
            return self.snapshot();
        };
        let busy = self.begin();
        let result = self
            .blocking(move |registry| registry.close_connection(&id))
            .await
            .map(|device| DeviceInfo::from(&device));
        busy.finish(|s| transition::device_closed(s, result))
    }

    /// Read from the selected device
    pub async fn read_from_device(&self) -> Arc<OrchestrationState> {
        let Some(id) = self.selected() else {
            return self.snapshot();
        };
        let busy = self.begin();
        let result = self.blocking(move |registry| registry.read(&id)).await;
        busy.finish(|s| transition::bytes_read(s, result))
    }

    /// Write `payload` to the selected device
    pub async fn write_to_device(&self, payload: Bytes) -> Arc<OrchestrationState> {
        let Some(id) = self.selected() else {
            return self.snapshot();
        };
        let busy = self.begin();
        let result = self.write_blocking(id, payload).await;
        busy.finish(|s| transition::bytes_written(s, result))
    }

    /// Publish the most recent device read to the broker; an empty payload
    /// when nothing has been read yet
    pub async fn publish_last_read_to_broker(&self) -> Arc<OrchestrationState> {
        let payload = self
            .snapshot()
            .last_bytes_read
            .as_ref()
            .map(|p| p.data.clone())
            .unwrap_or_default();
        let busy = self.begin();
        let result = self
            .inner
            .bridge
            .publish(payload.clone())
            .await
            .map(|()| payload);
        busy.finish(|s| transition::published(s, result))
    }

    /// Write the most recent inbound broker payload to the selected device
    pub async fn forward_last_received_to_device(&self) -> Arc<OrchestrationState> {
        let Some(id) = self.selected() else {
            return self.snapshot();
        };
        let Some(payload) = self
            .snapshot()
            .last_bytes_received
            .as_ref()
            .map(|p| p.data.clone())
        else {
            debug!("nothing received yet, skipping forward");
            return self.snapshot();
        };
        let busy = self.begin();
        let result = self.write_blocking(id, payload).await;
        busy.finish(|s| transition::bytes_written(s, result))
    }

    /// Ask the OS for access to `id` and wait for the answer
    pub async fn request_permission(&self, id: DeviceId) -> Arc<OrchestrationState> {
        let busy = self.begin();
        let (tx, rx) = oneshot::channel();
        let callback: PermissionCallback = Box::new(move |granted: bool| {
            let _ = tx.send(granted);
        });
        let result = match self
            .blocking(move |registry| registry.request_permission(&id, callback))
            .await
        {
            Ok(_) => rx
                .await
                .map_err(|_| DeviceError::Worker("permission callback dropped".to_string())),
            Err(e) => Err(e),
        };
        if let Ok(granted) = &result {
            info!(granted, "permission request answered");
        }
        busy.finish(|s| transition::permission_result(s, result))
    }

    fn begin(&self) -> Busy<'_> {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.store.update(|s| s.loading = true);
        Busy {
            inner: &self.inner,
            finished: false,
        }
    }

    fn selected(&self) -> Option<DeviceId> {
        let snapshot = self.snapshot();
        if snapshot.devices.is_empty() {
            debug!("no devices loaded, skipping device operation");
            return None;
        }
        snapshot.selected_device.clone()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DeviceError>
    where
        F: FnOnce(&DeviceRegistry) -> Result<T, DeviceError> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.inner.registry.clone();
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| DeviceError::Worker(e.to_string()))?
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let devices = self
            .blocking(|registry| {
                registry
                    .list_devices()
                    .map(|devices| devices.iter().map(DeviceInfo::from).collect::<Vec<_>>())
            })
            .await;
        if let Ok(devices) = &devices {
            info!(count = devices.len(), "devices loaded");
        }
        devices
    }

    async fn write_blocking(&self, id: DeviceId, payload: Bytes) -> Result<Bytes, DeviceError> {
        self.blocking(move |registry| registry.write(&id, &payload).map(|()| payload))
            .await
    }

    async fn connect_broker_inner(&self) {
        self.watch_broker_status();
        self.inner.store.update(transition::broker_connecting);
        let result = self.inner.bridge.connect(self.listener()).await;
        self.inner
            .store
            .update(|s| transition::broker_connected(s, result));
    }

    fn listener(&self) -> Arc<dyn BrokerListener> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Arc::new(move |payload: Bytes| {
            if let Some(inner) = weak.upgrade() {
                Orchestrator { inner }.on_inbound(payload);
            }
        })
    }

    fn on_inbound(self, payload: Bytes) {
        debug!(bytes = payload.len(), "inbound payload");
        self.inner
            .store
            .update(|s| transition::received(s, payload));
        if self.inner.forward_inbound.load(Ordering::SeqCst) {
            tokio::spawn(async move {
                self.forward_last_received_to_device().await;
            });
        }
    }

    fn watch_broker_status(&self) {
        if self.inner.watching_broker.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut rx = self.inner.bridge.subscribe_status();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.store.snapshot().broker_status != status {
                    inner
                        .store
                        .update(|s| transition::broker_status_changed(s, status));
                }
            }
        });
    }
}
