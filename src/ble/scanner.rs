//! BLE scanning functionality.
//!
//! Provides the time-bounded discovery session that builds the candidate
//! list for device selection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::authorization::Authorization;
use crate::ble::transport::{DiscoveryTransport, ScanEvent, GATT_FAILURE};
use crate::data::{Device, DiscoveredDevice};
use crate::error::{Error, FailureKind, Result};
use crate::publisher::ReadingPublisher;

/// Scan tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanConfig {
    /// How long a scan runs unless stopped earlier.
    pub window: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
        }
    }
}

/// Deduplicating discovery session.
pub struct DeviceScanner {
    discovery: Arc<dyn DiscoveryTransport>,
    authorization: Arc<dyn Authorization>,
    publisher: Arc<ReadingPublisher>,
    /// Candidate list, in first-seen order.
    devices_tx: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Handle to the scanning task.
    scan_handle: RwLock<Option<JoinHandle<()>>>,
    config: ScanConfig,
}

impl DeviceScanner {
    /// Create an idle scanner.
    pub fn new(
        discovery: Arc<dyn DiscoveryTransport>,
        authorization: Arc<dyn Authorization>,
        publisher: Arc<ReadingPublisher>,
        config: ScanConfig,
    ) -> Self {
        let (devices_tx, _) = watch::channel(Vec::new());

        Self {
            discovery,
            authorization,
            publisher,
            devices_tx: Arc::new(devices_tx),
            is_scanning: Arc::new(RwLock::new(false)),
            scan_handle: RwLock::new(None),
            config,
        }
    }

    /// Start a scan session.
    ///
    /// Clears the candidate list and runs for the configured window unless
    /// stopped earlier. Starting while a scan is running only reports an
    /// informational status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] if the capability is not granted,
    /// or the platform error if discovery could not be started.
    pub fn start_scanning(&self) -> Result<()> {
        if !self.authorization.is_granted() {
            self.publisher.report(FailureKind::PermissionDenied);
            return Err(Error::PermissionDenied);
        }
        self.publisher.set_authorized(true);

        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            self.publisher.info("Scan already in progress");
            return Ok(());
        }

        info!("Starting BLE scan for {:?}", self.config.window);

        self.devices_tx.send_replace(Vec::new());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.discovery.start_discovery(event_tx) {
            error!("Failed to start scan: {}", e);
            self.publisher.report_with(
                FailureKind::ScanFailed(GATT_FAILURE),
                format!("Failed to start scan: {}", e),
            );
            return Err(e);
        }
        *self.is_scanning.write() = true;

        let discovery = self.discovery.clone();
        let is_scanning = self.is_scanning.clone();
        let devices_tx = self.devices_tx.clone();
        let publisher = self.publisher.clone();
        let window = tokio::time::sleep(self.config.window);

        let handle = tokio::spawn(async move {
            tokio::pin!(window);
            let mut order = 0u64;

            loop {
                tokio::select! {
                    event = event_rx.recv() => match event {
                        Some(ScanEvent::Discovered { address, name, rssi }) => {
                            order += 1;
                            Self::record(&devices_tx, address, name, rssi, order);
                        }
                        Some(ScanEvent::Failed { code }) => {
                            warn!("Scan failed with code {}", code);
                            Self::finish(discovery.as_ref(), &is_scanning);
                            publisher.report(FailureKind::ScanFailed(code));
                            break;
                        }
                        None => {
                            debug!("Discovery stream closed");
                            Self::finish(discovery.as_ref(), &is_scanning);
                            break;
                        }
                    },
                    _ = &mut window => {
                        info!("Scan window elapsed");
                        Self::finish(discovery.as_ref(), &is_scanning);
                        break;
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        if let Some(previous) = self.scan_handle.write().replace(handle) {
            previous.abort();
        }

        Ok(())
    }

    /// Stop scanning. A no-op when not scanning.
    pub fn stop_scanning(&self) {
        if let Some(handle) = self.scan_handle.write().take() {
            handle.abort();
        }
        if Self::finish(self.discovery.as_ref(), &self.is_scanning) {
            info!("Stopped BLE scan");
        }
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Current candidate list.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.devices_tx.borrow().clone()
    }

    /// Look up a candidate by address.
    pub fn find(&self, address: &str) -> Option<DiscoveredDevice> {
        self.devices_tx
            .borrow()
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }

    /// Subscribe to candidate list changes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.devices_tx.subscribe()
    }

    /// End platform discovery and clear the flag. Returns `false` if the
    /// session was already over.
    fn finish(discovery: &dyn DiscoveryTransport, is_scanning: &RwLock<bool>) -> bool {
        {
            let mut scanning = is_scanning.write();
            if !*scanning {
                return false;
            }
            *scanning = false;
        }

        if let Err(e) = discovery.stop_discovery() {
            warn!("Failed to stop discovery: {}", e);
        }
        true
    }

    fn record(
        devices_tx: &watch::Sender<Vec<DiscoveredDevice>>,
        address: String,
        name: Option<String>,
        rssi: i16,
        order: u64,
    ) {
        let Some(name) = name.filter(|n| !n.is_empty()) else {
            trace!("Ignoring unnamed device {}", address);
            return;
        };

        devices_tx.send_modify(|devices| {
            if let Some(existing) = devices.iter_mut().find(|d| d.address() == address) {
                existing.rssi = rssi;
                existing.sightings += 1;
                existing.last_seen = order;
            } else {
                debug!("Discovered {} ({}) at {} dBm", name, address, rssi);
                devices.push(DiscoveredDevice {
                    device: Device::new(address, Some(name)),
                    rssi,
                    sightings: 1,
                    last_seen: order,
                });
            }
        });
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.stop_scanning();
    }
}

impl std::fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("is_scanning", &self.is_scanning())
            .field("devices", &self.devices_tx.borrow().len())
            .finish()
    }
}
