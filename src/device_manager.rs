//! Device manager for discovering and connecting to environmental sensors.
//!
//! This module ties the scanner, the sensor session and the publisher
//! together over one Bluetooth adapter.

use std::sync::Arc;

use btleplug::api::{Central, Manager as _};
use btleplug::platform::{Adapter, Manager};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::authorization::{Authorization, Granted};
use crate::ble::connection::{ConnectionConfig, ConnectionState};
use crate::ble::platform::{BtleplugDiscovery, BtleplugGatt};
use crate::ble::scanner::{DeviceScanner, ScanConfig};
use crate::ble::transport::{DiscoveryTransport, GattTransport, TransportEvent};
use crate::data::{Device, DiscoveredDevice, MeasurementChannel, Reading, SensorSnapshot};
use crate::error::{Error, Result};
use crate::publisher::{ReadingPublisher, StatusEvent};
use crate::sensor::{CallbackHandle, SensorConnection};

/// Configuration for a [`DeviceManager`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Connection tuning.
    pub connection: ConnectionConfig,
    /// Scan tuning.
    pub scan: ScanConfig,
}

/// Central manager for discovering and connecting to a sensor.
pub struct DeviceManager {
    /// Discovery session.
    scanner: DeviceScanner,
    /// The single sensor session.
    sensor: SensorConnection,
    /// Shared state published to subscribers.
    publisher: Arc<ReadingPublisher>,
}

impl DeviceManager {
    /// Create a new DeviceManager on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(
            adapter,
            Arc::new(Granted),
            ManagerConfig::default(),
        ))
    }

    /// Create a DeviceManager on a specific adapter.
    pub fn with_adapter(
        adapter: Adapter,
        authorization: Arc<dyn Authorization>,
        config: ManagerConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let gatt = BtleplugGatt::new(adapter.clone(), events_tx);
        let discovery = Arc::new(BtleplugDiscovery::new(adapter));

        Self::with_transports(gatt, events_rx, discovery, authorization, config)
    }

    /// Create a DeviceManager over arbitrary transports.
    ///
    /// `events` must be the receiving end of the channel `gatt` reports on.
    pub fn with_transports<T>(
        gatt: T,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        discovery: Arc<dyn DiscoveryTransport>,
        authorization: Arc<dyn Authorization>,
        config: ManagerConfig,
    ) -> Self
    where
        T: GattTransport + 'static,
    {
        let publisher = Arc::new(ReadingPublisher::new());
        let scanner = DeviceScanner::new(
            discovery,
            authorization.clone(),
            publisher.clone(),
            config.scan,
        );
        let sensor = SensorConnection::spawn(
            gatt,
            events,
            publisher.clone(),
            authorization,
            config.connection,
        );

        Self {
            scanner,
            sensor,
            publisher,
        }
    }

    // === Discovery ===

    /// Start a scan session.
    pub async fn start_scanning(&self) -> Result<()> {
        self.scanner.start_scanning()
    }

    /// Stop the scan session. A no-op when not scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.scanner.stop_scanning();
        Ok(())
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Get the candidate list in first-seen order.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.discovered_devices()
    }

    /// Get candidates sorted by signal strength (strongest first).
    pub fn devices_by_signal(&self) -> Vec<DiscoveredDevice> {
        let mut devices = self.scanner.discovered_devices();
        devices.sort_by_key(|d| std::cmp::Reverse(d.rssi));
        devices
    }

    /// Subscribe to candidate list changes.
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.scanner.subscribe()
    }

    // === Connection ===

    /// Connect to a discovered device by address.
    ///
    /// Stops any running scan first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if the address is not in the
    /// candidate list, or any error from [`connect`](Self::connect).
    pub async fn select_device(&self, address: &str) -> Result<()> {
        self.scanner.stop_scanning();

        let candidate = self
            .scanner
            .find(address)
            .ok_or_else(|| Error::DeviceNotFound {
                address: address.to_string(),
            })?;

        debug!("Selected {}", candidate.device);
        self.connect(candidate.device).await
    }

    /// Connect to a device.
    pub async fn connect(&self, device: Device) -> Result<()> {
        self.sensor.connect(device).await
    }

    /// Disconnect from the sensor.
    pub async fn disconnect(&self) -> Result<()> {
        self.sensor.disconnect().await
    }

    /// Request an explicit read of a channel.
    pub async fn read_channel(&self, channel: MeasurementChannel) -> Result<()> {
        self.sensor.read_channel(channel).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.publisher.state()
    }

    /// Check if the sensor is ready.
    pub fn is_connected(&self) -> bool {
        self.sensor.is_connected()
    }

    // === Readings ===

    /// Latest reading for a channel.
    pub fn latest(&self, channel: MeasurementChannel) -> Option<Reading> {
        self.publisher.latest(channel)
    }

    /// Latest value of every channel.
    pub fn snapshot(&self) -> SensorSnapshot {
        self.publisher.snapshot()
    }

    /// The shared publisher.
    pub fn publisher(&self) -> &Arc<ReadingPublisher> {
        &self.publisher
    }

    /// Subscribe to the connection state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.publisher.subscribe_state()
    }

    /// Subscribe to decoded readings.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.publisher.subscribe_readings()
    }

    /// Subscribe to status and error messages.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.publisher.subscribe_status()
    }

    /// Register a callback for decoded readings.
    pub fn on_reading<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        self.sensor.on_reading(callback)
    }

    /// Register a callback for connection state transitions.
    pub fn on_state_change<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.sensor.on_state_change(callback)
    }

    /// Clean shutdown of the connection and scanning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        self.stop_scanning().await?;

        if let Err(e) = self.sensor.shutdown().await {
            warn!("Error shutting down sensor connection: {}", e);
        }

        Ok(())
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("scanner", &self.scanner)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::AuthorizationFlag;
    use crate::ble::transport::testing::{Call, RecordingTransport, ScriptedDiscovery};
    use pretty_assertions::assert_eq;
    use tokio_test::assert_ok;

    struct Fixture {
        manager: DeviceManager,
        transport: RecordingTransport,
        discovery: Arc<ScriptedDiscovery>,
    }

    fn fixture_with(authorization: Arc<dyn Authorization>) -> Fixture {
        let transport = RecordingTransport::new();
        let discovery = Arc::new(ScriptedDiscovery::default());
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = DeviceManager::with_transports(
            transport.clone(),
            events_rx,
            discovery.clone(),
            authorization,
            ManagerConfig::default(),
        );
        Fixture {
            manager,
            transport,
            discovery,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(Granted))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_device_stops_scan_and_connects() {
        let f = fixture();
        assert_ok!(f.manager.start_scanning().await);
        f.discovery.seen("AA:BB", Some("EnvSensor"), -60);
        settle().await;

        assert_ok!(f.manager.select_device("AA:BB").await);

        assert!(!f.manager.is_scanning());
        assert_eq!(f.discovery.stops(), 1);
        assert_eq!(f.transport.calls(), vec![Call::Connect("AA:BB".to_string())]);
        assert_eq!(f.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_unknown_device() {
        let f = fixture();
        let err = f.manager.select_device("FF:FF").await.unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound { address } if address == "FF:FF"));
        assert!(f.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_by_signal() {
        let f = fixture();
        assert_ok!(f.manager.start_scanning().await);
        f.discovery.seen("A", Some("Far"), -90);
        f.discovery.seen("B", Some("Near"), -40);
        f.discovery.seen("C", Some("Mid"), -65);
        settle().await;

        let names: Vec<_> = f
            .manager
            .devices_by_signal()
            .into_iter()
            .filter_map(|d| d.device.name().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["Near", "Mid", "Far"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_manager_fails_closed() {
        let f = fixture_with(Arc::new(AuthorizationFlag::new(false)));

        assert!(matches!(
            f.manager.start_scanning().await,
            Err(Error::PermissionDenied)
        ));
        assert!(matches!(
            f.manager.connect(Device::new("AA", None)).await,
            Err(Error::PermissionDenied)
        ));
        assert!(!f.manager.publisher().is_authorized());
        assert!(f.transport.calls().is_empty());
        assert_eq!(f.discovery.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_scanning_keeps_connection() {
        let f = fixture();
        assert_ok!(f.manager.connect(Device::new("AA:BB", None)).await);
        assert_ok!(f.manager.start_scanning().await);
        f.discovery.seen("CC:DD", Some("Other"), -70);
        settle().await;

        assert_ok!(f.manager.stop_scanning().await);

        assert!(!f.manager.is_scanning());
        assert_eq!(f.discovery.stops(), 1);
        assert_eq!(f.manager.state(), ConnectionState::Connecting);
        assert_eq!(f.transport.calls(), vec![Call::Connect("AA:BB".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_everything() {
        let f = fixture();
        assert_ok!(f.manager.start_scanning().await);
        assert_ok!(f.manager.connect(Device::new("AA", None)).await);

        assert_ok!(f.manager.shutdown().await);

        assert!(!f.manager.is_scanning());
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert!(f.transport.calls().contains(&Call::Close));
    }
}
