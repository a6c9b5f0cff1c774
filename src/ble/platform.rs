//! btleplug-backed transports.
//!
//! btleplug exposes an async request/response API. Each [`GattTransport`]
//! and [`DiscoveryTransport`] call here spawns a tokio task that performs
//! the btleplug call and reports the outcome as an event, so the state
//! machine sees the same callback-driven flow on every platform.

use std::collections::HashSet;
use std::sync::Arc;

use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    DiscoveredService, DiscoveryTransport, GattTransport, LinkState, ScanEvent, TransportEvent,
    GATT_CONN_TIMEOUT, GATT_ERROR, GATT_FAILURE, GATT_SUCCESS,
};
use crate::ble::uuids::{CCCD_UUID, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE};
use crate::data::Device;
use crate::error::{Error, Result};

/// Map a btleplug error onto a GATT status code.
pub(crate) fn status_code(error: &btleplug::Error) -> i32 {
    match error {
        btleplug::Error::TimedOut(_) => GATT_CONN_TIMEOUT,
        btleplug::Error::PermissionDenied => GATT_ERROR,
        _ => GATT_FAILURE,
    }
}

/// GATT client over a btleplug adapter.
pub struct BtleplugGatt {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Peripheral of the open session, filled once the link is up.
    peripheral: Arc<Mutex<Option<Peripheral>>>,
    /// Characteristics with local delivery enabled.
    local: Arc<RwLock<HashSet<Uuid>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugGatt {
    /// Create a transport reporting on `events`.
    pub fn new(adapter: Adapter, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            adapter,
            events,
            peripheral: Arc::new(Mutex::new(None)),
            local: Arc::new(RwLock::new(HashSet::new())),
            tasks: Vec::new(),
        }
    }

    fn session_peripheral(&self) -> Result<Peripheral> {
        self.peripheral.lock().clone().ok_or(Error::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.session_peripheral()?
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(task));
    }
}

/// Forward notifications and adapter disconnects until the session ends.
async fn forward_session(
    adapter: Adapter,
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<TransportEvent>,
    local: Arc<RwLock<HashSet<Uuid>>>,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to get notifications stream: {}", e);
            return;
        }
    };
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to get adapter events: {}", e);
            return;
        }
    };
    let id = peripheral.id();

    loop {
        tokio::select! {
            Some(notification) = notifications.next() => {
                if !local.read().contains(&notification.uuid) {
                    trace!("Dropping notification from {}", notification.uuid);
                    continue;
                }
                let event = TransportEvent::CharacteristicChanged {
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Some(event) = central_events.next() => {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        info!("Peripheral {} disconnected", id);
                        let _ = events.send(TransportEvent::ConnectionStateChanged {
                            status: GATT_SUCCESS,
                            link: LinkState::Disconnected,
                        });
                        break;
                    }
                }
            }
            else => break,
        }
    }

    debug!("Session event loop ended");
}

impl GattTransport for BtleplugGatt {
    fn connect(&mut self, device: &Device) -> Result<()> {
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let slot = self.peripheral.clone();
        let address = device.address().to_string();
        let local = self.local.clone();

        self.spawn(async move {
            let peripherals = match adapter.peripherals().await {
                Ok(peripherals) => peripherals,
                Err(e) => {
                    error!("Failed to list peripherals: {}", e);
                    let _ = events.send(TransportEvent::ConnectionStateChanged {
                        status: status_code(&e),
                        link: LinkState::Disconnected,
                    });
                    return;
                }
            };

            let Some(peripheral) = peripherals
                .into_iter()
                .find(|p| p.id().to_string() == address)
            else {
                warn!("Peripheral {} is no longer known to the adapter", address);
                let _ = events.send(TransportEvent::ConnectionStateChanged {
                    status: GATT_FAILURE,
                    link: LinkState::Disconnected,
                });
                return;
            };

            match peripheral.connect().await {
                Ok(()) => {
                    *slot.lock() = Some(peripheral.clone());
                    let _ = events.send(TransportEvent::ConnectionStateChanged {
                        status: GATT_SUCCESS,
                        link: LinkState::Connected,
                    });
                    forward_session(adapter, peripheral, events, local).await;
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    let _ = events.send(TransportEvent::ConnectionStateChanged {
                        status: status_code(&e),
                        link: LinkState::Disconnected,
                    });
                }
            }
        });

        Ok(())
    }

    fn request_high_priority(&mut self) -> Result<()> {
        Err(Error::NotSupported {
            operation: "connection priority".to_string(),
        })
    }

    fn discover_services(&mut self) -> Result<()> {
        let peripheral = self.session_peripheral()?;
        let events = self.events.clone();

        self.spawn(async move {
            let event = match peripheral.discover_services().await {
                Ok(()) => TransportEvent::ServicesDiscovered {
                    status: GATT_SUCCESS,
                    services: peripheral
                        .services()
                        .into_iter()
                        .map(|service| {
                            DiscoveredService::new(
                                service.uuid,
                                service.characteristics.iter().map(|c| c.uuid).collect(),
                            )
                        })
                        .collect(),
                },
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    TransportEvent::ServicesDiscovered {
                        status: status_code(&e),
                        services: Vec::new(),
                    }
                }
            };
            let _ = events.send(event);
        });

        Ok(())
    }

    fn set_local_notifications(&mut self, characteristic: Uuid, enabled: bool) -> Result<()> {
        if !enabled {
            self.local.write().remove(&characteristic);
            return Ok(());
        }

        let found = self.characteristic(characteristic)?;
        if !found
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            return Err(Error::NotSupported {
                operation: format!("notifications on {}", characteristic),
            });
        }

        self.local.write().insert(characteristic);
        Ok(())
    }

    fn write_descriptor(&mut self, characteristic: Uuid, descriptor: Uuid, value: &[u8]) -> Result<()> {
        if descriptor != CCCD_UUID {
            return Err(Error::NotSupported {
                operation: format!("write to descriptor {}", descriptor),
            });
        }

        let subscribe = if value == ENABLE_NOTIFICATION_VALUE {
            true
        } else if value == DISABLE_NOTIFICATION_VALUE {
            false
        } else {
            return Err(Error::NotSupported {
                operation: format!("CCCD value {:02X?}", value),
            });
        };

        let peripheral = self.session_peripheral()?;
        let target = self.characteristic(characteristic)?;
        let events = self.events.clone();

        self.spawn(async move {
            let result = if subscribe {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    debug!("CCCD write for {} failed: {:?}", characteristic, e);
                    status_code(&e)
                }
            };
            let _ = events.send(TransportEvent::DescriptorWritten {
                characteristic,
                status,
            });
        });

        Ok(())
    }

    fn read_characteristic(&mut self, characteristic: Uuid) -> Result<()> {
        let peripheral = self.session_peripheral()?;
        let target = self.characteristic(characteristic)?;
        let events = self.events.clone();

        self.spawn(async move {
            let event = match peripheral.read(&target).await {
                Ok(data) => {
                    trace!("Read {} bytes from characteristic {}", data.len(), characteristic);
                    TransportEvent::CharacteristicRead {
                        characteristic,
                        value: Bytes::from(data),
                        status: GATT_SUCCESS,
                    }
                }
                Err(e) => TransportEvent::CharacteristicRead {
                    characteristic,
                    value: Bytes::new(),
                    status: status_code(&e),
                },
            };
            let _ = events.send(event);
        });

        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let peripheral = self.session_peripheral()?;
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.local.write().clear();
        *self.peripheral.lock() = None;
    }
}

impl Drop for BtleplugGatt {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Device discovery over a btleplug adapter.
pub struct BtleplugDiscovery {
    adapter: Adapter,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugDiscovery {
    /// Create a discovery transport on `adapter`.
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            task: Mutex::new(None),
        }
    }

    async fn report_peripheral(
        adapter: &Adapter,
        id: &btleplug::platform::PeripheralId,
        events: &mpsc::UnboundedSender<ScanEvent>,
    ) -> bool {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return true;
            }
        };

        let Ok(Some(properties)) = peripheral.properties().await else {
            return true;
        };

        events
            .send(ScanEvent::Discovered {
                address: id.to_string(),
                name: properties.local_name,
                rssi: properties.rssi.unwrap_or(i16::MIN),
            })
            .is_ok()
    }
}

impl DiscoveryTransport for BtleplugDiscovery {
    fn start_discovery(&self, events: mpsc::UnboundedSender<ScanEvent>) -> Result<()> {
        let adapter = self.adapter.clone();

        let handle = tokio::spawn(async move {
            let mut central_events = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    let _ = events.send(ScanEvent::Failed {
                        code: status_code(&e),
                    });
                    return;
                }
            };

            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                error!("Failed to start scan: {}", e);
                let _ = events.send(ScanEvent::Failed {
                    code: status_code(&e),
                });
                return;
            }

            while let Some(event) = central_events.next().await {
                let open = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        Self::report_peripheral(&adapter, &id, &events).await
                    }
                    _ => !events.is_closed(),
                };
                if !open {
                    break;
                }
            }

            debug!("Discovery event loop ended");
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_discovery(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no runtime to stop scan: {}", e)))?;
        let adapter = self.adapter.clone();
        runtime.spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }
}
