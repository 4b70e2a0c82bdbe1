//! Transport backed by btleplug
//!
//! btleplug exposes an async request/response API; this adapter turns each
//! accepted request into a spawned task that performs the call and emits the
//! matching [`TransportEvent`]. Adapter disconnect events and the
//! peripheral notification stream are pumped into the same sink.

use crate::central::EventSink;
use crate::error::{CentralError, CentralResult};
use crate::transport::{GattStatus, LinkState, Transport, TransportEvent, TransportHandle};
use crate::types::{
    CharProperties, CharacteristicDescriptor, PeerAddress, ServiceDescriptor,
    CLIENT_CHARACTERISTIC_CONFIG, DISABLE_NOTIFICATION_VALUE,
};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use dashmap::DashMap;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Link {
    address: PeerAddress,
    peripheral: Option<Peripheral>,
    pump: Option<JoinHandle<()>>,
}

/// Clonable handle on the attached sink
#[derive(Clone, Default)]
struct Emitter {
    sink: Arc<RwLock<Option<EventSink>>>,
}

impl Emitter {
    fn set(&self, sink: EventSink) {
        *self
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sink {
            Some(sink) => sink.deliver(event),
            None => debug!("No sink attached, dropping {} event", event.kind()),
        }
    }
}

/// Cross-platform transport using the first btleplug adapter
pub struct BtleplugTransport {
    adapter: Adapter,
    runtime: Handle,
    emitter: Emitter,
    links: Arc<DashMap<TransportHandle, Link>>,
    powered: AtomicBool,
    watcher: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Open the first adapter reported by the platform manager
    pub async fn with_default_adapter() -> CentralResult<Self> {
        let adapter = first_adapter().await?;
        Self::new(adapter).await
    }

    /// Wrap an adapter. Must be called within a tokio runtime.
    pub async fn new(adapter: Adapter) -> CentralResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| CentralError::AdapterError(format!("no tokio runtime: {}", e)))?;
        let emitter = Emitter::default();
        let links: Arc<DashMap<TransportHandle, Link>> = Arc::new(DashMap::new());

        let watcher = match adapter.events().await {
            Ok(events) => {
                let emitter = emitter.clone();
                let links = Arc::clone(&links);
                Some(runtime.spawn(async move {
                    let mut events = events;
                    while let Some(event) = events.next().await {
                        if let CentralEvent::DeviceDisconnected(id) = event {
                            link_lost(&emitter, &links, &id.to_string());
                        }
                    }
                    debug!("Adapter event stream ended");
                }))
            }
            Err(e) => {
                warn!("Adapter events unavailable, link loss will not be reported: {}", e);
                None
            }
        };

        info!("BLE transport ready: {:?}", adapter.adapter_info().await);
        Ok(Self {
            adapter,
            runtime,
            emitter,
            links,
            powered: AtomicBool::new(true),
            watcher,
        })
    }

    /// Record the radio power state reported by the platform
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    fn peripheral(&self, handle: TransportHandle) -> Option<(PeerAddress, Peripheral)> {
        let link = self.links.get(&handle)?;
        let peripheral = link.peripheral.clone()?;
        Some((link.address.clone(), peripheral))
    }

    /// Resolve a characteristic on a connected link
    fn characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<(PeerAddress, Peripheral, Characteristic)> {
        let (address, peripheral) = self.peripheral(handle)?;
        let found = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)?;
        Some((address, peripheral, found))
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        for link in self.links.iter() {
            if let Some(pump) = &link.pump {
                pump.abort();
            }
        }
    }
}

impl Transport for BtleplugTransport {
    fn attach(&self, sink: EventSink) {
        self.emitter.set(sink);
    }

    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn supports_mtu_exchange(&self) -> bool {
        false
    }

    fn connect(&self, address: &PeerAddress, handle: TransportHandle) -> bool {
        self.links.insert(
            handle,
            Link {
                address: address.clone(),
                peripheral: None,
                pump: None,
            },
        );

        let adapter = self.adapter.clone();
        let emitter = self.emitter.clone();
        let links = Arc::clone(&self.links);
        let runtime = self.runtime.clone();
        let address = address.clone();
        self.runtime.spawn(async move {
            let state = match find_peripheral(&adapter, &address).await {
                Ok(peripheral) => match peripheral.connect().await {
                    Ok(()) => {
                        let pump = runtime.spawn(pump_notifications(
                            emitter.clone(),
                            handle,
                            address.clone(),
                            peripheral.clone(),
                        ));
                        let stored = match links.get_mut(&handle) {
                            Some(mut link) => {
                                link.peripheral = Some(peripheral.clone());
                                link.pump = Some(pump);
                                true
                            }
                            None => {
                                pump.abort();
                                false
                            }
                        };
                        if !stored {
                            // Closed while connecting
                            if let Err(e) = peripheral.disconnect().await {
                                debug!("Disconnect of abandoned link to {} failed: {}", address, e);
                            }
                            return;
                        }
                        LinkState::Connected
                    }
                    Err(e) => {
                        warn!("Connection to {} failed: {}", address, e);
                        LinkState::Disconnected
                    }
                },
                Err(e) => {
                    warn!("Cannot connect to {}: {}", address, e);
                    LinkState::Disconnected
                }
            };

            if state == LinkState::Disconnected && links.remove(&handle).is_none() {
                return;
            }
            let status = match state {
                LinkState::Connected => GattStatus::SUCCESS,
                LinkState::Disconnected => GattStatus::FAILURE,
            };
            emitter.emit(TransportEvent::ConnectionStateChanged {
                handle,
                address: address.to_string(),
                status,
                state,
            });
        });

        true
    }

    fn disconnect(&self, handle: TransportHandle) {
        let Some((address, peripheral)) = self.peripheral(handle) else {
            return;
        };
        self.runtime.spawn(async move {
            match peripheral.disconnect().await {
                Ok(()) => debug!("Disconnected from {}", address),
                Err(e) => warn!("Disconnect from {} failed: {}", address, e),
            }
        });
    }

    fn close(&self, handle: TransportHandle) {
        if let Some((_, link)) = self.links.remove(&handle) {
            if let Some(pump) = link.pump {
                pump.abort();
            }
            debug!("Closed handle {} for {}", handle, link.address);
        }
    }

    fn discover_services(&self, handle: TransportHandle) -> bool {
        let Some((address, peripheral)) = self.peripheral(handle) else {
            return false;
        };
        let emitter = self.emitter.clone();
        self.runtime.spawn(async move {
            let (status, services) = match peripheral.discover_services().await {
                Ok(()) => (GattStatus::SUCCESS, to_service_descriptors(&peripheral.services())),
                Err(e) => {
                    warn!("Service discovery on {} failed: {}", address, e);
                    (GattStatus::FAILURE, Vec::new())
                }
            };
            emitter.emit(TransportEvent::ServicesDiscovered {
                handle,
                address: address.to_string(),
                status,
                services,
            });
        });
        true
    }

    fn read_characteristic(&self, handle: TransportHandle, service: Uuid, characteristic: Uuid) -> bool {
        let Some((address, peripheral, target)) = self.characteristic(handle, service, characteristic)
        else {
            return false;
        };
        let emitter = self.emitter.clone();
        self.runtime.spawn(async move {
            let (status, value) = match peripheral.read(&target).await {
                Ok(value) => (GattStatus::SUCCESS, value),
                Err(e) => {
                    warn!("Read of {} on {} failed: {}", characteristic, address, e);
                    (GattStatus::FAILURE, Vec::new())
                }
            };
            emitter.emit(TransportEvent::CharacteristicRead {
                handle,
                address: address.to_string(),
                service,
                characteristic,
                status,
                value,
            });
        });
        true
    }

    fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        let Some((address, peripheral, target)) = self.characteristic(handle, service, characteristic)
        else {
            return false;
        };
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let value = value.to_vec();
        let emitter = self.emitter.clone();
        self.runtime.spawn(async move {
            let status = match peripheral.write(&target, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Write to {} on {} failed: {}", characteristic, address, e);
                    GattStatus::FAILURE
                }
            };
            emitter.emit(TransportEvent::CharacteristicWrite {
                handle,
                address: address.to_string(),
                service,
                characteristic,
                status,
                value,
            });
        });
        true
    }

    fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool {
        let Some((address, peripheral, target)) = self.characteristic(handle, service, characteristic)
        else {
            return false;
        };
        // Enabling is driven by the CCCD write, which maps onto subscribe
        if !enabled {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.unsubscribe(&target).await {
                    debug!("Unsubscribing {} on {} failed: {}", target.uuid, address, e);
                }
            });
        }
        true
    }

    fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        let Some((address, peripheral, target)) = self.characteristic(handle, service, characteristic)
        else {
            return false;
        };
        let value = value.to_vec();
        let emitter = self.emitter.clone();
        self.runtime.spawn(async move {
            let result = if descriptor == CLIENT_CHARACTERISTIC_CONFIG {
                if value == DISABLE_NOTIFICATION_VALUE {
                    peripheral.unsubscribe(&target).await
                } else {
                    peripheral.subscribe(&target).await
                }
            } else {
                match target.descriptors.iter().find(|d| d.uuid == descriptor) {
                    Some(found) => peripheral.write_descriptor(found, &value).await,
                    None => Err(btleplug::Error::NotSupported(format!(
                        "descriptor {} not found",
                        descriptor
                    ))),
                }
            };
            let status = match result {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!("Descriptor write {} on {} failed: {}", descriptor, address, e);
                    GattStatus::FAILURE
                }
            };
            emitter.emit(TransportEvent::DescriptorWrite {
                handle,
                address: address.to_string(),
                service,
                characteristic,
                descriptor,
                status,
            });
        });
        true
    }

    fn read_remote_rssi(&self, handle: TransportHandle) -> bool {
        let Some((address, peripheral)) = self.peripheral(handle) else {
            return false;
        };
        let emitter = self.emitter.clone();
        self.runtime.spawn(async move {
            let rssi = match peripheral.properties().await {
                Ok(Some(properties)) => properties.rssi,
                Ok(None) => None,
                Err(e) => {
                    warn!("Reading properties of {} failed: {}", address, e);
                    None
                }
            };
            let (status, rssi) = match rssi {
                Some(rssi) => (GattStatus::SUCCESS, rssi),
                None => (GattStatus::FAILURE, 0),
            };
            emitter.emit(TransportEvent::RemoteRssi {
                handle,
                address: address.to_string(),
                rssi,
                status,
            });
        });
        true
    }

    fn request_mtu(&self, _handle: TransportHandle, _mtu: u16) -> bool {
        false
    }
}

/// First adapter of the platform manager
pub async fn first_adapter() -> CentralResult<Adapter> {
    debug!("Creating BLE manager and adapter");

    let manager = Manager::new()
        .await
        .map_err(|e| CentralError::AdapterError(format!("Failed to create BLE manager: {}", e)))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| CentralError::AdapterError(format!("Failed to get adapters: {}", e)))?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| CentralError::AdapterError("No BLE adapter found".to_string()))
}

async fn find_peripheral(adapter: &Adapter, address: &PeerAddress) -> CentralResult<Peripheral> {
    let peripherals = adapter.peripherals().await?;
    peripherals
        .into_iter()
        .find(|p| {
            matches_address(&p.id().to_string(), address)
                || matches_address(&p.address().to_string(), address)
        })
        .ok_or_else(|| CentralError::DeviceNotFound(address.to_string()))
}

fn matches_address(candidate: &str, address: &PeerAddress) -> bool {
    candidate.trim().eq_ignore_ascii_case(address.as_str())
}

fn link_lost(emitter: &Emitter, links: &DashMap<TransportHandle, Link>, id: &str) {
    let lost: Vec<(TransportHandle, PeerAddress)> = links
        .iter()
        .filter(|link| {
            link.peripheral
                .as_ref()
                .map(|p| p.id().to_string() == id)
                .unwrap_or(false)
        })
        .map(|link| (*link.key(), link.address.clone()))
        .collect();

    for (handle, address) in lost {
        info!("Link to {} dropped by the adapter", address);
        emitter.emit(TransportEvent::ConnectionStateChanged {
            handle,
            address: address.to_string(),
            status: GattStatus::FAILURE,
            state: LinkState::Disconnected,
        });
    }
}

async fn pump_notifications(
    emitter: Emitter,
    handle: TransportHandle,
    address: PeerAddress,
    peripheral: Peripheral,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Notification stream for {} unavailable: {}", address, e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        let service = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == notification.uuid)
            .map(|c| c.service_uuid);
        let Some(service) = service else {
            debug!(
                "Notification from unknown characteristic {} on {}",
                notification.uuid, address
            );
            continue;
        };
        emitter.emit(TransportEvent::CharacteristicChanged {
            handle,
            address: address.to_string(),
            service,
            characteristic: notification.uuid,
            value: notification.value,
        });
    }
    debug!("Notification stream for {} ended", address);
}

/// Convert btleplug's service set into discovered topology
pub fn to_service_descriptors(services: &BTreeSet<Service>) -> Vec<ServiceDescriptor> {
    services
        .iter()
        .map(|service| {
            let characteristics = service
                .characteristics
                .iter()
                .map(|c| {
                    CharacteristicDescriptor::new(
                        c.uuid,
                        CharProperties::from_bits(c.properties.bits()),
                        c.descriptors.iter().map(|d| d.uuid).collect(),
                    )
                })
                .collect();
            ServiceDescriptor::new(service.uuid, characteristics)
        })
        .collect()
}
