//! Event demultiplexer: routes raw transport events to registered handlers

use super::Shared;
use crate::event::{ConnectionEvent, Failure, GattEvent, NotifyEvent, Outcome};
use crate::registry::{Discovery, LinkDown};
use crate::routing::{CharacteristicKey, RouteKind};
use crate::transport::{GattStatus, LinkState, TransportEvent, TransportHandle};
use crate::types::{PeerAddress, PeerInfo, ServiceDescriptor, Topology, CLIENT_CHARACTERISTIC_CONFIG};
use tracing::{debug, info, warn};

impl Shared {
    pub(super) fn demux(&self, event: TransportEvent) {
        let address = match PeerAddress::parse(event.address()) {
            Ok(address) => address,
            Err(_) => {
                warn!(
                    "Dropping {} event with malformed address {:?}",
                    event.kind(),
                    event.address()
                );
                return;
            }
        };
        let handle = event.handle();

        match event {
            TransportEvent::ConnectionStateChanged { status, state, .. } => {
                self.on_link_state(&address, handle, status, state)
            }
            TransportEvent::ServicesDiscovered {
                status, services, ..
            } => self.on_services_discovered(&address, handle, status, services),
            other => {
                if self.registry.handle_of(&address) != Some(handle) {
                    debug!(
                        "Dropping stale {} event for {} on handle {}",
                        other.kind(),
                        address,
                        handle
                    );
                    return;
                }
                self.route_io(address, other);
            }
        }
    }

    fn on_link_state(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        status: GattStatus,
        state: LinkState,
    ) {
        if state == LinkState::Connected && status.is_success() {
            if !self.registry.is_pending(address, handle) {
                debug!("Link up for {} on handle {} ignored", address, handle);
                return;
            }
            debug!("Link up for {}, discovering services", address);
            if !self.transport.discover_services(handle) {
                warn!(
                    "Service discovery refused for {}, waiting for timeout",
                    address
                );
            }
            return;
        }

        let (removed, handler) = match self
            .registry
            .link_down(address, handle, || self.routes.purge_peer(address))
        {
            LinkDown::Removed { removed, purged } => (removed, purged),
            LinkDown::Deferred => {
                debug!("Link to {} failed before the attempt was announced", address);
                return;
            }
            LinkDown::Stale => {
                debug!("Link down for {} on stale handle {}", address, handle);
                return;
            }
        };

        if let Some(timer) = removed.timer {
            self.executor.cancel(timer);
        }
        self.transport.close(handle);
        info!(
            "Link to {} lost (status {}, was {})",
            address, status, removed.state
        );

        if let Some(handler) = handler {
            self.report(
                handler,
                GattEvent::Connection {
                    peer: PeerInfo::idle(address.clone()),
                    event: ConnectionEvent::Disconnected,
                },
            );
        }
    }

    fn on_services_discovered(
        &self,
        address: &PeerAddress,
        handle: TransportHandle,
        status: GattStatus,
        services: Vec<ServiceDescriptor>,
    ) {
        if !status.is_success() {
            warn!(
                "Service discovery failed for {} with status {}",
                address, status
            );
            return;
        }

        match self
            .registry
            .complete_discovery(address, handle, Topology::new(services))
        {
            Discovery::Connected { timer } => {
                if let Some(timer) = timer {
                    self.executor.cancel(timer);
                }
                info!("Connected to {}", address);
                if let Some(handler) = self.routes.resolve_connection(address) {
                    self.report(
                        handler,
                        GattEvent::Connection {
                            peer: self.peer_info(address),
                            event: ConnectionEvent::Connected,
                        },
                    );
                }
            }
            Discovery::Deferred => debug!(
                "Discovery for {} held until the attempt is announced",
                address
            ),
            Discovery::Refreshed => debug!("Services refreshed for {}", address),
            Discovery::Ignored => debug!(
                "Discovery for {} on handle {} arrived after the attempt ended",
                address, handle
            ),
        }
    }

    fn route_io(&self, address: PeerAddress, event: TransportEvent) {
        match event {
            TransportEvent::CharacteristicRead {
                service,
                characteristic,
                status,
                value,
                ..
            } => {
                let key = CharacteristicKey::new(address, service, characteristic);
                let Some(handler) = self.routes.resolve_characteristic(RouteKind::Read, &key) else {
                    return unrouted("read", &key);
                };
                self.report(
                    handler,
                    GattEvent::Read {
                        peer: self.peer_info(&key.address),
                        characteristic,
                        result: outcome(status, value, "read"),
                    },
                );
            }
            TransportEvent::CharacteristicWrite {
                service,
                characteristic,
                status,
                value,
                ..
            } => {
                let key = CharacteristicKey::new(address, service, characteristic);
                let Some(handler) = self.routes.resolve_characteristic(RouteKind::Write, &key) else {
                    return unrouted("write", &key);
                };
                self.report(
                    handler,
                    GattEvent::Write {
                        peer: self.peer_info(&key.address),
                        characteristic,
                        result: outcome(status, value, "write"),
                    },
                );
            }
            TransportEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
                ..
            } => {
                let key = CharacteristicKey::new(address, service, characteristic);
                let Some(handler) = self.routes.resolve_characteristic(RouteKind::Notify, &key) else {
                    return unrouted("value change", &key);
                };
                self.report(
                    handler,
                    GattEvent::Notify {
                        peer: self.peer_info(&key.address),
                        characteristic,
                        event: NotifyEvent::Changed(value),
                    },
                );
            }
            TransportEvent::DescriptorWrite {
                service,
                characteristic,
                descriptor,
                status,
                ..
            } => {
                if descriptor != CLIENT_CHARACTERISTIC_CONFIG {
                    debug!("Ignoring write of descriptor {} on {}", descriptor, address);
                    return;
                }
                let key = CharacteristicKey::new(address, service, characteristic);
                if !self.routes.take_subscription(&key) {
                    debug!("No subscription in flight for {}, dropping descriptor write", key);
                    return;
                }
                let Some(handler) = self.routes.resolve_characteristic(RouteKind::Notify, &key) else {
                    return unrouted("descriptor write", &key);
                };
                let event = if status.is_success() {
                    NotifyEvent::Subscribed
                } else {
                    NotifyEvent::Failed(Failure::from_status(
                        status,
                        format!("enabling notifications failed with status {}", status),
                    ))
                };
                self.report(
                    handler,
                    GattEvent::Notify {
                        peer: self.peer_info(&key.address),
                        characteristic,
                        event,
                    },
                );
            }
            TransportEvent::RemoteRssi { rssi, status, .. } => {
                let Some(handler) = self.routes.resolve_rssi(&address) else {
                    debug!("No RSSI registration for {}", address);
                    return;
                };
                self.report(
                    handler,
                    GattEvent::Rssi {
                        peer: self.peer_info(&address),
                        result: outcome(status, rssi, "RSSI read"),
                    },
                );
            }
            TransportEvent::MtuChanged { mtu, status, .. } => {
                if status.is_success() {
                    self.registry.set_mtu(&address, mtu);
                }
                let Some(handler) = self.routes.resolve_mtu(&address) else {
                    debug!("No MTU registration for {}", address);
                    return;
                };
                self.report(
                    handler,
                    GattEvent::Mtu {
                        peer: self.peer_info(&address),
                        result: outcome(status, mtu, "MTU exchange"),
                    },
                );
            }
            TransportEvent::ConnectionStateChanged { .. } | TransportEvent::ServicesDiscovered { .. } => {
                debug!("Lifecycle event reached I/O routing for {}", address)
            }
        }
    }
}

fn outcome<T>(status: GattStatus, value: T, operation: &str) -> Outcome<T> {
    if status.is_success() {
        Ok(value)
    } else {
        Err(Failure::from_status(
            status,
            format!("{} failed with status {}", operation, status),
        ))
    }
}

fn unrouted(operation: &str, key: &CharacteristicKey) {
    debug!("No {} registration for {}", operation, key);
}
