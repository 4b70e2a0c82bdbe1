//! Characteristic I/O dispatcher
//!
//! Every request is validated against the peer's discovered topology before
//! the transport is touched. Rejections are reported through the handler,
//! never returned.

use super::Shared;
use crate::event::{EventHandler, Failure, GattEvent, NotifyEvent};
use crate::routing::{CharacteristicKey, RouteKey, RouteKind};
use crate::transport::TransportHandle;
use crate::types::{CharacteristicDescriptor, PeerAddress, CLIENT_CHARACTERISTIC_CONFIG};
use tracing::{debug, warn};

/// A connected peer's handle plus the resolved characteristic
pub(super) struct Link {
    pub(super) handle: TransportHandle,
    pub(super) characteristic: CharacteristicDescriptor,
}

impl Shared {
    pub(super) fn resolve_link(&self, key: &CharacteristicKey) -> Result<Link, Failure> {
        let (handle, topology) = self
            .registry
            .link_of(&key.address)
            .ok_or_else(|| Failure::not_connected(format!("{} is not connected", key.address)))?;

        let service = topology.service(key.service).ok_or_else(|| {
            Failure::other(format!("service {} not found on {}", key.service, key.address))
        })?;
        let characteristic = service.characteristic(key.characteristic).ok_or_else(|| {
            Failure::other(format!(
                "characteristic {} not found in service {}",
                key.characteristic, key.service
            ))
        })?;

        Ok(Link {
            handle,
            characteristic: characteristic.clone(),
        })
    }

    fn reject(&self, kind: RouteKind, key: &CharacteristicKey, handler: EventHandler, failure: Failure) {
        debug!("Rejecting request on {}: {}", key, failure);
        let peer = self.peer_info(&key.address);
        let characteristic = key.characteristic;
        let event = match kind {
            RouteKind::Read => GattEvent::Read {
                peer,
                characteristic,
                result: Err(failure),
            },
            RouteKind::Write => GattEvent::Write {
                peer,
                characteristic,
                result: Err(failure),
            },
            RouteKind::Notify => GattEvent::Notify {
                peer,
                characteristic,
                event: NotifyEvent::Failed(failure),
            },
        };
        self.report(handler, event);
    }

    pub(super) fn read(&self, key: CharacteristicKey, handler: EventHandler) {
        let link = match self.resolve_link(&key) {
            Ok(link) if link.characteristic.properties.readable => link,
            Ok(_) => {
                let failure = Failure::other(format!("characteristic {} is not readable", key.characteristic));
                return self.reject(RouteKind::Read, &key, handler, failure);
            }
            Err(failure) => return self.reject(RouteKind::Read, &key, handler, failure),
        };

        self.routes
            .register_characteristic(RouteKind::Read, &key, handler.clone());
        debug!("Reading {}", key);
        if !self
            .transport
            .read_characteristic(link.handle, key.service, key.characteristic)
        {
            warn!("Transport rejected read of {}", key);
            self.reject(
                RouteKind::Read,
                &key,
                handler,
                Failure::other("read request was rejected by the transport"),
            );
        }
    }

    pub(super) fn write(&self, key: CharacteristicKey, data: &[u8], handler: EventHandler) {
        let link = match self.resolve_writable(&key) {
            Ok(link) => link,
            Err(failure) => return self.reject(RouteKind::Write, &key, handler, failure),
        };

        self.routes
            .register_characteristic(RouteKind::Write, &key, handler.clone());
        debug!("Writing {} byte(s) to {}", data.len(), key);
        if !self
            .transport
            .write_characteristic(link.handle, key.service, key.characteristic, data)
        {
            warn!("Transport rejected write to {}", key);
            self.reject(
                RouteKind::Write,
                &key,
                handler,
                Failure::other("write request was rejected by the transport"),
            );
        }
    }

    pub(super) fn resolve_writable(&self, key: &CharacteristicKey) -> Result<Link, Failure> {
        let link = self.resolve_link(key)?;
        if !link.characteristic.properties.writable {
            return Err(Failure::other(format!(
                "characteristic {} is not writable",
                key.characteristic
            )));
        }
        Ok(link)
    }

    pub(super) fn enable_notify(&self, key: CharacteristicKey, handler: EventHandler) {
        let (link, value) = match self.resolve_subscribable(&key) {
            Ok(resolved) => resolved,
            Err(failure) => return self.reject(RouteKind::Notify, &key, handler, failure),
        };

        let route = RouteKey::Characteristic(RouteKind::Notify, key.clone());
        self.routes.register(route.clone(), handler.clone());
        self.routes.expect_subscription(&key);

        if !self.transport.set_characteristic_notification(
            link.handle,
            key.service,
            key.characteristic,
            true,
        ) {
            warn!("Transport refused notification toggle on {}", key);
            self.routes.forget_subscription(&key);
            self.routes.unregister(&route);
            return self.reject(
                RouteKind::Notify,
                &key,
                handler,
                Failure::other("could not enable local notification delivery"),
            );
        }

        debug!("Writing CCCD {:02x?} on {}", value, key);
        if !self.transport.write_descriptor(
            link.handle,
            key.service,
            key.characteristic,
            CLIENT_CHARACTERISTIC_CONFIG,
            &value,
        ) {
            warn!("Transport rejected CCCD write on {}", key);
            self.transport
                .set_characteristic_notification(link.handle, key.service, key.characteristic, false);
            self.routes.forget_subscription(&key);
            self.routes.unregister(&route);
            self.reject(
                RouteKind::Notify,
                &key,
                handler,
                Failure::other("descriptor write was rejected by the transport"),
            );
        }
    }

    fn resolve_subscribable(&self, key: &CharacteristicKey) -> Result<(Link, [u8; 2]), Failure> {
        let link = self.resolve_link(key)?;
        let Some(value) = link.characteristic.subscription_value() else {
            return Err(Failure::other(format!(
                "characteristic {} supports neither notify nor indicate",
                key.characteristic
            )));
        };
        if !link.characteristic.has_descriptor(CLIENT_CHARACTERISTIC_CONFIG) {
            return Err(Failure::other(format!(
                "characteristic {} has no client characteristic configuration descriptor",
                key.characteristic
            )));
        }
        Ok((link, value))
    }

    /// Stop routing value changes and switch local delivery off. The CCCD
    /// is not written.
    pub(super) fn cancel_notify(&self, key: CharacteristicKey) {
        self.routes
            .unregister(&RouteKey::Characteristic(RouteKind::Notify, key.clone()));
        self.routes.forget_subscription(&key);

        let Ok(link) = self.resolve_link(&key) else {
            return;
        };
        if !link.characteristic.properties.supports_subscription() {
            return;
        }

        debug!("Cancelling notifications on {}", key);
        self.transport
            .set_characteristic_notification(link.handle, key.service, key.characteristic, false);
    }

    pub(super) fn read_rssi(&self, address: PeerAddress, handler: EventHandler) {
        let Some((handle, _)) = self.registry.link_of(&address) else {
            let failure = Failure::not_connected(format!("{} is not connected", address));
            return self.report_rssi_failure(&address, handler, failure);
        };

        self.routes.register_rssi(&address, handler.clone());
        if !self.transport.read_remote_rssi(handle) {
            warn!("Transport rejected RSSI read for {}", address);
            self.report_rssi_failure(
                &address,
                handler,
                Failure::other("RSSI request was rejected by the transport"),
            );
        }
    }

    fn report_rssi_failure(&self, address: &PeerAddress, handler: EventHandler, failure: Failure) {
        self.report(
            handler,
            GattEvent::Rssi {
                peer: self.peer_info(address),
                result: Err(failure),
            },
        );
    }

    pub(super) fn set_mtu(&self, address: PeerAddress, mtu: u16, handler: EventHandler) {
        if !self.transport.supports_mtu_exchange() {
            let failure = Failure::other("MTU exchange is not supported on this platform");
            return self.report_mtu_failure(&address, handler, failure);
        }

        let Some((handle, _)) = self.registry.link_of(&address) else {
            let failure = Failure::not_connected(format!("{} is not connected", address));
            return self.report_mtu_failure(&address, handler, failure);
        };

        let requested = self.config.clamp_mtu(mtu);
        if requested != mtu {
            debug!("Clamped MTU request for {} from {} to {}", address, mtu, requested);
        }

        self.routes.register_mtu(&address, handler.clone());
        if !self.transport.request_mtu(handle, requested) {
            warn!("Transport rejected MTU request for {}", address);
            self.report_mtu_failure(
                &address,
                handler,
                Failure::other("MTU request was rejected by the transport"),
            );
        }
    }

    fn report_mtu_failure(&self, address: &PeerAddress, handler: EventHandler, failure: Failure) {
        self.report(
            handler,
            GattEvent::Mtu {
                peer: self.peer_info(address),
                result: Err(failure),
            },
        );
    }
}
