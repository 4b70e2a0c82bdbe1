//! Callback routing table
//!
//! Transport events carry no correlation id, so each in-flight operation is
//! found again by a normalized key: the peer address alone for connection,
//! RSSI and MTU traffic, or (address, service, characteristic) for
//! characteristic traffic. UUID text is parsed to 128-bit values, which
//! makes characteristic keys case-insensitive.
//!
//! The table also remembers which characteristics have a subscription
//! descriptor write in flight, so each subscription settles at most once.

use crate::error::CentralResult;
use crate::event::EventHandler;
use crate::types::{parse_uuid, PeerAddress};
use dashmap::{DashMap, DashSet};
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Composite key of one characteristic on one peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicKey {
    pub address: PeerAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(address: PeerAddress, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            address,
            service,
            characteristic,
        }
    }

    /// Build a key from caller-supplied text
    pub fn parse(address: &str, service: &str, characteristic: &str) -> CentralResult<Self> {
        Ok(Self {
            address: PeerAddress::parse(address)?,
            service: parse_uuid(service)?,
            characteristic: parse_uuid(characteristic)?,
        })
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service, self.characteristic)
    }
}

/// Kind of characteristic traffic a registration serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Read,
    Write,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Connection(PeerAddress),
    Rssi(PeerAddress),
    Mtu(PeerAddress),
    Characteristic(RouteKind, CharacteristicKey),
}

impl RouteKey {
    pub fn address(&self) -> &PeerAddress {
        match self {
            RouteKey::Connection(address) | RouteKey::Rssi(address) | RouteKey::Mtu(address) => {
                address
            }
            RouteKey::Characteristic(_, key) => &key.address,
        }
    }
}

/// Concurrent map from route key to the single live handler
#[derive(Default)]
pub struct RoutingTable {
    routes: DashMap<RouteKey, EventHandler>,
    subscribing: DashSet<CharacteristicKey>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under the same key
    pub fn register(&self, key: RouteKey, handler: EventHandler) {
        if self.routes.insert(key.clone(), handler).is_some() {
            debug!("Replaced handler for {:?}", key);
        }
    }

    pub fn register_connection(&self, address: &PeerAddress, handler: EventHandler) {
        self.register(RouteKey::Connection(address.clone()), handler);
    }

    pub fn register_characteristic(
        &self,
        kind: RouteKind,
        key: &CharacteristicKey,
        handler: EventHandler,
    ) {
        self.register(RouteKey::Characteristic(kind, key.clone()), handler);
    }

    pub fn register_rssi(&self, address: &PeerAddress, handler: EventHandler) {
        self.register(RouteKey::Rssi(address.clone()), handler);
    }

    pub fn register_mtu(&self, address: &PeerAddress, handler: EventHandler) {
        self.register(RouteKey::Mtu(address.clone()), handler);
    }

    pub fn resolve(&self, key: &RouteKey) -> Option<EventHandler> {
        self.routes.get(key).map(|h| h.value().clone())
    }

    pub fn resolve_connection(&self, address: &PeerAddress) -> Option<EventHandler> {
        self.resolve(&RouteKey::Connection(address.clone()))
    }

    pub fn resolve_characteristic(
        &self,
        kind: RouteKind,
        key: &CharacteristicKey,
    ) -> Option<EventHandler> {
        self.resolve(&RouteKey::Characteristic(kind, key.clone()))
    }

    pub fn resolve_rssi(&self, address: &PeerAddress) -> Option<EventHandler> {
        self.resolve(&RouteKey::Rssi(address.clone()))
    }

    pub fn resolve_mtu(&self, address: &PeerAddress) -> Option<EventHandler> {
        self.resolve(&RouteKey::Mtu(address.clone()))
    }

    pub fn unregister(&self, key: &RouteKey) -> Option<EventHandler> {
        self.routes.remove(key).map(|(_, handler)| handler)
    }

    /// Drop every registration owned by a peer
    pub fn unregister_all_for_peer(&self, address: &PeerAddress) {
        let before = self.routes.len();
        self.routes.retain(|key, _| key.address() != address);
        self.subscribing.retain(|key| key.address != *address);
        debug!(
            "Purged {} route(s) for {}",
            before.saturating_sub(self.routes.len()),
            address
        );
    }

    /// Take the peer's connection handler and drop everything it owns
    pub fn purge_peer(&self, address: &PeerAddress) -> Option<EventHandler> {
        let handler = self.unregister(&RouteKey::Connection(address.clone()));
        self.unregister_all_for_peer(address);
        handler
    }

    /// Record that a subscription descriptor write is in flight
    pub fn expect_subscription(&self, key: &CharacteristicKey) {
        self.subscribing.insert(key.clone());
    }

    /// Claim the in-flight subscription for `key`. False when none is
    /// pending, as for a completion left over from a cancelled one.
    pub fn take_subscription(&self, key: &CharacteristicKey) -> bool {
        self.subscribing.remove(key).is_some()
    }

    pub fn forget_subscription(&self, key: &CharacteristicKey) {
        self.subscribing.remove(key);
    }

    pub fn clear_all(&self) {
        self.routes.clear();
        self.subscribing.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
