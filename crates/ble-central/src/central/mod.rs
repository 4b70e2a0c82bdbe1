//! GATT central controller
//!
//! [`GattCentral`] is the caller-facing facade. Requests flow through the
//! lifecycle controller and the I/O dispatcher, which register the caller's
//! handler in the routing table before touching the transport. Transport
//! events come back through an [`EventSink`] into the demultiplexer, which
//! resolves the handler and runs it on the callback executor.

mod batch;
mod demux;
mod dispatch;
mod lifecycle;

use crate::config::CentralConfig;
use crate::error::CentralResult;
use crate::event::{EventHandler, GattEvent};
use crate::executor::{CallbackExecutor, QueueExecutor};
use crate::registry::PeerRegistry;
use crate::routing::{CharacteristicKey, RoutingTable};
use crate::transport::{Transport, TransportEvent, TransportHandle};
use crate::types::{PeerAddress, PeerInfo, Topology};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

pub use batch::{effective_chunk_size, split_chunks};

/// State shared by the facade, the sink and pending timers
struct Shared {
    transport: Arc<dyn Transport>,
    executor: Arc<dyn CallbackExecutor>,
    registry: PeerRegistry,
    routes: RoutingTable,
    config: CentralConfig,
    /// Source of transport handles; ids start at 1
    next_handle: AtomicU64,
}

impl Shared {
    /// Snapshot of the peer record, idle when no session exists
    fn peer_info(&self, address: &PeerAddress) -> PeerInfo {
        self.registry
            .get(address)
            .unwrap_or_else(|| PeerInfo::idle(address.clone()))
    }

    /// Run a handler on the callback executor
    fn report(&self, handler: EventHandler, event: GattEvent) {
        self.executor.post(Box::new(move || handler(event)));
    }
}

/// Single ingress for transport events
///
/// Holds a weak reference; events delivered after the central is dropped
/// are discarded.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<Shared>,
}

impl EventSink {
    pub fn deliver(&self, event: TransportEvent) {
        match self.shared.upgrade() {
            Some(shared) => shared.demux(event),
            None => debug!("Central dropped, discarding {} event", event.kind()),
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("live", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Concurrent GATT central: connection lifecycle and characteristic I/O
/// for many peers over one transport
#[derive(Clone)]
pub struct GattCentral {
    shared: Arc<Shared>,
}

impl GattCentral {
    /// Create a central with default configuration on the current tokio
    /// runtime
    pub fn new(transport: Arc<dyn Transport>) -> CentralResult<Self> {
        Self::with_config(transport, CentralConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: CentralConfig) -> CentralResult<Self> {
        let executor = Arc::new(QueueExecutor::spawn()?);
        Self::with_executor(transport, executor, config)
    }

    /// Create a central with a caller-supplied callback executor
    pub fn with_executor(
        transport: Arc<dyn Transport>,
        executor: Arc<dyn CallbackExecutor>,
        config: CentralConfig,
    ) -> CentralResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            transport,
            executor,
            registry: PeerRegistry::new(),
            routes: RoutingTable::new(),
            config,
            next_handle: AtomicU64::new(1),
        });
        shared.transport.attach(EventSink {
            shared: Arc::downgrade(&shared),
        });

        info!("GATT central initialized");
        Ok(Self { shared })
    }

    /// Start a timeout-bounded connection attempt. `None` or a zero timeout
    /// uses the configured default. Every outcome reaches `handler`.
    pub fn connect(
        &self,
        timeout: Option<Duration>,
        address: &str,
        handler: EventHandler,
    ) -> CentralResult<()> {
        let address = PeerAddress::parse(address)?;
        self.shared.connect(timeout, address, handler);
        Ok(())
    }

    /// Tear down a peer. No-op for malformed addresses or peers without an
    /// active transport handle.
    pub fn disconnect(&self, address: &str) {
        match PeerAddress::parse(address) {
            Ok(address) => self.shared.disconnect_peer(&address),
            Err(_) => debug!("Ignoring disconnect for malformed address {:?}", address),
        }
    }

    pub fn disconnect_all(&self) {
        self.shared.disconnect_all();
    }

    /// Cancel timers, disconnect every peer and clear every table
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn read(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        handler: EventHandler,
    ) -> CentralResult<()> {
        let key = CharacteristicKey::parse(address, service, characteristic)?;
        self.shared.read(key, handler);
        Ok(())
    }

    pub fn write(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        data: &[u8],
        handler: EventHandler,
    ) -> CentralResult<()> {
        let key = CharacteristicKey::parse(address, service, characteristic)?;
        self.shared.write(key, data, handler);
        Ok(())
    }

    /// Write `data` in chunks of `chunk_size` bytes, one chunk per
    /// completion. A non-positive size uses the configured default.
    pub fn write_by_batch(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        data: &[u8],
        chunk_size: i32,
        handler: EventHandler,
    ) -> CentralResult<()> {
        let key = CharacteristicKey::parse(address, service, characteristic)?;
        self.shared.write_by_batch(key, data, chunk_size, handler);
        Ok(())
    }

    pub fn enable_notify(
        &self,
        address: &str,
        service: &str,
        characteristic: &str,
        handler: EventHandler,
    ) -> CentralResult<()> {
        let key = CharacteristicKey::parse(address, service, characteristic)?;
        self.shared.enable_notify(key, handler);
        Ok(())
    }

    /// Stop delivering value changes for a characteristic
    pub fn cancel_notify(&self, address: &str, service: &str, characteristic: &str) -> CentralResult<()> {
        let key = CharacteristicKey::parse(address, service, characteristic)?;
        self.shared.cancel_notify(key);
        Ok(())
    }

    pub fn read_rssi(&self, address: &str, handler: EventHandler) -> CentralResult<()> {
        let address = PeerAddress::parse(address)?;
        self.shared.read_rssi(address, handler);
        Ok(())
    }

    /// Request an MTU exchange. The size is clamped into the configured
    /// protocol range.
    pub fn set_mtu(&self, address: &str, mtu: u16, handler: EventHandler) -> CentralResult<()> {
        let address = PeerAddress::parse(address)?;
        self.shared.set_mtu(address, mtu, handler);
        Ok(())
    }

    /// Connected peers in connection order
    pub fn connected_peers(&self) -> Vec<PeerAddress> {
        self.shared.registry.connected()
    }

    pub fn is_connected(&self, address: &str) -> bool {
        PeerAddress::parse(address)
            .map(|a| self.shared.registry.is_connected(&a))
            .unwrap_or(false)
    }

    pub fn peer(&self, address: &str) -> Option<PeerInfo> {
        let address = PeerAddress::parse(address).ok()?;
        self.shared.registry.get(&address)
    }

    /// Topology recorded by the last successful discovery
    pub fn services(&self, address: &str) -> Option<Arc<Topology>> {
        let address = PeerAddress::parse(address).ok()?;
        self.shared.registry.topology_of(&address)
    }

    pub fn transport_handle(&self, address: &str) -> Option<TransportHandle> {
        let address = PeerAddress::parse(address).ok()?;
        self.shared.registry.handle_of(&address)
    }

    pub fn event_sink(&self) -> EventSink {
        EventSink {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> &CentralConfig {
        &self.shared.config
    }

    /// Number of live handler registrations
    pub fn route_count(&self) -> usize {
        self.shared.routes.len()
    }
}
