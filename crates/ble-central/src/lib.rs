//! Concurrent GATT central
//!
//! Manages connections from one central to many BLE peripherals over a
//! callback-only transport that reports every completion on a single shared
//! event channel. The crate tracks per-peer connection lifecycle with
//! timeout-bounded attempts, routes each transport event back to the handler
//! that requested it, validates characteristic capabilities before issuing
//! requests, and sequences chunked writes.
//!
//! ```no_run
//! use ble_central::{handler, BtleplugTransport, GattCentral, GattEvent};
//! use std::sync::Arc;
//!
//! # async fn run() -> ble_central::CentralResult<()> {
//! let transport = Arc::new(BtleplugTransport::with_default_adapter().await?);
//! let central = GattCentral::new(transport)?;
//!
//! central.connect(None, "AA:BB:CC:DD:EE:FF", handler(|event| {
//!     if let GattEvent::Connection { peer, event } = event {
//!         println!("{}: {:?}", peer.address, event);
//!     }
//! }))?;
//! # Ok(())
//! # }
//! ```

pub mod btle;
pub mod central;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod logging;
pub mod mock;
pub mod registry;
pub mod routing;
pub mod transport;
pub mod types;

pub use btle::BtleplugTransport;
pub use central::{EventSink, GattCentral};
pub use config::CentralConfig;
pub use error::{CentralError, CentralResult};
pub use event::{
    handler, ConnectionEvent, EventHandler, Failure, FailureCode, GattEvent, NotifyEvent, Outcome,
};
pub use executor::{CallbackExecutor, QueueExecutor, TimerId};
pub use mock::MockTransport;
pub use transport::{GattStatus, LinkState, Transport, TransportEvent, TransportHandle};
pub use types::{
    parse_uuid, CharProperties, CharacteristicDescriptor, PeerAddress, PeerInfo, PeerState,
    ServiceDescriptor, Topology, CLIENT_CHARACTERISTIC_CONFIG,
};
