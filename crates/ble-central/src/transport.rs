//! Transport boundary: the radio stack the central drives
//!
//! A transport accepts or rejects each request synchronously and, for every
//! accepted request, later emits exactly one [`TransportEvent`] into the
//! [`EventSink`] it was attached to. Events carry no correlation id; the
//! central correlates them by peer address and characteristic.

use crate::central::EventSink;
use crate::types::{PeerAddress, ServiceDescriptor};
use std::fmt;
use uuid::Uuid;

/// Opaque handle of one transport-level connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(u64);

impl TransportHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Raw GATT status code carried by completion events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0x0000);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(0x0002);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(0x0003);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(0x000d);
    pub const CONNECTION_CONGESTED: GattStatus = GattStatus(0x008f);
    pub const FAILURE: GattStatus = GattStatus(0x0101);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Link state reported by connection state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Raw event emitted by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged {
        handle: TransportHandle,
        address: String,
        status: GattStatus,
        state: LinkState,
    },
    ServicesDiscovered {
        handle: TransportHandle,
        address: String,
        status: GattStatus,
        services: Vec<ServiceDescriptor>,
    },
    CharacteristicRead {
        handle: TransportHandle,
        address: String,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicWrite {
        handle: TransportHandle,
        address: String,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        handle: TransportHandle,
        address: String,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DescriptorWrite {
        handle: TransportHandle,
        address: String,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    },
    RemoteRssi {
        handle: TransportHandle,
        address: String,
        rssi: i16,
        status: GattStatus,
    },
    MtuChanged {
        handle: TransportHandle,
        address: String,
        mtu: u16,
        status: GattStatus,
    },
}

impl TransportEvent {
    pub fn address(&self) -> &str {
        match self {
            TransportEvent::ConnectionStateChanged { address, .. }
            | TransportEvent::ServicesDiscovered { address, .. }
            | TransportEvent::CharacteristicRead { address, .. }
            | TransportEvent::CharacteristicWrite { address, .. }
            | TransportEvent::CharacteristicChanged { address, .. }
            | TransportEvent::DescriptorWrite { address, .. }
            | TransportEvent::RemoteRssi { address, .. }
            | TransportEvent::MtuChanged { address, .. } => address,
        }
    }

    pub fn handle(&self) -> TransportHandle {
        match self {
            TransportEvent::ConnectionStateChanged { handle, .. }
            | TransportEvent::ServicesDiscovered { handle, .. }
            | TransportEvent::CharacteristicRead { handle, .. }
            | TransportEvent::CharacteristicWrite { handle, .. }
            | TransportEvent::CharacteristicChanged { handle, .. }
            | TransportEvent::DescriptorWrite { handle, .. }
            | TransportEvent::RemoteRssi { handle, .. }
            | TransportEvent::MtuChanged { handle, .. } => *handle,
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::ConnectionStateChanged { .. } => "connection-state",
            TransportEvent::ServicesDiscovered { .. } => "services-discovered",
            TransportEvent::CharacteristicRead { .. } => "characteristic-read",
            TransportEvent::CharacteristicWrite { .. } => "characteristic-write",
            TransportEvent::CharacteristicChanged { .. } => "characteristic-changed",
            TransportEvent::DescriptorWrite { .. } => "descriptor-write",
            TransportEvent::RemoteRssi { .. } => "remote-rssi",
            TransportEvent::MtuChanged { .. } => "mtu-changed",
        }
    }
}

/// Radio stack driven by the central.
///
/// Every request method returns `true` when accepted; an
/// accepted request produces exactly one completion event later. Requests
/// rejected synchronously produce no event. Implementations must not call
/// back into the sink from inside a request method while holding locks.
pub trait Transport: Send + Sync {
    /// Receive the sink events must be delivered to
    fn attach(&self, sink: EventSink);

    /// Whether the radio is powered on
    fn is_enabled(&self) -> bool;

    /// Whether the platform supports an MTU exchange
    fn supports_mtu_exchange(&self) -> bool {
        true
    }

    /// Open a link to `address` under `handle`, which the central allocates
    /// before the call. Events for the handle may arrive before this returns.
    fn connect(&self, address: &PeerAddress, handle: TransportHandle) -> bool;

    fn disconnect(&self, handle: TransportHandle);

    /// Release every resource held for the handle
    fn close(&self, handle: TransportHandle);

    fn discover_services(&self, handle: TransportHandle) -> bool;

    fn read_characteristic(&self, handle: TransportHandle, service: Uuid, characteristic: Uuid) -> bool;

    fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool;

    /// Toggle local delivery of value changes. Produces no event.
    fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool;

    fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool;

    fn read_remote_rssi(&self, handle: TransportHandle) -> bool;

    fn request_mtu(&self, handle: TransportHandle, mtu: u16) -> bool;
}
