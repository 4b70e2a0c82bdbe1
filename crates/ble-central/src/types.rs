//! Peer identity, session state and discovered GATT topology

use crate::error::{CentralError, CentralResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Bluetooth base UUID, used to expand 16-bit short UUIDs
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Client Characteristic Configuration Descriptor (0x2902)
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// CCCD value enabling notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both notifications and indications
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// Parse UUID text, accepting the full 128-bit form in any letter case as
/// well as 16-bit short forms such as `"2902"` or `"0x2902"`.
pub fn parse_uuid(raw: &str) -> CentralResult<Uuid> {
    let trimmed = raw.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4 {
        let value = u16::from_str_radix(short, 16)
            .map_err(|_| CentralError::InvalidUuid(raw.to_string()))?;
        return Ok(Uuid::from_u128(BLUETOOTH_BASE_UUID | ((value as u128) << 96)));
    }

    Uuid::parse_str(trimmed).map_err(|_| CentralError::InvalidUuid(raw.to_string()))
}

/// Transport-stable peer address.
///
/// Addresses are opaque (a MAC address on most platforms, a UUID on others)
/// and compared case-insensitively: parsing normalizes to ASCII uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn parse(raw: &str) -> CentralResult<Self> {
        let trimmed = raw.trim();
        let well_formed = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '-' | '_'));

        if !well_formed {
            return Err(CentralError::InvalidAddress(raw.to_string()));
        }

        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerAddress {
    type Err = CentralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection state of a single peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PeerState {
    Idle,
    Connecting,
    Connected,
}

impl PeerState {
    pub fn is_connecting(self) -> bool {
        self == PeerState::Connecting
    }

    pub fn is_connected(self) -> bool {
        self == PeerState::Connected
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerState::Idle => "idle",
            PeerState::Connecting => "connecting",
            PeerState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Snapshot of a peer record handed to every handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub address: PeerAddress,
    pub state: PeerState,
    /// MTU negotiated by the last successful exchange
    pub mtu: Option<u16>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl PeerInfo {
    /// Record for a peer with no live session
    pub fn idle(address: PeerAddress) -> Self {
        Self {
            address,
            state: PeerState::Idle,
            mtu: None,
            connected_at: None,
        }
    }
}

/// Capability flags of a characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CharProperties {
    pub readable: bool,
    /// Write with response or write without response
    pub writable: bool,
    pub notifiable: bool,
    pub indicatable: bool,
}

impl CharProperties {
    pub const PROPERTY_READ: u8 = 0x02;
    pub const PROPERTY_WRITE_NO_RESPONSE: u8 = 0x04;
    pub const PROPERTY_WRITE: u8 = 0x08;
    pub const PROPERTY_NOTIFY: u8 = 0x10;
    pub const PROPERTY_INDICATE: u8 = 0x20;

    /// Decode the GATT characteristic property bit field
    pub fn from_bits(bits: u8) -> Self {
        Self {
            readable: bits & Self::PROPERTY_READ != 0,
            writable: bits & (Self::PROPERTY_WRITE | Self::PROPERTY_WRITE_NO_RESPONSE) != 0,
            notifiable: bits & Self::PROPERTY_NOTIFY != 0,
            indicatable: bits & Self::PROPERTY_INDICATE != 0,
        }
    }

    pub fn supports_subscription(&self) -> bool {
        self.notifiable || self.indicatable
    }
}

/// A discovered characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicDescriptor {
    pub uuid: Uuid,
    pub properties: CharProperties,
    pub descriptors: Vec<Uuid>,
}

impl CharacteristicDescriptor {
    pub fn new(uuid: Uuid, properties: CharProperties, descriptors: Vec<Uuid>) -> Self {
        Self {
            uuid,
            properties,
            descriptors,
        }
    }

    pub fn has_descriptor(&self, uuid: Uuid) -> bool {
        self.descriptors.contains(&uuid)
    }

    /// CCCD value that enables delivery. Indication wins when both modes are
    /// supported.
    pub fn subscription_value(&self) -> Option<[u8; 2]> {
        if self.properties.indicatable {
            Some(ENABLE_INDICATION_VALUE)
        } else if self.properties.notifiable {
            Some(ENABLE_NOTIFICATION_VALUE)
        } else {
            None
        }
    }
}

/// A discovered service and its characteristics, in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(uuid: Uuid, characteristics: Vec<CharacteristicDescriptor>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// GATT topology of one peer, as reported by the last successful discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Topology {
    services: Vec<ServiceDescriptor>,
}

impl Topology {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn service(&self, uuid: Uuid) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    pub fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&CharacteristicDescriptor> {
        self.service(service)?.characteristic(characteristic)
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
