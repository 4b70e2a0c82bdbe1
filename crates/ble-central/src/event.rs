//! Caller-facing events delivered to operation handlers

use crate::transport::GattStatus;
use crate::types::PeerInfo;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure classification surfaced to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCode {
    /// The peer is not in the connected set
    NotConnected,
    Other,
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::NotConnected => f.write_str("not connected"),
            FailureCode::Other => f.write_str("other"),
        }
    }
}

/// Failure reported through a handler's failure path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Failure {
    pub code: FailureCode,
    pub message: String,
    /// Raw transport status, when the failure came from a completion event
    pub status: Option<GattStatus>,
}

impl Failure {
    pub fn not_connected(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::NotConnected,
            message: message.into(),
            status: None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::Other,
            message: message.into(),
            status: None,
        }
    }

    pub fn from_status(status: GattStatus, message: impl Into<String>) -> Self {
        Self {
            code: FailureCode::Other,
            message: message.into(),
            status: Some(status),
        }
    }
}

/// Result carried by completion events
pub type Outcome<T> = Result<T, Failure>;

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connect request was accepted and the attempt is running
    Started,
    StartFailed(String),
    /// Services were discovered; the peer joined the connected set
    Connected,
    Disconnected,
    TimedOut,
}

/// Notification subscription notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyEvent {
    /// The CCCD write completed; values will now be delivered
    Subscribed,
    Changed(Vec<u8>),
    Failed(Failure),
}

/// Tagged event handed to a handler together with the peer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connection {
        peer: PeerInfo,
        event: ConnectionEvent,
    },
    Read {
        peer: PeerInfo,
        characteristic: Uuid,
        result: Outcome<Vec<u8>>,
    },
    Write {
        peer: PeerInfo,
        characteristic: Uuid,
        result: Outcome<Vec<u8>>,
    },
    /// Single aggregated result of a chunked write
    BatchWrite {
        peer: PeerInfo,
        characteristic: Uuid,
        result: Outcome<()>,
    },
    Notify {
        peer: PeerInfo,
        characteristic: Uuid,
        event: NotifyEvent,
    },
    Rssi {
        peer: PeerInfo,
        result: Outcome<i16>,
    },
    Mtu {
        peer: PeerInfo,
        result: Outcome<u16>,
    },
}

impl GattEvent {
    pub fn peer(&self) -> &PeerInfo {
        match self {
            GattEvent::Connection { peer, .. }
            | GattEvent::Read { peer, .. }
            | GattEvent::Write { peer, .. }
            | GattEvent::BatchWrite { peer, .. }
            | GattEvent::Notify { peer, .. }
            | GattEvent::Rssi { peer, .. }
            | GattEvent::Mtu { peer, .. } => peer,
        }
    }

    /// The failure carried by this event, if any
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            GattEvent::Read { result: Err(f), .. }
            | GattEvent::Write { result: Err(f), .. }
            | GattEvent::BatchWrite { result: Err(f), .. }
            | GattEvent::Notify {
                event: NotifyEvent::Failed(f),
                ..
            }
            | GattEvent::Rssi { result: Err(f), .. }
            | GattEvent::Mtu { result: Err(f), .. } => Some(f),
            _ => None,
        }
    }
}

/// Caller-supplied handler. Invoked only on the callback executor.
pub type EventHandler = Arc<dyn Fn(GattEvent) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`]
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(GattEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}
