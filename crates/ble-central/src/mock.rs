//! Deterministic in-process transport for tests
//!
//! Records every request, can refuse any class of operation, and lets the
//! test play the radio by emitting events through helper methods. Events are
//! only emitted from those helpers (or from auto-completed writes), after
//! the mock has released its own locks.

use crate::central::EventSink;
use crate::transport::{GattStatus, LinkState, Transport, TransportEvent, TransportHandle};
use crate::types::{PeerAddress, ServiceDescriptor};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Request recorded by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(PeerAddress),
    Disconnect(TransportHandle),
    Close(TransportHandle),
    DiscoverServices(TransportHandle),
    Read {
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
    },
    Write {
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    SetNotification {
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    },
    WriteDescriptor {
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: Vec<u8>,
    },
    ReadRssi(TransportHandle),
    RequestMtu {
        handle: TransportHandle,
        mtu: u16,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Connect(_) => Operation::Connect,
            Request::Disconnect(_) => Operation::Disconnect,
            Request::Close(_) => Operation::Close,
            Request::DiscoverServices(_) => Operation::DiscoverServices,
            Request::Read { .. } => Operation::Read,
            Request::Write { .. } => Operation::Write,
            Request::SetNotification { .. } => Operation::SetNotification,
            Request::WriteDescriptor { .. } => Operation::WriteDescriptor,
            Request::ReadRssi(_) => Operation::ReadRssi,
            Request::RequestMtu { .. } => Operation::RequestMtu,
        }
    }
}

/// What the mock radio does from inside an accepted `connect`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectScript {
    /// Report the link failing before `connect` returns
    LinkFails(GattStatus),
    /// Bring the link up and finish discovery before `connect` returns
    Establishes(Vec<ServiceDescriptor>),
}

/// Class of request, used for scripting refusals and counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    Close,
    DiscoverServices,
    Read,
    Write,
    SetNotification,
    WriteDescriptor,
    ReadRssi,
    RequestMtu,
}

/// Scripted transport double
pub struct MockTransport {
    sink: RwLock<Option<EventSink>>,
    requests: Mutex<Vec<Request>>,
    refused: Mutex<HashSet<Operation>>,
    enabled: AtomicBool,
    mtu_exchange: AtomicBool,
    auto_writes: AtomicBool,
    /// Status for the nth accepted write (1-based) when auto-completing
    write_failures: Mutex<HashMap<usize, GattStatus>>,
    writes_accepted: AtomicU64,
    connect_script: Mutex<Option<ConnectScript>>,
    handles: DashMap<PeerAddress, TransportHandle>,
    addresses: DashMap<TransportHandle, PeerAddress>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sink: RwLock::new(None),
            requests: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            enabled: AtomicBool::new(true),
            mtu_exchange: AtomicBool::new(true),
            auto_writes: AtomicBool::new(false),
            write_failures: Mutex::new(HashMap::new()),
            writes_accepted: AtomicU64::new(0),
            connect_script: Mutex::new(None),
            handles: DashMap::new(),
            addresses: DashMap::new(),
        }
    }

    /// Refuse every future request of this class synchronously
    pub fn refuse(&self, operation: Operation) {
        lock(&self.refused).insert(operation);
    }

    pub fn accept(&self, operation: Operation) {
        lock(&self.refused).remove(&operation);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_mtu_exchange(&self, supported: bool) {
        self.mtu_exchange.store(supported, Ordering::SeqCst);
    }

    /// Complete every accepted write immediately with a success status
    pub fn auto_complete_writes(&self, enabled: bool) {
        self.auto_writes.store(enabled, Ordering::SeqCst);
    }

    /// When auto-completing, fail the nth accepted write (1-based)
    pub fn fail_write(&self, nth: usize, status: GattStatus) {
        lock(&self.write_failures).insert(nth, status);
    }

    /// Run `script` synchronously inside the next accepted connect
    pub fn script_connect(&self, script: ConnectScript) {
        *lock(&self.connect_script) = Some(script);
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    pub fn count(&self, operation: Operation) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.operation() == operation)
            .count()
    }

    /// Values of every recorded characteristic write, in order
    pub fn written_values(&self) -> Vec<Vec<u8>> {
        lock(&self.requests)
            .iter()
            .filter_map(|r| match r {
                Request::Write { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.requests).clear();
    }

    /// Latest handle issued for an address
    pub fn handle_for(&self, address: &str) -> Option<TransportHandle> {
        let address = PeerAddress::parse(address).ok()?;
        self.handles.get(&address).map(|h| *h)
    }

    /// Deliver a raw event to the attached central
    pub fn emit(&self, event: TransportEvent) {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match sink {
            Some(sink) => sink.deliver(event),
            None => debug!("MockTransport not attached, dropping {}", event.kind()),
        }
    }

    fn current(&self, address: &str) -> TransportHandle {
        self.handle_for(address).unwrap_or(TransportHandle::new(0))
    }

    pub fn link_up(&self, address: &str) {
        self.emit(TransportEvent::ConnectionStateChanged {
            handle: self.current(address),
            address: address.to_string(),
            status: GattStatus::SUCCESS,
            state: LinkState::Connected,
        });
    }

    pub fn link_down(&self, address: &str, status: GattStatus) {
        self.emit(TransportEvent::ConnectionStateChanged {
            handle: self.current(address),
            address: address.to_string(),
            status,
            state: LinkState::Disconnected,
        });
    }

    pub fn discovered(&self, address: &str, status: GattStatus, services: Vec<ServiceDescriptor>) {
        self.emit(TransportEvent::ServicesDiscovered {
            handle: self.current(address),
            address: address.to_string(),
            status,
            services,
        });
    }

    /// Link up followed by a successful discovery
    pub fn establish(&self, address: &str, services: Vec<ServiceDescriptor>) {
        self.link_up(address);
        self.discovered(address, GattStatus::SUCCESS, services);
    }

    pub fn read_complete(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        value: &[u8],
    ) {
        self.emit(TransportEvent::CharacteristicRead {
            handle: self.current(address),
            address: address.to_string(),
            service,
            characteristic,
            status,
            value: value.to_vec(),
        });
    }

    pub fn write_complete(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        status: GattStatus,
        value: &[u8],
    ) {
        self.emit(TransportEvent::CharacteristicWrite {
            handle: self.current(address),
            address: address.to_string(),
            service,
            characteristic,
            status,
            value: value.to_vec(),
        });
    }

    pub fn value_changed(&self, address: &str, service: Uuid, characteristic: Uuid, value: &[u8]) {
        self.emit(TransportEvent::CharacteristicChanged {
            handle: self.current(address),
            address: address.to_string(),
            service,
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn descriptor_written(
        &self,
        address: &str,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        status: GattStatus,
    ) {
        self.emit(TransportEvent::DescriptorWrite {
            handle: self.current(address),
            address: address.to_string(),
            service,
            characteristic,
            descriptor,
            status,
        });
    }

    pub fn rssi(&self, address: &str, rssi: i16, status: GattStatus) {
        self.emit(TransportEvent::RemoteRssi {
            handle: self.current(address),
            address: address.to_string(),
            rssi,
            status,
        });
    }

    pub fn mtu_changed(&self, address: &str, mtu: u16, status: GattStatus) {
        self.emit(TransportEvent::MtuChanged {
            handle: self.current(address),
            address: address.to_string(),
            mtu,
            status,
        });
    }

    /// Record the request and report whether it is accepted
    fn record(&self, request: Request) -> bool {
        let operation = request.operation();
        lock(&self.requests).push(request);
        !lock(&self.refused).contains(&operation)
    }
}

impl Transport for MockTransport {
    fn attach(&self, sink: EventSink) {
        *self
            .sink
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sink);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn supports_mtu_exchange(&self) -> bool {
        self.mtu_exchange.load(Ordering::SeqCst)
    }

    fn connect(&self, address: &PeerAddress, handle: TransportHandle) -> bool {
        if !self.record(Request::Connect(address.clone())) {
            return false;
        }
        self.handles.insert(address.clone(), handle);
        self.addresses.insert(handle, address.clone());

        let script = lock(&self.connect_script).take();
        match script {
            Some(ConnectScript::LinkFails(status)) => self.link_down(address.as_str(), status),
            Some(ConnectScript::Establishes(services)) => self.establish(address.as_str(), services),
            None => {}
        }
        true
    }

    fn disconnect(&self, handle: TransportHandle) {
        self.record(Request::Disconnect(handle));
    }

    fn close(&self, handle: TransportHandle) {
        self.record(Request::Close(handle));
        self.addresses.remove(&handle);
    }

    fn discover_services(&self, handle: TransportHandle) -> bool {
        self.record(Request::DiscoverServices(handle))
    }

    fn read_characteristic(&self, handle: TransportHandle, service: Uuid, characteristic: Uuid) -> bool {
        self.record(Request::Read {
            handle,
            service,
            characteristic,
        })
    }

    fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        let accepted = self.record(Request::Write {
            handle,
            service,
            characteristic,
            value: value.to_vec(),
        });
        if !accepted || !self.auto_writes.load(Ordering::SeqCst) {
            return accepted;
        }

        let nth = self.writes_accepted.fetch_add(1, Ordering::SeqCst) as usize + 1;
        let status = lock(&self.write_failures)
            .get(&nth)
            .copied()
            .unwrap_or(GattStatus::SUCCESS);
        let address = self.addresses.get(&handle).map(|a| a.to_string());
        if let Some(address) = address {
            self.emit(TransportEvent::CharacteristicWrite {
                handle,
                address,
                service,
                characteristic,
                status,
                value: value.to_vec(),
            });
        }
        true
    }

    fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool {
        self.record(Request::SetNotification {
            handle,
            service,
            characteristic,
            enabled,
        })
    }

    fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        self.record(Request::WriteDescriptor {
            handle,
            service,
            characteristic,
            descriptor,
            value: value.to_vec(),
        })
    }

    fn read_remote_rssi(&self, handle: TransportHandle) -> bool {
        self.record(Request::ReadRssi(handle))
    }

    fn request_mtu(&self, handle: TransportHandle, mtu: u16) -> bool {
        self.record(Request::RequestMtu { handle, mtu })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
