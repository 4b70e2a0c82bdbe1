#![allow(dead_code)]

use ble_central::{
    handler, CharProperties, CharacteristicDescriptor, EventHandler, EventSink, GattCentral,
    GattEvent, MockTransport, PeerAddress, ServiceDescriptor, Transport, TransportHandle,
    CLIENT_CHARACTERISTIC_CONFIG,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const PEER: &str = "AA:BB:CC:DD:EE:01";
pub const SERVICE: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
/// Readable
pub const READ_CHAR: &str = "0000fff1-0000-1000-8000-00805f9b34fb";
/// Writable
pub const WRITE_CHAR: &str = "0000fff2-0000-1000-8000-00805f9b34fb";
/// Notify with CCCD
pub const NOTIFY_CHAR: &str = "0000fff3-0000-1000-8000-00805f9b34fb";
/// Notify and indicate with CCCD
pub const INDICATE_CHAR: &str = "0000fff4-0000-1000-8000-00805f9b34fb";
/// Notify without CCCD
pub const BARE_NOTIFY_CHAR: &str = "0000fff5-0000-1000-8000-00805f9b34fb";

pub type Events = mpsc::UnboundedReceiver<GattEvent>;

pub fn uuid(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap()
}

pub fn services() -> Vec<ServiceDescriptor> {
    let characteristic = |raw: &str, bits: u8, cccd: bool| {
        let descriptors = if cccd {
            vec![CLIENT_CHARACTERISTIC_CONFIG]
        } else {
            vec![]
        };
        CharacteristicDescriptor::new(uuid(raw), CharProperties::from_bits(bits), descriptors)
    };

    vec![ServiceDescriptor::new(
        uuid(SERVICE),
        vec![
            characteristic(READ_CHAR, CharProperties::PROPERTY_READ, false),
            characteristic(WRITE_CHAR, CharProperties::PROPERTY_WRITE, false),
            characteristic(NOTIFY_CHAR, CharProperties::PROPERTY_NOTIFY, true),
            characteristic(
                INDICATE_CHAR,
                CharProperties::PROPERTY_NOTIFY | CharProperties::PROPERTY_INDICATE,
                true,
            ),
            characteristic(BARE_NOTIFY_CHAR, CharProperties::PROPERTY_NOTIFY, false),
        ],
    )]
}

/// Handler that forwards every event into a channel
pub fn recorder() -> (EventHandler, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        handler(move |event| {
            let _ = tx.send(event);
        }),
        rx,
    )
}

pub fn setup() -> (Arc<MockTransport>, GattCentral) {
    let _ = ble_central::logging::init_logging();
    let mock = Arc::new(MockTransport::new());
    let central = GattCentral::new(mock.clone()).unwrap();
    (mock, central)
}

pub async fn next(rx: &mut Events) -> GattEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Wait until everything already queued on the callback executor has run
pub async fn flush(central: &GattCentral) {
    let (marker, mut rx) = recorder();
    central.read_rssi("FF:FF:FF:FF:FF:FE", marker).unwrap();
    next(&mut rx).await;
}

/// Assert no event is pending once the executor is drained
pub async fn assert_quiet(central: &GattCentral, rx: &mut Events) {
    flush(central).await;
    assert!(rx.try_recv().is_err(), "unexpected event delivered");
}

pub fn connection_event(event: GattEvent) -> ble_central::ConnectionEvent {
    match event {
        GattEvent::Connection { event, .. } => event,
        other => panic!("expected a connection event, got {:?}", other),
    }
}

/// Connect and complete discovery, returning the connection event stream
pub async fn connect_peer(central: &GattCentral, mock: &MockTransport, address: &str) -> Events {
    let (h, mut rx) = recorder();
    central.connect(None, address, h).unwrap();
    assert_eq!(
        connection_event(next(&mut rx).await),
        ble_central::ConnectionEvent::Started
    );

    mock.establish(address, services());
    assert_eq!(
        connection_event(next(&mut rx).await),
        ble_central::ConnectionEvent::Connected
    );
    rx
}

type Hook = Box<dyn FnOnce() + Send>;

/// Mock transport that runs a one-shot hook right after a handle is closed
pub struct HookedTransport {
    pub mock: Arc<MockTransport>,
    on_close: Mutex<Option<Hook>>,
}

impl HookedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mock: Arc::new(MockTransport::new()),
            on_close: Mutex::new(None),
        })
    }

    pub fn on_next_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(hook));
    }
}

impl Transport for HookedTransport {
    fn attach(&self, sink: EventSink) {
        self.mock.attach(sink)
    }

    fn is_enabled(&self) -> bool {
        self.mock.is_enabled()
    }

    fn connect(&self, address: &PeerAddress, handle: TransportHandle) -> bool {
        self.mock.connect(address, handle)
    }

    fn disconnect(&self, handle: TransportHandle) {
        self.mock.disconnect(handle)
    }

    fn close(&self, handle: TransportHandle) {
        self.mock.close(handle);
        let hook = self.on_close.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn discover_services(&self, handle: TransportHandle) -> bool {
        self.mock.discover_services(handle)
    }

    fn read_characteristic(&self, handle: TransportHandle, service: Uuid, characteristic: Uuid) -> bool {
        self.mock.read_characteristic(handle, service, characteristic)
    }

    fn write_characteristic(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> bool {
        self.mock
            .write_characteristic(handle, service, characteristic, value)
    }

    fn set_characteristic_notification(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        enabled: bool,
    ) -> bool {
        self.mock
            .set_characteristic_notification(handle, service, characteristic, enabled)
    }

    fn write_descriptor(
        &self,
        handle: TransportHandle,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> bool {
        self.mock
            .write_descriptor(handle, service, characteristic, descriptor, value)
    }

    fn read_remote_rssi(&self, handle: TransportHandle) -> bool {
        self.mock.read_remote_rssi(handle)
    }

    fn request_mtu(&self, handle: TransportHandle, mtu: u16) -> bool {
        self.mock.request_mtu(handle, mtu)
    }
}
