mod common;

use ble_central::mock::{Operation, Request};
use ble_central::{
    CentralError, FailureCode, GattEvent, GattStatus, NotifyEvent, TransportEvent,
    CLIENT_CHARACTERISTIC_CONFIG,
};
use common::*;

fn read_result(event: GattEvent) -> ble_central::Outcome<Vec<u8>> {
    match event {
        GattEvent::Read { result, .. } => result,
        other => panic!("expected a read event, got {:?}", other),
    }
}

fn notify_event(event: GattEvent) -> NotifyEvent {
    match event {
        GattEvent::Notify { event, .. } => event,
        other => panic!("expected a notify event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_read_roundtrip() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.read(PEER, SERVICE, READ_CHAR, h).unwrap();
    let handle = mock.handle_for(PEER).unwrap();
    assert!(mock.requests().contains(&Request::Read {
        handle,
        service: uuid(SERVICE),
        characteristic: uuid(READ_CHAR),
    }));

    mock.read_complete(PEER, uuid(SERVICE), uuid(READ_CHAR), GattStatus::SUCCESS, &[0x64]);
    match next(&mut rx).await {
        GattEvent::Read {
            peer,
            characteristic,
            result,
        } => {
            assert_eq!(peer.address.as_str(), PEER);
            assert_eq!(characteristic, uuid(READ_CHAR));
            assert_eq!(result, Ok(vec![0x64]));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_read_failure_status() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.read(PEER, SERVICE, READ_CHAR, h).unwrap();
    mock.read_complete(
        PEER,
        uuid(SERVICE),
        uuid(READ_CHAR),
        GattStatus::READ_NOT_PERMITTED,
        &[],
    );

    let failure = read_result(next(&mut rx).await).unwrap_err();
    assert_eq!(failure.code, FailureCode::Other);
    assert_eq!(failure.status, Some(GattStatus::READ_NOT_PERMITTED));
}

#[tokio::test]
async fn test_operations_on_unconnected_peer() {
    let (mock, central) = setup();
    let (h, mut rx) = recorder();

    central.read(PEER, SERVICE, READ_CHAR, h.clone()).unwrap();
    central.write(PEER, SERVICE, WRITE_CHAR, &[1, 2], h.clone()).unwrap();
    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h.clone()).unwrap();
    central.read_rssi(PEER, h.clone()).unwrap();
    central.set_mtu(PEER, 185, h).unwrap();

    for _ in 0..5 {
        let event = next(&mut rx).await;
        let failure = event.failure().expect("expected a failure");
        assert_eq!(failure.code, FailureCode::NotConnected);
    }
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_connecting_peer_is_not_connected() {
    let (mock, central) = setup();
    let (conn, _conn_rx) = recorder();
    central.connect(None, PEER, conn).unwrap();
    mock.link_up(PEER);

    let (h, mut rx) = recorder();
    central.read(PEER, SERVICE, READ_CHAR, h).unwrap();
    let failure = read_result(next(&mut rx).await).unwrap_err();
    assert_eq!(failure.code, FailureCode::NotConnected);
    assert_eq!(mock.count(Operation::Read), 0);
}

#[tokio::test]
async fn test_capability_validation() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    let missing = "0000aaaa-0000-1000-8000-00805f9b34fb";

    central.read(PEER, missing, READ_CHAR, h.clone()).unwrap();
    central.read(PEER, SERVICE, missing, h.clone()).unwrap();
    central.read(PEER, SERVICE, WRITE_CHAR, h.clone()).unwrap();
    central.write(PEER, SERVICE, READ_CHAR, &[1], h.clone()).unwrap();
    central.enable_notify(PEER, SERVICE, READ_CHAR, h).unwrap();

    let mut messages = Vec::new();
    for _ in 0..5 {
        let event = next(&mut rx).await;
        let failure = event.failure().expect("expected a failure").clone();
        assert_eq!(failure.code, FailureCode::Other);
        messages.push(failure.message);
    }
    assert!(messages[0].contains("service"));
    assert!(messages[1].contains("not found"));
    assert!(messages[2].contains("not readable"));
    assert!(messages[3].contains("not writable"));
    assert!(messages[4].contains("neither notify nor indicate"));

    assert_eq!(mock.count(Operation::Read), 0);
    assert_eq!(mock.count(Operation::Write), 0);
    assert_eq!(mock.count(Operation::SetNotification), 0);
}

#[tokio::test]
async fn test_malformed_arguments_return_errors() {
    let (mock, central) = setup();
    let (h, _rx) = recorder();

    assert!(matches!(
        central.read(PEER, "not-a-uuid", READ_CHAR, h.clone()),
        Err(CentralError::InvalidUuid(_))
    ));
    assert!(matches!(
        central.write("bad address!", SERVICE, WRITE_CHAR, &[], h),
        Err(CentralError::InvalidAddress(_))
    ));
    assert!(mock.requests().is_empty());
}

#[tokio::test]
async fn test_routing_ignores_uuid_case() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central
        .read(
            "aa:bb:cc:dd:ee:01",
            &SERVICE.to_uppercase(),
            &READ_CHAR.to_uppercase(),
            h,
        )
        .unwrap();
    mock.read_complete(PEER, uuid(SERVICE), uuid(READ_CHAR), GattStatus::SUCCESS, &[7]);

    assert_eq!(read_result(next(&mut rx).await), Ok(vec![7]));
}

#[tokio::test]
async fn test_reregistration_replaces_handler() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (first, mut first_rx) = recorder();
    let (second, mut second_rx) = recorder();

    central.read(PEER, SERVICE, READ_CHAR, first).unwrap();
    central.read(PEER, SERVICE, READ_CHAR, second).unwrap();
    mock.read_complete(PEER, uuid(SERVICE), uuid(READ_CHAR), GattStatus::SUCCESS, &[1]);

    assert_eq!(read_result(next(&mut second_rx).await), Ok(vec![1]));
    assert_quiet(&central, &mut first_rx).await;
}

#[tokio::test]
async fn test_transport_rejection_reports_failure() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    mock.refuse(Operation::Write);
    let (h, mut rx) = recorder();

    central.write(PEER, SERVICE, WRITE_CHAR, &[9], h).unwrap();
    match next(&mut rx).await {
        GattEvent::Write { result, .. } => {
            let failure = result.unwrap_err();
            assert_eq!(failure.code, FailureCode::Other);
            assert!(failure.message.contains("rejected"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_write_completion() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.write(PEER, SERVICE, WRITE_CHAR, &[1, 2, 3], h).unwrap();
    assert_eq!(mock.written_values(), vec![vec![1, 2, 3]]);

    mock.write_complete(PEER, uuid(SERVICE), uuid(WRITE_CHAR), GattStatus::SUCCESS, &[1, 2, 3]);
    match next(&mut rx).await {
        GattEvent::Write { result, .. } => assert_eq!(result, Ok(vec![1, 2, 3])),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_notify_subscription_and_values() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    let handle = mock.handle_for(PEER).unwrap();

    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h).unwrap();
    let requests = mock.requests();
    assert!(requests.contains(&Request::SetNotification {
        handle,
        service: uuid(SERVICE),
        characteristic: uuid(NOTIFY_CHAR),
        enabled: true,
    }));
    assert!(requests.contains(&Request::WriteDescriptor {
        handle,
        service: uuid(SERVICE),
        characteristic: uuid(NOTIFY_CHAR),
        descriptor: CLIENT_CHARACTERISTIC_CONFIG,
        value: vec![0x01, 0x00],
    }));

    // Subscription success waits for the descriptor write
    assert_quiet(&central, &mut rx).await;
    mock.descriptor_written(
        PEER,
        uuid(SERVICE),
        uuid(NOTIFY_CHAR),
        CLIENT_CHARACTERISTIC_CONFIG,
        GattStatus::SUCCESS,
    );
    assert_eq!(notify_event(next(&mut rx).await), NotifyEvent::Subscribed);

    mock.value_changed(PEER, uuid(SERVICE), uuid(NOTIFY_CHAR), &[0xAB]);
    mock.value_changed(PEER, uuid(SERVICE), uuid(NOTIFY_CHAR), &[0xCD]);
    assert_eq!(notify_event(next(&mut rx).await), NotifyEvent::Changed(vec![0xAB]));
    assert_eq!(notify_event(next(&mut rx).await), NotifyEvent::Changed(vec![0xCD]));
}

#[tokio::test]
async fn test_indication_preferred() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, _rx) = recorder();

    central.enable_notify(PEER, SERVICE, INDICATE_CHAR, h).unwrap();
    let written: Vec<Vec<u8>> = mock
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            Request::WriteDescriptor { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(written, vec![vec![0x02, 0x00]]);
}

#[tokio::test]
async fn test_notify_requires_cccd() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.enable_notify(PEER, SERVICE, BARE_NOTIFY_CHAR, h).unwrap();
    match notify_event(next(&mut rx).await) {
        NotifyEvent::Failed(failure) => assert_eq!(failure.code, FailureCode::Other),
        other => panic!("unexpected notify event {:?}", other),
    }
    assert_eq!(mock.count(Operation::SetNotification), 0);
    assert_eq!(mock.count(Operation::WriteDescriptor), 0);
}

#[tokio::test]
async fn test_cccd_write_failure() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h).unwrap();
    mock.descriptor_written(
        PEER,
        uuid(SERVICE),
        uuid(NOTIFY_CHAR),
        CLIENT_CHARACTERISTIC_CONFIG,
        GattStatus::WRITE_NOT_PERMITTED,
    );
    match notify_event(next(&mut rx).await) {
        NotifyEvent::Failed(failure) => {
            assert_eq!(failure.status, Some(GattStatus::WRITE_NOT_PERMITTED))
        }
        other => panic!("unexpected notify event {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_notify() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h).unwrap();
    mock.clear_requests();
    central.cancel_notify(PEER, SERVICE, NOTIFY_CHAR).unwrap();

    let handle = mock.handle_for(PEER).unwrap();
    assert_eq!(
        mock.requests(),
        vec![
            Request::SetNotification {
                handle,
                service: uuid(SERVICE),
                characteristic: uuid(NOTIFY_CHAR),
                enabled: false,
            },
        ]
    );

    mock.value_changed(PEER, uuid(SERVICE), uuid(NOTIFY_CHAR), &[1]);
    assert_quiet(&central, &mut rx).await;
}

#[tokio::test]
async fn test_resubscribe_settles_once() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (first, mut first_rx) = recorder();
    let (second, mut second_rx) = recorder();
    let cccd_written = |status| {
        mock.descriptor_written(
            PEER,
            uuid(SERVICE),
            uuid(NOTIFY_CHAR),
            CLIENT_CHARACTERISTIC_CONFIG,
            status,
        )
    };

    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, first).unwrap();
    cccd_written(GattStatus::SUCCESS);
    assert_eq!(notify_event(next(&mut first_rx).await), NotifyEvent::Subscribed);

    central.cancel_notify(PEER, SERVICE, NOTIFY_CHAR).unwrap();
    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, second).unwrap();
    cccd_written(GattStatus::SUCCESS);
    assert_eq!(notify_event(next(&mut second_rx).await), NotifyEvent::Subscribed);

    // A completion nobody asked for is dropped
    cccd_written(GattStatus::FAILURE);
    assert_quiet(&central, &mut second_rx).await;
    assert_quiet(&central, &mut first_rx).await;
    assert_eq!(
        mock.count(Operation::WriteDescriptor),
        2,
        "cancelling leaves the descriptor alone"
    );
}

#[tokio::test]
async fn test_cancel_before_cccd_completion() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h).unwrap();
    central.cancel_notify(PEER, SERVICE, NOTIFY_CHAR).unwrap();
    mock.descriptor_written(
        PEER,
        uuid(SERVICE),
        uuid(NOTIFY_CHAR),
        CLIENT_CHARACTERISTIC_CONFIG,
        GattStatus::SUCCESS,
    );
    assert_quiet(&central, &mut rx).await;
}

#[tokio::test]
async fn test_rssi() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central.read_rssi(PEER, h).unwrap();
    assert_eq!(mock.count(Operation::ReadRssi), 1);
    mock.rssi(PEER, -67, GattStatus::SUCCESS);

    match next(&mut rx).await {
        GattEvent::Rssi { result, .. } => assert_eq!(result, Ok(-67)),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_mtu_is_clamped_and_recorded() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    let handle = mock.handle_for(PEER).unwrap();

    central.set_mtu(PEER, 10, h.clone()).unwrap();
    central.set_mtu(PEER, 1000, h).unwrap();
    let requested: Vec<u16> = mock
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            Request::RequestMtu { handle: requested_on, mtu } if requested_on == handle => Some(mtu),
            _ => None,
        })
        .collect();
    assert_eq!(requested, vec![23, 517]);

    mock.mtu_changed(PEER, 247, GattStatus::SUCCESS);
    match next(&mut rx).await {
        GattEvent::Mtu { peer, result } => {
            assert_eq!(result, Ok(247));
            assert_eq!(peer.mtu, Some(247));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(central.peer(PEER).unwrap().mtu, Some(247));
}

#[tokio::test]
async fn test_mtu_unsupported() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    mock.set_mtu_exchange(false);
    let (h, mut rx) = recorder();

    central.set_mtu(PEER, 185, h).unwrap();
    match next(&mut rx).await {
        GattEvent::Mtu { result, .. } => {
            let failure = result.unwrap_err();
            assert_eq!(failure.code, FailureCode::Other);
            assert!(failure.message.contains("not supported"));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(mock.count(Operation::RequestMtu), 0);
}

#[tokio::test]
async fn test_stale_io_event_is_dropped() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    central.read(PEER, SERVICE, READ_CHAR, h).unwrap();

    let current = mock.handle_for(PEER).unwrap();
    central.event_sink().deliver(TransportEvent::CharacteristicRead {
        handle: ble_central::TransportHandle::new(current.id() + 100),
        address: PEER.to_string(),
        service: uuid(SERVICE),
        characteristic: uuid(READ_CHAR),
        status: GattStatus::SUCCESS,
        value: vec![1],
    });
    assert_quiet(&central, &mut rx).await;
}

#[tokio::test]
async fn test_routes_purged_on_disconnect() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    central.enable_notify(PEER, SERVICE, NOTIFY_CHAR, h).unwrap();

    mock.link_down(PEER, GattStatus::FAILURE);
    assert_eq!(central.route_count(), 0);

    mock.value_changed(PEER, uuid(SERVICE), uuid(NOTIFY_CHAR), &[1]);
    assert_quiet(&central, &mut rx).await;
}
