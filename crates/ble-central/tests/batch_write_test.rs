mod common;

use ble_central::mock::Operation;
use ble_central::{FailureCode, GattEvent, GattStatus, Outcome};
use common::*;

fn batch_result(event: GattEvent) -> Outcome<()> {
    match event {
        GattEvent::BatchWrite { result, .. } => result,
        other => panic!("expected a batch write event, got {:?}", other),
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[tokio::test]
async fn test_batch_write_splits_payload() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    mock.auto_complete_writes(true);
    let (h, mut rx) = recorder();
    let data = payload(45);

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &data, 20, h)
        .unwrap();
    assert_eq!(batch_result(next(&mut rx).await), Ok(()));

    let written = mock.written_values();
    assert_eq!(
        written.iter().map(Vec::len).collect::<Vec<_>>(),
        vec![20, 20, 5]
    );
    assert_eq!(written.concat(), data);
    assert_quiet(&central, &mut rx).await;
}

#[tokio::test]
async fn test_non_positive_chunk_size_defaults_to_twenty() {
    for chunk_size in [0, -1, -100] {
        let (mock, central) = setup();
        let _conn = connect_peer(&central, &mock, PEER).await;
        mock.auto_complete_writes(true);
        let (h, mut rx) = recorder();

        central
            .write_by_batch(PEER, SERVICE, WRITE_CHAR, &payload(50), chunk_size, h)
            .unwrap();
        assert_eq!(batch_result(next(&mut rx).await), Ok(()));
        assert_eq!(
            mock.written_values()
                .iter()
                .map(Vec::len)
                .collect::<Vec<_>>(),
            vec![20, 20, 10]
        );
    }
}

#[tokio::test]
async fn test_empty_payload_writes_nothing() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    mock.auto_complete_writes(true);
    let (h, mut rx) = recorder();

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &[], 20, h)
        .unwrap();
    assert_quiet(&central, &mut rx).await;
    assert_eq!(mock.count(Operation::Write), 0);
}

#[tokio::test]
async fn test_failing_chunk_abandons_the_rest() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    mock.auto_complete_writes(true);
    mock.fail_write(3, GattStatus::INVALID_ATTRIBUTE_LENGTH);
    let (h, mut rx) = recorder();

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &payload(100), 20, h)
        .unwrap();

    let failure = batch_result(next(&mut rx).await).unwrap_err();
    assert_eq!(failure.code, FailureCode::Other);
    assert_eq!(failure.status, Some(GattStatus::INVALID_ATTRIBUTE_LENGTH));

    assert_quiet(&central, &mut rx).await;
    assert_eq!(mock.count(Operation::Write), 3);
}

#[tokio::test]
async fn test_chunks_wait_for_completion() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();
    let data = payload(30);

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &data, 10, h)
        .unwrap();

    for sent in 1..=3 {
        flush(&central).await;
        assert_eq!(mock.count(Operation::Write), sent);
        let chunk = mock.written_values()[sent - 1].clone();
        mock.write_complete(PEER, uuid(SERVICE), uuid(WRITE_CHAR), GattStatus::SUCCESS, &chunk);
    }

    assert_eq!(batch_result(next(&mut rx).await), Ok(()));
    assert_eq!(mock.written_values().concat(), data);
}

#[tokio::test]
async fn test_rejected_chunk_reports_failure() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &payload(40), 20, h)
        .unwrap();
    mock.refuse(Operation::Write);
    mock.write_complete(PEER, uuid(SERVICE), uuid(WRITE_CHAR), GattStatus::SUCCESS, &[]);

    let failure = batch_result(next(&mut rx).await).unwrap_err();
    assert!(failure.message.contains("chunk 2/2"));
    assert_eq!(mock.count(Operation::Write), 2);
}

#[tokio::test]
async fn test_batch_write_requires_connection() {
    let (mock, central) = setup();
    let (h, mut rx) = recorder();

    central
        .write_by_batch(PEER, SERVICE, WRITE_CHAR, &payload(10), 5, h)
        .unwrap();
    let failure = batch_result(next(&mut rx).await).unwrap_err();
    assert_eq!(failure.code, FailureCode::NotConnected);
    assert_eq!(mock.count(Operation::Write), 0);
}

#[tokio::test]
async fn test_batch_write_requires_writable_characteristic() {
    let (mock, central) = setup();
    let _conn = connect_peer(&central, &mock, PEER).await;
    let (h, mut rx) = recorder();

    central
        .write_by_batch(PEER, SERVICE, READ_CHAR, &payload(10), 5, h)
        .unwrap();
    let failure = batch_result(next(&mut rx).await).unwrap_err();
    assert_eq!(failure.code, FailureCode::Other);
    assert_eq!(mock.count(Operation::Write), 0);
}
