//! QoS acknowledgment flow tests
//!
//! Outbound and inbound PUBLISH at QoS 0, 1 and 2, out-of-order and
//! unexpected acknowledgments, and packet identifier allocation.


use mqttsub::protocol::{Packet, Publish};
use mqttsub::testing::RecordingObserver;
use mqttsub::{ChannelHandler, ConnectionState, MqttError, QoS};
use std::collections::HashSet;
use std::time::Duration;
use test_helpers::{connect, harness, test_config, wait_for_state, STEP};
use tokio::time::timeout;

fn expect_publish(packet: Option<Packet>) -> Publish {
    match packet {
        Some(Packet::Publish(publish)) => publish,
        other => panic!("expected PUBLISH, got {other:?}"),
    }
}

#[tokio::test]
async fn test_qos0_publish_completes_without_ack() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("metrics/cpu", "0.42", QoS::AtMostOnce, true)
        .await
        .unwrap();
    assert_eq!(token.packet_id(), None);
    token.wait().await.unwrap();

    let publish = expect_publish(connection.recv().await);
    assert_eq!(publish.topic, "metrics/cpu");
    assert_eq!(publish.packet_id, None);
    assert!(publish.retain);
}

#[tokio::test]
async fn test_qos1_publish_completes_on_puback() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("orders/new", "42", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();

    let publish = expect_publish(connection.recv().await);
    assert_eq!(publish.packet_id, Some(packet_id));
    assert_eq!(publish.qos, QoS::AtLeastOnce);
    assert!(!publish.dup);

    connection.send(&Packet::PubAck(packet_id)).await.unwrap();
    timeout(STEP, token.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_qos2_publish_walks_full_handshake() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("ledger/entry", "credit", QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();
    assert_eq!(expect_publish(connection.recv().await).qos, QoS::ExactlyOnce);

    connection.send(&Packet::PubRec(packet_id)).await.unwrap();
    assert_eq!(connection.recv().await, Some(Packet::PubRel(packet_id)));

    connection.send(&Packet::PubComp(packet_id)).await.unwrap();
    timeout(STEP, token.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_inbound_qos2_is_delivered_once() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;
    let client = harness.client;

    let (handler, mut messages) = ChannelHandler::channel();
    client.set_default_handler(handler).await;

    let mut publish = Publish::new("payments/in", QoS::ExactlyOnce, "once");
    publish.packet_id = Some(9);
    connection
        .send(&Packet::Publish(publish.clone()))
        .await
        .unwrap();
    assert_eq!(connection.recv().await, Some(Packet::PubRec(9)));

    // Redelivery before PUBREL must not reach the handler again
    publish.dup = true;
    connection.send(&Packet::Publish(publish)).await.unwrap();
    assert_eq!(connection.recv().await, Some(Packet::PubRec(9)));

    connection.send(&Packet::PubRel(9)).await.unwrap();
    assert_eq!(connection.recv().await, Some(Packet::PubComp(9)));

    // A marker on the same worker queue proves nothing else was dispatched
    connection
        .send(&Packet::Publish(Publish::new("payments/marker", QoS::AtMostOnce, "")))
        .await
        .unwrap();

    let first = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.topic, "payments/in");
    assert_eq!(first.payload.as_ref(), b"once");
    let second = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(second.topic, "payments/marker");
}

#[tokio::test]
async fn test_inbound_qos2_id_reusable_after_release() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let (handler, mut messages) = ChannelHandler::channel();
    harness.client.set_default_handler(handler).await;

    for payload in ["first", "second"] {
        let mut publish = Publish::new("jobs", QoS::ExactlyOnce, payload);
        publish.packet_id = Some(3);
        connection.send(&Packet::Publish(publish)).await.unwrap();
        assert_eq!(connection.recv().await, Some(Packet::PubRec(3)));
        connection.send(&Packet::PubRel(3)).await.unwrap();
        assert_eq!(connection.recv().await, Some(Packet::PubComp(3)));
    }

    let first = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    let second = timeout(STEP, messages.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload.as_ref(), b"first");
    assert_eq!(second.payload.as_ref(), b"second");
}

#[tokio::test]
async fn test_out_of_order_acks_complete_the_right_operations() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let first = harness
        .client
        .publish("q", "1", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let second = harness
        .client
        .publish("q", "2", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let first_id = first.packet_id().unwrap();
    let second_id = second.packet_id().unwrap();
    assert_ne!(first_id, second_id);
    expect_publish(connection.recv().await);
    expect_publish(connection.recv().await);

    connection.send(&Packet::PubAck(second_id)).await.unwrap();
    timeout(STEP, second.wait()).await.unwrap().unwrap();

    connection.send(&Packet::PubAck(first_id)).await.unwrap();
    timeout(STEP, first.wait()).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_ack_is_ignored() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    connection.send(&Packet::PubAck(4242)).await.unwrap();

    let token = harness
        .client
        .publish("still/alive", "yes", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let publish = expect_publish(connection.recv().await);
    connection
        .send(&Packet::PubAck(publish.packet_id.unwrap()))
        .await
        .unwrap();
    timeout(STEP, token.wait()).await.unwrap().unwrap();
    assert_eq!(harness.client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_unknown_pubrec_still_gets_pubrel() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    connection.send(&Packet::PubRec(77)).await.unwrap();

    assert_eq!(connection.recv().await, Some(Packet::PubRel(77)));
}

#[tokio::test]
async fn test_out_of_sequence_ack_fails_operation_and_reconnects() {
    let mut harness = harness(test_config());
    let observer = RecordingObserver::new();
    harness.client.set_observer(observer.clone()).await;
    let mut states = harness.client.state_changes();
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("q", "1", QoS::ExactlyOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();
    expect_publish(connection.recv().await);

    // PUBCOMP while PUBREC is expected
    connection.send(&Packet::PubComp(packet_id)).await.unwrap();

    let result = timeout(STEP, token.wait()).await.unwrap();
    assert!(matches!(result, Err(MqttError::ProtocolViolation(_))));
    assert_eq!(connection.recv().await, None, "client closed the stream");

    let (_connection, _) = timeout(STEP, harness.broker.accept_session(false))
        .await
        .unwrap()
        .unwrap();
    wait_for_state(&mut states, ConnectionState::Connected).await;

    let events = observer.wait_for_events(4, STEP).await;
    assert!(
        events[1].starts_with("lost Protocol violation"),
        "got {events:?}"
    );
    assert!(events[2].starts_with("reconnecting 1"), "got {events:?}");
}

#[tokio::test]
async fn test_wrong_ack_type_for_qos1_tears_down_connection() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("q", "1", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();
    expect_publish(connection.recv().await);

    connection.send(&Packet::PubRec(packet_id)).await.unwrap();

    let result = timeout(STEP, token.wait()).await.unwrap();
    assert!(matches!(result, Err(MqttError::ProtocolViolation(_))));
    assert_eq!(connection.recv().await, None);
    assert!(timeout(STEP, harness.broker.accept_session(false))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_in_flight_packet_ids_are_unique() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let mut ids = HashSet::new();
    let mut tokens = Vec::new();
    for i in 0..50 {
        let qos = if i % 2 == 0 {
            QoS::AtLeastOnce
        } else {
            QoS::ExactlyOnce
        };
        let token = harness
            .client
            .publish("bulk", format!("{i}"), qos, false)
            .await
            .unwrap();
        assert!(ids.insert(token.packet_id().unwrap()), "duplicate id");
        tokens.push(token);
    }

    for _ in 0..50 {
        let publish = expect_publish(connection.recv().await);
        assert!(ids.contains(&publish.packet_id.unwrap()));
    }
}

#[tokio::test]
async fn test_wait_timeout_abandons_operation() {
    let mut harness = harness(test_config());
    let mut connection = connect(&mut harness, false).await;

    let token = harness
        .client
        .publish("slow", "x", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let packet_id = token.packet_id().unwrap();
    expect_publish(connection.recv().await);

    let result = token.wait_timeout(Duration::from_millis(50)).await;
    assert_eq!(result, Err(MqttError::Cancelled));

    // The late ack is discarded and the session carries on
    connection.send(&Packet::PubAck(packet_id)).await.unwrap();
    let token = harness
        .client
        .publish("slow", "y", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    let publish = expect_publish(connection.recv().await);
    connection
        .send(&Packet::PubAck(publish.packet_id.unwrap()))
        .await
        .unwrap();
    timeout(STEP, token.wait()).await.unwrap().unwrap();
}
