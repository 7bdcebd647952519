//! Inbound fan-out: owning-connection filtering and the wrong-connection
//! fallback.


use mqtt_mux::transport::{ClientEvent, ClientEventKind};
use mqtt_mux::{InboundMessage, MessageCallback, QoS, MAX_SUBSCRIPTIONS_PER_CONNECTION};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use test_helpers::{counting_callback, noop_callback, settle, test_client};

#[tokio::test]
async fn message_on_unknown_connection_reaches_all_matching_subscribers() {
    let harness = test_client();
    let (plus_cb, plus_count) = counting_callback();
    let (c_cb, c_count) = counting_callback();
    let (d_cb, d_count) = counting_callback();

    harness
        .client
        .subscribe("A/B/+", QoS::AtLeastOnce, plus_cb)
        .await
        .unwrap();
    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, c_cb)
        .await
        .unwrap();
    harness
        .client
        .subscribe("A/B/D", QoS::AtLeastOnce, d_cb)
        .await
        .unwrap();

    // The broker hands the message to a connection that owns none of the
    // matching subscriptions (request/response flows do this).
    let events = harness.factory.events_sender().unwrap();
    events
        .send(ClientEvent {
            connection_id: 999,
            kind: ClientEventKind::Message(InboundMessage {
                topic: "A/B/C".into(),
                payload: b"hello".to_vec(),
                retain: false,
            }),
        })
        .await
        .unwrap();
    settle().await;

    assert_eq!(plus_count.load(Ordering::SeqCst), 1);
    assert_eq!(c_count.load(Ordering::SeqCst), 1);
    assert_eq!(d_count.load(Ordering::SeqCst), 0);

    harness.client.close().await;
}

#[tokio::test]
async fn overlapping_filters_on_two_connections_deliver_once() {
    let harness = test_client();
    let (c_cb, c_count) = counting_callback();
    let (plus_cb, plus_count) = counting_callback();

    // Fill the first connection; A/B/C lands on it.
    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, c_cb)
        .await
        .unwrap();
    for i in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION - 1 {
        harness
            .client
            .subscribe(&format!("filler/{i}"), QoS::AtLeastOnce, noop_callback())
            .await
            .unwrap();
    }
    // The wide filter no longer fits and goes to a second connection.
    harness
        .client
        .subscribe("A/B/+", QoS::AtLeastOnce, plus_cb)
        .await
        .unwrap();
    assert_eq!(harness.client.connection_count().await, 2);

    let transports = harness.factory.created();
    // Both connections receive the broker copy for their own filter; each
    // callback fires exactly once.
    transports[0].inject_message("A/B/C", b"payload").await;
    transports[1].inject_message("A/B/C", b"payload").await;
    settle().await;

    assert_eq!(c_count.load(Ordering::SeqCst), 1);
    assert_eq!(plus_count.load(Ordering::SeqCst), 1);

    harness.client.close().await;
}

#[tokio::test]
async fn panicking_subscriber_does_not_starve_the_rest() {
    let harness = test_client();
    let panicking: MessageCallback = Arc::new(|_message: &InboundMessage| {
        panic!("subscriber bug");
    });
    let (counting, count) = counting_callback();

    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, panicking)
        .await
        .unwrap();
    harness
        .client
        .subscribe("A/B/+", QoS::AtLeastOnce, counting)
        .await
        .unwrap();

    let transports = harness.factory.created();
    transports[0].inject_message("A/B/C", b"boom").await;
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);

    harness.client.close().await;
}

#[tokio::test]
async fn callbacks_see_topic_and_payload() {
    let harness = test_client();
    let received: Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = received.clone();
    let callback: MessageCallback = Arc::new(move |message: &InboundMessage| {
        sink.lock()
            .unwrap()
            .push((message.topic.clone(), message.payload.clone()));
    });

    harness
        .client
        .subscribe("telemetry/+", QoS::AtLeastOnce, callback)
        .await
        .unwrap();

    let payload = serde_json::to_vec(&serde_json::json!({"temp": 21.5})).unwrap();
    let transports = harness.factory.created();
    transports[0].inject_message("telemetry/core-1", &payload).await;
    settle().await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0, "telemetry/core-1");
    assert_eq!(received[0].1, payload);

    harness.client.close().await;
}
