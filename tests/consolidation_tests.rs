//! Subscription consolidation: the broker sees the minimum filter set.


use mqtt_mux::{ConfigStore, DeviceConfig, MqttSection, QoS, SubscribeError};
use std::time::Duration;
use test_helpers::{cloud_device_config, noop_callback, test_client, test_client_with_config};

#[tokio::test]
async fn overlapping_subscriptions_subscribe_once() {
    let harness = test_client();
    let wide = noop_callback();
    let narrow = noop_callback();

    harness
        .client
        .subscribe("A/B/+", QoS::AtLeastOnce, wide.clone())
        .await
        .unwrap();
    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, narrow.clone())
        .await
        .unwrap();

    // A/B/+ already covers A/B/C at the broker.
    let subscribes = harness.factory.broker.subscribes();
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0].1, "A/B/+");

    // The wide local subscriber goes away, but A/B/C still needs the filter.
    harness.client.unsubscribe("A/B/+", &wide).await.unwrap();
    assert!(harness.factory.broker.unsubscribes().is_empty());

    // Last dependent gone: exactly one UNSUBSCRIBE, for the wide filter.
    harness.client.unsubscribe("A/B/C", &narrow).await.unwrap();
    let unsubscribes = harness.factory.broker.unsubscribes();
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0].1, "A/B/+");

    harness.client.close().await;
}

#[tokio::test]
async fn subscribe_unsubscribe_round_trip_restores_state() {
    let harness = test_client();
    let callback = noop_callback();

    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, callback.clone())
        .await
        .unwrap();
    harness
        .client
        .unsubscribe("devices/temp", &callback)
        .await
        .unwrap();

    assert_eq!(harness.factory.broker.subscribes().len(), 1);
    assert_eq!(harness.factory.broker.unsubscribes().len(), 1);

    // The registry kept nothing: the same subscribe hits the wire again.
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, callback.clone())
        .await
        .unwrap();
    assert_eq!(harness.factory.broker.subscribes().len(), 2);

    harness.client.close().await;
}

#[tokio::test]
async fn timed_out_subscribe_completes_late_and_suppresses_duplicates() {
    let config = ConfigStore::new(DeviceConfig {
        mqtt: MqttSection {
            operation_timeout_ms: 100,
            ..Default::default()
        },
        ..cloud_device_config()
    });
    let harness = test_client_with_config(config);
    harness
        .factory
        .broker
        .delay_subscribes(Some(Duration::from_millis(300)));

    let first = noop_callback();
    let result = harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, first)
        .await;
    assert!(matches!(result, Err(SubscribeError::Timeout)));

    // Let the delayed SUBACK land; the pending slot becomes permanent.
    tokio::time::sleep(Duration::from_millis(400)).await;
    harness.factory.broker.delay_subscribes(None);
    assert_eq!(harness.factory.broker.subscribes().len(), 1);

    // A repeat subscribe rides the now-recorded broker filter: no second
    // SUBSCRIBE reaches the wire.
    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    assert_eq!(harness.factory.broker.subscribes().len(), 1);

    harness.client.close().await;
}

#[tokio::test]
async fn failed_subscribe_surfaces_and_drops_the_binding() {
    let harness = test_client();
    harness.factory.broker.fail_next_subscribes(1);

    let callback = noop_callback();
    let result = harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, callback.clone())
        .await;
    assert!(matches!(result, Err(SubscribeError::Transport(_))));

    // The tentative binding is gone: unsubscribing is a no-op at the broker.
    harness.client.unsubscribe("A/B/C", &callback).await.unwrap();
    assert!(harness.factory.broker.unsubscribes().is_empty());

    harness.client.close().await;
}

#[tokio::test]
async fn offline_device_subscribe_is_a_silent_no_op() {
    let harness = test_client_with_config(ConfigStore::new(DeviceConfig::default()));

    harness
        .client
        .subscribe("A/B/C", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    assert!(harness.factory.created().is_empty());
    assert!(harness.factory.broker.subscribes().is_empty());

    harness.client.close().await;
}

#[tokio::test]
async fn invalid_subscribe_topics_are_rejected() {
    let harness = test_client();

    for topic in ["a/#/b", "a/b+", "a/b/c/d/e/f/g/h/i"] {
        let result = harness
            .client
            .subscribe(topic, QoS::AtLeastOnce, noop_callback())
            .await;
        assert!(
            matches!(result, Err(SubscribeError::InvalidTopic(_))),
            "expected {topic} to be rejected"
        );
    }
    assert!(harness.factory.broker.subscribes().is_empty());

    harness.client.close().await;
}
