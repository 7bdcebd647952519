//! Pool growth and reclamation as seen through the facade.


use mqtt_mux::{QoS, MAX_SUBSCRIPTIONS_PER_CONNECTION};
use test_helpers::{noop_callback, test_client};

#[tokio::test]
async fn pool_grows_when_the_first_connection_is_full() {
    let harness = test_client();

    for i in 0..MAX_SUBSCRIPTIONS_PER_CONNECTION {
        harness
            .client
            .subscribe(&format!("sensors/{i}"), QoS::AtLeastOnce, noop_callback())
            .await
            .unwrap();
    }
    assert_eq!(harness.client.connection_count().await, 1);

    harness
        .client
        .subscribe("overflow/A", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    harness
        .client
        .subscribe("overflow/B", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    // Growth, and both connections stay alive.
    assert_eq!(harness.client.connection_count().await, 2);
    assert_eq!(harness.factory.created().len(), 2);
    assert_eq!(harness.factory.broker.disconnect_count("core-1"), 0);
    assert_eq!(harness.factory.broker.disconnect_count("core-1#2"), 0);

    harness.client.close().await;
}

#[tokio::test]
async fn no_connection_ever_exceeds_the_subscription_budget() {
    let harness = test_client();

    for i in 0..60 {
        harness
            .client
            .subscribe(&format!("fleet/{i}"), QoS::AtLeastOnce, noop_callback())
            .await
            .unwrap();
    }

    let subscribes = harness.factory.broker.subscribes();
    for client_id in ["core-1", "core-1#2"] {
        let count = subscribes.iter().filter(|(id, _)| id == client_id).count();
        assert!(
            count <= MAX_SUBSCRIPTIONS_PER_CONNECTION,
            "{client_id} holds {count} subscriptions"
        );
    }
    assert_eq!(subscribes.len(), 60);

    harness.client.close().await;
}

#[tokio::test]
async fn idle_connection_is_reclaimed_once_capacity_frees_up() {
    let harness = test_client();
    let callbacks: Vec<_> = (0..MAX_SUBSCRIPTIONS_PER_CONNECTION)
        .map(|_| noop_callback())
        .collect();

    for (i, callback) in callbacks.iter().enumerate() {
        harness
            .client
            .subscribe(&format!("sensors/{i}"), QoS::AtLeastOnce, callback.clone())
            .await
            .unwrap();
    }
    harness
        .client
        .subscribe("overflow/A", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    assert_eq!(harness.client.connection_count().await, 2);

    // Empty the first connection entirely.
    for (i, callback) in callbacks.iter().enumerate() {
        harness
            .client
            .unsubscribe(&format!("sensors/{i}"), callback)
            .await
            .unwrap();
    }

    // Next subscribe sees two connections with spare capacity and reclaims
    // the idle one.
    harness
        .client
        .subscribe("overflow/B", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    assert_eq!(harness.client.connection_count().await, 1);
    assert_eq!(harness.factory.broker.disconnect_count("core-1"), 1);

    harness.client.close().await;
}

#[tokio::test]
async fn connected_reflects_pool_state() {
    let harness = test_client();
    assert!(!harness.client.connected().await);

    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    assert!(harness.client.connected().await);

    harness.client.close().await;
    assert!(!harness.client.connected().await);
}

#[tokio::test]
async fn close_is_idempotent_and_disconnects_every_connection() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    harness.client.close().await;
    let disconnects = harness.factory.broker.disconnect_count("core-1");
    assert!(disconnects >= 1);

    harness.client.close().await;
    assert_eq!(harness.factory.broker.disconnect_count("core-1"), disconnects);
}
