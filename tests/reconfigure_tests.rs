//! Reconfiguration: coalesced reconnects on qualifying config changes.


use mqtt_mux::config::{
    ChangeKind, NODE_AWS_REGION, NODE_IOT_DATA_ENDPOINT, NODE_ROOT_CA_PATH,
};
use mqtt_mux::{ConfigStore, DeviceConfig, ProxySection, QoS};
use std::time::Duration;
use test_helpers::{cloud_device_config, noop_callback, test_client, test_client_with_config};

/// Long enough for the 200ms test debounce to fire and the wave to finish.
async fn wait_for_wave() {
    tokio::time::sleep(Duration::from_millis(600)).await;
}

#[tokio::test]
async fn burst_of_changes_produces_a_single_reconnect_wave() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    assert_eq!(harness.factory.broker.connect_count("core-1"), 1);

    // Four qualifying changes inside the debounce window.
    for timeout in [5_000u64, 6_000, 7_000, 8_000] {
        harness
            .config
            .update(ChangeKind::Changed, "mqtt.operationTimeoutMs", |c| {
                c.mqtt.operation_timeout_ms = timeout;
            });
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    wait_for_wave().await;

    // Exactly one reconnect per live connection.
    assert_eq!(harness.factory.broker.disconnect_count("core-1"), 1);
    assert_eq!(harness.factory.broker.connect_count("core-1"), 2);

    harness.client.close().await;
}

#[tokio::test]
async fn endpoint_change_reconnects_every_connection() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    harness
        .config
        .update(ChangeKind::Changed, NODE_IOT_DATA_ENDPOINT, |c| {
            c.iot_data_endpoint = "other-ats.iot.us-west-2.amazonaws.com".into();
        });
    wait_for_wave().await;

    assert_eq!(harness.factory.broker.connect_count("core-1"), 2);

    harness.client.close().await;
}

#[tokio::test]
async fn unrelated_changes_do_not_reconnect() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    harness
        .config
        .update(ChangeKind::Changed, "spooler.spoolSizeInBytes", |c| {
            c.spooler.spool_size_in_bytes = 1024;
        });
    harness
        .config
        .update(ChangeKind::TimestampUpdated, "mqtt.port", |_| {});
    wait_for_wave().await;

    assert_eq!(harness.factory.broker.connect_count("core-1"), 1);
    assert_eq!(harness.factory.broker.disconnect_count("core-1"), 0);

    harness.client.close().await;
}

#[tokio::test]
async fn region_change_reconnects_only_with_a_proxy() {
    // No proxy: region changes are ignored.
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    harness.config.update(ChangeKind::Changed, NODE_AWS_REGION, |c| {
        c.aws_region = "eu-west-1".into();
    });
    wait_for_wave().await;
    assert_eq!(harness.factory.broker.connect_count("core-1"), 1);
    harness.client.close().await;

    // With a proxy the region feeds the proxy endpoint, so reconnect.
    let config = ConfigStore::new(DeviceConfig {
        proxy: Some(ProxySection {
            url: "http://proxy.example.com:3128".into(),
            username: None,
            password: None,
        }),
        ..cloud_device_config()
    });
    let harness = test_client_with_config(config);
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();
    harness.config.update(ChangeKind::Changed, NODE_AWS_REGION, |c| {
        c.aws_region = "eu-west-1".into();
    });
    wait_for_wave().await;
    assert_eq!(harness.factory.broker.connect_count("core-1"), 2);
    harness.client.close().await;
}

#[tokio::test]
async fn repeated_identical_changes_within_the_window_reconnect_once() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    harness
        .config
        .update(ChangeKind::Changed, NODE_ROOT_CA_PATH, |c| {
            c.root_ca_path = Some("/greengrass/v2/rootCA-new.pem".into());
        });
    harness
        .config
        .update(ChangeKind::Changed, NODE_ROOT_CA_PATH, |c| {
            c.root_ca_path = Some("/greengrass/v2/rootCA-new.pem".into());
        });
    wait_for_wave().await;

    assert_eq!(harness.factory.broker.disconnect_count("core-1"), 1);
    assert_eq!(harness.factory.broker.connect_count("core-1"), 2);

    harness.client.close().await;
}

#[tokio::test]
async fn publish_limits_are_revalidated_on_mqtt_changes() {
    let harness = test_client();
    harness
        .client
        .subscribe("devices/temp", QoS::AtLeastOnce, noop_callback())
        .await
        .unwrap();

    // Over-limit settings get clamped when the change is picked up.
    harness
        .config
        .update(ChangeKind::Changed, "mqtt.maxMessageSizeInBytes", |c| {
            c.mqtt.max_message_size_in_bytes = 1024;
        });
    wait_for_wave().await;

    let oversized = harness
        .client
        .publish(mqtt_mux::PublishRequest::new(
            "data",
            vec![0u8; 2048],
            QoS::AtLeastOnce,
        ))
        .await;
    assert!(matches!(
        oversized,
        Err(mqtt_mux::PublishError::PayloadTooLarge { .. })
    ));

    harness.client.close().await;
}
