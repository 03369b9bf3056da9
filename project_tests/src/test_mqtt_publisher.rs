//! # MQTT Publisher Integration Tests
//!
//! Runs `lib_common::broker::MqttPublisher` against the mock broker in
//! `support` and checks that a publish only succeeds once the broker has
//! acknowledged it.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::TcpListener;
use std::time::{Duration, Instant};

use lib_common::broker::{MqttPublisher, MqttPublisherOptions, QoS};
use lib_common::core::{BrokerPublisher, PublishError};
use project_tests::support::{AckMode, MockBroker};

fn options(port: u16, qos: QoS) -> MqttPublisherOptions {
    MqttPublisherOptions {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "forwarder-test".to_string(),
        username: None,
        password: None,
        qos,
        keep_alive: Duration::from_secs(30),
        ack_timeout: Duration::from_millis(500),
        max_packet_bytes: 64 * 1024,
    }
}

#[tokio::test]
async fn test_qos1_publishes_in_order_after_puback() {
    let broker = MockBroker::start(AckMode::Ack);
    let mut publisher = MqttPublisher::new(options(broker.port, QoS::AtLeastOnce));

    publisher.publish("Plant/Area", br#"{"value":1}"#).await.unwrap();
    publisher.publish("Plant/Area", br#"{"value":2}"#).await.unwrap();
    publisher.close().await;

    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].topic, "Plant/Area");
    assert_eq!(published[0].payload, br#"{"value":1}"#.to_vec());
    assert_eq!(published[1].payload, br#"{"value":2}"#.to_vec());
    assert!(published.iter().all(|p| p.qos == 1 && !p.retain));
    assert_eq!(broker.connections(), 1);
}

#[tokio::test]
async fn test_qos2_waits_for_pubcomp() {
    let broker = MockBroker::start(AckMode::Ack);
    let mut publisher = MqttPublisher::new(options(broker.port, QoS::ExactlyOnce));

    publisher.publish("Plant/Area", b"exactly once").await.unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].qos, 2);
}

#[tokio::test]
async fn test_missing_ack_is_transient_after_timeout() {
    let broker = MockBroker::start(AckMode::Silent);
    let mut publisher = MqttPublisher::new(options(broker.port, QoS::AtLeastOnce));

    let started = Instant::now();
    let result = publisher.publish("Plant/Area", b"unacked").await;

    assert!(matches!(result, Err(PublishError::Transient(_))), "got {:?}", result);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_unreachable_broker_is_transient() {
    // Reserve a port and free it so nothing listens there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut publisher = MqttPublisher::new(options(port, QoS::AtLeastOnce));

    let result = publisher.publish("Plant/Area", b"nobody home").await;
    assert!(matches!(result, Err(PublishError::Transient(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_long_outage_keeps_failing_fast_then_recovers_without_duplicates() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut publisher = MqttPublisher::new(MqttPublisherOptions {
        ack_timeout: Duration::from_millis(200),
        ..options(port, QoS::AtLeastOnce)
    });

    // More attempts than the client's request queue holds.
    for attempt in 1..=12 {
        let result = tokio::time::timeout(Duration::from_secs(3), publisher.publish("Plant/Area", b"pending"))
            .await
            .unwrap_or_else(|_| panic!("attempt {} did not return", attempt));
        assert!(matches!(result, Err(PublishError::Transient(_))), "attempt {}: {:?}", attempt, result);
        assert!(!publisher.is_connected());
    }

    let broker = MockBroker::start_on(port, AckMode::Ack);
    tokio::time::timeout(Duration::from_secs(3), publisher.publish("Plant/Area", b"pending"))
        .await
        .unwrap()
        .unwrap();

    // Failed attempts were never queued, so only the successful one arrives.
    assert_eq!(broker.published().len(), 1);
    assert_eq!(broker.connections(), 1);
}

#[tokio::test]
async fn test_reconnects_after_dropped_connection() {
    let broker = MockBroker::start(AckMode::DropFirst);
    let mut publisher = MqttPublisher::new(options(broker.port, QoS::AtLeastOnce));

    let first = publisher.publish("Plant/Area", b"lost").await;
    assert!(matches!(first, Err(PublishError::Transient(_))), "got {:?}", first);

    publisher.publish("Plant/Area", b"retried").await.unwrap();

    assert_eq!(broker.connections(), 2);
    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload, b"retried".to_vec());
}

#[tokio::test]
async fn test_oversized_message_is_permanent_without_connecting() {
    let broker = MockBroker::start(AckMode::Ack);
    let mut publisher = MqttPublisher::new(MqttPublisherOptions {
        max_packet_bytes: 256,
        ..options(broker.port, QoS::AtLeastOnce)
    });

    let result = publisher.publish("Plant/Area", &[b'x'; 512]).await;
    assert!(matches!(result, Err(PublishError::Permanent(_))));
    assert_eq!(broker.connections(), 0);
}
