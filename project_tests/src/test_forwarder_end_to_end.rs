//! # End-to-End Forwarding Tests
//!
//! Wires the real `CanaryReader`, `MqttPublisher` and `FileWatermarkStore`
//! together against the mock historian and broker, including a restart from
//! the persisted watermark.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use lib_common::broker::{MqttPublisher, MqttPublisherOptions, QoS};
use lib_common::core::{
    FileWatermarkStore, ForwardLoop, ForwardSettings, PermanentErrorPolicy, TickOutcome, Watermark, WatermarkSeed,
};
use lib_common::historian::{CanaryAuth, CanaryOptions, CanaryReader};
use lib_common::retrieve::ApiClientOptions;
use project_tests::support::{AckMode, MockBroker, MockHttpServer};

fn seed() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn historian() -> MockHttpServer {
    // Always answers with the same two values; filtering is the reader's job.
    MockHttpServer::start(|req| {
        if req.target.contains("browseTags") {
            (200, json!({ "statusCode": "Good", "tags": ["Plant.Area.Level"] }).to_string())
        } else {
            (
                200,
                json!({
                    "statusCode": "Good",
                    "data": {
                        "Plant.Area.Level": [
                            { "t": "2024-03-01T12:00:01Z", "v": 10.5, "q": 192 },
                            { "t": "2024-03-01T12:00:02Z", "v": 11.0, "q": 192 }
                        ]
                    }
                })
                .to_string(),
            )
        }
    })
}

fn forward_loop(historian: &MockHttpServer, broker: &MockBroker) -> ForwardLoop<CanaryReader, MqttPublisher> {
    let reader = CanaryReader::new(CanaryOptions {
        base_url: historian.base_url.clone(),
        auth: CanaryAuth::ApiToken("secret".to_string()),
        http: ApiClientOptions {
            max_retries: 0,
            ..Default::default()
        },
        page_size: 100,
        application: "ForwarderTests".to_string(),
        read_window: Duration::from_secs(10 * 365 * 86_400),
        max_pages: 10,
    })
    .unwrap();
    let publisher = MqttPublisher::new(MqttPublisherOptions {
        host: "127.0.0.1".to_string(),
        port: broker.port,
        client_id: "forwarder-e2e".to_string(),
        username: None,
        password: None,
        qos: QoS::AtLeastOnce,
        keep_alive: Duration::from_secs(30),
        ack_timeout: Duration::from_secs(2),
        max_packet_bytes: 64 * 1024,
    });
    ForwardLoop::new(
        reader,
        publisher,
        ForwardSettings {
            dataset_id: "Plant.Area".to_string(),
            topic: "Plant/Area".to_string(),
            poll_interval: Duration::from_millis(50),
            retry_base_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(200),
            on_permanent_read_error: PermanentErrorPolicy::Exit,
        },
    )
}

#[tokio::test]
async fn test_forwards_once_and_resumes_from_persisted_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("watermark.json");
    let historian = historian();
    let broker = MockBroker::start(AckMode::Ack);
    let (_tx, mut shutdown) = broadcast::channel::<()>(1);

    // --- First run ---
    {
        let store = FileWatermarkStore::open(&path).unwrap();
        let mut watermark = Watermark::open("Plant.Area", store, WatermarkSeed::At(seed())).unwrap();
        let mut forward = forward_loop(&historian, &broker);

        let report = forward.tick(&mut watermark, &mut shutdown).await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.published, 2);
        assert_eq!(watermark.get(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 2).unwrap());
    }

    let published = broker.published();
    assert_eq!(published.len(), 2);
    let first: Value = serde_json::from_slice(&published[0].payload).unwrap();
    assert_eq!(first["tag"], "Plant.Area.Level");
    assert_eq!(first["timestamp"], "2024-03-01T12:00:01Z");
    assert_eq!(first["value"], 10.5);
    assert_eq!(first["quality"], "GOOD");
    assert!(published.iter().all(|p| p.topic == "Plant/Area"));

    // --- Restart: the seed is ignored, nothing is sent twice ---
    let store = FileWatermarkStore::open(&path).unwrap();
    let mut watermark = Watermark::open("Plant.Area", store, WatermarkSeed::StartOfHistory).unwrap();
    assert_eq!(watermark.get(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 2).unwrap());

    let mut forward = forward_loop(&historian, &broker);
    let report = forward.tick(&mut watermark, &mut shutdown).await.unwrap();
    assert_eq!(report.outcome, TickOutcome::Empty);
    assert_eq!(broker.published().len(), 2);

    let last_query = historian
        .requests()
        .into_iter()
        .rev()
        .find(|r| r.target.contains("getTagData"))
        .unwrap();
    assert_eq!(last_query.json()["startTime"], "2024-03-01T12:00:02Z");
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let historian = historian();
    let broker = MockBroker::start(AckMode::Ack);
    let (tx, mut shutdown) = broadcast::channel::<()>(1);

    let store = FileWatermarkStore::open(dir.path().join("watermark.json")).unwrap();
    let mut watermark = Watermark::open("Plant.Area", store, WatermarkSeed::At(seed())).unwrap();
    let mut forward = forward_loop(&historian, &broker);

    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(()).unwrap();
    });

    tokio::time::timeout(Duration::from_secs(10), forward.run(&mut watermark, &mut shutdown))
        .await
        .expect("loop did not stop")
        .unwrap();
    stopper.await.unwrap();

    // Repeated polls never re-send what was already forwarded.
    assert_eq!(broker.published().len(), 2);
    assert!(historian.count("api/v2/getTagData") >= 2);
}

#[tokio::test]
async fn test_permanent_historian_error_stops_run() {
    let dir = tempfile::tempdir().unwrap();
    let historian = MockHttpServer::start(|_| (404, "gone".to_string()));
    let broker = MockBroker::start(AckMode::Ack);
    let (_tx, mut shutdown) = broadcast::channel::<()>(1);

    let store = FileWatermarkStore::open(dir.path().join("watermark.json")).unwrap();
    let mut watermark = Watermark::open("Plant.Area", store, WatermarkSeed::At(seed())).unwrap();
    let mut forward = forward_loop(&historian, &broker);

    let result = tokio::time::timeout(Duration::from_secs(10), forward.run(&mut watermark, &mut shutdown))
        .await
        .unwrap();
    assert!(result.is_err());
    assert!(broker.published().is_empty());
}
