//! # Canary Reader Integration Tests
//!
//! Drives `lib_common::historian::CanaryReader` against a mock Views API and
//! checks tag discovery, paging, session handling and error classification.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as TimeDelta, TimeZone, Utc};
use serde_json::json;

use lib_common::core::{HistorianReader, Quality, ReadError, SampleValue};
use lib_common::historian::{CanaryAuth, CanaryOptions, CanaryReader};
use lib_common::retrieve::ApiClientOptions;
use project_tests::support::{MockHttpServer, RecordedRequest};

const DATASET: &str = "Plant.Area";

fn options(base_url: &str, auth: CanaryAuth) -> CanaryOptions {
    CanaryOptions {
        base_url: base_url.to_string(),
        auth,
        http: ApiClientOptions {
            timeout: Duration::from_secs(5),
            max_retries: 0,
            ..Default::default()
        },
        page_size: 2,
        application: "ForwarderTests".to_string(),
        // One window reaches from any test start time to now.
        read_window: Duration::from_secs(10 * 365 * 86_400),
        max_pages: 10,
    }
}

fn reader(base_url: &str, auth: CanaryAuth) -> CanaryReader {
    CanaryReader::new(options(base_url, auth)).unwrap()
}

fn user_auth() -> CanaryAuth {
    CanaryAuth::User {
        username: Some("operator".to_string()),
        password: Some("pw".to_string()),
    }
}

fn window_of(req: &RecordedRequest) -> (DateTime<Utc>, DateTime<Utc>) {
    let body = req.json();
    let parse = |key: &str| {
        DateTime::parse_from_rfc3339(body[key].as_str().unwrap())
            .unwrap()
            .with_timezone(&Utc)
    };
    (parse("startTime"), parse("endTime"))
}

fn token_auth() -> CanaryAuth {
    CanaryAuth::ApiToken("secret-token".to_string())
}

fn since() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn tags_response() -> String {
    json!({ "statusCode": "Good", "errors": [], "tags": ["Plant.Area.Level", "Plant.Area.Flow"] }).to_string()
}

fn path_of(target: &str) -> &str {
    target.trim_start_matches('/').split('?').next().unwrap_or_default()
}

#[tokio::test]
async fn test_pages_are_merged_filtered_and_sorted() {
    let server = MockHttpServer::start(|req| match path_of(&req.target) {
        "api/v2/browseTags" => (200, tags_response()),
        "api/v2/getTagData" if req.json()["continuation"].is_null() => (
            200,
            json!({
                "statusCode": "Good",
                "data": {
                    "Plant.Area.Level": [
                        { "t": "2024-03-01T12:00:00Z", "v": 1.0, "q": 192 },
                        { "t": "2024-03-01T12:00:03Z", "v": 3.0, "q": 192 }
                    ]
                },
                "continuation": "page-2"
            })
            .to_string(),
        ),
        "api/v2/getTagData" => (
            200,
            json!({
                "statusCode": "Good",
                "data": {
                    "Plant.Area.Flow": [
                        { "t": "2024-03-01T12:00:02Z", "v": "open", "q": 64 }
                    ]
                },
                "continuation": null
            })
            .to_string(),
        ),
        _ => (404, "{}".to_string()),
    });

    let mut reader = reader(&server.base_url, token_auth());
    let samples = reader.read_since(DATASET, since()).await.unwrap();

    // The sample at exactly `since` is dropped.
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].tag, "Plant.Area.Flow");
    assert_eq!(samples[0].value, SampleValue::Text("open".to_string()));
    assert_eq!(samples[0].quality, Quality::Uncertain);
    assert_eq!(samples[1].tag, "Plant.Area.Level");
    assert_eq!(samples[1].value, SampleValue::Number(3.0));
    assert_eq!(samples[1].quality, Quality::Good);

    let requests = server.requests();
    let browse = &requests[0];
    assert!(browse.target.contains("path=Plant.Area"));
    assert!(browse.target.contains("deep=true"));
    assert!(browse.target.contains("apiToken=secret-token"));

    let first_page = requests[1].json();
    assert_eq!(first_page["apiToken"], "secret-token");
    assert_eq!(first_page["tags"], json!(["Plant.Area.Level", "Plant.Area.Flow"]));
    assert_eq!(first_page["startTime"], "2024-03-01T12:00:00Z");
    assert_eq!(first_page["maxSize"], 2);
    assert_eq!(requests[2].json()["continuation"], "page-2");
    assert_eq!(reader.cached_tags().map(|t| t.len()), Some(2));
}

#[tokio::test]
async fn test_tags_are_browsed_once() {
    let server = MockHttpServer::start(|req| match path_of(&req.target) {
        "api/v2/browseTags" => (200, tags_response()),
        _ => (200, json!({ "statusCode": "Good", "data": {} }).to_string()),
    });

    let mut reader = reader(&server.base_url, token_auth());
    assert!(reader.read_since(DATASET, since()).await.unwrap().is_empty());
    assert!(reader.read_since(DATASET, since()).await.unwrap().is_empty());

    assert_eq!(server.count("api/v2/browseTags"), 1);
    assert_eq!(server.count("api/v2/getTagData"), 2);
}

#[tokio::test]
async fn test_expired_user_token_is_refreshed() {
    let logins = Arc::new(AtomicUsize::new(0));
    let data_calls = Arc::new(AtomicUsize::new(0));
    let (logins_in, data_calls_in) = (logins.clone(), data_calls.clone());

    let server = MockHttpServer::start(move |req| match path_of(&req.target) {
        "api/v2/getUserToken" => {
            let n = logins_in.fetch_add(1, Ordering::SeqCst) + 1;
            (200, json!({ "statusCode": "Good", "userToken": format!("session-{}", n) }).to_string())
        }
        "api/v2/browseTags" => (200, tags_response()),
        "api/v2/getTagData" => {
            // The first session is rejected once.
            if data_calls_in.fetch_add(1, Ordering::SeqCst) == 0 {
                (401, "expired".to_string())
            } else {
                (200, json!({ "statusCode": "Good", "data": {} }).to_string())
            }
        }
        "api/v2/revokeUserToken" => (200, json!({ "statusCode": "Good" }).to_string()),
        _ => (404, "{}".to_string()),
    });

    let mut reader = reader(&server.base_url, user_auth());

    let first = reader.read_since(DATASET, since()).await;
    assert!(matches!(first, Err(ReadError::Transient(_))), "got {:?}", first);

    assert!(reader.read_since(DATASET, since()).await.unwrap().is_empty());
    assert_eq!(logins.load(Ordering::SeqCst), 2);

    let requests = server.requests();
    let login = requests.iter().find(|r| path_of(&r.target) == "api/v2/getUserToken").unwrap();
    assert_eq!(login.json()["username"], "operator");
    assert_eq!(login.json()["application"], "ForwarderTests");
    let last_data = requests.iter().rev().find(|r| path_of(&r.target) == "api/v2/getTagData").unwrap();
    assert_eq!(last_data.json()["userToken"], "session-2");

    reader.close().await;
    let revoke = server.requests().into_iter().find(|r| path_of(&r.target) == "api/v2/revokeUserToken").unwrap();
    assert_eq!(revoke.json()["userToken"], "session-2");
}

#[tokio::test]
async fn test_missing_dataset_is_permanent() {
    let server = MockHttpServer::start(|_| (404, "not here".to_string()));
    let mut reader = reader(&server.base_url, token_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Permanent(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_empty_dataset_is_permanent() {
    let server = MockHttpServer::start(|_| (200, json!({ "statusCode": "Good", "tags": [] }).to_string()));
    let mut reader = reader(&server.base_url, token_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Permanent(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_rejected_api_token_is_permanent() {
    let server = MockHttpServer::start(|_| {
        (200, json!({ "statusCode": "BadApiToken", "errors": ["token revoked"] }).to_string())
    });
    let mut reader = reader(&server.base_url, token_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Permanent(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockHttpServer::start(|_| (503, "maintenance".to_string()));
    let mut reader = reader(&server.base_url, token_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Transient(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_unreachable_historian_is_transient() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut reader = reader(&format!("http://127.0.0.1:{}/", port), token_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Transient(_))), "got {:?}", result);
}

#[tokio::test]
async fn test_fresh_session_refused_is_permanent() {
    let logins = Arc::new(AtomicUsize::new(0));
    let logins_in = logins.clone();

    let server = MockHttpServer::start(move |req| match path_of(&req.target) {
        "api/v2/getUserToken" => {
            logins_in.fetch_add(1, Ordering::SeqCst);
            (200, json!({ "statusCode": "Good", "userToken": "session" }).to_string())
        }
        _ => (401, "not allowed to read this dataset".to_string()),
    });
    let mut reader = reader(&server.base_url, user_auth());

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Permanent(_))), "got {:?}", result);
    assert_eq!(logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dense_window_is_narrowed_until_it_fits() {
    // Windows wider than ten minutes never run out of continuation tokens.
    let server = MockHttpServer::start(|req| match path_of(&req.target) {
        "api/v2/browseTags" => (200, tags_response()),
        "api/v2/getTagData" => {
            let (start, end) = window_of(req);
            if end - start > TimeDelta::minutes(10) {
                (200, json!({ "statusCode": "Good", "data": {}, "continuation": "more" }).to_string())
            } else {
                let t = (start + TimeDelta::seconds(1)).to_rfc3339();
                (
                    200,
                    json!({
                        "statusCode": "Good",
                        "data": { "Plant.Area.Level": [ { "t": t, "v": 1.0, "q": 192 } ] }
                    })
                    .to_string(),
                )
            }
        }
        _ => (404, "{}".to_string()),
    });

    let mut reader = CanaryReader::new(CanaryOptions {
        read_window: Duration::from_secs(3600),
        max_pages: 3,
        ..options(&server.base_url, token_auth())
    })
    .unwrap();

    let samples = reader.read_since(DATASET, since()).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].timestamp, since() + TimeDelta::seconds(1));

    // 60 min and 30 min windows each use up their 3 pages, 15 min does too,
    // 7.5 min answers at once.
    let windows: Vec<_> = server
        .requests()
        .iter()
        .filter(|r| path_of(&r.target) == "api/v2/getTagData")
        .map(window_of)
        .collect();
    assert_eq!(windows.len(), 3 * 3 + 1);
    assert!(windows.iter().all(|(start, _)| *start == since()));
    let (_, last_end) = windows[windows.len() - 1];
    assert_eq!(last_end - since(), TimeDelta::seconds(450));
}

#[tokio::test]
async fn test_overflow_at_narrowest_window_is_transient() {
    let server = MockHttpServer::start(|req| match path_of(&req.target) {
        "api/v2/browseTags" => (200, tags_response()),
        _ => (200, json!({ "statusCode": "Good", "data": {}, "continuation": "more" }).to_string()),
    });
    let mut reader = CanaryReader::new(CanaryOptions {
        read_window: Duration::from_secs(4),
        max_pages: 2,
        ..options(&server.base_url, token_auth())
    })
    .unwrap();

    let result = reader.read_since(DATASET, since()).await;
    assert!(matches!(result, Err(ReadError::Transient(_))), "got {:?}", result);
    // 4 s, 2 s and 1 s windows, two pages each.
    assert_eq!(server.count("api/v2/getTagData"), 6);
}

#[tokio::test]
async fn test_empty_windows_are_skipped() {
    let start = Utc::now() - TimeDelta::days(3);
    let data_at = start + TimeDelta::hours(30);

    let server = MockHttpServer::start(move |req| match path_of(&req.target) {
        "api/v2/browseTags" => (200, tags_response()),
        "api/v2/getTagData" => {
            let (from, to) = window_of(req);
            let data = if from <= data_at && data_at < to {
                json!({ "Plant.Area.Flow": [ { "t": data_at.to_rfc3339(), "v": 4.0, "q": 192 } ] })
            } else {
                json!({})
            };
            (200, json!({ "statusCode": "Good", "data": data }).to_string())
        }
        _ => (404, "{}".to_string()),
    });
    let mut reader = CanaryReader::new(CanaryOptions {
        read_window: Duration::from_secs(86_400),
        ..options(&server.base_url, token_auth())
    })
    .unwrap();

    let samples = reader.read_since(DATASET, start).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].tag, "Plant.Area.Flow");
    assert_eq!(server.count("api/v2/getTagData"), 2);
}
