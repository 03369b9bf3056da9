//! # Canary Views Reader
//!
//! Reads a dataset from the Canary Views Web API (v2) and turns it into the
//! ordered sample stream the forward loop expects.
//!
//! ## Workflow of one `read_since`:
//! 1.  **Session**: use the configured API token, or obtain (and cache) a user
//!     token through `getUserToken`.
//! 2.  **Tags**: browse the dataset path once (`browseTags`, deep) and cache
//!     the tag list.
//! 3.  **Data**: `getTagData` over a bounded window starting at the
//!     watermark, following `continuation` tokens until the historian has
//!     nothing more. Empty windows are skipped until data or the present is
//!     reached. A window that needs more than `max_pages` pages is halved and
//!     re-read, so a dense history still yields a finite first batch.
//! 4.  **Normalize**: flatten all tags, drop null values and anything at or
//!     before the watermark, sort by timestamp.
//!
//! ## Error classification:
//! Timeouts, connection failures, 5xx/408/429, undecodable bodies and expired
//! user tokens are transient. Rejected credentials, unknown datasets and
//! other 4xx answers are permanent, as is a session token that is refused
//! before it was ever accepted.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::endpoints::HistorianReader;
use crate::core::errors::ReadError;
use crate::core::sample::{Quality, Sample, SampleValue};
use crate::retrieve::ky_http::{ApiClient, ApiClientOptions, ApiResponse};

/// Default HTTPS port of the Canary Views service.
pub const DEFAULT_VIEWS_PORT: u16 = 55236;

/// Narrowest window tried before a page overflow is reported as an error.
const MIN_READ_WINDOW: TimeDelta = TimeDelta::seconds(1);

/// How the reader authenticates against Canary Views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanaryAuth {
    /// Static API token sent with every call.
    ApiToken(String),
    /// Session user token requested through `getUserToken`. Both fields are
    /// optional for servers that allow anonymous sessions.
    User {
        username: Option<String>,
        password: Option<String>,
    },
}

/// # Canary Options
#[derive(Debug, Clone)]
pub struct CanaryOptions {
    /// Base URL of the Views service, see [`views_base_url`].
    pub base_url: String,
    pub auth: CanaryAuth,
    /// Timeout and retry settings of the HTTP transport.
    pub http: ApiClientOptions,
    /// `maxSize` requested per `getTagData` page.
    pub page_size: u32,
    /// Application name reported when requesting a user token.
    pub application: String,
    /// Longest time span asked for in one `getTagData` query.
    pub read_window: std::time::Duration,
    /// `continuation` round trips allowed per window before it is halved.
    pub max_pages: usize,
}

/// Builds the Views base URL from the configured historian address. A bare
/// host (the legacy `Canary_Url` form) becomes `https://host:55236/`; a
/// `host:port` pair keeps its port; a full URL is used as given.
pub fn views_base_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.contains("://") {
        format!("{}/", raw)
    } else if raw.contains(':') {
        format!("https://{}/", raw)
    } else {
        format!("https://{}:{}/", raw, DEFAULT_VIEWS_PORT)
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserTokenRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<&'a str>,
    application: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TagDataRequest<'a> {
    #[serde(flatten)]
    auth: &'a AuthFields,
    tags: &'a [String],
    start_time: String,
    end_time: String,
    max_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    errors: Vec<String>,
}

impl Envelope {
    fn is_good(&self) -> bool {
        self.status_code.as_deref().map_or(true, |s| s.eq_ignore_ascii_case("good"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserTokenResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    user_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BrowseTagsResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagDataResponse {
    #[serde(flatten)]
    envelope: Envelope,
    #[serde(default)]
    data: HashMap<String, Vec<RawTvq>>,
    #[serde(default)]
    continuation: Option<Value>,
}

/// One timestamp/value/quality triple as Canary returns it.
#[derive(Debug, Deserialize)]
struct RawTvq {
    t: String,
    #[serde(default)]
    v: Value,
    #[serde(default)]
    q: Option<i64>,
}

/// # Canary Reader
///
/// [`HistorianReader`] over the Canary Views Web API.
pub struct CanaryReader {
    client: ApiClient,
    auth: CanaryAuth,
    application: String,
    page_size: u32,
    read_window: TimeDelta,
    max_pages: usize,
    user_token: Option<String>,
    /// Whether the held user token has been accepted by a data call.
    session_verified: bool,
    /// Dataset path and its tags, filled by the first successful browse.
    tags: Option<(String, Vec<String>)>,
}

impl CanaryReader {
    /// # Errors
    /// Fails if the base URL is invalid.
    pub fn new(options: CanaryOptions) -> anyhow::Result<Self> {
        let client = ApiClient::new(&options.base_url, &options.http)?;
        let read_window = TimeDelta::from_std(options.read_window)?.max(MIN_READ_WINDOW);
        Ok(Self {
            client,
            auth: options.auth,
            application: options.application,
            page_size: options.page_size.max(1),
            read_window,
            max_pages: options.max_pages.max(1),
            user_token: None,
            session_verified: false,
            tags: None,
        })
    }

    /// Tags discovered under the dataset, once browsed.
    pub fn cached_tags(&self) -> Option<&[String]> {
        self.tags.as_ref().map(|(_, tags)| tags.as_slice())
    }

    /// Revokes the session user token, if one is held.
    pub async fn close(&mut self) {
        if let Some(token) = self.user_token.take() {
            let body = serde_json::json!({ "userToken": token });
            match self
                .client
                .request::<Value, _>(Method::POST, "api/v2/revokeUserToken", None, Some(body))
                .await
            {
                Ok(_) => log::debug!("Canary user token revoked"),
                Err(e) => log::warn!("Failed to revoke Canary user token: {}", e),
            }
        }
    }

    async fn auth_fields(&mut self) -> Result<AuthFields, ReadError> {
        let (username, password) = match &self.auth {
            CanaryAuth::ApiToken(token) => {
                return Ok(AuthFields {
                    api_token: Some(token.clone()),
                    user_token: None,
                })
            }
            CanaryAuth::User { username, password } => (username.clone(), password.clone()),
        };

        if self.user_token.is_none() {
            let request = UserTokenRequest {
                username: username.as_deref(),
                password: password.as_deref(),
                application: &self.application,
            };
            let response = self
                .client
                .request::<UserTokenResponse, _>(Method::POST, "api/v2/getUserToken", None, Some(request))
                .await
                .map_err(transport_error)?;

            // Any rejection of the login itself needs an operator.
            let body = match response {
                ApiResponse { success: true, data: Some(body), .. } => body,
                ApiResponse { status, error_body, .. } => {
                    return Err(match classify_http(status) {
                        e @ ReadError::Transient(_) => e,
                        ReadError::Permanent(_) => ReadError::Permanent(format!(
                            "Canary rejected the login (HTTP {}): {}",
                            status,
                            error_body.unwrap_or_default()
                        )),
                    })
                }
            };
            if !body.envelope.is_good() {
                return Err(ReadError::Permanent(format!(
                    "Canary rejected the login: {}",
                    describe(&body.envelope)
                )));
            }
            let token = body
                .user_token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ReadError::Transient("Canary returned no user token".to_string()))?;
            log::info!("Obtained Canary user token");
            self.user_token = Some(token);
            self.session_verified = false;
        }

        Ok(AuthFields {
            api_token: None,
            user_token: self.user_token.clone(),
        })
    }

    /// Drops the session. A token that worked before has expired and a new
    /// login may help; one refused right after login means the account may
    /// not read the dataset.
    fn session_rejected(&mut self, detail: &str) -> ReadError {
        self.user_token = None;
        if self.session_verified {
            ReadError::Transient(format!("Canary session expired: {}", detail))
        } else {
            ReadError::Permanent(format!("Canary refused a fresh session: {}", detail))
        }
    }

    /// Maps a non-2xx answer of a data call.
    fn http_failure(&mut self, status: u16, error_body: Option<String>) -> ReadError {
        if status == 401 && self.user_token.is_some() {
            return self.session_rejected(&format!("HTTP 401 {}", error_body.unwrap_or_default()));
        }
        match classify_http(status) {
            ReadError::Transient(reason) => ReadError::Transient(reason),
            ReadError::Permanent(reason) => ReadError::Permanent(format!(
                "{}: {}",
                reason,
                error_body.unwrap_or_default()
            )),
        }
    }

    /// Maps a `statusCode != Good` envelope.
    fn api_failure(&mut self, envelope: &Envelope) -> ReadError {
        let status = envelope.status_code.clone().unwrap_or_default();
        let detail = describe(envelope);

        if status.to_lowercase().contains("token") {
            return match self.auth {
                CanaryAuth::ApiToken(_) => ReadError::Permanent(format!("Canary rejected the API token: {}", detail)),
                CanaryAuth::User { .. } => self.session_rejected(&detail),
            };
        }

        let lowered = detail.to_lowercase();
        if ["not found", "does not exist", "invalid path", "unknown"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            ReadError::Permanent(format!("Canary: {}", detail))
        } else {
            ReadError::Transient(format!("Canary: {}", detail))
        }
    }

    async fn browse_tags(&mut self, dataset_id: &str) -> Result<Vec<String>, ReadError> {
        if let Some((path, tags)) = &self.tags {
            if path == dataset_id {
                return Ok(tags.clone());
            }
        }

        let auth = self.auth_fields().await?;
        let path = {
            let mut query = url::form_urlencoded::Serializer::new(String::new());
            query.append_pair("path", dataset_id).append_pair("deep", "true");
            if let Some(token) = &auth.api_token {
                query.append_pair("apiToken", token);
            }
            if let Some(token) = &auth.user_token {
                query.append_pair("userToken", token);
            }
            format!("api/v2/browseTags?{}", query.finish())
        };

        let response = self
            .client
            .request::<BrowseTagsResponse, ()>(Method::GET, &path, None, None)
            .await
            .map_err(transport_error)?;
        let body = match response {
            ApiResponse { success: true, data: Some(body), .. } => body,
            ApiResponse { status, error_body, .. } => return Err(self.http_failure(status, error_body)),
        };
        if !body.envelope.is_good() {
            return Err(self.api_failure(&body.envelope));
        }
        self.session_verified = true;
        if body.tags.is_empty() {
            return Err(ReadError::Permanent(format!(
                "dataset {} not found or contains no tags",
                dataset_id
            )));
        }

        log::info!("Loaded {} tags from Canary dataset {}", body.tags.len(), dataset_id);
        self.tags = Some((dataset_id.to_string(), body.tags.clone()));
        Ok(body.tags)
    }

    /// Reads `[start, end]` page by page. `None` when the window needs more
    /// than `max_pages` pages.
    async fn fetch_window(
        &mut self,
        tags: &[String],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Option<Vec<Sample>>, ReadError> {
        let start_time = start.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let end_time = end.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let mut continuation: Option<Value> = None;
        let mut samples = Vec::new();

        for _ in 0..self.max_pages {
            let auth = self.auth_fields().await?;
            let request = TagDataRequest {
                auth: &auth,
                tags,
                start_time: start_time.clone(),
                end_time: end_time.clone(),
                max_size: self.page_size,
                continuation: continuation.take(),
            };

            let response = self
                .client
                .request::<TagDataResponse, _>(Method::POST, "api/v2/getTagData", None, Some(request))
                .await
                .map_err(transport_error)?;
            let page = match response {
                ApiResponse { success: true, data: Some(body), .. } => body,
                ApiResponse { status, error_body, .. } => return Err(self.http_failure(status, error_body)),
            };
            if !page.envelope.is_good() {
                return Err(self.api_failure(&page.envelope));
            }
            self.session_verified = true;

            for (tag, tvqs) in page.data {
                samples.extend(tvqs.into_iter().filter_map(|tvq| to_sample(&tag, tvq)));
            }

            match page.continuation {
                Some(next) if !next.is_null() => continuation = Some(next),
                _ => return Ok(Some(samples)),
            }
        }

        Ok(None)
    }

    /// Walks windows from `since` towards now and returns the first batch of
    /// samples newer than `since`, or nothing once the present is reached.
    async fn fetch_since(&mut self, tags: &[String], since: DateTime<Utc>) -> Result<Vec<Sample>, ReadError> {
        let now = Utc::now();
        let mut window = self.read_window;
        let mut start = since;

        while start < now {
            let end = start.checked_add_signed(window).map_or(now, |end| end.min(now));
            match self.fetch_window(tags, start, end).await? {
                Some(mut samples) => {
                    samples.retain(|s| s.timestamp > since);
                    if !samples.is_empty() {
                        samples.sort_by_key(|s| s.timestamp);
                        return Ok(samples);
                    }
                    start = end;
                }
                None if window > MIN_READ_WINDOW => {
                    window = (window / 2).max(MIN_READ_WINDOW);
                    log::warn!(
                        "getTagData from {} needs more than {} pages, narrowing the window to {}s",
                        start,
                        self.max_pages,
                        window.num_seconds()
                    );
                }
                None => {
                    return Err(ReadError::Transient(format!(
                        "getTagData from {} did not finish within {} pages even for a {}s window",
                        start,
                        self.max_pages,
                        window.num_seconds()
                    )))
                }
            }
        }

        Ok(Vec::new())
    }
}

impl HistorianReader for CanaryReader {
    async fn read_since(&mut self, dataset_id: &str, since: DateTime<Utc>) -> Result<Vec<Sample>, ReadError> {
        let tags = self.browse_tags(dataset_id).await?;
        self.fetch_since(&tags, since).await
    }
}

fn to_sample(tag: &str, tvq: RawTvq) -> Option<Sample> {
    let timestamp = match DateTime::parse_from_rfc3339(&tvq.t) {
        Ok(ts) => ts.with_timezone(&Utc),
        Err(e) => {
            log::warn!("Ignoring value of {} with unparseable timestamp {:?}: {}", tag, tvq.t, e);
            return None;
        }
    };

    let value = match tvq.v {
        Value::Null => {
            log::debug!("Ignoring null value of {} at {}", tag, timestamp);
            return None;
        }
        Value::Number(n) => SampleValue::Number(n.as_f64()?),
        Value::Bool(b) => SampleValue::Number(if b { 1.0 } else { 0.0 }),
        Value::String(s) => SampleValue::Text(s),
        other => SampleValue::Text(other.to_string()),
    };

    let quality = tvq.q.map_or(Quality::Uncertain, Quality::from_opc_code);
    Some(Sample::new(tag, timestamp, value, quality))
}

fn classify_http(status: u16) -> ReadError {
    match status {
        401 | 403 => ReadError::Permanent(format!("Canary rejected the credentials (HTTP {})", status)),
        404 => ReadError::Permanent("Canary endpoint or dataset not found (HTTP 404)".to_string()),
        408 | 429 => ReadError::Transient(format!("Canary busy (HTTP {})", status)),
        s if s >= 500 => ReadError::Transient(format!("Canary server error (HTTP {})", s)),
        s => ReadError::Permanent(format!("Canary refused the request (HTTP {})", s)),
    }
}

fn transport_error(e: anyhow::Error) -> ReadError {
    ReadError::Transient(format!("Canary request failed: {:#}", e))
}

fn describe(envelope: &Envelope) -> String {
    let status = envelope.status_code.as_deref().unwrap_or("unknown status");
    if envelope.errors.is_empty() {
        status.to_string()
    } else {
        format!("{} ({})", status, envelope.errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_base_url_forms() {
        assert_eq!(views_base_url("historian"), "https://historian:55236/");
        assert_eq!(views_base_url("historian:55235"), "https://historian:55235/");
        assert_eq!(views_base_url("http://historian:55235/"), "http://historian:55235/");
    }

    #[test]
    fn test_read_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let mut reader = CanaryReader::new(CanaryOptions {
            base_url: "http://127.0.0.1:1/".to_string(),
            auth: CanaryAuth::User {
                username: None,
                password: None,
            },
            http: ApiClientOptions::default(),
            page_size: 10,
            application: "test".to_string(),
            read_window: std::time::Duration::from_secs(60),
            max_pages: 1,
        })
        .unwrap();
        let read = reader.read_since("Plant.Area", Utc::now());
        assert_send(&read);
    }

    #[test]
    fn test_http_classification() {
        assert!(!classify_http(401).is_transient());
        assert!(!classify_http(404).is_transient());
        assert!(!classify_http(400).is_transient());
        assert!(classify_http(429).is_transient());
        assert!(classify_http(503).is_transient());
    }

    #[test]
    fn test_tvq_conversion() {
        let tvq: RawTvq = serde_json::from_value(serde_json::json!({
            "t": "2024-03-01T07:00:00.1234567-05:00", "v": 12.5, "q": 192
        }))
        .unwrap();
        let sample = to_sample("Plant.Level", tvq).unwrap();
        assert_eq!(sample.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true), "2024-03-01T12:00:00.123456Z");
        assert_eq!(sample.value, SampleValue::Number(12.5));
        assert_eq!(sample.quality, Quality::Good);

        let null: RawTvq = serde_json::from_value(serde_json::json!({"t": "2024-03-01T12:00:00Z", "v": null})).unwrap();
        assert!(to_sample("Plant.Level", null).is_none());

        let flag: RawTvq = serde_json::from_value(serde_json::json!({"t": "2024-03-01T12:00:00Z", "v": true})).unwrap();
        let flag = to_sample("Plant.Run", flag).unwrap();
        assert_eq!(flag.value, SampleValue::Number(1.0));
        assert_eq!(flag.quality, Quality::Uncertain);

        let broken: RawTvq = serde_json::from_value(serde_json::json!({"t": "yesterday", "v": 1})).unwrap();
        assert!(to_sample("Plant.Level", broken).is_none());
    }
}
