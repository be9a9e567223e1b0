//! STIB/MIVB open-data API client.
//!
//! The STIB open-data portal (https://opendata.stib-mivb.be/) exposes the
//! Brussels transit network behind an OAuth2 client-credentials token.
//! Endpoints used here:
//!
//! - `POST /api/token` - exchange client id/secret for a bearer token
//! - `GET /api/NetworkDescription/1.0/PointByName/{name}` - resolve a stop
//!   name to its network point ids (one per direction/platform)
//! - `GET /api/OperationMonitoring/4.0/PassingTimeByPoint/{ids}` - real-time
//!   waiting times for a comma-separated list of point ids
//! - `GET /api/NetworkDescription/1.0/LineDetails/{id}` - static line info
//!   (route type and color)
//!
//! Point resolutions and line details are static network data and are cached
//! in memory for the process lifetime. Passing times are never cached here.
//! Destination and message texts come localized (fr/nl); the requested
//! language is picked with fallback to the other one.

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ApiRequestLog, ApiRequestSender, PassageSource, UpstreamError};
use crate::config::Config;
use crate::models::{ArrivingIn, LineKind, Passage, PassageFilter};

const STIB_TOKEN_URL: &str = "https://opendata.stib-mivb.be/api/token";
const STIB_POINT_BY_NAME_URL: &str =
    "https://opendata.stib-mivb.be/api/NetworkDescription/1.0/PointByName";
const STIB_PASSING_TIME_URL: &str =
    "https://opendata.stib-mivb.be/api/OperationMonitoring/4.0/PassingTimeByPoint";
const STIB_LINE_DETAILS_URL: &str =
    "https://opendata.stib-mivb.be/api/NetworkDescription/1.0/LineDetails";

/// Tokens are refreshed this long before their reported expiry
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct AccessToken {
    token: String,
    expires_at: Instant,
}

/// STIB API client for fetching real-time passage data
pub struct StibClient {
    client: Client,
    client_id: String,
    client_secret: String,
    /// Semaphore to limit concurrent requests
    rate_limiter: Arc<Semaphore>,
    token: RwLock<Option<AccessToken>>,
    /// stop name -> point ids, static network data
    point_cache: RwLock<HashMap<String, Vec<String>>>,
    /// line id -> (kind, color), static network data
    line_cache: RwLock<HashMap<String, (LineKind, Option<String>)>>,
    /// Sender for request diagnostics
    diagnostics_tx: ApiRequestSender,
}

impl StibClient {
    pub fn with_max_concurrent(
        config: &Config,
        diagnostics_tx: ApiRequestSender,
        max_concurrent: usize,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpstreamError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            rate_limiter: Arc::new(Semaphore::new(max_concurrent)),
            token: RwLock::new(None),
            point_cache: RwLock::new(HashMap::new()),
            line_cache: RwLock::new(HashMap::new()),
            diagnostics_tx,
        })
    }

    /// Send a diagnostics log entry. Send errors just mean no one is listening.
    fn log_request(&self, log: ApiRequestLog) {
        let _ = self.diagnostics_tx.send(log);
    }

    /// Return a valid bearer token, requesting a fresh one when the cached
    /// token is missing or about to expire.
    async fn bearer_token(&self) -> Result<String, UpstreamError> {
        {
            let token = self.token.read().await;
            if let Some(cached) = token.as_ref() {
                if cached.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                    return Ok(cached.token.clone());
                }
            }
        }

        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let response = self
            .client
            .post(STIB_TOKEN_URL)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            self.log_request(ApiRequestLog {
                id: request_id,
                timestamp: Utc::now().to_rfc3339(),
                method: "POST".to_string(),
                endpoint: "token".to_string(),
                params: None,
                duration_ms: start.elapsed().as_millis() as u64,
                status,
                response_size: None,
                error: Some(format!("HTTP error: {}", status)),
            });
            return Err(UpstreamError::Auth(format!(
                "token request failed with HTTP {}",
                status
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Auth(format!("invalid token response: {}", e)))?;

        self.log_request(ApiRequestLog {
            id: request_id,
            timestamp: Utc::now().to_rfc3339(),
            method: "POST".to_string(),
            endpoint: "token".to_string(),
            params: None,
            duration_ms: start.elapsed().as_millis() as u64,
            status,
            response_size: None,
            error: None,
        });

        let token = token_response.access_token.clone();
        *self.token.write().await = Some(AccessToken {
            token: token_response.access_token,
            expires_at: Instant::now() + Duration::from_secs(token_response.expires_in),
        });

        Ok(token)
    }

    /// Authenticated GET with rate limiting and a diagnostics log entry.
    /// Returns the raw response body.
    async fn get_logged(
        &self,
        endpoint: &'static str,
        url: &str,
        params: HashMap<String, String>,
    ) -> Result<String, UpstreamError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .expect("Semaphore closed unexpectedly");

        let token = self.bearer_token().await?;
        let start = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let mut log = ApiRequestLog {
            id: request_id,
            timestamp: Utc::now().to_rfc3339(),
            method: "GET".to_string(),
            endpoint: endpoint.to_string(),
            params: Some(params),
            duration_ms: 0,
            status: 0,
            response_size: None,
            error: None,
        };

        let response = match self.client.get(url).bearer_auth(&token).send().await {
            Ok(resp) => resp,
            Err(e) => {
                log.duration_ms = start.elapsed().as_millis() as u64;
                log.error = Some(e.to_string());
                self.log_request(log);
                return Err(UpstreamError::Network(e.to_string()));
            }
        };

        let status = response.status();
        log.status = status.as_u16();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // Token may have been revoked; drop it so the next call re-authenticates
            *self.token.write().await = None;
            log.duration_ms = start.elapsed().as_millis() as u64;
            log.error = Some(format!("HTTP error: {}", status.as_u16()));
            self.log_request(log);
            return Err(UpstreamError::Auth(format!("HTTP {}", status.as_u16())));
        }

        if !status.is_success() {
            log.duration_ms = start.elapsed().as_millis() as u64;
            log.error = Some(format!("HTTP error: {}", status.as_u16()));
            self.log_request(log);
            return Err(UpstreamError::Network(format!(
                "HTTP error: {}",
                status.as_u16()
            )));
        }

        match response.text().await {
            Ok(body) => {
                log.duration_ms = start.elapsed().as_millis() as u64;
                log.response_size = Some(body.len());
                self.log_request(log);
                Ok(body)
            }
            Err(e) => {
                log.duration_ms = start.elapsed().as_millis() as u64;
                log.error = Some(format!("Failed to read body: {}", e));
                self.log_request(log);
                Err(UpstreamError::Network(e.to_string()))
            }
        }
    }

    /// Resolve a stop name to its network point ids, caching successful
    /// lookups. An unknown stop resolves to an empty list (not cached, so a
    /// later network-data update can still fix it).
    async fn resolve_points(&self, stop_name: &str) -> Result<Vec<String>, UpstreamError> {
        if let Some(points) = self.point_cache.read().await.get(stop_name) {
            return Ok(points.clone());
        }

        let url = format!(
            "{}/{}",
            STIB_POINT_BY_NAME_URL,
            urlencoding::encode(stop_name)
        );
        let mut params = HashMap::new();
        params.insert("stop_name".to_string(), stop_name.to_string());

        let body = self.get_logged("PointByName", &url, params).await?;
        let response: PointByNameResponse =
            serde_json::from_str(&body).map_err(|e| UpstreamError::Parse(e.to_string()))?;

        let points: Vec<String> = response.points.into_iter().map(|p| p.id).collect();
        debug!(stop_name = %stop_name, count = points.len(), "Resolved stop points");

        if !points.is_empty() {
            self.point_cache
                .write()
                .await
                .insert(stop_name.to_string(), points.clone());
        }

        Ok(points)
    }

    /// Static line info (kind and color), cached per line id. Lookup
    /// failures degrade to Unknown rather than failing the passage fetch.
    async fn line_info(&self, line_id: &str) -> (LineKind, Option<String>) {
        if let Some(info) = self.line_cache.read().await.get(line_id) {
            return info.clone();
        }

        let url = format!(
            "{}/{}",
            STIB_LINE_DETAILS_URL,
            urlencoding::encode(line_id)
        );
        let mut params = HashMap::new();
        params.insert("line_id".to_string(), line_id.to_string());

        let body = match self.get_logged("LineDetails", &url, params).await {
            Ok(body) => body,
            Err(e) => {
                warn!(line_id = %line_id, error = %e, "Failed to fetch line details");
                return (LineKind::Unknown, None);
            }
        };

        let response: LineDetailsResponse = match serde_json::from_str(&body) {
            Ok(response) => response,
            Err(e) => {
                warn!(line_id = %line_id, error = %e, "Failed to parse line details");
                return (LineKind::Unknown, None);
            }
        };

        let info = response
            .lines
            .first()
            .map(|line| {
                let kind = line
                    .route_type
                    .as_deref()
                    .map(LineKind::from_route_type)
                    .unwrap_or(LineKind::Unknown);
                (kind, line.color.clone())
            })
            .unwrap_or((LineKind::Unknown, None));
        debug!(line_id = %line_id, kind = info.0.as_str(), "Fetched line details");

        self.line_cache
            .write()
            .await
            .insert(line_id.to_string(), info.clone());
        info
    }

    async fn fetch_passing_times(
        &self,
        point_ids: &[String],
    ) -> Result<PassingTimesResponse, UpstreamError> {
        let ids = point_ids.join(",");
        let url = format!("{}/{}", STIB_PASSING_TIME_URL, urlencoding::encode(&ids));
        let mut params = HashMap::new();
        params.insert("point_ids".to_string(), ids);

        let body = self.get_logged("PassingTimeByPoint", &url, params).await?;
        serde_json::from_str(&body).map_err(|e| UpstreamError::Parse(e.to_string()))
    }
}

impl PassageSource for StibClient {
    async fn fetch_passages(
        &self,
        stop_name: &str,
        filter: &PassageFilter,
        max_passages: usize,
        lang: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Passage>, UpstreamError> {
        let points = self.resolve_points(stop_name).await?;
        if points.is_empty() {
            debug!(stop_name = %stop_name, "No network points for stop");
            return Ok(Vec::new());
        }

        let response = self.fetch_passing_times(&points).await?;

        let mut passages = Vec::new();
        for point in &response.points {
            for passing_time in &point.passing_times {
                let line_id = passing_time.line_id.as_deref().ok_or_else(|| {
                    UpstreamError::MalformedRecord(format!(
                        "passing time at point {} has no lineId",
                        point.point_id
                    ))
                })?;
                let (line_kind, line_color) = self.line_info(line_id).await;
                let passage = convert_passing_time(
                    passing_time,
                    &point.point_id,
                    line_kind,
                    line_color,
                    lang,
                    now,
                )?;
                if filter.matches(&passage) {
                    passages.push(passage);
                }
            }
        }

        passages.sort_by_key(|p| p.expected_arrival_time);
        passages.truncate(max_passages);
        Ok(passages)
    }
}

/// Build a Passage from one upstream passing time. Fails with
/// MalformedRecord when a required field is missing or unparseable.
fn convert_passing_time(
    passing_time: &PassingTime,
    point_id: &str,
    line_kind: LineKind,
    line_color: Option<String>,
    lang: &str,
    now: DateTime<Utc>,
) -> Result<Passage, UpstreamError> {
    let line_id = passing_time
        .line_id
        .clone()
        .ok_or_else(|| UpstreamError::MalformedRecord("missing lineId".to_string()))?;

    let destination = passing_time
        .destination
        .as_ref()
        .and_then(|text| text.get(lang))
        .ok_or_else(|| UpstreamError::MalformedRecord("missing destination".to_string()))?
        .to_string();

    let raw_time = passing_time
        .expected_arrival_time
        .as_deref()
        .ok_or_else(|| UpstreamError::MalformedRecord("missing expectedArrivalTime".to_string()))?;
    let expected_arrival_time = DateTime::parse_from_rfc3339(raw_time)
        .map_err(|e| {
            UpstreamError::MalformedRecord(format!("bad expectedArrivalTime '{}': {}", raw_time, e))
        })?
        .with_timezone(&Utc);

    // Already-departed vehicles clamp to zero rather than going negative
    let remaining = (expected_arrival_time - now).num_seconds().max(0);

    Ok(Passage {
        destination,
        expected_arrival_time,
        stop_id: point_id.to_string(),
        message: passing_time
            .message
            .as_ref()
            .and_then(|text| text.get(lang))
            .map(|s| s.to_string()),
        arriving_in: ArrivingIn {
            minutes: (remaining / 60) as u32,
            seconds: (remaining % 60) as u32,
        },
        line_id,
        line_kind,
        line_color,
    })
}

// Response structures

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointByNameResponse {
    #[serde(default)]
    pub points: Vec<PointRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointRef {
    pub id: String,
    pub name: Option<LocalizedText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassingTimesResponse {
    #[serde(default)]
    pub points: Vec<PointPassingTimes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointPassingTimes {
    #[serde(rename = "pointId")]
    pub point_id: String,
    #[serde(default, rename = "passingTimes")]
    pub passing_times: Vec<PassingTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassingTime {
    #[serde(rename = "lineId")]
    pub line_id: Option<String>,
    pub destination: Option<LocalizedText>,
    pub message: Option<LocalizedText>,
    #[serde(rename = "expectedArrivalTime")]
    pub expected_arrival_time: Option<String>,
}

/// fr/nl localized text as returned by the STIB API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizedText {
    pub fr: Option<String>,
    pub nl: Option<String>,
}

impl LocalizedText {
    /// Text in the requested language, falling back to the other one
    pub fn get(&self, lang: &str) -> Option<&str> {
        let (preferred, fallback) = match lang {
            "nl" => (&self.nl, &self.fr),
            _ => (&self.fr, &self.nl),
        };
        preferred.as_deref().or(fallback.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDetailsResponse {
    #[serde(default)]
    pub lines: Vec<LineDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineDetail {
    #[serde(rename = "lineId")]
    pub line_id: Option<String>,
    #[serde(rename = "routeType")]
    pub route_type: Option<String>,
    pub color: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE_PASSING_TIMES: &str = r#"{
        "points": [
            {
                "pointId": "8161",
                "passingTimes": [
                    {
                        "destination": {"fr": "STOCKEL", "nl": "STOKKEL"},
                        "expectedArrivalTime": "2026-08-07T12:34:00+02:00",
                        "lineId": "1",
                        "message": {"fr": "Ralentissements", "nl": "Vertragingen"}
                    },
                    {
                        "destination": {"fr": "STOCKEL", "nl": "STOKKEL"},
                        "expectedArrivalTime": "2026-08-07T12:41:30+02:00",
                        "lineId": "1"
                    }
                ]
            }
        ]
    }"#;

    fn sample_now() -> DateTime<Utc> {
        // 12:30:55 Brussels summer time (UTC+2)
        Utc.with_ymd_and_hms(2026, 8, 7, 10, 30, 55).unwrap()
    }

    #[test]
    fn test_parse_passing_times_response() {
        let response: PassingTimesResponse = serde_json::from_str(SAMPLE_PASSING_TIMES).unwrap();
        assert_eq!(response.points.len(), 1);
        let point = &response.points[0];
        assert_eq!(point.point_id, "8161");
        assert_eq!(point.passing_times.len(), 2);
        assert_eq!(point.passing_times[0].line_id.as_deref(), Some("1"));
        assert!(point.passing_times[1].message.is_none());
    }

    #[test]
    fn test_localized_text_falls_back() {
        let text = LocalizedText {
            fr: None,
            nl: Some("STOKKEL".to_string()),
        };
        assert_eq!(text.get("fr"), Some("STOKKEL"));
        assert_eq!(text.get("nl"), Some("STOKKEL"));

        let both = LocalizedText {
            fr: Some("STOCKEL".to_string()),
            nl: Some("STOKKEL".to_string()),
        };
        assert_eq!(both.get("fr"), Some("STOCKEL"));
        assert_eq!(both.get("nl"), Some("STOKKEL"));
    }

    #[test]
    fn test_convert_passing_time() {
        let response: PassingTimesResponse = serde_json::from_str(SAMPLE_PASSING_TIMES).unwrap();
        let passing_time = &response.points[0].passing_times[0];

        // expected 12:34:00, now 12:30:55 -> 185 seconds out
        let passage = convert_passing_time(
            passing_time,
            "8161",
            LineKind::Metro,
            Some("#C4008F".to_string()),
            "fr",
            sample_now(),
        )
        .unwrap();

        assert_eq!(passage.destination, "STOCKEL");
        assert_eq!(passage.arriving_in, ArrivingIn { minutes: 3, seconds: 5 });
        assert_eq!(passage.stop_id, "8161");
        assert_eq!(passage.line_id, "1");
        assert_eq!(passage.line_kind, LineKind::Metro);
        assert_eq!(passage.message.as_deref(), Some("Ralentissements"));
    }

    #[test]
    fn test_convert_clamps_departed_vehicle_to_zero() {
        let response: PassingTimesResponse = serde_json::from_str(SAMPLE_PASSING_TIMES).unwrap();
        let passing_time = &response.points[0].passing_times[0];

        // An hour past the expected arrival
        let late = Utc.with_ymd_and_hms(2026, 8, 7, 11, 34, 0).unwrap();
        let passage =
            convert_passing_time(passing_time, "8161", LineKind::Metro, None, "fr", late).unwrap();

        assert_eq!(passage.arriving_in, ArrivingIn { minutes: 0, seconds: 0 });
    }

    #[test]
    fn test_convert_rejects_missing_destination() {
        let passing_time = PassingTime {
            line_id: Some("1".to_string()),
            destination: None,
            message: None,
            expected_arrival_time: Some("2026-08-07T12:34:00+02:00".to_string()),
        };
        let result = convert_passing_time(
            &passing_time,
            "8161",
            LineKind::Metro,
            None,
            "fr",
            sample_now(),
        );
        assert!(matches!(result, Err(UpstreamError::MalformedRecord(_))));
    }

    #[test]
    fn test_convert_rejects_bad_timestamp() {
        let passing_time = PassingTime {
            line_id: Some("1".to_string()),
            destination: Some(LocalizedText {
                fr: Some("STOCKEL".to_string()),
                nl: None,
            }),
            message: None,
            expected_arrival_time: Some("not-a-timestamp".to_string()),
        };
        let result = convert_passing_time(
            &passing_time,
            "8161",
            LineKind::Metro,
            None,
            "fr",
            sample_now(),
        );
        assert!(matches!(result, Err(UpstreamError::MalformedRecord(_))));
    }

    #[test]
    fn test_parse_line_details_response() {
        let json = r##"{"lines": [{"lineId": "1", "routeType": "M", "color": "#C4008F"}]}"##;
        let response: LineDetailsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.lines.len(), 1);
        assert_eq!(response.lines[0].route_type.as_deref(), Some("M"));
        assert_eq!(
            response.lines[0]
                .route_type
                .as_deref()
                .map(LineKind::from_route_type),
            Some(LineKind::Metro)
        );
    }
}
