//! # Bus Arrival Fetching and Normalisation
//!
//! Fetches real-time arrival predictions for a bus stop and turns the raw
//! feed into [`ArrivalRecord`]s the renderer can draw directly.
//!
//! ## Data Source
//! - **Request**: `GET {base_url}/busarrival?BusStopCode={code}` with the API
//!   key in a header
//! - **Format**: JSON, `{"Services": [{"ServiceNo", "NextBus", "NextBus2", "NextBus3"}]}`
//!   where each `NextBus*` carries an ISO-8601 `EstimatedArrival` with offset
//!
//! ## Processing Pipeline
//! 1. **Fetch**: bounded retries with exponential backoff on 429/5xx and
//!    transport errors
//! 2. **Parse**: decode each service independently; a malformed service or
//!    slot is dropped on its own
//! 3. **Convert**: timestamp → whole minutes from "now" in the feed's civil
//!    timezone, floored and clamped at zero
//! 4. **Filter**: services without a single usable prediction are dropped
//! 5. **Order**: soonest bus first, ties in feed order
//!
//! ## Error Handling
//! [`ArrivalSource::fetch`] never fails. Network, status and JSON problems are
//! logged and produce an empty list, which the scheduler renders as an empty
//! column (or skips the screen entirely if every stop came back empty).

use crate::config::TransitConfig;
use crate::ArrivalRecord;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, error, warn};
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::time::Duration;
use thiserror::Error;

/// Predictions reported per service by the feed
pub const ETA_SLOTS: usize = 3;

/// Errors inside the fetch pipeline. They never leave [`ArrivalFetcher`].
#[derive(Error, Debug)]
pub enum FetchError {
    /// No credential configured, so no request is attempted
    #[error("missing API key")]
    MissingApiKey,

    /// Request could not be built, sent or read
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status (after retries, if it was retryable)
    #[error("HTTP status {0}")]
    Status(u16),

    /// Body was not the expected JSON document
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Anything that can produce arrivals for a stop code.
///
/// Implementations must not fail: problems degrade to an empty list.
#[allow(async_fn_in_trait)]
pub trait ArrivalSource {
    async fn fetch(&self, stop_code: &str) -> Vec<ArrivalRecord>;
}

/// Retry schedule for idempotent GETs
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each further retry
    pub backoff_factor: Duration,
    /// Statuses worth retrying
    pub retry_statuses: &'static [u16],
    /// Upper bound honoured for a server's `Retry-After`
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_millis(300),
            retry_statuses: &[429, 500, 502, 503, 504],
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_factor * 2u32.saturating_pow(retry.saturating_sub(1))
    }

    pub fn should_retry(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status.as_u16())
    }

    /// Delay before retry number `retry`, preferring the server's hint
    fn delay_with_hint(&self, retry: u32, retry_after: Option<u64>) -> Duration {
        match retry_after {
            Some(secs) => Duration::from_secs(secs).min(self.max_retry_after),
            None => self.delay_for(retry),
        }
    }
}

/// HTTP-backed [`ArrivalSource`]
pub struct ArrivalFetcher {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    api_key_header: String,
    policy: RetryPolicy,
    tz: Tz,
}

impl ArrivalFetcher {
    /// Build a fetcher with the configured endpoint, credential and timeout.
    /// `tz` is the civil timezone the feed's offsets refer to.
    pub fn new(config: &TransitConfig, tz: Tz) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
            policy: RetryPolicy::default(),
            tz,
        })
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch and normalise arrivals, surfacing the failure reason
    pub async fn try_fetch(&self, stop_code: &str) -> Result<Vec<ArrivalRecord>, FetchError> {
        let body = self.get_with_retry(stop_code).await?;
        let now = Utc::now().with_timezone(&self.tz);
        parse_arrivals(&body, &now)
    }

    async fn get_with_retry(&self, stop_code: &str) -> Result<String, FetchError> {
        let api_key = self.api_key.as_deref().ok_or(FetchError::MissingApiKey)?;
        let url = format!("{}/busarrival", self.base_url);

        let mut retry = 0;
        loop {
            let sent = self
                .client
                .get(&url)
                .query(&[("BusStopCode", stop_code)])
                .header(self.api_key_header.as_str(), api_key)
                .header(header::ACCEPT, "application/json")
                .send()
                .await;

            let (failure, retry_after) = match sent {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.text().await?);
                }
                Ok(response) => {
                    let status = response.status();
                    if !self.policy.should_retry(status) {
                        return Err(FetchError::Status(status.as_u16()));
                    }
                    let retry_after = response
                        .headers()
                        .get(header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    (FetchError::Status(status.as_u16()), retry_after)
                }
                Err(e) if e.is_connect() || e.is_timeout() => (FetchError::Http(e), None),
                Err(e) => return Err(FetchError::Http(e)),
            };

            if retry >= self.policy.max_retries {
                return Err(failure);
            }
            retry += 1;
            let delay = self.policy.delay_with_hint(retry, retry_after);
            warn!(
                "[arrivals] stop {stop_code}: {failure}; retry {retry}/{} in {:?}",
                self.policy.max_retries, delay
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl ArrivalSource for ArrivalFetcher {
    async fn fetch(&self, stop_code: &str) -> Vec<ArrivalRecord> {
        match self.try_fetch(stop_code).await {
            Ok(records) => {
                debug!("[arrivals] stop {stop_code}: {} service(s)", records.len());
                records
            }
            Err(e) => {
                error!("[arrivals] stop {stop_code}: {e}");
                Vec::new()
            }
        }
    }
}

// -- Feed decoding --

#[derive(Debug, Deserialize)]
struct ArrivalResponse {
    #[serde(rename = "Services", default)]
    services: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceEntry {
    #[serde(rename = "ServiceNo", default, deserialize_with = "service_label")]
    service_no: Option<String>,
    #[serde(rename = "NextBus", default, deserialize_with = "lenient")]
    next_bus: Option<NextBus>,
    #[serde(rename = "NextBus2", default, deserialize_with = "lenient")]
    next_bus2: Option<NextBus>,
    #[serde(rename = "NextBus3", default, deserialize_with = "lenient")]
    next_bus3: Option<NextBus>,
}

#[derive(Debug, Default, Deserialize)]
struct NextBus {
    #[serde(rename = "EstimatedArrival", default, deserialize_with = "lenient")]
    estimated_arrival: Option<String>,
}

/// A field of the wrong shape reads as absent instead of failing the service
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Service numbers occasionally arrive as bare JSON numbers
fn service_label<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

impl ServiceEntry {
    fn slots(&self) -> [Option<&str>; ETA_SLOTS] {
        [&self.next_bus, &self.next_bus2, &self.next_bus3]
            .map(|slot| slot.as_ref().and_then(|b| b.estimated_arrival.as_deref()))
    }
}

/// Parse a feed body into arrival records relative to `now`.
///
/// A body without a `Services` list is an empty result, not an error.
pub fn parse_arrivals<Z: TimeZone>(
    body: &str,
    now: &DateTime<Z>,
) -> Result<Vec<ArrivalRecord>, FetchError> {
    let response: ArrivalResponse = serde_json::from_str(body)?;
    let services = response.services.unwrap_or_default();

    let mut records = Vec::with_capacity(services.len());
    for value in services {
        let entry: ServiceEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("[arrivals] skipping undecodable service: {e}");
                continue;
            }
        };

        let mut etas: Vec<u32> = entry
            .slots()
            .into_iter()
            .flatten()
            .filter_map(parse_timestamp)
            .map(|eta| minutes_until(&eta, now))
            .collect();

        let service_id = entry.service_no.unwrap_or_else(|| "?".to_string());
        if etas.is_empty() {
            debug!("[arrivals] service {service_id}: no usable ETA, dropped");
            continue;
        }
        etas.sort_unstable();
        etas.truncate(ETA_SLOTS);
        records.push(ArrivalRecord {
            service_id,
            eta_minutes: etas,
        });
    }

    // Stable: equal soonest ETAs keep feed order
    records.sort_by_key(|r| r.soonest());
    Ok(records)
}

/// Parse an `EstimatedArrival` value; blank or malformed values yield `None`
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
}

/// Whole minutes from `now` until `eta`, floored, never negative
pub fn minutes_until<Z: TimeZone>(eta: &DateTime<FixedOffset>, now: &DateTime<Z>) -> u32 {
    let seconds = (eta.naive_utc() - now.naive_utc()).num_seconds();
    u32::try_from(seconds.max(0) / 60).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn sg_now() -> DateTime<Tz> {
        chrono_tz::Asia::Singapore
            .with_ymd_and_hms(2025, 3, 14, 9, 0, 0)
            .single()
            .unwrap()
    }

    fn stamp(now: &DateTime<Tz>, offset: TimeDelta) -> String {
        (now.clone() + offset).format("%Y-%m-%dT%H:%M:%S%:z").to_string()
    }

    #[test]
    fn eta_now_is_zero() {
        let now = sg_now();
        let eta = parse_timestamp(&stamp(&now, TimeDelta::zero())).unwrap();
        assert_eq!(minutes_until(&eta, &now), 0);
    }

    #[test]
    fn eta_is_floored() {
        let now = sg_now();
        let eta = parse_timestamp(&stamp(&now, TimeDelta::seconds(90))).unwrap();
        assert_eq!(minutes_until(&eta, &now), 1);
        let eta = parse_timestamp(&stamp(&now, TimeDelta::seconds(179))).unwrap();
        assert_eq!(minutes_until(&eta, &now), 2);
    }

    #[test]
    fn past_eta_is_clamped_to_zero() {
        let now = sg_now();
        let eta = parse_timestamp(&stamp(&now, TimeDelta::minutes(-5))).unwrap();
        assert_eq!(minutes_until(&eta, &now), 0);
    }

    #[test]
    fn eta_is_independent_of_the_zone_now_is_expressed_in() {
        let now = sg_now();
        let eta = parse_timestamp(&stamp(&now, TimeDelta::minutes(7))).unwrap();
        let now_utc = now.with_timezone(&Utc);
        assert_eq!(minutes_until(&eta, &now_utc), 7);
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_timestamp("2025-03-14T09:05:00+08:00").is_some());
        assert!(parse_timestamp("2025-03-14T09:05:00+0800").is_some());
        assert!(parse_timestamp("").is_none());
        assert!(parse_timestamp("soon").is_none());
        assert!(parse_timestamp("2025-03-14 09:05").is_none());
    }

    #[test]
    fn drops_services_without_etas_and_orders_by_soonest() {
        let now = sg_now();
        let body = serde_json::json!({
            "BusStopCode": "83139",
            "Services": [
                { "ServiceNo": "15",
                  "NextBus": { "EstimatedArrival": "" },
                  "NextBus2": { "EstimatedArrival": "" },
                  "NextBus3": { "EstimatedArrival": "" } },
                { "ServiceNo": "155",
                  "NextBus": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(9)) },
                  "NextBus2": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(18)) },
                  "NextBus3": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(30)) } },
                { "ServiceNo": "43",
                  "NextBus": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(4)) },
                  "NextBus2": {},
                  "NextBus3": { "EstimatedArrival": "garbage" } }
            ]
        })
        .to_string();

        let records = parse_arrivals(&body, &now).unwrap();
        assert_eq!(
            records,
            vec![
                ArrivalRecord {
                    service_id: "43".into(),
                    eta_minutes: vec![4]
                },
                ArrivalRecord {
                    service_id: "155".into(),
                    eta_minutes: vec![9, 18, 30]
                },
            ]
        );
    }

    #[test]
    fn ties_keep_feed_order() {
        let now = sg_now();
        let soon = stamp(&now, TimeDelta::minutes(3));
        let body = serde_json::json!({
            "Services": [
                { "ServiceNo": "B", "NextBus": { "EstimatedArrival": &soon } },
                { "ServiceNo": "A", "NextBus": { "EstimatedArrival": &soon } },
            ]
        })
        .to_string();
        let ids: Vec<String> = parse_arrivals(&body, &now)
            .unwrap()
            .into_iter()
            .map(|r| r.service_id)
            .collect();
        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn missing_services_is_empty_not_error() {
        let now = sg_now();
        assert!(parse_arrivals("{}", &now).unwrap().is_empty());
        assert!(parse_arrivals(r#"{"Services": null}"#, &now).unwrap().is_empty());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(matches!(
            parse_arrivals("<html>", &sg_now()),
            Err(FetchError::Json(_))
        ));
    }

    #[test]
    fn malformed_pieces_degrade_individually() {
        let now = sg_now();
        let body = serde_json::json!({
            "Services": [
                "not an object",
                { "ServiceNo": 190,
                  "NextBus": "broken",
                  "NextBus2": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(12)) } },
                { "NextBus": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(20)) } }
            ]
        })
        .to_string();
        let records = parse_arrivals(&body, &now).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].service_id, "190");
        assert_eq!(records[0].eta_minutes, vec![12]);
        assert_eq!(records[1].service_id, "?");
    }

    #[test]
    fn etas_are_non_decreasing() {
        let now = sg_now();
        let body = serde_json::json!({
            "Services": [
                { "ServiceNo": "7",
                  "NextBus": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(15)) },
                  "NextBus2": { "EstimatedArrival": stamp(&now, TimeDelta::minutes(5)) } }
            ]
        })
        .to_string();
        let records = parse_arrivals(&body, &now).unwrap();
        assert_eq!(records[0].eta_minutes, vec![5, 15]);
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for(2), Duration::from_millis(600));
        assert_eq!(policy.delay_for(3), Duration::from_millis(1200));
        assert_eq!(
            policy.delay_with_hint(1, Some(120)),
            Duration::from_secs(30)
        );
        assert_eq!(policy.delay_with_hint(2, Some(2)), Duration::from_secs(2));
        assert_eq!(policy.delay_with_hint(2, None), policy.delay_for(2));
    }

    #[test]
    fn retryable_statuses() {
        let policy = RetryPolicy::default();
        for code in [429, 500, 502, 503, 504] {
            assert!(policy.should_retry(StatusCode::from_u16(code).unwrap()));
        }
        for code in [400, 401, 403, 404, 501] {
            assert!(!policy.should_retry(StatusCode::from_u16(code).unwrap()));
        }
    }

    #[tokio::test]
    async fn missing_api_key_yields_empty_without_request() {
        let config = TransitConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..TransitConfig::default()
        };
        let fetcher = ArrivalFetcher::new(&config, chrono_tz::Asia::Singapore).unwrap();
        assert!(matches!(
            fetcher.try_fetch("83139").await,
            Err(FetchError::MissingApiKey)
        ));
        assert!(fetcher.fetch("83139").await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_empty() {
        let config = TransitConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: Some("key".to_string()),
            timeout_secs: 2,
            ..TransitConfig::default()
        };
        let fetcher = ArrivalFetcher::new(&config, chrono_tz::Asia::Singapore)
            .unwrap()
            .with_retry_policy(RetryPolicy {
                max_retries: 1,
                backoff_factor: Duration::from_millis(10),
                ..RetryPolicy::default()
            });
        assert!(fetcher.fetch("83139").await.is_empty());
    }

    fn reply(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n{headers}\r\n{body}",
            body.len()
        )
    }

    fn ok_reply() -> String {
        let now = Utc::now().with_timezone(&chrono_tz::Asia::Singapore);
        let body = serde_json::json!({
            "Services": [
                { "ServiceNo": "7",
                  "NextBus": { "EstimatedArrival": stamp(&now, TimeDelta::seconds(450)) } }
            ]
        });
        reply("200 OK", "", &body.to_string())
    }

    /// Answer each connection with the next scripted reply, repeating the
    /// last one. Returns the base URL and a count of requests served.
    async fn serve(script: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let served = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let n = served.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }
                let _ = socket.write_all(script[n.min(script.len() - 1)].as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}"), hits)
    }

    fn local_fetcher(base_url: String) -> ArrivalFetcher {
        let config = TransitConfig {
            base_url,
            api_key: Some("key".to_string()),
            timeout_secs: 5,
            ..TransitConfig::default()
        };
        ArrivalFetcher::new(&config, chrono_tz::Asia::Singapore)
            .unwrap()
            .with_retry_policy(RetryPolicy {
                backoff_factor: Duration::from_millis(1),
                ..RetryPolicy::default()
            })
    }

    fn services(records: &[ArrivalRecord]) -> Vec<&str> {
        records.iter().map(|r| r.service_id.as_str()).collect()
    }

    #[tokio::test]
    async fn unavailable_then_success_is_retried() {
        let (url, hits) = serve(vec![
            reply("503 Service Unavailable", "", ""),
            ok_reply(),
        ])
        .await;
        let records = local_fetcher(url).fetch("83139").await;
        assert_eq!(services(&records), vec!["7"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let (url, hits) = serve(vec![reply("404 Not Found", "", "")]).await;
        let fetcher = local_fetcher(url);
        assert!(matches!(
            fetcher.try_fetch("83139").await,
            Err(FetchError::Status(404))
        ));
        assert!(fetcher.fetch("83139").await.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_unavailable_exhausts_retries() {
        let (url, hits) = serve(vec![reply("503 Service Unavailable", "", "")]).await;
        let fetcher = local_fetcher(url);
        assert!(matches!(
            fetcher.try_fetch("83139").await,
            Err(FetchError::Status(503))
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_after_header_sets_the_delay() {
        let (url, hits) = serve(vec![
            reply("429 Too Many Requests", "Retry-After: 1\r\n", ""),
            ok_reply(),
        ])
        .await;
        let started = std::time::Instant::now();
        let records = local_fetcher(url).fetch("83139").await;
        let elapsed = started.elapsed();
        assert_eq!(services(&records), vec!["7"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // The 1ms backoff alone would retry almost at once
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }
}
