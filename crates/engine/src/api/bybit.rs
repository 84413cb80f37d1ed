//! Bybit v5 public market data client (no authentication required)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::live::MarketDataSource;
use crate::types::Candle;

pub const DEFAULT_BASE_URL: &str = "https://api.bybit.com";
const MAX_KLINES_PER_REQUEST: usize = 1000;
const RATE_LIMIT_CODE: i64 = 10006;
const MAX_RATE_LIMIT_RETRIES: u32 = 5;
const RATE_LIMIT_BACKOFF_MS: u64 = 1500;
const PAGE_DELAY_MS: u64 = 200;

/// Bybit linear-perpetual kline client
#[derive(Clone)]
pub struct BybitClient {
    client: Client,
    base_url: String,
    category: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KlineResponse {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    result: Option<KlineResult>,
}

#[derive(Debug, Default, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

impl BybitClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            category: "linear".to_string(),
        })
    }

    /// Fetch up to `limit` candles, oldest-first.
    ///
    /// Rate-limit responses (`retCode` 10006) are retried with a growing
    /// backoff; any other non-zero code is returned as [`FetchError::Api`].
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut url = format!(
            "{}/v5/market/kline?category={}&symbol={}&interval={}&limit={}",
            self.base_url,
            self.category,
            symbol,
            interval,
            limit.clamp(1, MAX_KLINES_PER_REQUEST)
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&start={}", start));
        }
        if let Some(end) = end_ms {
            url.push_str(&format!("&end={}", end));
        }

        let mut attempt = 0;
        loop {
            debug!(symbol, interval, attempt, "Fetching klines from Bybit");
            let response = self.client.get(&url).send().await?;

            if !response.status().is_success() {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Status { status, body });
            }

            let payload: KlineResponse = response.json().await?;
            if payload.ret_code == RATE_LIMIT_CODE && attempt < MAX_RATE_LIMIT_RETRIES {
                attempt += 1;
                let backoff = Duration::from_millis(RATE_LIMIT_BACKOFF_MS * attempt as u64);
                warn!(symbol, attempt, backoff_ms = backoff.as_millis() as u64, "Bybit rate limit, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let candles = parse_klines(payload)?;
            debug!(count = candles.len(), "Fetched klines");
            return Ok(candles);
        }
    }

    /// Every candle between `start_ms` and `end_ms`, paging forward
    /// `1000` bars at a time. De-duplicated and sorted by time.
    pub async fn fetch_history(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>, FetchError> {
        let step_ms = interval_step_ms(interval)?;

        info!(symbol, interval, start_ms, end_ms, "Fetching kline history from Bybit");

        let mut all = Vec::new();
        let mut current = start_ms;
        while current < end_ms {
            // Bybit answers with the newest bars inside [start, end]; bound
            // each page so it starts at `current`.
            let page_end = (current + step_ms * (MAX_KLINES_PER_REQUEST as i64 - 1)).min(end_ms);
            let page = self
                .get_klines(symbol, interval, Some(current), Some(page_end), MAX_KLINES_PER_REQUEST)
                .await?;
            let next = match page.last() {
                Some(last) => last.time.timestamp_millis() + step_ms,
                None => page_end + step_ms,
            };
            all.extend(page);
            if next <= current {
                break;
            }
            current = next;
            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
        }

        let candles = drop_forming(dedup_sorted(all), step_ms, Utc::now().timestamp_millis());
        if candles.is_empty() {
            return Err(FetchError::Empty {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
            });
        }
        info!(total = candles.len(), "Kline history fetch complete");
        Ok(candles)
    }
}

#[async_trait]
impl MarketDataSource for BybitClient {
    async fn fetch(&self, symbol: &str, interval: &str, window: usize) -> Result<Vec<Candle>, FetchError> {
        let step_ms = interval_step_ms(interval)?;
        let candles = self.get_klines(symbol, interval, None, None, window).await?;
        let candles = drop_forming(candles, step_ms, Utc::now().timestamp_millis());
        if candles.is_empty() {
            return Err(FetchError::Empty {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
            });
        }
        Ok(candles)
    }
}

/// Check `retCode` and turn newest-first string rows into oldest-first
/// candles. Rows that fail to parse are skipped.
fn parse_klines(payload: KlineResponse) -> Result<Vec<Candle>, FetchError> {
    if payload.ret_code != 0 {
        return Err(FetchError::Api {
            code: payload.ret_code,
            message: payload.ret_msg,
        });
    }

    let rows = payload.result.unwrap_or_default().list;
    let mut candles: Vec<Candle> = rows.iter().filter_map(|row| parse_row(row)).collect();
    candles.reverse();
    Ok(dedup_sorted(candles))
}

fn parse_row(row: &[String]) -> Option<Candle> {
    let [start, open, high, low, close, volume, ..] = row else {
        return None;
    };
    let time = DateTime::<Utc>::from_timestamp_millis(start.parse().ok()?)?;
    Some(Candle {
        time,
        open: open.parse().ok()?,
        high: high.parse().ok()?,
        low: low.parse().ok()?,
        close: close.parse().ok()?,
        volume: volume.parse().ok()?,
    })
}

/// Keep only bars that have closed by `now_ms`. Bybit returns the bar still
/// forming as the newest row.
fn drop_forming(mut candles: Vec<Candle>, step_ms: i64, now_ms: i64) -> Vec<Candle> {
    let before = candles.len();
    candles.retain(|c| c.time.timestamp_millis() + step_ms <= now_ms);
    if candles.len() < before {
        debug!(dropped = before - candles.len(), "Dropped unfinished klines");
    }
    candles
}

fn interval_step_ms(interval: &str) -> Result<i64, FetchError> {
    interval_minutes(interval)
        .map(|m| i64::from(m) * 60_000)
        .ok_or_else(|| FetchError::Decode(format!("unsupported interval '{interval}'")))
}

fn dedup_sorted(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.time);
    candles.dedup_by_key(|c| c.time);
    candles
}

/// Bar length in minutes for a Bybit interval code
pub fn interval_minutes(interval: &str) -> Option<u32> {
    match interval {
        "D" => Some(1440),
        "W" => Some(10_080),
        "M" => Some(43_200),
        other => other.parse().ok().filter(|m| *m > 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: &str) -> KlineResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_parse_reverses_newest_first_rows() {
        let body = r#"{
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "linear",
                "symbol": "ADAUSDT",
                "list": [
                    ["1714521720000", "0.4510", "0.4520", "0.4505", "0.4515", "1200", "541.8"],
                    ["1714521660000", "0.4500", "0.4512", "0.4498", "0.4510", "900", "405.9"],
                    ["1714521600000", "0.4490", "0.4503", "0.4488", "0.4500", "1500", "674.2"]
                ]
            }
        }"#;
        let candles = parse_klines(payload(body)).unwrap();
        assert_eq!(candles.len(), 3);
        assert!(crate::types::is_strictly_increasing(&candles));
        assert_eq!(candles[0].time.timestamp_millis(), 1_714_521_600_000);
        assert_eq!(candles[0].open, 0.4490);
        assert_eq!(candles[2].close, 0.4515);
        assert_eq!(candles[2].volume, 1200.0);
    }

    #[test]
    fn test_parse_skips_bad_rows() {
        let body = r#"{
            "retCode": 0,
            "result": {
                "list": [
                    ["1714521660000", "0.45", "0.46", "0.44", "oops", "1", "1"],
                    ["1714521600000", "0.45", "0.46", "0.44", "0.455", "1", "1"],
                    ["short"]
                ]
            }
        }"#;
        let candles = parse_klines(payload(body)).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 0.455);
    }

    #[test]
    fn test_non_zero_code_is_api_error() {
        let body = r#"{"retCode": 10001, "retMsg": "params error", "result": {}}"#;
        match parse_klines(payload(body)) {
            Err(FetchError::Api { code, message }) => {
                assert_eq!(code, 10001);
                assert_eq!(message, "params error");
            }
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[test]
    fn test_unfinished_newest_bar_is_dropped() {
        let body = r#"{
            "retCode": 0,
            "result": {
                "list": [
                    ["1714521720000", "0.4510", "0.4520", "0.4505", "0.4515", "1200", "541.8"],
                    ["1714521660000", "0.4500", "0.4512", "0.4498", "0.4510", "900", "405.9"],
                    ["1714521600000", "0.4490", "0.4503", "0.4488", "0.4500", "1500", "674.2"]
                ]
            }
        }"#;
        let candles = parse_klines(payload(body)).unwrap();
        let step_ms = interval_step_ms("1").unwrap();

        // 30s into the newest minute: that bar is still open
        let now_ms = 1_714_521_750_000;
        let closed = drop_forming(candles.clone(), step_ms, now_ms);
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[1].time.timestamp_millis(), 1_714_521_660_000);

        // the newest bar counts once its minute has ended
        let closed = drop_forming(candles, step_ms, 1_714_521_780_000);
        assert_eq!(closed.len(), 3);

        assert!(matches!(interval_step_ms("5m"), Err(FetchError::Decode(_))));
    }

    #[test]
    fn test_interval_minutes() {
        assert_eq!(interval_minutes("1"), Some(1));
        assert_eq!(interval_minutes("240"), Some(240));
        assert_eq!(interval_minutes("D"), Some(1440));
        assert_eq!(interval_minutes("0"), None);
        assert_eq!(interval_minutes("5m"), None);
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = BybitClient::new("http://localhost:9000/").unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}
