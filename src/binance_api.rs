use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::governor::{ApiError, RequestGovernor};
use crate::types::{Candle, OiSample, SymbolInfo};

const KLINES_PATH: &str = "/fapi/v1/klines";
const PREMIUM_INDEX_PATH: &str = "/fapi/v1/premiumIndex";
const EXCHANGE_INFO_PATH: &str = "/fapi/v1/exchangeInfo";
const OI_HIST_PATH: &str = "/futures/data/openInterestHist";

/// Everything the scanner and the tracker read from the exchange.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Active USDT perpetuals, possibly served from a short-lived cache.
    async fn perpetual_symbols(&self) -> Result<Vec<SymbolInfo>, ApiError>;
    /// Symbol → mark price, strictly positive prices only.
    async fn mark_prices(&self) -> Result<HashMap<String, f64>, ApiError>;
    /// Up to `count` closed candles, oldest first. Never contains the open candle.
    async fn closed_klines(&self, symbol: &str, interval: &str, count: usize) -> Result<Vec<Candle>, ApiError>;
    async fn open_interest_history(&self, symbol: &str, period: &str, limit: usize) -> Result<Vec<OiSample>, ApiError>;
}

// ── Client ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BinanceClient {
    governor: Arc<RequestGovernor>,
    symbols_ttl: Duration,
    symbols_cache: Arc<Mutex<Option<(Instant, Vec<SymbolInfo>)>>>,
}

impl BinanceClient {
    pub fn new(governor: Arc<RequestGovernor>, symbols_ttl: Duration) -> Self {
        BinanceClient {
            governor,
            symbols_ttl,
            symbols_cache: Arc::new(Mutex::new(None)),
        }
    }
}

/// Binance kline weight: 1 up to 100 rows, 2 above.
fn klines_weight(limit: usize) -> u32 {
    if limit <= 100 { 1 } else { 2 }
}

#[async_trait]
impl MarketData for BinanceClient {
    async fn perpetual_symbols(&self) -> Result<Vec<SymbolInfo>, ApiError> {
        let mut cache = self.symbols_cache.lock().await;
        if let Some((fetched_at, symbols)) = cache.as_ref() {
            if !symbols.is_empty() && fetched_at.elapsed() < self.symbols_ttl {
                return Ok(symbols.clone());
            }
        }

        let info = self.governor.execute(EXCHANGE_INFO_PATH, &[], 1).await?;
        let symbols = parse_perpetual_symbols(&info).ok_or_else(|| ApiError::Decode {
            path: EXCHANGE_INFO_PATH.to_string(),
            reason: "missing symbols array".to_string(),
        })?;
        log::info!("Loaded {} USDT perpetual symbols from exchange info", symbols.len());
        *cache = Some((Instant::now(), symbols.clone()));
        Ok(symbols)
    }

    async fn mark_prices(&self) -> Result<HashMap<String, f64>, ApiError> {
        let data = self.governor.execute(PREMIUM_INDEX_PATH, &[], 1).await?;
        parse_mark_prices(&data).ok_or_else(|| ApiError::Decode {
            path: PREMIUM_INDEX_PATH.to_string(),
            reason: "expected an array".to_string(),
        })
    }

    async fn closed_klines(&self, symbol: &str, interval: &str, count: usize) -> Result<Vec<Candle>, ApiError> {
        // two extra rows so that dropping the open candle still leaves `count`
        let limit = count + 2;
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let raw = self.governor.execute(KLINES_PATH, &params, klines_weight(limit)).await?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut candles = parse_closed_klines(&raw, now_ms).ok_or_else(|| ApiError::Decode {
            path: KLINES_PATH.to_string(),
            reason: "expected an array of rows".to_string(),
        })?;
        if candles.len() > count {
            let excess = candles.len() - count;
            candles.drain(..excess);
        }
        Ok(candles)
    }

    async fn open_interest_history(&self, symbol: &str, period: &str, limit: usize) -> Result<Vec<OiSample>, ApiError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("period", period.to_string()),
            ("limit", limit.to_string()),
        ];
        let raw = self.governor.execute(OI_HIST_PATH, &params, 1).await?;
        parse_oi_history(&raw).ok_or_else(|| ApiError::Decode {
            path: OI_HIST_PATH.to_string(),
            reason: "expected an array".to_string(),
        })
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────────

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn int(v: &Value) -> Option<i64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Rows whose close time lies after `now_ms` are still forming and are skipped.
pub fn parse_closed_klines(raw: &Value, now_ms: i64) -> Option<Vec<Candle>> {
    let rows = raw.as_array()?;
    let candles = rows
        .iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            let close_time = int(arr.get(6)?)?;
            if close_time > now_ms {
                return None;
            }
            Some(Candle {
                open_time: int(arr.first()?)?,
                open: num(arr.get(1)?)?,
                high: num(arr.get(2)?)?,
                low: num(arr.get(3)?)?,
                close: num(arr.get(4)?)?,
                volume: num(arr.get(5)?)?,
                close_time,
                quote_volume: num(arr.get(7)?)?,
                trades: arr.get(8).and_then(int).unwrap_or(0).max(0) as u64,
            })
        })
        .collect();
    Some(candles)
}

pub fn parse_mark_prices(raw: &Value) -> Option<HashMap<String, f64>> {
    let list = raw.as_array()?;
    Some(
        list.iter()
            .filter_map(|d| {
                let symbol = d["symbol"].as_str()?;
                let price = num(&d["markPrice"])?;
                (price > 0.0).then(|| (symbol.to_string(), price))
            })
            .collect(),
    )
}

pub fn parse_perpetual_symbols(info: &Value) -> Option<Vec<SymbolInfo>> {
    let list = info["symbols"].as_array()?;
    Some(
        list.iter()
            .filter(|s| {
                s["quoteAsset"].as_str() == Some("USDT")
                    && s["contractType"].as_str() == Some("PERPETUAL")
                    && s["status"].as_str() == Some("TRADING")
            })
            .filter_map(|s| {
                Some(SymbolInfo {
                    symbol: s["symbol"].as_str()?.to_string(),
                    base_asset: s["baseAsset"].as_str()?.to_string(),
                })
            })
            .collect(),
    )
}

pub fn parse_oi_history(raw: &Value) -> Option<Vec<OiSample>> {
    let list = raw.as_array()?;
    Some(
        list.iter()
            .filter_map(|e| {
                Some(OiSample {
                    timestamp: int(&e["timestamp"])?,
                    open_interest: num(&e["sumOpenInterest"])?,
                    open_interest_value: num(&e["sumOpenInterestValue"])?,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::governor::tests::{ok, ScriptedTransport};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn row(open_time: i64, close_time: i64, close: &str) -> Value {
        json!([open_time, "1.0", "2.0", "0.5", close, "100", close_time, "150.5", 42, "0", "0", "0"])
    }

    #[test]
    fn unclosed_rows_are_dropped() {
        let raw = json!([row(0, 999, "1.1"), row(1000, 1999, "1.2"), row(2000, 2999, "1.3")]);
        let candles = parse_closed_klines(&raw, 2500).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles.iter().all(|c| c.close_time <= 2500));
        assert_eq!(candles[1].close, 1.2);
        assert_eq!(candles[1].quote_volume, 150.5);
        assert_eq!(candles[1].trades, 42);
    }

    #[test]
    fn close_time_equal_to_now_is_closed() {
        let raw = json!([row(0, 999, "1.1")]);
        assert_eq!(parse_closed_klines(&raw, 999).unwrap().len(), 1);
    }

    #[test]
    fn mark_prices_skip_non_positive() {
        let raw = json!([
            { "symbol": "BTCUSDT", "markPrice": "65000.10" },
            { "symbol": "DEADUSDT", "markPrice": "0.00000000" },
            { "symbol": "ETHUSDT", "markPrice": "3100.5" }
        ]);
        let prices = parse_mark_prices(&raw).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices["BTCUSDT"], 65000.10);
        assert!(!prices.contains_key("DEADUSDT"));
    }

    #[test]
    fn only_trading_usdt_perpetuals() {
        let info = json!({ "symbols": [
            { "symbol": "BTCUSDT", "baseAsset": "BTC", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "TRADING" },
            { "symbol": "BTCUSDT_250627", "baseAsset": "BTC", "quoteAsset": "USDT", "contractType": "CURRENT_QUARTER", "status": "TRADING" },
            { "symbol": "ETHBUSD", "baseAsset": "ETH", "quoteAsset": "BUSD", "contractType": "PERPETUAL", "status": "TRADING" },
            { "symbol": "OLDUSDT", "baseAsset": "OLD", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "SETTLING" },
            { "symbol": "1000PEPEUSDT", "baseAsset": "1000PEPE", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "TRADING" }
        ]});
        let symbols = parse_perpetual_symbols(&info).unwrap();
        let names: Vec<&str> = symbols.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(names, vec!["BTCUSDT", "1000PEPEUSDT"]);
        assert_eq!(symbols[1].base_asset, "1000PEPE");
    }

    #[test]
    fn oi_history_parses_value_field() {
        let raw = json!([
            { "symbol": "XUSDT", "sumOpenInterest": "10.0", "sumOpenInterestValue": "1000.0", "timestamp": 1 },
            { "symbol": "XUSDT", "sumOpenInterest": "12.0", "sumOpenInterestValue": "1250.0", "timestamp": 2 }
        ]);
        let hist = parse_oi_history(&raw).unwrap();
        assert_eq!(hist.len(), 2);
        assert_eq!(hist[1].open_interest_value, 1250.0);
    }

    #[tokio::test(start_paused = true)]
    async fn symbols_are_cached_for_ttl() {
        let body = json!({ "symbols": [
            { "symbol": "BTCUSDT", "baseAsset": "BTC", "quoteAsset": "USDT", "contractType": "PERPETUAL", "status": "TRADING" }
        ]})
        .to_string();
        let transport = Arc::new(ScriptedTransport::new(vec![ok(&body), ok(&body)]));
        let cfg = RateLimitConfig { weight_ceiling: 100, request_delay_ms: 0, max_attempts: 1 };
        let gov = Arc::new(RequestGovernor::new(Box::new(transport.clone()), &cfg));
        let client = BinanceClient::new(gov, Duration::from_secs(300));

        assert_eq!(client.perpetual_symbols().await.unwrap().len(), 1);
        assert_eq!(client.perpetual_symbols().await.unwrap().len(), 1);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        client.perpetual_symbols().await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_klines_trims_to_count() {
        let now = chrono::Utc::now().timestamp_millis();
        let rows: Vec<Value> = (0..7)
            .map(|i| row(i * 1000, now - 10_000 + i * 1000, "1.0"))
            .chain(std::iter::once(row(7000, now + 60_000, "9.9")))
            .collect();
        let transport = Arc::new(ScriptedTransport::new(vec![ok(&Value::Array(rows).to_string())]));
        let cfg = RateLimitConfig { weight_ceiling: 100, request_delay_ms: 0, max_attempts: 1 };
        let gov = Arc::new(RequestGovernor::new(Box::new(transport), &cfg));
        let client = BinanceClient::new(gov, Duration::from_secs(300));

        let candles = client.closed_klines("XUSDT", "1h", 5).await.unwrap();
        assert_eq!(candles.len(), 5);
        assert_eq!(candles.last().unwrap().open_time, 6000);
        assert!(candles.iter().all(|c| c.close != 9.9));
    }
}
