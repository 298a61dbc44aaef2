use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{MarketCapConfig, COINGECKO_MARKETS_URL, USER_AGENT};

const PER_PAGE: u32 = 250;
const MAX_PAGES: u32 = 12;
const PAGE_DELAY_SECS: u64 = 12;
const MAX_PAGE_ERRORS: u32 = 3;
const MAX_CONSECUTIVE_429: u32 = 3;
const ERROR_SLEEP_SECS: u64 = 10;
const FAILED_REFRESH_RETRY_SECS: u64 = 600;

/// Market-cap gate applied to the target list before any candle is fetched.
#[async_trait]
pub trait MarketCapFilter: Send + Sync {
    async fn passes(&self, base_asset: &str, max_usd: f64) -> bool;
    /// Human label for the alert, e.g. `$12.34M` or `Unknown`.
    async fn label(&self, base_asset: &str) -> String;
}

/// Used when the filter is switched off.
pub struct NoMarketCapFilter;

#[async_trait]
impl MarketCapFilter for NoMarketCapFilter {
    async fn passes(&self, _base_asset: &str, _max_usd: f64) -> bool {
        true
    }

    async fn label(&self, _base_asset: &str) -> String {
        "Unknown".to_string()
    }
}

/// Strips exchange multiplier prefixes: `1000PEPE` → `PEPE`.
pub fn normalise(base_asset: &str) -> String {
    let upper = base_asset.to_uppercase();
    for prefix in ["10000", "1000"] {
        if upper.len() > prefix.len() && upper.starts_with(prefix) {
            return upper[prefix.len()..].to_string();
        }
    }
    upper
}

pub fn format_mcap(mcap: Option<f64>) -> String {
    match mcap {
        None => "Unknown".to_string(),
        Some(v) if v >= 1e9 => format!("${:.2}B", v / 1e9),
        Some(v) if v >= 1e6 => format!("${:.2}M", v / 1e6),
        Some(v) if v >= 1e3 => format!("${:.2}K", v / 1e3),
        Some(v) => format!("${v:.2}"),
    }
}

/// One page of the CoinGecko markets listing, as far as the refresh cares.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Rows(Vec<serde_json::Value>),
    /// HTTP 429 with the advised wait, if any.
    Throttled(Option<u64>),
    /// HTTP 403, the free tier refusing this host.
    Forbidden,
    Failed(String),
}

#[async_trait]
pub trait PageSource: Send + Sync {
    async fn page(&self, page: u32) -> PageOutcome;
}

/// reqwest-backed source for `/coins/markets`.
pub struct HttpPageSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPageSource {
    pub fn new(url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(HttpPageSource { client, url: url.to_string() })
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn page(&self, page: u32) -> PageOutcome {
        let query = [
            ("vs_currency", "usd".to_string()),
            ("order", "market_cap_desc".to_string()),
            ("per_page", PER_PAGE.to_string()),
            ("page", page.to_string()),
            ("sparkline", "false".to_string()),
        ];
        let resp = match self.client.get(&self.url).query(&query).send().await {
            Ok(r) => r,
            Err(e) => return PageOutcome::Failed(e.to_string()),
        };
        match resp.status().as_u16() {
            429 => PageOutcome::Throttled(
                resp.headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok()),
            ),
            403 => PageOutcome::Forbidden,
            s if !(200..300).contains(&s) => PageOutcome::Failed(format!("HTTP {s}")),
            _ => match resp.json::<Vec<serde_json::Value>>().await {
                Ok(rows) => PageOutcome::Rows(rows),
                Err(e) => PageOutcome::Failed(format!("unreadable page: {e}")),
            },
        }
    }
}

struct Cache {
    caps: HashMap<String, f64>,
    /// `None` until the first refresh attempt, successful or not.
    next_refresh: Option<Instant>,
}

/// Bulk top-N market caps from CoinGecko's free API, cached for a TTL.
pub struct CoinGeckoProvider {
    source: Box<dyn PageSource>,
    ttl: Duration,
    include_unknown: bool,
    cache: Mutex<Cache>,
}

impl CoinGeckoProvider {
    pub fn new(cfg: &MarketCapConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::with_source(cfg, Box::new(HttpPageSource::new(COINGECKO_MARKETS_URL)?)))
    }

    pub fn with_source(cfg: &MarketCapConfig, source: Box<dyn PageSource>) -> Self {
        CoinGeckoProvider {
            source,
            ttl: Duration::from_secs(cfg.cache_minutes.saturating_mul(60)),
            include_unknown: cfg.include_unknown,
            cache: Mutex::new(Cache { caps: HashMap::new(), next_refresh: None }),
        }
    }

    async fn get(&self, base_asset: &str) -> Option<f64> {
        let mut cache = self.cache.lock().await;
        let due = cache.next_refresh.map_or(true, |at| Instant::now() >= at);
        if due {
            self.refresh(&mut cache).await;
        }
        cache.caps.get(&normalise(base_asset)).copied()
    }

    /// Keeps the previous cache when nothing could be fetched. A failed
    /// attempt is retried after `FAILED_REFRESH_RETRY_SECS`, not per lookup.
    async fn refresh(&self, cache: &mut Cache) {
        log::info!("Refreshing market-cap cache from CoinGecko…");
        let mut caps: HashMap<String, f64> = HashMap::new();
        let mut page = 1;
        let mut errors = 0;
        let mut consecutive_429 = 0;

        while page <= MAX_PAGES && errors < MAX_PAGE_ERRORS {
            let rows = match self.source.page(page).await {
                PageOutcome::Rows(rows) => rows,
                PageOutcome::Throttled(advised) => {
                    consecutive_429 += 1;
                    if consecutive_429 >= MAX_CONSECUTIVE_429 {
                        log::warn!(
                            "CoinGecko: {} consecutive 429s — stopping at page {} ({} coins so far)",
                            consecutive_429, page, caps.len()
                        );
                        break;
                    }
                    let wait = advised.unwrap_or(90) + consecutive_429 as u64 * 30;
                    log::warn!("CoinGecko 429 on page {} — waiting {}s", page, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                PageOutcome::Forbidden => {
                    log::error!("CoinGecko 403 — stopping at page {} ({} coins)", page, caps.len());
                    break;
                }
                PageOutcome::Failed(reason) => {
                    log::warn!("CoinGecko error on page {}: {}", page, reason);
                    errors += 1;
                    tokio::time::sleep(Duration::from_secs(ERROR_SLEEP_SECS)).await;
                    continue;
                }
            };
            if rows.is_empty() {
                break;
            }
            consecutive_429 = 0;
            errors = 0;
            for coin in &rows {
                let sym = coin["symbol"].as_str().unwrap_or("").to_uppercase();
                if let (false, Some(mcap)) = (sym.is_empty(), coin["market_cap"].as_f64()) {
                    // first (largest) coin wins on ticker collisions
                    caps.entry(sym).or_insert(mcap);
                }
            }
            log::debug!("CoinGecko: page {} OK — {} coins cached", page, caps.len());
            page += 1;
            if page <= MAX_PAGES {
                tokio::time::sleep(Duration::from_secs(PAGE_DELAY_SECS)).await;
            }
        }

        let now = Instant::now();
        if !caps.is_empty() {
            log::info!("Market-cap cache updated: {} coins", caps.len());
            cache.caps = caps;
            cache.next_refresh = Some(now + self.ttl);
            return;
        }
        let retry = self.ttl.min(Duration::from_secs(FAILED_REFRESH_RETRY_SECS));
        if cache.caps.is_empty() {
            log::error!(
                "CoinGecko refresh failed and no previous cache — all coins unknown for {}s",
                retry.as_secs()
            );
        } else {
            log::warn!("CoinGecko refresh failed — keeping previous cache ({} coins)", cache.caps.len());
        }
        cache.next_refresh = Some(now + retry);
    }
}

pub fn passes_cap(mcap: Option<f64>, max_usd: f64, include_unknown: bool) -> bool {
    match mcap {
        Some(v) => v <= max_usd,
        None => include_unknown,
    }
}

#[async_trait]
impl MarketCapFilter for CoinGeckoProvider {
    async fn passes(&self, base_asset: &str, max_usd: f64) -> bool {
        let mcap = self.get(base_asset).await;
        if mcap.is_none() {
            log::debug!(
                "No mcap for {} — {}",
                base_asset,
                if self.include_unknown { "including" } else { "excluding" }
            );
        }
        passes_cap(mcap, max_usd, self.include_unknown)
    }

    async fn label(&self, base_asset: &str) -> String {
        format_mcap(self.get(base_asset).await)
    }
}
