use serde::Deserialize;
use std::path::{Path, PathBuf};

// ─── Endpoints ────────────────────────────────────────────────────────────────
pub const BINANCE_REST_URL: &str = "https://fapi.binance.com";
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";
pub const COINGECKO_MARKETS_URL: &str = "https://api.coingecko.com/api/v3/coins/markets";
pub const USER_AGENT: &str = "BinanceFuturesScanner/1.0";

// TELEGRAM_TOKEN, TELEGRAM_CHAT_ID (required) and BINANCE_API_KEY (optional)
// are read from environment variables at runtime.
pub const CONFIG_PATH_ENV: &str = "SCANNER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// ─── Request governor ─────────────────────────────────────────────────────────
/// Documented Binance futures limit per rolling minute.
pub const MAX_WEIGHT_PER_MIN: u32 = 2400;
pub const SAFE_WEIGHT_CEILING: u32 = 2000;
pub const WEIGHT_WINDOW_SECS: u64 = 60;
pub const WEIGHT_SLEEP_MARGIN_MS: u64 = 500;
pub const REQUEST_DELAY_MS: u64 = 100;
pub const REQUEST_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_AFTER_DEFAULT_SECS: u64 = 60;
pub const IP_BAN_SLEEP_SECS: u64 = 120;
pub const MAX_THROTTLE_RETRIES: u32 = 10;
pub const HTTP_TIMEOUT_SECS: u64 = 30;
pub const SYMBOLS_TTL_SECS: u64 = 300;
pub const MAX_INTERVAL_SECS: u64 = 86_400;
pub const MAX_CACHE_MINUTES: u64 = 10_080;
pub const SHUTDOWN_GRACE_SECS: u64 = 20;
pub const COMMAND_POLL_SECS: u64 = 10;

// ─── Defaults ─────────────────────────────────────────────────────────────────
pub const BTC_SYMBOL: &str = "BTCUSDT";
pub const ALERT_PAUSE_MS: u64 = 300;
pub const TRANSITION_PAUSE_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("{0} env var not set")]
    MissingEnv(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub tracker: TrackerConfig,
    pub rate_limit: RateLimitConfig,
    pub market_cap: MarketCapConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub timeframe: String,
    pub scan_interval_seconds: u64,
    pub volume_recent_candles: usize,
    pub volume_baseline_candles: usize,
    pub volume_multiplier: f64,
    pub bullish_candle_required: bool,
    /// 0 disables the ceiling.
    pub max_upper_wick_pct: f64,
    /// 0 disables the floor.
    pub min_body_pct: f64,
    pub breakout_enabled: bool,
    pub breakout_lookback: usize,
    pub open_interest_enabled: bool,
    pub open_interest_periods: usize,
    pub open_interest_min_increase_pct: f64,
    pub trend_candles: usize,
    pub cooldown_hours: f64,
    pub excluded_symbols: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            timeframe: "1h".to_string(),
            scan_interval_seconds: 300,
            volume_recent_candles: 1,
            volume_baseline_candles: 20,
            volume_multiplier: 3.0,
            bullish_candle_required: true,
            max_upper_wick_pct: 40.0,
            min_body_pct: 30.0,
            breakout_enabled: true,
            breakout_lookback: 20,
            open_interest_enabled: false,
            open_interest_periods: 6,
            open_interest_min_increase_pct: 5.0,
            trend_candles: 5,
            cooldown_hours: 12.0,
            excluded_symbols: Vec::new(),
        }
    }
}

impl ScannerConfig {
    pub fn cooldown_ms(&self) -> i64 {
        (self.cooldown_hours * 3_600_000.0) as i64
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub data_dir: PathBuf,
    pub max_age_hours: f64,
    pub price_update_interval_seconds: u64,
    pub take_profit_targets: Vec<u32>,
    pub reversal_alert_enabled: bool,
    pub min_reversal_peak_pct: f64,
    pub reversal_drop_from_peak_pct: f64,
    /// Answer `/active`, `/summary` and `/report` in the alert chat.
    pub commands_enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            enabled: true,
            data_dir: PathBuf::from("data"),
            max_age_hours: 72.0,
            price_update_interval_seconds: 300,
            take_profit_targets: vec![3, 5, 10, 15, 20],
            reversal_alert_enabled: true,
            min_reversal_peak_pct: 3.0,
            reversal_drop_from_peak_pct: 5.0,
            commands_enabled: true,
        }
    }
}

impl TrackerConfig {
    pub fn max_age_ms(&self) -> i64 {
        (self.max_age_hours * 3_600_000.0) as i64
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub weight_ceiling: u32,
    pub request_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            weight_ceiling: SAFE_WEIGHT_CEILING,
            request_delay_ms: REQUEST_DELAY_MS,
            max_attempts: REQUEST_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketCapConfig {
    pub enabled: bool,
    pub max_usd: f64,
    pub include_unknown: bool,
    pub cache_minutes: u64,
}

impl Default for MarketCapConfig {
    fn default() -> Self {
        MarketCapConfig {
            enabled: true,
            max_usd: 500_000_000.0,
            include_unknown: true,
            cache_minutes: 120,
        }
    }
}

impl Config {
    /// Path from `SCANNER_CONFIG`, falling back to `config.json`.
    pub fn path_from_env() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!("Config {} not found — using defaults", path.display());
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sc = &self.scanner;
        let invalid = |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if sc.timeframe.trim().is_empty() {
            return invalid("scanner.timeframe is empty");
        }
        if sc.volume_recent_candles == 0 || sc.volume_baseline_candles == 0 {
            return invalid("scanner volume windows must be at least 1 candle");
        }
        if sc.volume_multiplier <= 0.0 {
            return invalid("scanner.volume_multiplier must be positive");
        }
        if sc.breakout_enabled && sc.breakout_lookback == 0 {
            return invalid("scanner.breakout_lookback must be at least 1");
        }
        if sc.open_interest_enabled && sc.open_interest_periods == 0 {
            return invalid("scanner.open_interest_periods must be at least 1");
        }
        if sc.scan_interval_seconds > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "scanner.scan_interval_seconds must be at most {MAX_INTERVAL_SECS}"
            )));
        }
        if sc.cooldown_hours < 0.0 {
            return invalid("scanner.cooldown_hours must not be negative");
        }
        if self.tracker.max_age_hours <= 0.0 {
            return invalid("tracker.max_age_hours must be positive");
        }
        let every = self.tracker.price_update_interval_seconds;
        if every == 0 || every > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "tracker.price_update_interval_seconds must be within 1..={MAX_INTERVAL_SECS}"
            )));
        }
        if self.market_cap.cache_minutes > MAX_CACHE_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "market_cap.cache_minutes must be at most {MAX_CACHE_MINUTES}"
            )));
        }
        let rl = &self.rate_limit;
        if rl.weight_ceiling == 0 || rl.weight_ceiling > MAX_WEIGHT_PER_MIN {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.weight_ceiling must be within 1..={MAX_WEIGHT_PER_MIN}"
            )));
        }
        if rl.max_attempts == 0 {
            return invalid("rate_limit.max_attempts must be at least 1");
        }
        Ok(())
    }
}

pub fn required_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(ConfigError::MissingEnv(name))
}

pub fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
