use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::binance_api::MarketData;
use crate::config::{ScannerConfig, ALERT_PAUSE_MS, BTC_SYMBOL};
use crate::cooldown::CooldownSuppressor;
use crate::filters;
use crate::governor::ApiError;
use crate::market_cap::MarketCapFilter;
use crate::run_flag::RunFlag;
use crate::telegram::Notifier;
use crate::tracker::SignalTracker;
use crate::types::{CandleColor, Signal, SignalEvent, SignalSnapshot, SymbolInfo};

/// First stage a symbol failed, with the measured value.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    OnCooldown,
    InsufficientCandles { got: usize, needed: usize },
    NoVolumeBaseline,
    LowVolume { ratio: f64, threshold: f64 },
    NotBullish(CandleColor),
    UpperWick { pct: f64, max: f64 },
    SmallBody { pct: f64, min: f64 },
    NoBreakout { close: f64, level: Option<f64> },
    OpenInterestUnavailable,
    LowOpenInterest { change_pct: f64, min: f64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::OnCooldown => write!(f, "on cooldown"),
            Rejection::InsufficientCandles { got, needed } => {
                write!(f, "insufficient candles ({got} < {needed})")
            }
            Rejection::NoVolumeBaseline => write!(f, "no volume baseline"),
            Rejection::LowVolume { ratio, threshold } => write!(f, "volume {ratio:.2}x < {threshold}x"),
            Rejection::NotBullish(color) => write!(f, "candle is {}", color.as_str()),
            Rejection::UpperWick { pct, max } => write!(f, "upper wick {pct:.1}% > {max}%"),
            Rejection::SmallBody { pct, min } => write!(f, "body {pct:.1}% < {min}%"),
            Rejection::NoBreakout { close, level } => match level {
                Some(l) => write!(f, "no breakout (close {close} <= {l})"),
                None => write!(f, "no breakout level"),
            },
            Rejection::OpenInterestUnavailable => write!(f, "open interest unavailable"),
            Rejection::LowOpenInterest { change_pct, min } => write!(f, "OI {change_pct:+.2}% < {min}%"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Rejected(Rejection),
    Emitted(Signal),
}

pub struct Scanner {
    cfg: ScannerConfig,
    max_mcap: f64,
    market: Arc<dyn MarketData>,
    mcap: Arc<dyn MarketCapFilter>,
    cooldown: Arc<CooldownSuppressor>,
    tracker: Option<Arc<SignalTracker>>,
    notifier: Arc<dyn Notifier>,
    running: RunFlag,
}

impl Scanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: ScannerConfig,
        max_mcap: f64,
        market: Arc<dyn MarketData>,
        mcap: Arc<dyn MarketCapFilter>,
        cooldown: Arc<CooldownSuppressor>,
        tracker: Option<Arc<SignalTracker>>,
        notifier: Arc<dyn Notifier>,
        running: RunFlag,
    ) -> Self {
        Scanner { cfg, max_mcap, market, mcap, cooldown, tracker, notifier, running }
    }

    // ── Pipeline ──────────────────────────────────────────────────────────────

    /// Runs the filter stages in order, stopping at the first failure.
    /// `Err` only when candle data could not be fetched at all.
    pub async fn analyse(
        &self,
        info: &SymbolInfo,
        marks: &HashMap<String, f64>,
        now_ms: i64,
    ) -> Result<Verdict, ApiError> {
        let symbol = info.symbol.as_str();
        let cfg = &self.cfg;
        let reject = |r: Rejection| -> Result<Verdict, ApiError> {
            log::debug!("[{}] rejected: {}", symbol, r);
            Ok(Verdict::Rejected(r))
        };

        // 1. cooldown, before any request
        if self.cooldown.is_suppressed(symbol, now_ms) {
            return reject(Rejection::OnCooldown);
        }

        // 2. data sufficiency
        let needed = filters::candles_needed(cfg);
        let candles = self.market.closed_klines(symbol, &cfg.timeframe, needed).await?;
        let Some(latest) = candles.last().filter(|_| candles.len() >= needed) else {
            return reject(Rejection::InsufficientCandles { got: candles.len(), needed });
        };

        // 3. volume anomaly
        let Some(volume) = filters::volume_ratio(&candles, cfg.volume_recent_candles, cfg.volume_baseline_candles)
        else {
            return reject(Rejection::NoVolumeBaseline);
        };
        if volume.ratio < cfg.volume_multiplier {
            return reject(Rejection::LowVolume { ratio: volume.ratio, threshold: cfg.volume_multiplier });
        }
        log::info!("[{}] 📊 Volume spike {:.2}x (threshold {}x)", symbol, volume.ratio, cfg.volume_multiplier);

        // 4. candle quality
        let candle = filters::candle_metrics(latest);
        if cfg.bullish_candle_required && candle.color != CandleColor::Green {
            return reject(Rejection::NotBullish(candle.color));
        }
        if cfg.max_upper_wick_pct > 0.0 && candle.upper_wick_pct > cfg.max_upper_wick_pct {
            return reject(Rejection::UpperWick { pct: candle.upper_wick_pct, max: cfg.max_upper_wick_pct });
        }
        if cfg.min_body_pct > 0.0 && candle.body_pct < cfg.min_body_pct {
            return reject(Rejection::SmallBody { pct: candle.body_pct, min: cfg.min_body_pct });
        }
        log::info!(
            "[{}] 🕯 Candle OK: {} body {:.0}% wick {:.0}%",
            symbol, candle.color.as_str(), candle.body_pct, candle.upper_wick_pct
        );

        // 5. breakout
        let breakout = if cfg.breakout_enabled {
            match filters::breakout(&candles, cfg.breakout_lookback) {
                Some(b) => {
                    log::info!("[{}] 🔺 Breakout +{:.2}% above {}", symbol, b.margin_pct, b.level);
                    Some(b)
                }
                None => {
                    return reject(Rejection::NoBreakout {
                        close: latest.close,
                        level: filters::breakout_level(&candles, cfg.breakout_lookback),
                    })
                }
            }
        } else {
            None
        };

        // 6. open interest
        let oi_change_pct = if cfg.open_interest_enabled {
            let history = match self
                .market
                .open_interest_history(symbol, &cfg.timeframe, cfg.open_interest_periods + 1)
                .await
            {
                Ok(h) => h,
                Err(e) => {
                    log::warn!("[{}] OI fetch failed: {}", symbol, e);
                    return reject(Rejection::OpenInterestUnavailable);
                }
            };
            let Some(change) = filters::oi_change_pct(&history, cfg.open_interest_periods) else {
                return reject(Rejection::OpenInterestUnavailable);
            };
            if change < cfg.open_interest_min_increase_pct {
                return reject(Rejection::LowOpenInterest { change_pct: change, min: cfg.open_interest_min_increase_pct });
            }
            log::info!("[{}] 📈 OI {:+.2}%", symbol, change);
            Some(change)
        } else {
            None
        };

        // 7. emission
        self.cooldown.record(symbol, now_ms);
        let snapshot = SignalSnapshot {
            timeframe: cfg.timeframe.clone(),
            mcap: self.mcap.label(&info.base_asset).await,
            volume,
            vol_threshold: cfg.volume_multiplier,
            candle,
            candle_open_ms: latest.open_time,
            breakout,
            oi_change_pct,
            trend: filters::trend_summary(&candles, cfg.trend_candles),
            btc_price: marks.get(BTC_SYMBOL).copied(),
        };
        let entry = marks.get(symbol).copied().unwrap_or(0.0);
        let signal = Signal::new(symbol, entry, now_ms, snapshot);
        log::info!("[{}] 🚨 SIGNAL @ {}", symbol, entry);

        if let Some(tracker) = &self.tracker {
            tracker.record(signal.clone());
        }
        Ok(Verdict::Emitted(signal))
    }

    // ── Cycle ─────────────────────────────────────────────────────────────────

    async fn targets(&self) -> Vec<SymbolInfo> {
        let symbols = match self.market.perpetual_symbols().await {
            Ok(s) => s,
            Err(e) => {
                log::error!("Failed to list symbols: {}", e);
                return Vec::new();
            }
        };
        let mut targets = Vec::with_capacity(symbols.len());
        for info in symbols {
            if self.cfg.excluded_symbols.iter().any(|s| s == &info.symbol) {
                continue;
            }
            if self.mcap.passes(&info.base_asset, self.max_mcap).await {
                targets.push(info);
            }
        }
        targets
    }

    /// One pass over every target symbol; returns the number of signals emitted.
    pub async fn run_cycle(&self) -> usize {
        let started = Instant::now();
        let targets = self.targets().await;
        let marks = match self.market.mark_prices().await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Mark prices unavailable, entries will be unknown: {}", e);
                HashMap::new()
            }
        };
        log::info!("── Scan cycle: {} symbols ──", targets.len());

        let mut emitted = 0;
        for info in &targets {
            if !self.running.is_running() {
                log::info!("Scan interrupted by shutdown");
                break;
            }
            let now_ms = chrono::Utc::now().timestamp_millis();
            match self.analyse(info, &marks, now_ms).await {
                Ok(Verdict::Emitted(signal)) => {
                    emitted += 1;
                    if !self.notifier.notify(&SignalEvent::SignalEmitted(signal)).await {
                        log::error!("[{}] Failed to send alert", info.symbol);
                    }
                    tokio::time::sleep(Duration::from_millis(ALERT_PAUSE_MS)).await;
                }
                Ok(Verdict::Rejected(_)) => {}
                Err(e) => log::warn!("[{}] skipped: {}", info.symbol, e),
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        let pruned = self.cooldown.prune(now_ms);
        log::info!(
            "Cycle done in {:.1}s: {} signals, {} on cooldown ({} pruned)",
            started.elapsed().as_secs_f64(), emitted, self.cooldown.active_count(now_ms), pruned
        );
        emitted
    }

    pub async fn run(&self, banner: &str) {
        if !self.notifier.send_text(banner).await {
            log::warn!("Startup banner not delivered");
        }
        let interval = Duration::from_secs(self.cfg.scan_interval_seconds);
        while self.running.is_running() {
            let started = Instant::now();
            self.run_cycle().await;
            let rest = interval.saturating_sub(started.elapsed());
            log::info!("Next scan in {}s", rest.as_secs());
            self.running.sleep(rest).await;
        }
        log::info!("Scanner stopped");
    }
}
