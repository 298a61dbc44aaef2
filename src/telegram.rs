use std::time::Duration;

use async_trait::async_trait;

use crate::config::{required_env, Config, ConfigError, TELEGRAM_API_URL};
use crate::types::{CandleColor, Signal, SignalEvent};

const SEND_ATTEMPTS: u32 = 3;
/// Telegram caps messages at 4096 characters.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Delivery boundary for scanner and tracker events. Returns whether the
/// message went out; delivery failures never propagate into the core.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &SignalEvent) -> bool;
    async fn send_text(&self, text: &str) -> bool;
}

/// A chat message from `getUpdates`. `text` is empty for non-text updates.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub update_id: i64,
    pub chat_id: String,
    pub text: String,
}

#[derive(Clone)]
pub struct TelegramBot {
    client: reqwest::Client,
    base: String,
    chat_id: String,
}

impl TelegramBot {
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = required_env("TELEGRAM_TOKEN")?;
        let chat_id = required_env("TELEGRAM_CHAT_ID")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("telegram client: {e}")))?;
        Ok(TelegramBot {
            client,
            base: format!("{}/bot{}", TELEGRAM_API_URL, token),
            chat_id,
        })
    }

    /// `getMe` round-trip; the process does not start without it.
    pub async fn validate(&self) -> bool {
        let url = format!("{}/getMe", self.base);
        match self.client.get(&url).send().await {
            Ok(resp) => match resp.json::<serde_json::Value>().await {
                Ok(body) if body["ok"].as_bool() == Some(true) => {
                    log::info!(
                        "Telegram bot validated: @{}",
                        body["result"]["username"].as_str().unwrap_or("?")
                    );
                    true
                }
                Ok(body) => {
                    log::error!("Telegram validation failed: {}", body);
                    false
                }
                Err(e) => {
                    log::error!("Telegram validation error: {}", e);
                    false
                }
            },
            Err(e) => {
                log::error!("Telegram validation error: {}", e);
                false
            }
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Long-polls `getUpdates` from `offset`. An `ok: false` reply reads as no updates.
    pub async fn poll_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<IncomingMessage>, reqwest::Error> {
        let url = format!("{}/getUpdates", self.base);
        let query = [
            ("offset", offset.to_string()),
            ("timeout", timeout_secs.to_string()),
            ("allowed_updates", r#"["message"]"#.to_string()),
        ];
        let body: serde_json::Value = self.client.get(&url).query(&query).send().await?.json().await?;
        Ok(parse_updates(&body))
    }

    pub async fn send(&self, text: &str) -> bool {
        let url = format!("{}/sendMessage", self.base);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        for attempt in 1..=SEND_ATTEMPTS {
            let resp = match self.client.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("Telegram send failed (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            let reply: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("Telegram reply unreadable (attempt {}): {}", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };
            if reply["ok"].as_bool() == Some(true) {
                let preview: String = text.chars().take(80).collect();
                log::info!("Telegram sent: {}", preview.replace('\n', " "));
                return true;
            }
            if reply["error_code"].as_i64() == Some(429) {
                let wait = reply["parameters"]["retry_after"].as_u64().unwrap_or(30);
                log::warn!("Telegram 429 — waiting {}s", wait);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            log::warn!("Telegram error: {}", reply);
            return false;
        }
        false
    }
}

#[async_trait]
impl Notifier for TelegramBot {
    async fn notify(&self, event: &SignalEvent) -> bool {
        self.send(&format_event(event)).await
    }

    async fn send_text(&self, text: &str) -> bool {
        self.send(text).await
    }
}

pub fn parse_updates(body: &serde_json::Value) -> Vec<IncomingMessage> {
    if body["ok"].as_bool() != Some(true) {
        return Vec::new();
    }
    let Some(results) = body["result"].as_array() else { return Vec::new() };
    results
        .iter()
        .filter_map(|u| {
            let update_id = u["update_id"].as_i64()?;
            let msg = &u["message"];
            let chat_id = match &msg["chat"]["id"] {
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::String(s) => s.clone(),
                _ => String::new(),
            };
            let text = msg["text"].as_str().unwrap_or("").trim().to_string();
            Some(IncomingMessage { update_id, chat_id, text })
        })
        .collect()
}

/// Splits on line breaks so each part fits in one message.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let idx = match rest[..cut].rfind('\n') {
            Some(i) if i > 0 => i,
            _ => cut,
        };
        parts.push(rest[..idx].to_string());
        rest = rest[idx..].trim_start_matches('\n');
    }
    if !rest.trim().is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

// ── Formatting ───────────────────────────────────────────────────────────────

pub fn fmt_price(price: f64) -> String {
    if price <= 0.0 {
        "N/A".to_string()
    } else if price >= 1000.0 {
        format!("${price:.2}")
    } else if price >= 1.0 {
        format!("${price:.4}")
    } else if price >= 0.001 {
        format!("${price:.6}")
    } else {
        format!("${price:.8}")
    }
}

pub fn fmt_vol_usd(vol: f64) -> String {
    if vol >= 1e9 {
        format!("${:.1}B", vol / 1e9)
    } else if vol >= 1e6 {
        format!("${:.1}M", vol / 1e6)
    } else if vol >= 1e3 {
        format!("${:.0}K", vol / 1e3)
    } else {
        format!("${vol:.0}")
    }
}

pub(crate) fn color_icon(color: CandleColor) -> &'static str {
    match color {
        CandleColor::Green => "🟢",
        CandleColor::Red => "🔴",
        CandleColor::Doji => "⚪",
    }
}

pub(crate) fn fmt_time(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "?".to_string())
}

pub fn format_event(event: &SignalEvent) -> String {
    match event {
        SignalEvent::SignalEmitted(sig) => format_signal(sig),
        SignalEvent::TakeProfitHit { signal, target_pct, highest_pct, current_pct } => format!(
            "🎯 <b>TARGET +{target_pct}% HIT — {}</b>\n\
             Entry: <code>{}</code>  Peak: <code>{}</code> ({highest_pct:+.2}%)\n\
             Now:   <code>{}</code> ({current_pct:+.2}%)\n\
             Alerted: {}",
            signal.symbol,
            fmt_price(signal.entry_price),
            fmt_price(signal.highest_price),
            fmt_price(signal.current_price),
            fmt_time(signal.alert_time_ms),
        ),
        SignalEvent::ReversalWarning { signal, drop_pct, highest_pct, current_pct } => format!(
            "⚠️ <b>REVERSAL WARNING — {}</b>\n\
             Peak: <code>{}</code> ({highest_pct:+.2}%)\n\
             Now:  <code>{}</code> ({current_pct:+.2}%)\n\
             Drop from peak: <code>{drop_pct:.2}%</code>",
            signal.symbol,
            fmt_price(signal.highest_price),
            fmt_price(signal.current_price),
        ),
    }
}

fn format_signal(sig: &Signal) -> String {
    let s = &sig.snapshot;
    let mut lines = vec![
        "🚨 <b>VOLUME SPIKE ALERT</b>".to_string(),
        "━".repeat(28),
        format!("📌 <b>Symbol:</b>    {}", sig.symbol),
        format!("⏱  <b>Timeframe:</b> {}", s.timeframe),
        format!("💰 <b>Market Cap:</b> {}", s.mcap),
        format!("💵 <b>Price:</b>     {}", fmt_price(sig.entry_price)),
        String::new(),
        format!(
            "📊 <b>Volume:</b>  {:.2}x  ({} vs {} avg)",
            s.volume.ratio,
            fmt_vol_usd(s.volume.recent_avg),
            fmt_vol_usd(s.volume.baseline_avg)
        ),
        format!(
            "🕯  <b>Candle:</b>   {} {}  |  Body: {:.0}%  |  Wick: {:.0}%",
            color_icon(s.candle.color),
            s.candle.color.as_str(),
            s.candle.body_pct,
            s.candle.upper_wick_pct
        ),
    ];
    lines.push(match &s.breakout {
        Some(b) => format!("🔺 <b>Breakout:</b>  ✅ +{:.2}% above {}", b.margin_pct, fmt_price(b.level)),
        None => "🔺 <b>Breakout:</b>  ⚫ Disabled".to_string(),
    });
    lines.push(match s.oi_change_pct {
        Some(pct) => format!("📈 <b>OI Change:</b> {} {:+.2}%", if pct >= 0.0 { "📈" } else { "📉" }, pct),
        None => "📈 <b>OI Change:</b> ⚫ Disabled".to_string(),
    });
    if !s.trend.pattern.is_empty() {
        let emoji = s.trend.pattern.replace('G', "🟢").replace('R', "🔴");
        lines.push(format!(
            "📊 <b>Trend:</b>    {}/{} green  {}",
            s.trend.green_count, s.trend.total, emoji
        ));
    }
    if let Some(btc) = s.btc_price {
        lines.push(format!("₿  <b>BTC:</b>       {}", fmt_price(btc)));
    }
    lines.push(String::new());
    lines.push(format!("🕐 <b>Candle:</b>   {}", fmt_time(s.candle_open_ms)));
    lines.push(format!("🕐 <b>Sent:</b>     {}", fmt_time(sig.alert_time_ms)));
    lines.join("\n")
}

/// Sent once at startup: which stages are enabled and with what thresholds.
pub fn format_banner(cfg: &Config) -> String {
    let s = &cfg.scanner;
    let on_off = |on: bool| if on { "✅" } else { "⚫" };
    let mut lines = vec![
        "🤖 <b>Volume Scanner started</b>".to_string(),
        "━".repeat(28),
        format!("⏱  Timeframe: {}  |  every {}s", s.timeframe, s.scan_interval_seconds),
        format!(
            "📊 Volume: ≥{}x ({} vs {} candles)",
            s.volume_multiplier, s.volume_recent_candles, s.volume_baseline_candles
        ),
        format!(
            "🕯  Candle: bullish {}  |  wick ≤{}%  |  body ≥{}%",
            on_off(s.bullish_candle_required), s.max_upper_wick_pct, s.min_body_pct
        ),
        format!("🔺 Breakout: {} ({} candles)", on_off(s.breakout_enabled), s.breakout_lookback),
        format!(
            "📈 OI: {} (≥{}% over {} periods)",
            on_off(s.open_interest_enabled), s.open_interest_min_increase_pct, s.open_interest_periods
        ),
        format!("⏳ Cooldown: {}h", s.cooldown_hours),
    ];
    if cfg.market_cap.enabled {
        lines.push(format!(
            "💰 Max market cap: {}{}",
            fmt_vol_usd(cfg.market_cap.max_usd),
            if cfg.market_cap.include_unknown { " (unknown included)" } else { "" }
        ));
    }
    if cfg.tracker.enabled {
        let targets: Vec<String> = cfg.tracker.take_profit_targets.iter().map(|t| format!("+{t}%")).collect();
        lines.push(format!(
            "🎯 Tracking {}h  |  TP {}",
            cfg.tracker.max_age_hours,
            targets.join(" ")
        ));
    }
    lines.join("\n")
}
