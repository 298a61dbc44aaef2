//! Chat commands answered from the tracker store. Queries never write:
//! fresh mark prices are overlaid on a loaded copy for display only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::binance_api::MarketData;
use crate::config::{ALERT_PAUSE_MS, BTC_SYMBOL, COMMAND_POLL_SECS};
use crate::run_flag::RunFlag;
use crate::telegram::{
    color_icon, fmt_price, fmt_time, fmt_vol_usd, split_message, IncomingMessage, TelegramBot, MAX_MESSAGE_LEN,
};
use crate::tracker::{PerformanceSummary, SignalTracker};
use crate::types::{pct_change, ArchivedSignal, Signal};

const POLL_ERROR_SLEEP_SECS: u64 = 5;
const UNKNOWN_REPLY: &str = "❓ Unknown command. Send /help for available commands.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// All active signals, or one symbol in detail.
    Report(Option<String>),
    Summary,
    Active,
    Help,
    Unknown(String),
}

impl Command {
    /// `None` for plain chat text. `/cmd@botname` addresses the same command.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let mut parts = text.split_whitespace();
        let head = parts.next()?.to_lowercase();
        let name = head.split('@').next().unwrap_or_default();
        Some(match name {
            "/report" => Command::Report(parts.next().map(usdt_symbol)),
            "/summary" => Command::Summary,
            "/active" => Command::Active,
            "/help" | "/start" => Command::Help,
            other => Command::Unknown(other.to_string()),
        })
    }
}

fn usdt_symbol(arg: &str) -> String {
    let sym = arg.to_uppercase();
    if sym.ends_with("USDT") {
        sym
    } else {
        format!("{sym}USDT")
    }
}

/// Answers commands for the owner chat.
pub struct CommandDesk {
    tracker: Arc<SignalTracker>,
    market: Arc<dyn MarketData>,
}

impl CommandDesk {
    pub fn new(tracker: Arc<SignalTracker>, market: Arc<dyn MarketData>) -> Self {
        CommandDesk { tracker, market }
    }

    /// Reply for one update, or `None` when it is not ours to answer.
    pub async fn handle(&self, msg: &IncomingMessage, owner_chat: &str, now_ms: i64) -> Option<String> {
        if msg.chat_id != owner_chat {
            log::debug!("Ignoring update {} from chat {}", msg.update_id, msg.chat_id);
            return None;
        }
        let cmd = Command::parse(&msg.text)?;
        log::info!("Command received: {:?}", cmd);
        Some(self.respond(&cmd, now_ms).await)
    }

    pub async fn respond(&self, cmd: &Command, now_ms: i64) -> String {
        match cmd {
            Command::Active => {
                format_active(&self.tracker.active_signals(now_ms), self.tracker.max_age_hours(), now_ms)
            }
            Command::Summary => {
                let prices = self.fresh_prices().await;
                let active = with_prices(self.tracker.active_signals(now_ms), &prices);
                format_summary(&active, &self.tracker.history())
            }
            Command::Report(symbol) => {
                let prices = self.fresh_prices().await;
                let active = with_prices(self.tracker.active_signals(now_ms), &prices);
                if active.is_empty() {
                    return "📊 No active signals in tracking window.".to_string();
                }
                let Some(symbol) = symbol else {
                    return format_report(&active, now_ms);
                };
                let matches: Vec<String> = active
                    .iter()
                    .filter(|s| &s.symbol == symbol)
                    .map(|s| format_detail(s, prices.get(BTC_SYMBOL).copied(), now_ms))
                    .collect();
                if matches.is_empty() {
                    format!("📊 No active signals found for <b>{symbol}</b>")
                } else {
                    matches.join("\n\n")
                }
            }
            Command::Help => format_help(self.tracker.max_age_hours(), self.tracker.update_interval_secs()),
            Command::Unknown(_) => UNKNOWN_REPLY.to_string(),
        }
    }

    async fn fresh_prices(&self) -> HashMap<String, f64> {
        match self.market.mark_prices().await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("Command prices unavailable, showing stored values: {}", e);
                HashMap::new()
            }
        }
    }
}

/// `getUpdates` loop feeding a [`CommandDesk`].
pub struct CommandListener {
    bot: TelegramBot,
    desk: CommandDesk,
}

impl CommandListener {
    pub fn new(bot: TelegramBot, desk: CommandDesk) -> Self {
        CommandListener { bot, desk }
    }

    pub async fn run(self, running: RunFlag) {
        log::info!("Telegram command listener started");
        // commands queued while the bot was down are dropped
        let mut offset = match self.bot.poll_updates(0, 0).await {
            Ok(backlog) => match backlog.last() {
                Some(last) => {
                    log::info!("Skipped {} old queued messages", backlog.len());
                    last.update_id + 1
                }
                None => 0,
            },
            Err(e) => {
                log::warn!("Command backlog poll failed: {}", e);
                0
            }
        };

        while running.is_running() {
            let updates = match self.bot.poll_updates(offset, COMMAND_POLL_SECS).await {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("Command poll failed: {}", e);
                    running.sleep(Duration::from_secs(POLL_ERROR_SLEEP_SECS)).await;
                    continue;
                }
            };
            for update in updates {
                offset = offset.max(update.update_id + 1);
                let now_ms = chrono::Utc::now().timestamp_millis();
                let Some(reply) = self.desk.handle(&update, self.bot.chat_id(), now_ms).await else {
                    continue;
                };
                for part in split_message(&reply, MAX_MESSAGE_LEN) {
                    if !self.bot.send(&part).await {
                        log::error!("Failed to send command reply");
                    }
                    tokio::time::sleep(Duration::from_millis(ALERT_PAUSE_MS)).await;
                }
            }
        }
        log::info!("Command listener stopped");
    }
}

// ── Formatting ───────────────────────────────────────────────────────────────

fn with_prices(mut signals: Vec<Signal>, prices: &HashMap<String, f64>) -> Vec<Signal> {
    for sig in signals.iter_mut() {
        if let Some(&p) = prices.get(&sig.symbol) {
            sig.current_price = p;
            sig.highest_price = sig.highest_price.max(p);
        }
    }
    signals
}

fn fmt_pct(pct: f64) -> String {
    format!("{} {:+.2}%", if pct >= 0.0 { "📈" } else { "📉" }, pct)
}

fn fmt_age(alert_ms: i64, now_ms: i64) -> String {
    let mins = (now_ms - alert_ms).max(0) / 60_000;
    if mins < 60 {
        format!("{mins}m ago")
    } else {
        format!("{}h {}m ago", mins / 60, mins % 60)
    }
}

fn ratio(n: usize, total: usize) -> String {
    format!("{n}/{total} ({:.0}%)", n as f64 / total as f64 * 100.0)
}

pub fn format_active(signals: &[Signal], window_hours: f64, now_ms: i64) -> String {
    if signals.is_empty() {
        return "📡 No active signals being tracked.".to_string();
    }
    let mut lines = vec![format!("📡 <b>ACTIVE SIGNALS ({})</b>", signals.len()), "━".repeat(28), String::new()];
    for sig in signals {
        lines.push(format!(
            "• <b>{}</b>  {}  {}  {:.1}x  {}",
            sig.symbol,
            color_icon(sig.snapshot.candle.color),
            fmt_age(sig.alert_time_ms, now_ms),
            sig.snapshot.volume.ratio,
            sig.snapshot.mcap
        ));
    }
    lines.push(String::new());
    lines.push(format!("Window: {window_hours}h | Send /report SYMBOL for details"));
    lines.join("\n")
}

pub fn format_summary(active: &[Signal], history: &[ArchivedSignal]) -> String {
    let summary = PerformanceSummary::of(active, history);
    let mut lines = vec!["📊 <b>PERFORMANCE SUMMARY</b>".to_string(), "━".repeat(28), String::new()];

    match &summary.active {
        Some(a) => {
            let known: Vec<&Signal> = active.iter().filter(|s| s.entry_price > 0.0).collect();
            let strong_body = known.iter().filter(|s| s.snapshot.candle.body_pct >= 50.0).count();
            let strong_trend = known
                .iter()
                .filter(|s| {
                    let t = &s.snapshot.trend;
                    t.total > 0 && t.green_count as f64 / t.total as f64 >= 0.6
                })
                .count();
            lines.push(format!("<b>📡 Active Signals ({})</b>", a.count));
            lines.push(format!("   Avg Current:  {}", fmt_pct(a.avg_current_pct)));
            lines.push(format!("   Avg Peak:     {}", fmt_pct(a.avg_peak_pct)));
            lines.push(format!("   Win Now:      {}", ratio(a.winners_now, a.count)));
            lines.push(format!("   Win Peak>2%:  {}", ratio(a.peak_winners, a.count)));
            lines.push(format!("   Best Now:     {}  {}", a.best_now.0, fmt_pct(a.best_now.1)));
            lines.push(format!("   Worst Now:    {}  {}", a.worst_now.0, fmt_pct(a.worst_now.1)));
            lines.push(format!("   Best Peak:    {}  {}", a.best_peak.0, fmt_pct(a.best_peak.1)));
            lines.push(String::new());
            lines.push("<b>📋 Signal Quality Breakdown</b>".to_string());
            lines.push(format!("   Strong body (≥50%):   {}/{}", strong_body, a.count));
            lines.push(format!("   Strong trend (≥60%):  {}/{}", strong_trend, a.count));
        }
        None => lines.push("📡 No active signals".to_string()),
    }
    lines.push(String::new());

    match (&summary.history, summary.history_count) {
        (_, 0) => lines.push("📜 No historical signals yet".to_string()),
        (None, n) => lines.push(format!("📜 History: {n} signals (no exit data)")),
        (Some(h), n) => {
            lines.push(format!("<b>📜 History ({n} signals)</b>"));
            lines.push(format!("   Avg Exit:  {}", fmt_pct(h.avg_exit_pct)));
            if let Some(peak) = h.avg_peak_pct {
                lines.push(format!("   Avg Peak:  {}", fmt_pct(peak)));
            }
            lines.push(format!("   Win Rate:  {}", ratio(h.winners, h.with_exit_data)));
        }
    }
    lines.join("\n")
}

/// Condensed view of every active signal, newest first.
pub fn format_report(signals: &[Signal], now_ms: i64) -> String {
    let mut lines = vec!["📊 <b>SIGNAL PERFORMANCE REPORT</b>".to_string(), "━".repeat(28), String::new()];
    for sig in signals {
        let s = &sig.snapshot;
        let age = fmt_age(sig.alert_time_ms, now_ms);
        let (Some(cur), Some(peak)) = (sig.current_pct(), sig.highest_pct()) else {
            lines.push(format!("📌 <b>{}</b> — entry price N/A — {}", sig.symbol, age));
            lines.push(String::new());
            continue;
        };
        lines.push(format!("📌 <b>{}</b>", sig.symbol));
        lines.push(format!(
            "   {} → Now: {} ({})",
            fmt_price(sig.entry_price),
            fmt_price(sig.current_price),
            fmt_pct(cur)
        ));
        lines.push(format!("   Peak: {} ({})", fmt_price(sig.highest_price), fmt_pct(peak)));

        let mut detail = vec![
            format!("{} body:{:.0}% wick:{:.0}%", color_icon(s.candle.color), s.candle.body_pct, s.candle.upper_wick_pct),
            format!("Vol: {:.1}x ({})", s.volume.ratio, fmt_vol_usd(s.volume.recent_avg)),
        ];
        if s.trend.total > 0 {
            detail.push(format!("Trend: {}/{}🟢", s.trend.green_count, s.trend.total));
        }
        lines.push(format!("   {}", detail.join(" | ")));

        let mut extra = Vec::new();
        if let Some(b) = &s.breakout {
            extra.push(format!("Brk: +{:.1}%", b.margin_pct));
        }
        if let Some(oi) = s.oi_change_pct {
            extra.push(format!("OI: {oi:+.1}%"));
        }
        extra.push(format!("Age: {age}"));
        lines.push(format!("   {}", extra.join(" | ")));
        lines.push(String::new());
    }

    if let Some(a) = PerformanceSummary::of(signals, &[]).active {
        lines.push("─".repeat(28));
        lines.push(format!("📡 Active: {} signals", a.count));
        lines.push(format!("📊 Avg now:  {}", fmt_pct(a.avg_current_pct)));
        lines.push(format!("🏔  Avg peak: {}", fmt_pct(a.avg_peak_pct)));
        lines.push(format!("🎯 Win now:  {}", ratio(a.winners_now, a.count)));
        lines.push(format!("🎯 Win peak(>2%): {}", ratio(a.peak_winners, a.count)));
    }
    lines.join("\n")
}

pub fn format_detail(sig: &Signal, btc_now: Option<f64>, now_ms: i64) -> String {
    let s = &sig.snapshot;
    let cur = sig.current_pct().unwrap_or(0.0);
    let peak = sig.highest_pct().unwrap_or(0.0);
    let mut lines = vec![
        format!("📊 <b>DETAILED REPORT — {}</b>", sig.symbol),
        "━".repeat(28),
        String::new(),
        "<b>💵 Price Performance</b>".to_string(),
        format!("   Entry:    {}", fmt_price(sig.entry_price)),
        format!("   Current:  {}  ({})", fmt_price(sig.current_price), fmt_pct(cur)),
        format!("   Highest:  {}  ({})", fmt_price(sig.highest_price), fmt_pct(peak)),
        format!("   Age:      {}", fmt_age(sig.alert_time_ms, now_ms)),
        String::new(),
        "<b>🕯 Candle Quality</b>".to_string(),
        format!("   Color:       {} {}", color_icon(s.candle.color), s.candle.color.as_str()),
        format!("   Body:        {:.1}% of range", s.candle.body_pct),
        format!("   Upper Wick:  {:.1}% of range", s.candle.upper_wick_pct),
        format!("   Lower Wick:  {:.1}% of range", s.candle.lower_wick_pct),
        String::new(),
        "<b>📊 Volume</b>".to_string(),
        format!("   Ratio:     {:.2}x", s.volume.ratio),
        format!("   Recent:    {} avg", fmt_vol_usd(s.volume.recent_avg)),
        format!("   Baseline:  {} avg", fmt_vol_usd(s.volume.baseline_avg)),
        String::new(),
    ];
    if let Some(b) = &s.breakout {
        lines.push("<b>🔺 Breakout</b>".to_string());
        lines.push(format!("   Level:   {}", fmt_price(b.level)));
        lines.push(format!("   Margin:  +{:.2}% above level", b.margin_pct));
        lines.push(String::new());
    }
    if let Some(oi) = s.oi_change_pct {
        lines.push("<b>📈 Open Interest</b>".to_string());
        lines.push(format!("   Change:  {}", fmt_pct(oi)));
        lines.push(String::new());
    }
    if !s.trend.pattern.is_empty() {
        lines.push("<b>📊 Trend Context</b>".to_string());
        lines.push(format!(
            "   Last {} candles: {}/{} green  {}",
            s.trend.total,
            s.trend.green_count,
            s.trend.total,
            s.trend.pattern.replace('G', "🟢").replace('R', "🔴")
        ));
    }
    if let (Some(then), Some(now)) = (s.btc_price, btc_now) {
        if let Some(chg) = pct_change(then, now) {
            lines.push(format!("   BTC:  {} → {} ({})", fmt_price(then), fmt_price(now), fmt_pct(chg)));
        }
    }
    lines.push(String::new());
    lines.push(format!("💰 Market Cap: {}", s.mcap));
    lines.push(format!("🕐 Signal: {}", fmt_time(sig.alert_time_ms)));
    lines.push(String::new());
    lines.push(diagnosis(sig, cur, peak));
    lines.join("\n")
}

/// Heuristic hints on why a signal did or did not work out.
fn diagnosis(sig: &Signal, cur: f64, peak: f64) -> String {
    let s = &sig.snapshot;
    let mut hints = Vec::new();

    if peak > 5.0 && cur < 0.0 {
        hints.push("⚠️ Pumped then dumped — possible distribution".to_string());
    } else if peak < 1.0 && cur < -3.0 {
        hints.push("⚠️ Never pumped — signal may have been late entry".to_string());
    }
    if s.candle.upper_wick_pct > 40.0 {
        hints.push(format!("⚠️ High upper wick ({:.0}%) — selling pressure at signal", s.candle.upper_wick_pct));
    }
    if s.candle.body_pct < 35.0 {
        hints.push(format!("⚠️ Small body ({:.0}%) — weak conviction candle", s.candle.body_pct));
    }
    match s.breakout.as_ref().map(|b| b.margin_pct) {
        Some(m) if m < 0.5 => hints.push(format!("⚠️ Marginal breakout (+{m:.1}%) — barely broke out")),
        Some(m) if m > 3.0 => hints.push(format!("✅ Strong breakout (+{m:.1}%)")),
        _ => {}
    }
    let t = &s.trend;
    if t.total > 0 {
        let share = t.green_count as f64 / t.total as f64;
        if share < 0.4 {
            hints.push(format!("⚠️ Weak trend ({}/{} green) — counter-trend signal", t.green_count, t.total));
        } else if share >= 0.8 {
            hints.push(format!("✅ Strong trend ({}/{} green)", t.green_count, t.total));
        }
    }
    if s.volume.ratio > 10.0 {
        hints.push(format!("✅ Extreme volume ({:.0}x) — high conviction", s.volume.ratio));
    } else if s.volume.ratio < 3.5 {
        hints.push(format!("⚠️ Volume barely above threshold ({:.1}x)", s.volume.ratio));
    }
    if cur > 5.0 {
        hints.push(format!("✅ Currently profitable ({cur:+.1}%)"));
    }
    if hints.is_empty() {
        hints.push("ℹ️ Signal looks normal — no strong flags".to_string());
    }

    let body: Vec<String> = hints.iter().map(|h| format!("   {h}")).collect();
    format!("<b>🔍 Diagnosis</b>\n{}", body.join("\n"))
}

pub fn format_help(window_hours: f64, update_secs: u64) -> String {
    [
        "🤖 <b>VOLUME SCANNER COMMANDS</b>".to_string(),
        "━".repeat(28),
        String::new(),
        "/report — All signals with performance + context".to_string(),
        "/report SYMBOL — Detailed breakdown + auto diagnosis".to_string(),
        "/summary — Win rates, averages, quality stats".to_string(),
        "/active — Quick list of tracked signals".to_string(),
        "/help — Show this message".to_string(),
        String::new(),
        format!("💡 Signals tracked for {window_hours}h"),
        format!("🏔 Highest price updated every {}m", update_secs.div_ceil(60)),
    ]
    .join("\n")
}
