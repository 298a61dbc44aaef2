#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch lets jemalloc evaluate its decay windows and
    // return dirty pages to the OS.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced");
}

mod binance_api;
mod commands;
mod config;
mod cooldown;
mod filters;
mod governor;
mod market_cap;
mod run_flag;
mod scanner;
mod telegram;
mod tracker;
mod types;

use std::sync::Arc;
use std::time::Duration;

use binance_api::{BinanceClient, MarketData};
use commands::{CommandDesk, CommandListener};
use config::{optional_env, Config, BINANCE_REST_URL, SHUTDOWN_GRACE_SECS, SYMBOLS_TTL_SECS};
use cooldown::CooldownSuppressor;
use governor::{HttpTransport, RequestGovernor};
use market_cap::{CoinGeckoProvider, MarketCapFilter, NoMarketCapFilter};
use run_flag::{watch_loop, RunFlag};
use scanner::Scanner;
use telegram::{Notifier, TelegramBot};
use tracker::SignalTracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // ── Configuration ────────────────────────────────────────────────────────
    let cfg_path = Config::path_from_env();
    let cfg = Config::load(&cfg_path)?;
    cfg.validate()?;
    log::info!(
        "Config loaded from {} (timeframe {}, interval {}s)",
        cfg_path.display(), cfg.scanner.timeframe, cfg.scanner.scan_interval_seconds
    );

    // ── Notification channel: no start without it ────────────────────────────
    let tg = TelegramBot::from_env()?;
    if !tg.validate().await {
        return Err("Telegram validation failed — check TELEGRAM_TOKEN / TELEGRAM_CHAT_ID".into());
    }
    let notifier: Arc<dyn Notifier> = Arc::new(tg.clone());

    // ── Exchange access ──────────────────────────────────────────────────────
    let transport = HttpTransport::new(BINANCE_REST_URL, optional_env("BINANCE_API_KEY"))?;
    let governor = Arc::new(RequestGovernor::new(Box::new(transport), &cfg.rate_limit));
    let market: Arc<dyn MarketData> =
        Arc::new(BinanceClient::new(governor.clone(), Duration::from_secs(SYMBOLS_TTL_SECS)));

    let mcap: Arc<dyn MarketCapFilter> = if cfg.market_cap.enabled {
        Arc::new(CoinGeckoProvider::new(&cfg.market_cap)?)
    } else {
        log::info!("Market-cap filter disabled");
        Arc::new(NoMarketCapFilter)
    };

    let running = RunFlag::new();

    // ── Tracker loop and chat commands ───────────────────────────────────────
    let mut loops = Vec::new();
    let tracker = if cfg.tracker.enabled {
        let tracker = Arc::new(SignalTracker::new(&cfg.tracker)?);
        let handle = tokio::spawn(tracker.clone().run(market.clone(), notifier.clone(), running.clone()));
        loops.push(tokio::spawn(watch_loop("Tracker", handle, running.clone())));
        if cfg.tracker.commands_enabled {
            let listener = CommandListener::new(tg, CommandDesk::new(tracker.clone(), market.clone()));
            let handle = tokio::spawn(listener.run(running.clone()));
            loops.push(tokio::spawn(watch_loop("Command listener", handle, running.clone())));
        }
        Some(tracker)
    } else {
        log::info!("Signal tracker disabled");
        None
    };

    // ── Shutdown on Ctrl-C ───────────────────────────────────────────────────
    {
        let running = running.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Shutdown requested, finishing current step…");
                running.stop();
            }
        });
    }

    #[cfg(feature = "jemalloc")]
    {
        let running = running.clone();
        let every = Duration::from_secs(cfg.scanner.scan_interval_seconds.max(60));
        tokio::spawn(async move {
            while running.is_running() {
                running.sleep(every).await;
                jemalloc_purge();
            }
        });
    }

    // ── Scan loop ────────────────────────────────────────────────────────────
    let banner = telegram::format_banner(&cfg);
    let scanner = Scanner::new(
        cfg.scanner.clone(),
        cfg.market_cap.max_usd,
        market,
        mcap,
        Arc::new(CooldownSuppressor::new(cfg.scanner.cooldown_ms())),
        tracker.clone(),
        notifier,
        running,
    );
    scanner.run(&banner).await;

    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    for watcher in loops {
        if tokio::time::timeout(grace, watcher).await.is_err() {
            log::warn!("Background loop still running after {}s, exiting anyway", grace.as_secs());
        }
    }
    if let Some(t) = tracker {
        log_summary(&t);
    }
    log::info!("Weight in current window at exit: {}", governor.used_weight().await);
    Ok(())
}

fn log_summary(tracker: &SignalTracker) {
    let s = tracker.summary(chrono::Utc::now().timestamp_millis());
    log::info!("── Performance (last {}h) ──", tracker.max_age_hours());
    match s.active {
        Some(a) => {
            log::info!(
                "Active: {} | avg now {:+.2}% | avg peak {:+.2}% | winners {} | peak >2% {}",
                a.count, a.avg_current_pct, a.avg_peak_pct, a.winners_now, a.peak_winners
            );
            log::info!(
                "Best now {} {:+.2}% | worst now {} {:+.2}% | best peak {} {:+.2}%",
                a.best_now.0, a.best_now.1, a.worst_now.0, a.worst_now.1, a.best_peak.0, a.best_peak.1
            );
        }
        None => log::info!("Active: none"),
    }
    match s.history {
        Some(h) => log::info!(
            "History: {} archived | avg exit {:+.2}% | avg peak {} | win rate {:.0}% ({}/{})",
            s.history_count,
            h.avg_exit_pct,
            h.avg_peak_pct.map_or("n/a".to_string(), |p| format!("{p:+.2}%")),
            h.winners as f64 / h.with_exit_data as f64 * 100.0,
            h.winners,
            h.with_exit_data
        ),
        None => log::info!("History: {} archived", s.history_count),
    }
}
