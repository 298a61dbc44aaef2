use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::binance_api::MarketData;
use crate::config::{TrackerConfig, TRANSITION_PAUSE_MS};
use crate::run_flag::RunFlag;
use crate::telegram::Notifier;
use crate::types::{ArchivedSignal, Signal, SignalEvent};

const SIGNALS_FILE: &str = "signals.json";
const HISTORY_FILE: &str = "history.json";
/// Peak gain above which an active signal counts as a peak winner.
const PEAK_WIN_PCT: f64 = 2.0;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ── JSON array files ──────────────────────────────────────────────────────────

/// Missing or unreadable files load as empty; the condition is logged.
fn load_json<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let raw = match std::fs::read_to_string(path) {
        Ok(r) => r,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            log::error!("Failed to read {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<T>>(&raw) {
        Ok(items) => items,
        Err(e) => {
            log::error!("Failed to parse {}: {} — treating as empty", path.display(), e);
            Vec::new()
        }
    }
}

/// Write to a sibling temp file, then rename over the target.
fn save_json<T: Serialize>(path: &Path, items: &[T]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(items).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    std::fs::write(&tmp, body).map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
    std::fs::rename(&tmp, path).map_err(|source| StoreError::Io { path: path.to_path_buf(), source })
}

fn round_to(x: f64, decimals: i32) -> f64 {
    let f = 10f64.powi(decimals);
    (x * f).round() / f
}

// ── Summary ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveStats {
    pub count: usize,
    pub avg_current_pct: f64,
    pub avg_peak_pct: f64,
    pub winners_now: usize,
    pub peak_winners: usize,
    pub best_now: (String, f64),
    pub worst_now: (String, f64),
    pub best_peak: (String, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryStats {
    pub with_exit_data: usize,
    pub avg_exit_pct: f64,
    pub avg_peak_pct: Option<f64>,
    pub winners: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSummary {
    pub active: Option<ActiveStats>,
    pub history_count: usize,
    pub history: Option<HistoryStats>,
}

impl PerformanceSummary {
    pub fn of(active: &[Signal], history: &[ArchivedSignal]) -> Self {
        PerformanceSummary {
            active: active_stats(active),
            history_count: history.len(),
            history: history_stats(history),
        }
    }
}

fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

// ── Tracker ───────────────────────────────────────────────────────────────────

/// Durable store of live and archived signals. Every operation is a
/// load-mutate-save under one lock; no network call happens while it is held.
pub struct SignalTracker {
    cfg: TrackerConfig,
    signals_path: PathBuf,
    history_path: PathBuf,
    lock: Mutex<()>,
}

impl SignalTracker {
    pub fn new(cfg: &TrackerConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&cfg.data_dir).map_err(|source| StoreError::Io {
            path: cfg.data_dir.clone(),
            source,
        })?;
        let mut cfg = cfg.clone();
        cfg.take_profit_targets.sort_unstable();
        cfg.take_profit_targets.dedup();
        log::info!(
            "Tracker initialised (max_age={}h, update={}s, TP targets={:?}, reversal={})",
            cfg.max_age_hours, cfg.price_update_interval_seconds,
            cfg.take_profit_targets, cfg.reversal_alert_enabled
        );
        Ok(SignalTracker {
            signals_path: cfg.data_dir.join(SIGNALS_FILE),
            history_path: cfg.data_dir.join(HISTORY_FILE),
            cfg,
            lock: Mutex::new(()),
        })
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn save_signals(&self, signals: &[Signal]) -> bool {
        match save_json(&self.signals_path, signals) {
            Ok(()) => true,
            Err(e) => {
                log::error!("Tracker: {}", e);
                false
            }
        }
    }

    pub fn max_age_hours(&self) -> f64 {
        self.cfg.max_age_hours
    }

    pub fn update_interval_secs(&self) -> u64 {
        self.cfg.price_update_interval_seconds
    }

    pub fn record(&self, signal: Signal) {
        let _g = self.guard();
        let mut signals: Vec<Signal> = load_json(&self.signals_path);
        let (symbol, price) = (signal.symbol.clone(), signal.entry_price);
        signals.push(signal);
        if self.save_signals(&signals) {
            log::info!("[{}] Tracker: recorded @ {:.8}", symbol, price);
        }
    }

    /// Applies a (possibly partial) price map; returns how many signals changed.
    pub fn refresh_prices(&self, prices: &HashMap<String, f64>, now_ms: i64) -> usize {
        let _g = self.guard();
        let mut signals: Vec<Signal> = load_json(&self.signals_path);
        let mut updated = 0;
        for sig in signals.iter_mut() {
            let Some(&price) = prices.get(&sig.symbol) else { continue };
            sig.current_price = price;
            sig.last_update_ms = Some(now_ms);
            if price > sig.highest_price {
                sig.highest_price = price;
            }
            updated += 1;
        }
        if updated > 0 && !self.save_signals(&signals) {
            return 0;
        }
        updated
    }

    /// Fires take-profit targets and the one-time reversal warning. The
    /// returned events are already persisted as sent.
    pub fn evaluate_transitions(&self) -> Vec<SignalEvent> {
        let _g = self.guard();
        let mut signals: Vec<Signal> = load_json(&self.signals_path);
        let mut events = Vec::new();
        for sig in signals.iter_mut() {
            events.extend(evaluate_signal(sig, &self.cfg));
        }
        if !events.is_empty() && !self.save_signals(&signals) {
            return Vec::new();
        }
        events
    }

    /// Moves signals at or past max age into the history store.
    pub fn archive_expired(&self, now_ms: i64) -> usize {
        let _g = self.guard();
        let signals: Vec<Signal> = load_json(&self.signals_path);
        let max_age = self.cfg.max_age_ms();
        let (expired, active): (Vec<Signal>, Vec<Signal>) =
            signals.into_iter().partition(|s| s.age_ms(now_ms) >= max_age);
        if expired.is_empty() {
            return 0;
        }

        let mut history: Vec<ArchivedSignal> = load_json(&self.history_path);
        let prior = history.len();
        let archived = expired.len();
        history.extend(expired.into_iter().map(|s| archive(s, now_ms)));

        // history first: a crash in between duplicates rather than loses
        if let Err(e) = save_json(&self.history_path, &history) {
            log::error!("Tracker: {}", e);
            return 0;
        }
        if !self.save_signals(&active) {
            history.truncate(prior);
            if let Err(e) = save_json(&self.history_path, &history) {
                log::error!("Tracker: history rollback failed: {}", e);
            }
            return 0;
        }
        archived
    }

    /// Live signals younger than max age, newest first.
    pub fn active_signals(&self, now_ms: i64) -> Vec<Signal> {
        let signals: Vec<Signal> = {
            let _g = self.guard();
            load_json(&self.signals_path)
        };
        let max_age = self.cfg.max_age_ms();
        let mut active: Vec<Signal> = signals.into_iter().filter(|s| s.age_ms(now_ms) < max_age).collect();
        active.sort_by(|a, b| b.alert_time_ms.cmp(&a.alert_time_ms));
        active
    }

    pub fn history(&self) -> Vec<ArchivedSignal> {
        let _g = self.guard();
        load_json(&self.history_path)
    }

    pub fn summary(&self, now_ms: i64) -> PerformanceSummary {
        PerformanceSummary::of(&self.active_signals(now_ms), &self.history())
    }

    // ── Background loop ──────────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>, market: Arc<dyn MarketData>, notifier: Arc<dyn Notifier>, running: RunFlag) {
        let interval = Duration::from_secs(self.cfg.price_update_interval_seconds);
        log::info!("Tracker loop started (every {}s)", interval.as_secs());
        while running.is_running() {
            self.tick(market.as_ref(), notifier.as_ref()).await;
            running.sleep(interval).await;
        }
        log::info!("Tracker loop stopped");
    }

    /// One refresh / evaluate / notify / archive pass.
    pub async fn tick(&self, market: &dyn MarketData, notifier: &dyn Notifier) {
        match market.mark_prices().await {
            Ok(prices) => {
                let updated = self.refresh_prices(&prices, chrono::Utc::now().timestamp_millis());
                log::debug!("Tracker: refreshed {} signals", updated);
            }
            Err(e) => log::warn!("Tracker price update failed: {}", e),
        }

        for event in self.evaluate_transitions() {
            if !notifier.notify(&event).await {
                log::error!("[{}] Failed to send {} alert", event.signal().symbol, event.kind());
            }
            tokio::time::sleep(Duration::from_millis(TRANSITION_PAUSE_MS)).await;
        }

        let archived = self.archive_expired(chrono::Utc::now().timestamp_millis());
        if archived > 0 {
            log::info!("Tracker: archived {} expired signals", archived);
        }
    }
}

/// Transitions for one signal. Skipped while the entry price is unknown.
fn evaluate_signal(sig: &mut Signal, cfg: &TrackerConfig) -> Vec<SignalEvent> {
    let mut events = Vec::new();
    let (Some(high_pct), Some(cur_pct)) = (sig.highest_pct(), sig.current_pct()) else {
        return events;
    };

    let mut hit = Vec::new();
    for &target in &cfg.take_profit_targets {
        if !sig.tp_sent.contains(&target) && high_pct >= target as f64 {
            sig.tp_sent.push(target);
            hit.push(target);
            log::info!(
                "[{}] 🎯 TP target +{}% hit (peak {:+.2}%, now {:+.2}%)",
                sig.symbol, target, high_pct, cur_pct
            );
        }
    }
    for target in hit {
        events.push(SignalEvent::TakeProfitHit {
            signal: sig.clone(),
            target_pct: target,
            highest_pct: high_pct,
            current_pct: cur_pct,
        });
    }

    if cfg.reversal_alert_enabled && !sig.reversal_warned && high_pct >= cfg.min_reversal_peak_pct {
        let drop = high_pct - cur_pct;
        if drop >= cfg.reversal_drop_from_peak_pct {
            sig.reversal_warned = true;
            log::info!(
                "[{}] ⚠️ Reversal warning (peak {:+.2}%, now {:+.2}%, drop {:.2}%)",
                sig.symbol, high_pct, cur_pct, drop
            );
            events.push(SignalEvent::ReversalWarning {
                signal: sig.clone(),
                drop_pct: drop,
                highest_pct: high_pct,
                current_pct: cur_pct,
            });
        }
    }
    events
}

fn archive(signal: Signal, now_ms: i64) -> ArchivedSignal {
    let age_ms = signal.age_ms(now_ms);
    let known = signal.entry_price > 0.0;
    ArchivedSignal {
        archived_at_ms: now_ms,
        tracked_hours: round_to(age_ms as f64 / 3_600_000.0, 1),
        highest_pct: signal.highest_pct().map(|p| round_to(p, 2)),
        exit_pct: signal.current_pct().map(|p| round_to(p, 2)),
        exit_price: known.then_some(signal.current_price),
        signal,
    }
}

fn active_stats(active: &[Signal]) -> Option<ActiveStats> {
    let rows: Vec<(&str, f64, f64)> = active
        .iter()
        .filter_map(|s| {
            let cur = s.current_pct()?;
            let peak = s.highest_pct()?;
            Some((s.symbol.as_str(), cur, peak.max(cur)))
        })
        .collect();
    if rows.is_empty() {
        return None;
    }
    let cur: Vec<f64> = rows.iter().map(|r| r.1).collect();
    let peak: Vec<f64> = rows.iter().map(|r| r.2).collect();
    let pick = |key: fn(&(&str, f64, f64)) -> f64, highest: bool| {
        let row = rows
            .iter()
            .copied()
            .reduce(|a, b| {
                let better = if highest { key(&b) > key(&a) } else { key(&b) < key(&a) };
                if better { b } else { a }
            })
            .unwrap_or(rows[0]);
        (row.0.to_string(), key(&row))
    };
    Some(ActiveStats {
        count: rows.len(),
        avg_current_pct: mean(&cur),
        avg_peak_pct: mean(&peak),
        winners_now: cur.iter().filter(|&&c| c > 0.0).count(),
        peak_winners: peak.iter().filter(|&&p| p > PEAK_WIN_PCT).count(),
        best_now: pick(|r| r.1, true),
        worst_now: pick(|r| r.1, false),
        best_peak: pick(|r| r.2, true),
    })
}

fn history_stats(history: &[ArchivedSignal]) -> Option<HistoryStats> {
    let exits: Vec<f64> = history.iter().filter_map(|h| h.exit_pct).collect();
    if exits.is_empty() {
        return None;
    }
    let peaks: Vec<f64> = history.iter().filter_map(|h| h.highest_pct).collect();
    Some(HistoryStats {
        with_exit_data: exits.len(),
        avg_exit_pct: mean(&exits),
        avg_peak_pct: (!peaks.is_empty()).then(|| mean(&peaks)),
        winners: exits.iter().filter(|&&e| e > 0.0).count(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::ApiError;
    use crate::telegram::tests::{snapshot, RecordingNotifier};
    use crate::types::{Candle, OiSample, SymbolInfo};
    use async_trait::async_trait;
    use std::collections::HashSet;

    const HOUR: i64 = 3_600_000;
    const T0: i64 = 1_700_000_000_000;

    fn tracker(dir: &Path, cfg: impl FnOnce(&mut TrackerConfig)) -> SignalTracker {
        let mut c = TrackerConfig { data_dir: dir.to_path_buf(), ..TrackerConfig::default() };
        cfg(&mut c);
        SignalTracker::new(&c).unwrap()
    }

    fn sig(symbol: &str, entry: f64, at: i64) -> Signal {
        Signal::new(symbol, entry, at, snapshot())
    }

    fn prices(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(s, p)| (s.to_string(), *p)).collect()
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        let mut a = sig("AUSDT", 1.25, T0);
        a.snapshot.oi_change_pct = Some(7.5);
        let b = sig("BUSDT", 0.0, T0 + 1);
        t.record(a.clone());
        t.record(b.clone());

        let reopened = tracker(dir.path(), |_| {});
        let loaded: Vec<Signal> = reopened.active_signals(T0 + 2);
        assert_eq!(loaded.len(), 2);
        for s in [&a, &b] {
            assert!(loaded.contains(s));
        }
        assert!(!dir.path().join("signals.tmp").exists());
    }

    #[test]
    fn missing_or_corrupt_store_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        assert!(t.active_signals(T0).is_empty());
        assert!(t.history().is_empty());

        std::fs::write(dir.path().join("signals.json"), "[{ truncated").unwrap();
        assert!(t.active_signals(T0).is_empty());
        // the next write replaces the corrupt file
        t.record(sig("AUSDT", 1.0, T0));
        assert_eq!(t.active_signals(T0).len(), 1);
    }

    #[test]
    fn highest_price_never_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        t.record(sig("AUSDT", 100.0, T0));
        let mut last_high = 100.0;
        for p in [101.0, 99.0, 112.0, 90.0, 111.9, 112.0, 50.0] {
            t.refresh_prices(&prices(&[("AUSDT", p)]), T0);
            let s = &t.active_signals(T0)[0];
            assert!(s.highest_price >= last_high);
            assert_eq!(s.current_price, p);
            last_high = s.highest_price;
        }
        assert_eq!(last_high, 112.0);
    }

    #[test]
    fn partial_price_map_leaves_others_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        t.record(sig("AUSDT", 10.0, T0));
        t.record(sig("BUSDT", 20.0, T0 + 1));
        assert_eq!(t.refresh_prices(&prices(&[("AUSDT", 11.0), ("ZUSDT", 5.0)]), T0 + 5), 1);
        let by_symbol: HashMap<String, Signal> =
            t.active_signals(T0 + 5).into_iter().map(|s| (s.symbol.clone(), s)).collect();
        assert_eq!(by_symbol["AUSDT"].current_price, 11.0);
        assert_eq!(by_symbol["AUSDT"].last_update_ms, Some(T0 + 5));
        assert_eq!(by_symbol["BUSDT"].current_price, 20.0);
        assert_eq!(by_symbol["BUSDT"].last_update_ms, None);
        assert_eq!(t.refresh_prices(&HashMap::new(), T0 + 6), 0);
    }

    #[test]
    fn take_profits_fire_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| {
            c.take_profit_targets = vec![10, 3, 15, 5];
            c.reversal_alert_enabled = false;
        });
        t.record(sig("AUSDT", 100.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 112.0)]), T0);

        let events = t.evaluate_transitions();
        let targets: Vec<u32> = events
            .iter()
            .map(|e| match e {
                SignalEvent::TakeProfitHit { target_pct, highest_pct, .. } => {
                    assert!((highest_pct - 12.0).abs() < 1e-9);
                    *target_pct
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(targets, vec![3, 5, 10]);

        // re-crossing the same thresholds fires nothing new
        for p in [101.0, 113.0, 112.5] {
            t.refresh_prices(&prices(&[("AUSDT", p)]), T0);
            assert!(t.evaluate_transitions().is_empty());
        }
        let stored = &t.active_signals(T0)[0];
        let sent: HashSet<u32> = stored.tp_sent.iter().copied().collect();
        assert_eq!(sent, HashSet::from([3, 5, 10]));
    }

    #[test]
    fn reversal_fires_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| {
            c.take_profit_targets = vec![];
            c.min_reversal_peak_pct = 5.0;
            c.reversal_drop_from_peak_pct = 5.0;
        });
        t.record(sig("AUSDT", 100.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 110.0)]), T0);
        assert!(t.evaluate_transitions().is_empty());

        t.refresh_prices(&prices(&[("AUSDT", 103.0)]), T0);
        let events = t.evaluate_transitions();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SignalEvent::ReversalWarning { drop_pct, highest_pct, current_pct, signal } => {
                assert!((drop_pct - 7.0).abs() < 1e-9);
                assert!((highest_pct - 10.0).abs() < 1e-9);
                assert!((current_pct - 3.0).abs() < 1e-9);
                assert!(signal.reversal_warned);
            }
            other => panic!("unexpected {other:?}"),
        }

        t.refresh_prices(&prices(&[("AUSDT", 95.0)]), T0);
        assert!(t.evaluate_transitions().is_empty());
    }

    #[test]
    fn reversal_needs_peak_floor() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| {
            c.take_profit_targets = vec![];
            c.min_reversal_peak_pct = 5.0;
            c.reversal_drop_from_peak_pct = 5.0;
        });
        t.record(sig("AUSDT", 100.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 104.0)]), T0);
        t.refresh_prices(&prices(&[("AUSDT", 90.0)]), T0);
        assert!(t.evaluate_transitions().is_empty());
    }

    #[test]
    fn unknown_entry_never_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        t.record(sig("AUSDT", 0.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 50.0)]), T0);
        assert!(t.evaluate_transitions().is_empty());
    }

    #[test]
    fn expired_signals_move_to_history() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| c.max_age_hours = 72.0);
        t.record(sig("OLDUSDT", 100.0, T0));
        t.record(sig("NOENTRYUSDT", 0.0, T0));
        t.record(sig("NEWUSDT", 100.0, T0 + 48 * HOUR));
        t.refresh_prices(&prices(&[("OLDUSDT", 112.0)]), T0);
        t.refresh_prices(&prices(&[("OLDUSDT", 104.5), ("NOENTRYUSDT", 3.0)]), T0);

        let now = T0 + 72 * HOUR + 30 * 60_000;
        assert_eq!(t.archive_expired(now), 2);
        assert_eq!(t.archive_expired(now), 0);

        let active = t.active_signals(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "NEWUSDT");

        let history = t.history();
        assert_eq!(history.len(), 2);
        let old = history.iter().find(|h| h.signal.symbol == "OLDUSDT").unwrap();
        assert_eq!(old.archived_at_ms, now);
        assert_eq!(old.tracked_hours, 72.5);
        assert_eq!(old.highest_pct, Some(12.0));
        assert_eq!(old.exit_pct, Some(4.5));
        assert_eq!(old.exit_price, Some(104.5));

        let unknown = history.iter().find(|h| h.signal.symbol == "NOENTRYUSDT").unwrap();
        assert_eq!((unknown.highest_pct, unknown.exit_pct, unknown.exit_price), (None, None, None));
    }

    #[test]
    fn summary_over_active_and_history() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| c.max_age_hours = 10.0);
        t.record(sig("AUSDT", 100.0, T0));
        t.record(sig("BUSDT", 100.0, T0));
        t.record(sig("CUSDT", 0.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 110.0)]), T0);
        t.refresh_prices(&prices(&[("AUSDT", 105.0), ("BUSDT", 98.0)]), T0);

        let s = t.summary(T0 + HOUR);
        let active = s.active.unwrap();
        assert_eq!(active.count, 2);
        assert_eq!(active.winners_now, 1);
        assert_eq!(active.peak_winners, 1);
        assert_eq!(active.best_now.0, "AUSDT");
        assert_eq!(active.worst_now.0, "BUSDT");
        assert_eq!(active.best_peak, ("AUSDT".to_string(), 10.0));
        assert!((active.avg_current_pct - 1.5).abs() < 1e-9);
        assert_eq!(s.history_count, 0);
        assert!(s.history.is_none());

        t.archive_expired(T0 + 11 * HOUR);
        let s = t.summary(T0 + 11 * HOUR);
        assert!(s.active.is_none());
        assert_eq!(s.history_count, 3);
        let h = s.history.unwrap();
        assert_eq!(h.with_exit_data, 2);
        assert_eq!(h.winners, 1);
        assert!((h.avg_exit_pct - 1.5).abs() < 1e-9);
    }

    fn block(dir: &Path, tmp: &str) {
        std::fs::create_dir(dir.join(tmp)).unwrap();
    }

    fn unblock(dir: &Path, tmp: &str) {
        std::fs::remove_dir(dir.join(tmp)).unwrap();
    }

    #[test]
    fn failed_signal_writes_change_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| {
            c.take_profit_targets = vec![5, 10];
            c.reversal_alert_enabled = false;
        });
        t.record(sig("AUSDT", 100.0, T0));
        t.refresh_prices(&prices(&[("AUSDT", 112.0)]), T0);

        block(dir.path(), "signals.tmp");
        t.record(sig("BUSDT", 50.0, T0 + 1));
        assert_eq!(t.active_signals(T0 + 1).len(), 1);

        assert_eq!(t.refresh_prices(&prices(&[("AUSDT", 120.0)]), T0 + 2), 0);
        assert_eq!(t.active_signals(T0)[0].current_price, 112.0);

        assert!(t.evaluate_transitions().is_empty());
        assert!(t.active_signals(T0)[0].tp_sent.is_empty());

        assert_eq!(t.archive_expired(T0 + 100 * HOUR), 0);
        assert!(t.history().is_empty(), "archived entries rolled back");
        assert_eq!(t.active_signals(T0).len(), 1);

        // nothing was half-sent: every target fires once writes work again
        unblock(dir.path(), "signals.tmp");
        assert_eq!(t.evaluate_transitions().len(), 2);
        assert!(t.evaluate_transitions().is_empty());
    }

    #[test]
    fn failed_history_write_keeps_signals_active() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| c.max_age_hours = 1.0);
        t.record(sig("AUSDT", 100.0, T0));

        block(dir.path(), "history.tmp");
        assert_eq!(t.archive_expired(T0 + 2 * HOUR), 0);
        assert_eq!(t.active_signals(T0).len(), 1);
        assert!(t.history().is_empty());

        unblock(dir.path(), "history.tmp");
        assert_eq!(t.archive_expired(T0 + 2 * HOUR), 1);
        assert_eq!(t.history().len(), 1);
    }

    #[test]
    fn queries_see_whole_store_while_prices_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |_| {});
        for i in 0..20 {
            t.record(sig(&format!("S{i}USDT"), 100.0, T0 + i));
        }
        std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for n in 1..=200 {
                    let all: HashMap<String, f64> =
                        (0..20).map(|i| (format!("S{i}USDT"), 100.0 + n as f64)).collect();
                    assert_eq!(t.refresh_prices(&all, T0 + n), 20);
                }
            });
            for _ in 0..200 {
                let active = t.active_signals(T0 + HOUR);
                assert_eq!(active.len(), 20);
                // one refresh rewrites every price together
                assert!(active.iter().all(|s| s.current_price == active[0].current_price));
                assert_eq!(t.summary(T0 + HOUR).active.map(|a| a.count), Some(20));
            }
            writer.join().unwrap();
        });
        assert_eq!(t.active_signals(T0 + HOUR)[0].current_price, 300.0);
    }

    struct FixedPrices(HashMap<String, f64>);

    #[async_trait]
    impl MarketData for FixedPrices {
        async fn perpetual_symbols(&self) -> Result<Vec<SymbolInfo>, ApiError> {
            Ok(Vec::new())
        }
        async fn mark_prices(&self) -> Result<HashMap<String, f64>, ApiError> {
            Ok(self.0.clone())
        }
        async fn closed_klines(&self, _: &str, _: &str, _: usize) -> Result<Vec<Candle>, ApiError> {
            Ok(Vec::new())
        }
        async fn open_interest_history(&self, _: &str, _: &str, _: usize) -> Result<Vec<OiSample>, ApiError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_refreshes_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let t = tracker(dir.path(), |c| c.take_profit_targets = vec![5]);
        let now = chrono::Utc::now().timestamp_millis();
        t.record(sig("AUSDT", 100.0, now));

        let market = FixedPrices(prices(&[("AUSDT", 106.0)]));
        let notifier = RecordingNotifier::default();
        t.tick(&market, &notifier).await;

        let events = notifier.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "take_profit");
        assert_eq!(t.active_signals(now)[0].current_price, 106.0);
    }
}
