use std::collections::HashMap;
use std::sync::Mutex;

/// Per-symbol alert timestamps (epoch ms). A symbol alerted at `t` stays
/// suppressed while `now - t < window`.
pub struct CooldownSuppressor {
    window_ms: i64,
    last_alert: Mutex<HashMap<String, i64>>,
}

impl CooldownSuppressor {
    pub fn new(window_ms: i64) -> Self {
        CooldownSuppressor { window_ms, last_alert: Mutex::new(HashMap::new()) }
    }

    pub fn is_suppressed(&self, symbol: &str, now_ms: i64) -> bool {
        let map = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(symbol) {
            Some(&t) => {
                let remaining = self.window_ms - (now_ms - t);
                if remaining > 0 {
                    log::debug!("[{}] on cooldown — {:.1} min remaining", symbol, remaining as f64 / 60_000.0);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn record(&self, symbol: &str, now_ms: i64) {
        let mut map = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(symbol.to_string(), now_ms);
    }

    /// Drops entries older than the window; returns how many were removed.
    pub fn prune(&self, now_ms: i64) -> usize {
        let mut map = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, t| now_ms - *t <= self.window_ms);
        before - map.len()
    }

    pub fn active_count(&self, now_ms: i64) -> usize {
        let map = self.last_alert.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|&&t| now_ms - t < self.window_ms).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 3_600_000;

    #[test]
    fn suppressed_for_exactly_the_window() {
        let cd = CooldownSuppressor::new(12 * HOUR);
        let t = 1_700_000_000_000;
        assert!(!cd.is_suppressed("ABCUSDT", t));
        cd.record("ABCUSDT", t);

        assert!(cd.is_suppressed("ABCUSDT", t));
        assert!(cd.is_suppressed("ABCUSDT", t + 12 * HOUR - 1));
        assert!(!cd.is_suppressed("ABCUSDT", t + 12 * HOUR));
        assert!(!cd.is_suppressed("ABCUSDT", t + 12 * HOUR + 1));
    }

    #[test]
    fn symbols_are_independent() {
        let cd = CooldownSuppressor::new(HOUR);
        cd.record("AUSDT", 0);
        cd.record("BUSDT", HOUR / 2);
        assert!(!cd.is_suppressed("AUSDT", HOUR));
        assert!(cd.is_suppressed("BUSDT", HOUR));
        assert!(!cd.is_suppressed("CUSDT", HOUR));
        assert_eq!(cd.active_count(HOUR), 1);
    }

    #[test]
    fn re_record_restarts_window() {
        let cd = CooldownSuppressor::new(HOUR);
        cd.record("AUSDT", 0);
        cd.record("AUSDT", HOUR);
        assert!(cd.is_suppressed("AUSDT", HOUR + HOUR / 2));
    }

    #[test]
    fn prune_removes_stale_entries_only() {
        let cd = CooldownSuppressor::new(HOUR);
        cd.record("OLDUSDT", 0);
        cd.record("NEWUSDT", 2 * HOUR);
        assert_eq!(cd.prune(2 * HOUR + 1), 1);
        assert!(cd.is_suppressed("NEWUSDT", 2 * HOUR + 1));
        assert_eq!(cd.prune(2 * HOUR + 1), 0);
    }
}
