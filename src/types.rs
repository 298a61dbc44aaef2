use serde::{Deserialize, Serialize};

/// One kline row. Timestamps are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
    pub quote_volume: f64,
    pub trades: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CandleColor {
    Green,
    Red,
    Doji,
}

impl CandleColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleColor::Green => "GREEN",
            CandleColor::Red => "RED",
            CandleColor::Doji => "DOJI",
        }
    }
}

/// Shape of a single candle; percentages of the high-low range, one decimal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CandleMetrics {
    pub color: CandleColor,
    pub body_pct: f64,
    pub upper_wick_pct: f64,
    pub lower_wick_pct: f64,
}

/// Direction history of the last N candles, e.g. `"GGRGG"` (newest last).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub green_count: usize,
    pub total: usize,
    pub pattern: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OiSample {
    pub timestamp: i64,
    pub open_interest: f64,
    pub open_interest_value: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolInfo {
    pub symbol: String,
    pub base_asset: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeStats {
    pub ratio: f64,
    pub recent_avg: f64,
    pub baseline_avg: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakoutInfo {
    pub level: f64,
    pub margin_pct: f64,
}

/// Enrichment captured when the signal fired. Never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub timeframe: String,
    pub mcap: String,
    pub volume: VolumeStats,
    pub vol_threshold: f64,
    pub candle: CandleMetrics,
    pub candle_open_ms: i64,
    /// Present only when the breakout stage is enabled.
    pub breakout: Option<BreakoutInfo>,
    /// Present only when the open-interest stage is enabled.
    pub oi_change_pct: Option<f64>,
    pub trend: TrendSummary,
    pub btc_price: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    /// 0.0 when no mark price was available at emission (unknown).
    pub entry_price: f64,
    pub highest_price: f64,
    pub current_price: f64,
    pub alert_time_ms: i64,
    #[serde(default)]
    pub last_update_ms: Option<i64>,
    pub snapshot: SignalSnapshot,
    #[serde(default)]
    pub tp_sent: Vec<u32>,
    #[serde(default)]
    pub reversal_warned: bool,
}

impl Signal {
    pub fn new(symbol: &str, entry_price: f64, alert_time_ms: i64, snapshot: SignalSnapshot) -> Self {
        let entry_price = entry_price.max(0.0);
        Signal {
            symbol: symbol.to_string(),
            entry_price,
            highest_price: entry_price,
            current_price: entry_price,
            alert_time_ms,
            last_update_ms: None,
            snapshot,
            tp_sent: Vec::new(),
            reversal_warned: false,
        }
    }

    /// Peak gain vs entry in percent; `None` when the entry price is unknown.
    pub fn highest_pct(&self) -> Option<f64> {
        pct_change(self.entry_price, self.highest_price)
    }

    pub fn current_pct(&self) -> Option<f64> {
        pct_change(self.entry_price, self.current_price)
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.alert_time_ms
    }
}

pub fn pct_change(entry: f64, price: f64) -> Option<f64> {
    if entry <= 0.0 {
        return None;
    }
    Some((price - entry) / entry * 100.0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSignal {
    #[serde(flatten)]
    pub signal: Signal,
    pub archived_at_ms: i64,
    pub tracked_hours: f64,
    /// The three below are absent when the entry price is unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highest_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
}

/// Outbound notifications produced by the scanner and the tracker.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalEvent {
    SignalEmitted(Signal),
    TakeProfitHit {
        signal: Signal,
        target_pct: u32,
        highest_pct: f64,
        current_pct: f64,
    },
    ReversalWarning {
        signal: Signal,
        drop_pct: f64,
        highest_pct: f64,
        current_pct: f64,
    },
}

impl SignalEvent {
    pub fn signal(&self) -> &Signal {
        match self {
            SignalEvent::SignalEmitted(s) => s,
            SignalEvent::TakeProfitHit { signal, .. } => signal,
            SignalEvent::ReversalWarning { signal, .. } => signal,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalEvent::SignalEmitted(_) => "signal",
            SignalEvent::TakeProfitHit { .. } => "take_profit",
            SignalEvent::ReversalWarning { .. } => "reversal",
        }
    }
}
