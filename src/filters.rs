use crate::config::ScannerConfig;
use crate::types::{BreakoutInfo, Candle, CandleColor, CandleMetrics, OiSample, TrendSummary, VolumeStats};

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Body and wick sizes as a share of the high-low range.
/// A zero range is a doji with all percentages at 0.
pub fn candle_metrics(c: &Candle) -> CandleMetrics {
    let range = c.high - c.low;
    if range <= 0.0 {
        return CandleMetrics {
            color: CandleColor::Doji,
            body_pct: 0.0,
            upper_wick_pct: 0.0,
            lower_wick_pct: 0.0,
        };
    }

    let color = if c.close >= c.open { CandleColor::Green } else { CandleColor::Red };
    let body = (c.close - c.open).abs();
    let upper_wick = c.high - c.close.max(c.open);
    let lower_wick = c.close.min(c.open) - c.low;

    CandleMetrics {
        color,
        body_pct: round1(body / range * 100.0),
        upper_wick_pct: round1(upper_wick / range * 100.0),
        lower_wick_pct: round1(lower_wick / range * 100.0),
    }
}

/// `G` for a strictly rising candle, `R` otherwise, over the last `count` candles.
pub fn trend_summary(candles: &[Candle], count: usize) -> TrendSummary {
    let recent = &candles[candles.len().saturating_sub(count)..];
    let pattern: String = recent
        .iter()
        .map(|c| if c.close > c.open { 'G' } else { 'R' })
        .collect();
    TrendSummary {
        green_count: pattern.chars().filter(|&ch| ch == 'G').count(),
        total: recent.len(),
        pattern,
    }
}

fn avg_quote_volume(candles: &[Candle]) -> Option<f64> {
    if candles.is_empty() {
        return None;
    }
    Some(candles.iter().map(|c| c.quote_volume).sum::<f64>() / candles.len() as f64)
}

/// Average quote volume of the last `recent` candles against the `baseline`
/// candles just before them. `None` when either window is incomplete or the
/// baseline average is not positive.
pub fn volume_ratio(candles: &[Candle], recent: usize, baseline: usize) -> Option<VolumeStats> {
    let n = candles.len();
    if recent == 0 || baseline == 0 || n < recent + baseline {
        return None;
    }
    let recent_avg = avg_quote_volume(&candles[n - recent..])?;
    let baseline_avg = avg_quote_volume(&candles[n - recent - baseline..n - recent])?;
    if baseline_avg <= 0.0 {
        return None;
    }
    Some(VolumeStats { ratio: recent_avg / baseline_avg, recent_avg, baseline_avg })
}

/// Highest high of the `lookback` candles preceding the latest one.
pub fn breakout_level(candles: &[Candle], lookback: usize) -> Option<f64> {
    let n = candles.len();
    if lookback == 0 || n < lookback + 1 {
        return None;
    }
    candles[n - 1 - lookback..n - 1]
        .iter()
        .map(|c| c.high)
        .fold(None, |acc: Option<f64>, h| Some(acc.map_or(h, |a| a.max(h))))
}

/// `Some` only when the latest close exceeds the breakout level.
pub fn breakout(candles: &[Candle], lookback: usize) -> Option<BreakoutInfo> {
    let level = breakout_level(candles, lookback)?;
    let close = candles.last()?.close;
    if level <= 0.0 || close <= level {
        return None;
    }
    Some(BreakoutInfo { level, margin_pct: (close - level) / level * 100.0 })
}

/// Latest OI value against the mean of the `periods` samples before it, in percent.
pub fn oi_change_pct(history: &[OiSample], periods: usize) -> Option<f64> {
    if periods == 0 || history.len() < periods + 1 {
        return None;
    }
    let window = &history[history.len() - periods - 1..];
    let (latest, previous) = window.split_last()?;
    let avg = previous.iter().map(|s| s.open_interest_value).sum::<f64>() / previous.len() as f64;
    if avg <= 0.0 {
        return None;
    }
    Some((latest.open_interest_value - avg) / avg * 100.0)
}

/// Candle count covering every enabled stage.
pub fn candles_needed(cfg: &ScannerConfig) -> usize {
    let volume = cfg.volume_recent_candles + cfg.volume_baseline_candles;
    let breakout = if cfg.breakout_enabled { cfg.breakout_lookback + 1 } else { 0 };
    volume.max(breakout).max(cfg.trend_candles)
}
