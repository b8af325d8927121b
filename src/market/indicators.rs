//! Technical indicator table
//!
//! Dense per-bar indicator values over one OHLCV window. RSI, MACD,
//! Bollinger and the SMAs come from the `ta` crate; VWAP, Ichimoku lines and
//! ADX are computed locally since `ta` does not provide them.

use ta::indicators::{
    BollingerBands, MovingAverageConvergenceDivergence, RelativeStrengthIndex,
    SimpleMovingAverage,
};
use ta::Next;

use super::MarketDataError;
use crate::exchange::Bar;

/// Fewest bars that give the MACD(12,26,9) a usable warm-up.
pub const MIN_BARS: usize = 35;

const ADX_PERIOD: f64 = 14.0;
const TENKAN_PERIOD: usize = 9;
const KIJUN_PERIOD: usize = 26;

/// Indicator values for one bar.
#[derive(Debug, Clone)]
pub struct IndicatorRow {
    pub close: f64,
    pub volume: f64,
    pub rsi14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_histogram: f64,
    pub sma20: f64,
    pub sma50: f64,
    pub sma200: f64,
    pub bb_upper: f64,
    pub bb_middle: f64,
    pub bb_lower: f64,
    /// Volume-weighted average price, cumulative over the window.
    pub vwap: f64,
    pub adx14: f64,
    /// Ichimoku conversion line (9-period midpoint).
    pub tenkan: f64,
    /// Ichimoku base line (26-period midpoint).
    pub kijun: f64,
    pub volume_sma20: f64,
}

/// Trend direction summarized from the table's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Sideways,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Sideways => write!(f, "sideways"),
        }
    }
}

/// Trend plus its ADX-derived strength, 0-100.
#[derive(Debug, Clone, Copy)]
pub struct TrendSummary {
    pub trend: Trend,
    pub strength: u8,
}

/// Dense indicator table aligned with the input bars.
#[derive(Debug)]
pub struct IndicatorTable {
    rows: Vec<IndicatorRow>,
}

impl IndicatorTable {
    /// Compute the full table for one window. Requires at least [`MIN_BARS`]
    /// bars; shorter windows are a `MarketDataError::Unavailable`.
    pub fn compute(bars: &[Bar]) -> Result<Self, MarketDataError> {
        if bars.len() < MIN_BARS {
            return Err(MarketDataError::Unavailable(format!(
                "window has {} bars, need at least {}",
                bars.len(),
                MIN_BARS
            )));
        }

        let mut rsi = RelativeStrengthIndex::new(14).expect("period is non-zero");
        let mut macd =
            MovingAverageConvergenceDivergence::new(12, 26, 9).expect("periods are non-zero");
        let mut bb = BollingerBands::new(20, 2.0).expect("period is non-zero");
        let mut sma20 = SimpleMovingAverage::new(20).expect("period is non-zero");
        let mut sma50 = SimpleMovingAverage::new(50).expect("period is non-zero");
        let mut sma200 = SimpleMovingAverage::new(200).expect("period is non-zero");
        let mut vol_sma20 = SimpleMovingAverage::new(20).expect("period is non-zero");

        // Wilder-smoothed ADX state
        let mut smoothed_tr = 0.0;
        let mut smoothed_plus_dm = 0.0;
        let mut smoothed_minus_dm = 0.0;
        let mut adx = 0.0;

        // Cumulative VWAP state
        let mut cum_pv = 0.0;
        let mut cum_vol = 0.0;

        let mut rows = Vec::with_capacity(bars.len());

        for (i, bar) in bars.iter().enumerate() {
            let macd_out = macd.next(bar.close);
            let bb_out = bb.next(bar.close);

            let typical = (bar.high + bar.low + bar.close) / 3.0;
            cum_pv += typical * bar.volume;
            cum_vol += bar.volume;
            let vwap = if cum_vol > 0.0 { cum_pv / cum_vol } else { bar.close };

            if i > 0 {
                let prev = &bars[i - 1];
                let up_move = bar.high - prev.high;
                let down_move = prev.low - bar.low;
                let plus_dm = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
                let minus_dm = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };
                let tr = (bar.high - bar.low)
                    .max((bar.high - prev.close).abs())
                    .max((bar.low - prev.close).abs());

                smoothed_tr += (tr - smoothed_tr) / ADX_PERIOD;
                smoothed_plus_dm += (plus_dm - smoothed_plus_dm) / ADX_PERIOD;
                smoothed_minus_dm += (minus_dm - smoothed_minus_dm) / ADX_PERIOD;

                if smoothed_tr > 0.0 {
                    let plus_di = 100.0 * smoothed_plus_dm / smoothed_tr;
                    let minus_di = 100.0 * smoothed_minus_dm / smoothed_tr;
                    let di_sum = plus_di + minus_di;
                    let dx = if di_sum > 0.0 {
                        100.0 * (plus_di - minus_di).abs() / di_sum
                    } else {
                        0.0
                    };
                    adx += (dx - adx) / ADX_PERIOD;
                }
            }

            let tenkan = midpoint(&bars[..=i], TENKAN_PERIOD);
            let kijun = midpoint(&bars[..=i], KIJUN_PERIOD);

            rows.push(IndicatorRow {
                close: bar.close,
                volume: bar.volume,
                rsi14: rsi.next(bar.close),
                macd: macd_out.macd,
                macd_signal: macd_out.signal,
                macd_histogram: macd_out.histogram,
                sma20: sma20.next(bar.close),
                sma50: sma50.next(bar.close),
                sma200: sma200.next(bar.close),
                bb_upper: bb_out.upper,
                bb_middle: bb_out.average,
                bb_lower: bb_out.lower,
                vwap,
                adx14: adx,
                tenkan,
                kijun,
                volume_sma20: vol_sma20.next(bar.volume),
            });
        }

        Ok(Self { rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn latest(&self) -> &IndicatorRow {
        self.rows.last().expect("table is never empty")
    }

    /// Last `n` rows, oldest first.
    pub fn tail(&self, n: usize) -> &[IndicatorRow] {
        let start = self.rows.len().saturating_sub(n);
        &self.rows[start..]
    }

    /// Summarize direction from the moving-average stack and MACD, with ADX
    /// as the strength reading.
    pub fn trend(&self) -> TrendSummary {
        let row = self.latest();
        let strength = row.adx14.clamp(0.0, 100.0).round() as u8;

        let bullish = row.close > row.sma20 && row.sma20 > row.sma50 && row.macd > row.macd_signal;
        let bearish = row.close < row.sma20 && row.sma20 < row.sma50 && row.macd < row.macd_signal;

        let trend = if bullish {
            Trend::Bullish
        } else if bearish {
            Trend::Bearish
        } else {
            Trend::Sideways
        };

        TrendSummary { trend, strength }
    }
}

/// Midpoint of the highest high and lowest low over the trailing `period`
/// bars (fewer during warm-up).
fn midpoint(bars: &[Bar], period: usize) -> f64 {
    let start = bars.len().saturating_sub(period);
    let window = &bars[start..];
    let high = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    (high + low) / 2.0
}
