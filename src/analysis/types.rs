//! Analysis domain types
//!
//! The advisor's structured verdict for one timeframe, plus the enums it is
//! built from. Raw advisor strings never travel past the gateway: everything
//! here is a tagged type.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Analysis timeframe. `Final` is synthetic: it is produced by re-prompting
/// the advisor with the four sampled timeframes bundled, never pulled from
/// the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "final")]
    Final,
}

impl Timeframe {
    /// The four timeframes sampled from the exchange, shortest first.
    pub const SOURCES: [Timeframe; 4] = [Self::M15, Self::H1, Self::H4, Self::D1];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            "final" => Some(Self::Final),
            _ => None,
        }
    }

    /// Bar period. `Final` has no sampling period.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::M15 => Some(Duration::minutes(15)),
            Self::H1 => Some(Duration::hours(1)),
            Self::H4 => Some(Duration::hours(4)),
            Self::D1 => Some(Duration::days(1)),
            Self::Final => None,
        }
    }

    /// Fixed OHLCV window length requested per trigger.
    pub fn window_len(&self) -> usize {
        match self {
            Self::M15 => 64,
            Self::H1 => 48,
            Self::H4 => 90,
            Self::D1 => 45,
            Self::Final => 0,
        }
    }

    /// Interval parameter in the exchange's kline API dialect.
    pub fn kline_interval(&self) -> &'static str {
        match self {
            Self::M15 => "15",
            Self::H1 => "60",
            Self::H4 => "240",
            Self::D1 => "D",
            Self::Final => "",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market phase as judged by the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPhase {
    Up,
    Down,
    Accumulate,
    Distribute,
}

/// Overall sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// Advisor-assessed risk level. Caps leverage and position size (§ policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

/// Position suggestion from the advisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Suggestion {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Suggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// The actionable subset of an analysis.
///
/// Price levels are optional because a HOLD carries none. `position_size_pct`
/// is a percentage of account equity, never a base-asset quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSignal {
    pub position_suggestion: Suggestion,
    pub entry_price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit1: Option<f64>,
    #[serde(default)]
    pub take_profit2: Option<f64>,
    #[serde(default)]
    pub take_profit3: Option<f64>,
    pub leverage: u32,
    pub position_size_pct: f64,
    pub auto_trading_enabled: bool,
}

impl TradingSignal {
    /// Check the directional ordering invariant between entry, stop and first
    /// take-profit. BUY requires `sl < entry < tp1`; SELL the reverse; HOLD
    /// is always valid.
    pub fn validate_levels(&self) -> Result<(), String> {
        let (entry, sl, tp) = match self.position_suggestion {
            Suggestion::Hold => return Ok(()),
            _ => match (self.entry_price, self.stop_loss, self.take_profit1) {
                (Some(e), Some(s), Some(t)) => (e, s, t),
                _ => {
                    return Err(format!(
                        "{} signal is missing entry/stop/take-profit levels",
                        self.position_suggestion
                    ))
                }
            },
        };

        if entry <= 0.0 || sl <= 0.0 || tp <= 0.0 {
            return Err("price levels must be positive".to_string());
        }

        match self.position_suggestion {
            Suggestion::Buy if !(sl < entry && entry < tp) => Err(format!(
                "BUY requires stop_loss < entry < take_profit1, got sl={} entry={} tp1={}",
                sl, entry, tp
            )),
            Suggestion::Sell if !(tp < entry && entry < sl) => Err(format!(
                "SELL requires take_profit1 < entry < stop_loss, got tp1={} entry={} sl={}",
                tp, entry, sl
            )),
            _ => Ok(()),
        }
    }

    /// Distance from entry to stop, as a percent of entry.
    pub fn stop_distance_pct(&self) -> Option<f64> {
        match (self.entry_price, self.stop_loss) {
            (Some(entry), Some(sl)) if entry > 0.0 => Some((sl - entry).abs() / entry * 100.0),
            _ => None,
        }
    }
}

/// The advisor's structured verdict for one timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub market_phase: MarketPhase,
    pub overall_sentiment: Sentiment,
    pub risk_level: RiskLevel,
    /// Confidence in the verdict, 0-100.
    pub confidence: u8,
    /// Trend strength, 0-100. Distinct from confidence: a weak but clean
    /// trend can carry high confidence.
    pub trend_strength: u8,
    pub trading_signals: TradingSignal,
    /// Millisecond timestamp at which the gateway accepted the verdict.
    pub generated_at: i64,
    pub source_timeframe: Timeframe,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(suggestion: Suggestion, entry: f64, sl: f64, tp: f64) -> TradingSignal {
        TradingSignal {
            position_suggestion: suggestion,
            entry_price: Some(entry),
            stop_loss: Some(sl),
            take_profit1: Some(tp),
            take_profit2: None,
            take_profit3: None,
            leverage: 5,
            position_size_pct: 20.0,
            auto_trading_enabled: true,
        }
    }

    #[test]
    fn test_buy_level_ordering() {
        assert!(signal(Suggestion::Buy, 60000.0, 59400.0, 61200.0)
            .validate_levels()
            .is_ok());
        // Stop above entry is invalid for a long
        assert!(signal(Suggestion::Buy, 60000.0, 60600.0, 61200.0)
            .validate_levels()
            .is_err());
    }

    #[test]
    fn test_sell_level_ordering() {
        assert!(signal(Suggestion::Sell, 58000.0, 58600.0, 56800.0)
            .validate_levels()
            .is_ok());
        assert!(signal(Suggestion::Sell, 58000.0, 57400.0, 56800.0)
            .validate_levels()
            .is_err());
    }

    #[test]
    fn test_hold_allows_missing_levels() {
        let sig = TradingSignal {
            position_suggestion: Suggestion::Hold,
            entry_price: None,
            stop_loss: None,
            take_profit1: None,
            take_profit2: None,
            take_profit3: None,
            leverage: 1,
            position_size_pct: 0.0,
            auto_trading_enabled: false,
        };
        assert!(sig.validate_levels().is_ok());
    }

    #[test]
    fn test_missing_levels_rejected_for_buy() {
        let mut sig = signal(Suggestion::Buy, 60000.0, 59400.0, 61200.0);
        sig.stop_loss = None;
        assert!(sig.validate_levels().is_err());
    }

    #[test]
    fn test_stop_distance_pct() {
        let sig = signal(Suggestion::Buy, 60000.0, 59400.0, 61200.0);
        let pct = sig.stop_distance_pct().unwrap();
        assert!((pct - 1.0).abs() < 1e-9); // 600 / 60000 = 1%
    }

    #[test]
    fn test_suggestion_wire_format() {
        assert_eq!(serde_json::to_string(&Suggestion::Buy).unwrap(), "\"BUY\"");
        assert!(serde_json::from_str::<Suggestion>("\"MAYBE\"").is_err());
    }

    #[test]
    fn test_timeframe_roundtrip() {
        for tf in Timeframe::SOURCES {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
        assert_eq!(Timeframe::parse("final"), Some(Timeframe::Final));
        assert_eq!(Timeframe::parse("2h"), None);
    }
}
