//! Signal admissibility policy
//!
//! Rule-gates applied to the combined analysis before any order leaves the
//! process. A signal that fails any gate never reaches the reconciler; the
//! first failing gate names the rejection.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::analysis::types::{Analysis, RiskLevel, Suggestion};
use crate::exchange::OrderSide;

/// Per-risk-tier caps (leverage or position size).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskCaps<T> {
    pub high: T,
    pub medium: T,
    pub low: T,
}

impl<T: Copy> RiskCaps<T> {
    pub fn for_risk(&self, level: RiskLevel) -> T {
        match level {
            RiskLevel::High => self.high,
            RiskLevel::Medium => self.medium,
            RiskLevel::Low => self.low,
        }
    }
}

/// Policy thresholds. Defaults match the operating values the agent ships
/// with; all are configurable.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub min_confidence: u8,
    pub min_trend_strength: u8,
    pub max_daily_trades: u32,
    pub cooldown_minutes: i64,
    /// Max |stop - entry| / entry, in percent.
    pub max_loss_pct: f64,
    pub leverage_caps: RiskCaps<u32>,
    pub position_caps: RiskCaps<f64>,
    /// Calendar days for the daily-trade cap roll in this timezone.
    pub timezone: Tz,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_confidence: 70,
            min_trend_strength: 60,
            max_daily_trades: 3,
            cooldown_minutes: 60,
            max_loss_pct: 2.0,
            leverage_caps: RiskCaps { high: 10, medium: 5, low: 3 },
            position_caps: RiskCaps { high: 30.0, medium: 20.0, low: 15.0 },
            timezone: chrono_tz::Asia::Seoul,
        }
    }
}

/// Why a signal was turned away.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    AutoTradingDisabled,
    LowConfidence { confidence: u8, min: u8 },
    WeakTrend { strength: u8, min: u8 },
    DailyTradeCap { executed: u32, max: u32 },
    Cooldown { remaining_secs: i64 },
    StopTooWide { pct: f64, max: f64 },
    InvalidLevels { detail: String },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoTradingDisabled => write!(f, "auto-trading disabled by advisor"),
            Self::LowConfidence { confidence, min } => {
                write!(f, "confidence {} below minimum {}", confidence, min)
            }
            Self::WeakTrend { strength, min } => {
                write!(f, "trend strength {} below minimum {}", strength, min)
            }
            Self::DailyTradeCap { executed, max } => {
                write!(f, "daily trade cap reached ({}/{})", executed, max)
            }
            Self::Cooldown { remaining_secs } => {
                write!(f, "cooldown active, {}s remaining", remaining_secs)
            }
            Self::StopTooWide { pct, max } => {
                write!(f, "stop distance {:.2}% exceeds {:.2}%", pct, max)
            }
            Self::InvalidLevels { detail } => write!(f, "invalid price levels: {}", detail),
        }
    }
}

/// An admissible verdict: either stand aside, or trade with clamped
/// leverage and size.
#[derive(Debug, Clone, PartialEq)]
pub enum Admissible {
    Hold,
    Trade(OrderIntent),
}

/// A fully-gated trade intent. Leverage and size are already clamped by the
/// advisor's own risk tier.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub leverage: u32,
    pub size_pct: f64,
}

/// Stateful gatekeeper: tracks the daily trade count and the execution
/// cooldown across triggers.
pub struct SignalPolicy {
    config: PolicyConfig,
    trades_today: u32,
    day: Option<NaiveDate>,
    last_executed_at: Option<DateTime<Utc>>,
}

impl SignalPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            trades_today: 0,
            day: None,
            last_executed_at: None,
        }
    }

    /// Apply the gates in order. The first failure wins.
    pub fn evaluate(
        &mut self,
        analysis: &Analysis,
        now: DateTime<Utc>,
    ) -> Result<Admissible, RejectReason> {
        self.roll_day(now);
        let signal = &analysis.trading_signals;

        // Gate 1: the advisor itself must opt in.
        if !signal.auto_trading_enabled {
            return Err(RejectReason::AutoTradingDisabled);
        }

        // Gate 2: confidence.
        if analysis.confidence < self.config.min_confidence {
            return Err(RejectReason::LowConfidence {
                confidence: analysis.confidence,
                min: self.config.min_confidence,
            });
        }

        // Gate 3: trend strength.
        if analysis.trend_strength < self.config.min_trend_strength {
            return Err(RejectReason::WeakTrend {
                strength: analysis.trend_strength,
                min: self.config.min_trend_strength,
            });
        }

        // A HOLD that clears the quality gates is admissible and trades
        // nothing; the sizing gates below only apply to BUY/SELL.
        if signal.position_suggestion == Suggestion::Hold {
            return Ok(Admissible::Hold);
        }

        // Gate 4: daily trade cap.
        if self.trades_today >= self.config.max_daily_trades {
            return Err(RejectReason::DailyTradeCap {
                executed: self.trades_today,
                max: self.config.max_daily_trades,
            });
        }

        // Gate 5: execution cooldown.
        if let Some(last) = self.last_executed_at {
            let cooldown = Duration::minutes(self.config.cooldown_minutes);
            let elapsed = now - last;
            if elapsed < cooldown {
                return Err(RejectReason::Cooldown {
                    remaining_secs: (cooldown - elapsed).num_seconds(),
                });
            }
        }

        // Levels must exist and be ordered for the direction.
        if let Err(detail) = signal.validate_levels() {
            return Err(RejectReason::InvalidLevels { detail });
        }
        let entry = signal.entry_price.expect("validated above");
        let stop = signal.stop_loss.expect("validated above");
        let take_profit = signal.take_profit1.expect("validated above");

        // Gate 6: stop distance.
        let stop_pct = (stop - entry).abs() / entry * 100.0;
        if stop_pct > self.config.max_loss_pct {
            return Err(RejectReason::StopTooWide {
                pct: stop_pct,
                max: self.config.max_loss_pct,
            });
        }

        // Gate 7: clamp leverage and size by the advisor's own risk tier.
        let leverage = signal
            .leverage
            .min(self.config.leverage_caps.for_risk(analysis.risk_level))
            .max(1);
        let size_pct = signal
            .position_size_pct
            .min(self.config.position_caps.for_risk(analysis.risk_level));

        let side = match signal.position_suggestion {
            Suggestion::Buy => OrderSide::Buy,
            Suggestion::Sell => OrderSide::Sell,
            Suggestion::Hold => unreachable!("handled above"),
        };

        Ok(Admissible::Trade(OrderIntent {
            side,
            entry_price: entry,
            stop_loss: stop,
            take_profit,
            leverage,
            size_pct,
        }))
    }

    /// Record a completed execution. `last_executed_at` never decreases and
    /// the daily counter rolls with the configured timezone's calendar day.
    pub fn record_execution(&mut self, at: DateTime<Utc>) {
        self.roll_day(at);
        self.trades_today += 1;
        let effective = match self.last_executed_at {
            Some(prev) if prev > at => prev,
            _ => at,
        };
        self.last_executed_at = Some(effective);
        info!(
            "execution recorded, {} trade(s) today, cooldown until {}",
            self.trades_today,
            (effective + Duration::minutes(self.config.cooldown_minutes))
                .with_timezone(&self.config.timezone)
        );
    }

    pub fn trades_today(&self) -> u32 {
        self.trades_today
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let local_day = now.with_timezone(&self.config.timezone).date_naive();
        if self.day != Some(local_day) {
            self.day = Some(local_day);
            self.trades_today = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::{MarketPhase, Sentiment, Timeframe, TradingSignal};
    use chrono::TimeZone;

    fn analysis(confidence: u8, strength: u8, risk: RiskLevel, signal: TradingSignal) -> Analysis {
        Analysis {
            market_phase: MarketPhase::Up,
            overall_sentiment: Sentiment::Positive,
            risk_level: risk,
            confidence,
            trend_strength: strength,
            trading_signals: signal,
            generated_at: 0,
            source_timeframe: Timeframe::Final,
        }
    }

    fn buy_signal() -> TradingSignal {
        TradingSignal {
            position_suggestion: Suggestion::Buy,
            entry_price: Some(60000.0),
            stop_loss: Some(59400.0),
            take_profit1: Some(61200.0),
            take_profit2: None,
            take_profit3: None,
            leverage: 5,
            position_size_pct: 20.0,
            auto_trading_enabled: true,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_strong_buy_is_admissible() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        let result = policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, buy_signal()), at(10))
            .unwrap();
        match result {
            Admissible::Trade(intent) => {
                assert_eq!(intent.side, OrderSide::Buy);
                assert_eq!(intent.leverage, 5);
                assert_eq!(intent.size_pct, 20.0);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_cooldown_rejects() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        policy.record_execution(at(10));
        // 10 minutes later, inside the 60-minute cooldown
        let now = at(10) + Duration::minutes(10);
        let err = policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, buy_signal()), now)
            .unwrap_err();
        assert!(matches!(err, RejectReason::Cooldown { remaining_secs } if remaining_secs == 3000));
    }

    #[test]
    fn test_cooldown_clears_after_window() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        policy.record_execution(at(10));
        let now = at(10) + Duration::minutes(61);
        assert!(policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, buy_signal()), now)
            .is_ok());
    }

    #[test]
    fn test_last_executed_at_is_monotonic() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        policy.record_execution(at(12));
        policy.record_execution(at(10)); // out-of-order receipt
        assert_eq!(policy.last_executed_at(), Some(at(12)));
    }

    #[test]
    fn test_daily_cap_and_rollover() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        let cfg = PolicyConfig::default();
        for i in 0..cfg.max_daily_trades {
            // spread past the cooldown
            policy.record_execution(at(1) + Duration::hours(2 * i as i64));
        }
        let now = at(1) + Duration::hours(10);
        let err = policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, buy_signal()), now)
            .unwrap_err();
        assert!(matches!(err, RejectReason::DailyTradeCap { .. }));

        // Next local calendar day (KST): counter resets.
        let next_day = now + Duration::days(1);
        assert!(policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, buy_signal()), next_day)
            .is_ok());
    }

    #[test]
    fn test_risk_tier_clamps() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        let mut sig = buy_signal();
        sig.leverage = 10;
        sig.position_size_pct = 40.0;
        let result = policy
            .evaluate(&analysis(80, 70, RiskLevel::Low, sig), at(10))
            .unwrap();
        match result {
            Admissible::Trade(intent) => {
                assert_eq!(intent.leverage, 3);
                assert_eq!(intent.size_pct, 15.0);
            }
            other => panic!("expected trade, got {:?}", other),
        }
    }

    #[test]
    fn test_quality_gates_reject_in_order() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());

        let mut disabled = buy_signal();
        disabled.auto_trading_enabled = false;
        assert_eq!(
            policy
                .evaluate(&analysis(80, 70, RiskLevel::Medium, disabled), at(10))
                .unwrap_err(),
            RejectReason::AutoTradingDisabled
        );

        assert!(matches!(
            policy
                .evaluate(&analysis(69, 70, RiskLevel::Medium, buy_signal()), at(10))
                .unwrap_err(),
            RejectReason::LowConfidence { .. }
        ));

        assert!(matches!(
            policy
                .evaluate(&analysis(80, 59, RiskLevel::Medium, buy_signal()), at(10))
                .unwrap_err(),
            RejectReason::WeakTrend { .. }
        ));
    }

    #[test]
    fn test_wide_stop_rejected() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        let mut sig = buy_signal();
        sig.stop_loss = Some(58000.0); // 3.33% away
        let err = policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, sig), at(10))
            .unwrap_err();
        assert!(matches!(err, RejectReason::StopTooWide { .. }));
    }

    #[test]
    fn test_hold_passes_quality_gates_only() {
        let mut policy = SignalPolicy::new(PolicyConfig::default());
        let sig = TradingSignal {
            position_suggestion: Suggestion::Hold,
            entry_price: None,
            stop_loss: None,
            take_profit1: None,
            take_profit2: None,
            take_profit3: None,
            leverage: 1,
            position_size_pct: 0.0,
            auto_trading_enabled: true,
        };
        // Even with the daily cap exhausted, HOLD is admissible.
        for i in 0..3 {
            policy.record_execution(at(1) + Duration::hours(2 * i));
        }
        let result = policy
            .evaluate(&analysis(80, 70, RiskLevel::Medium, sig), at(10))
            .unwrap();
        assert_eq!(result, Admissible::Hold);
    }
}
