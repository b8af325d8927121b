//! Runtime configuration

use std::path::PathBuf;

use anyhow::{bail, Result};
use chrono_tz::Tz;

use crate::notify::ChannelConfig;
use crate::trading::policy::{PolicyConfig, RiskCaps};
use crate::trading::reconciler::SizingConfig;

/// Configuration for the trading agent. Defaults are the shipping values;
/// every field can be overridden from the CLI or environment.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Instrument, uppercase concatenation (e.g. "BTCUSDT").
    pub symbol: String,

    /// Timezone for wall-clock schedule boundaries and the daily trade cap.
    pub timezone: Tz,

    /// Use the exchange testnet endpoint (endpoint selection only).
    pub testnet: bool,

    /// Enable the optional 15m schedule.
    pub enable_15m: bool,

    /// Root of the persisted state (`analysis/`, `trades/`).
    pub data_dir: PathBuf,

    /// Minimum advisor confidence for execution.
    pub min_confidence: u8,

    /// Minimum trend strength for execution.
    pub min_trend_strength: u8,

    /// Executed plans allowed per local calendar day.
    pub max_daily_trades: u32,

    /// Minimum gap between executed plans.
    pub cooldown_minutes: i64,

    /// Maximum stop distance as percent of entry.
    pub max_loss_pct: f64,

    /// Informational take-profit ladder beyond the attached first level.
    pub profit_targets: Vec<f64>,

    /// Leverage ceiling per advisor risk tier.
    pub leverage_caps: RiskCaps<u32>,

    /// Position-size ceiling (percent of equity) per advisor risk tier.
    pub position_caps: RiskCaps<f64>,

    /// Instrument quantity step in base units.
    pub step_size: f64,

    /// Minimum order value in quote units.
    pub min_notional: f64,

    /// Token-bucket rate per notification channel, messages per minute.
    pub rate_limit_per_channel: u32,

    /// Notification channels; exactly one must have the admin role.
    pub channels: Vec<ChannelConfig>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            timezone: chrono_tz::Asia::Seoul,
            testnet: false,
            enable_15m: false,
            data_dir: PathBuf::from("data"),
            min_confidence: 70,
            min_trend_strength: 60,
            max_daily_trades: 3,
            cooldown_minutes: 60,
            max_loss_pct: 2.0,
            profit_targets: vec![2.0, 4.0, 6.0],
            leverage_caps: RiskCaps { high: 10, medium: 5, low: 3 },
            position_caps: RiskCaps { high: 30.0, medium: 20.0, low: 15.0 },
            step_size: 0.001,
            min_notional: 1.0,
            rate_limit_per_channel: 20,
            channels: Vec::new(),
        }
    }
}

impl BotConfig {
    /// The policy-gate slice of this config.
    pub fn policy(&self) -> PolicyConfig {
        PolicyConfig {
            min_confidence: self.min_confidence,
            min_trend_strength: self.min_trend_strength,
            max_daily_trades: self.max_daily_trades,
            cooldown_minutes: self.cooldown_minutes,
            max_loss_pct: self.max_loss_pct,
            leverage_caps: self.leverage_caps,
            position_caps: self.position_caps,
            timezone: self.timezone,
        }
    }

    /// The instrument sizing slice of this config.
    pub fn sizing(&self) -> SizingConfig {
        SizingConfig {
            step_size: self.step_size,
            min_notional: self.min_notional,
        }
    }

    /// Reject malformed configurations before startup.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.is_empty()
            || self.symbol.contains(':')
            || self.symbol.chars().any(|c| c.is_lowercase())
        {
            bail!(
                "symbol must be an uppercase concatenation like BTCUSDT, got {:?}",
                self.symbol
            );
        }
        if self.step_size <= 0.0 {
            bail!("step_size must be positive");
        }
        if self.min_notional < 0.0 {
            bail!("min_notional must not be negative");
        }
        let admins = self
            .channels
            .iter()
            .filter(|c| c.role == crate::notify::ChannelRole::Admin)
            .count();
        if admins != 1 {
            bail!("exactly one admin channel required, found {}", admins);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::ChannelRole;

    fn with_admin() -> BotConfig {
        let mut config = BotConfig::default();
        config.channels.push(ChannelConfig {
            chat_id: 1,
            role: ChannelRole::Admin,
            rate_limit_per_min: 20,
        });
        config
    }

    #[test]
    fn test_default_config_validates_with_admin_channel() {
        assert!(with_admin().validate().is_ok());
        assert!(BotConfig::default().validate().is_err()); // no admin channel
    }

    #[test]
    fn test_colon_symbols_rejected() {
        let mut config = with_admin();
        config.symbol = "BTC:USDT".to_string();
        assert!(config.validate().is_err());
        config.symbol = "btcusdt".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_two_admin_channels_rejected() {
        let mut config = with_admin();
        config.channels.push(ChannelConfig {
            chat_id: 2,
            role: ChannelRole::Admin,
            rate_limit_per_min: 20,
        });
        assert!(config.validate().is_err());
    }
}
