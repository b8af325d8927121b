//! Market data: OHLCV windows and the indicator table fed to the advisor.

pub mod data;
pub mod indicators;

pub use data::{MarketDataService, MarketView};
pub use indicators::{IndicatorTable, Trend, TrendSummary};

use crate::exchange::ExchangeError;

/// Market-data failure modes. `Unavailable` is terminal for the trigger;
/// `Exchange(Transient…)` is retried by the service.
#[derive(Debug, thiserror::Error)]
pub enum MarketDataError {
    #[error("market data unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}
