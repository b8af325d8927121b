//! Market data service
//!
//! Pulls the per-timeframe OHLCV window plus the 24h ticker snapshot and
//! computes the indicator table. Windows are re-pulled on every trigger,
//! never cached across triggers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::indicators::IndicatorTable;
use super::MarketDataError;
use crate::analysis::types::Timeframe;
use crate::exchange::{Bar, Exchange, ExchangeError, MarketSnapshot};

/// Retries after the initial attempt, with 1s/2s/4s backoff.
const MAX_RETRIES: u32 = 3;

/// Everything the advisor prompt needs for one timeframe.
pub struct MarketView {
    pub bars: Vec<Bar>,
    pub indicators: IndicatorTable,
    pub snapshot: MarketSnapshot,
}

/// Window + indicator fetcher over the exchange facade.
pub struct MarketDataService {
    exchange: Arc<dyn Exchange>,
    symbol: String,
}

impl MarketDataService {
    pub fn new(exchange: Arc<dyn Exchange>, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
        }
    }

    /// Pull the fixed-size window for `timeframe` and compute indicators.
    pub async fn window(&self, timeframe: Timeframe) -> Result<MarketView, MarketDataError> {
        let limit = timeframe.window_len();
        if limit == 0 {
            return Err(MarketDataError::Unavailable(format!(
                "{} has no sampled window",
                timeframe
            )));
        }

        let bars = retry_transient("get_ohlcv", || {
            self.exchange.get_ohlcv(&self.symbol, timeframe, limit)
        })
        .await?;

        if bars.is_empty() {
            return Err(MarketDataError::Unavailable(format!(
                "exchange returned no {} bars for {}",
                timeframe, self.symbol
            )));
        }
        debug!("pulled {} {} bars for {}", bars.len(), timeframe, self.symbol);

        let indicators = IndicatorTable::compute(&bars)?;
        let snapshot = self.snapshot().await?;

        Ok(MarketView {
            bars,
            indicators,
            snapshot,
        })
    }

    /// 24h ticker snapshot on its own, for status commands.
    pub async fn snapshot(&self) -> Result<MarketSnapshot, MarketDataError> {
        let snapshot = retry_transient("get_market_snapshot", || {
            self.exchange.get_market_snapshot(&self.symbol)
        })
        .await?;
        Ok(snapshot)
    }
}

/// Run `op`, retrying transient exchange errors with exponential backoff.
/// Non-transient errors fail immediately.
async fn retry_transient<T, F, Fut>(op_name: &str, mut op: F) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    op_name, attempt, MAX_RETRIES, delay, err
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_transient("op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ExchangeError::Transient("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_fails_fast_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = retry_transient("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Auth("bad key".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<i32, _> = retry_transient("op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ExchangeError::Transient("down".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ExchangeError::Transient(_))));
        // initial attempt + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
