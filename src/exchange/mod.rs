//! Exchange facade
//!
//! The thin contract the core consumes. Everything behind it (signing,
//! field-name normalization, endpoint selection) is the adapter's concern;
//! the core only ever sees these types.

pub mod bybit;

pub use bybit::client::BybitClient;

use async_trait::async_trait;

use crate::analysis::types::Timeframe;

/// A single OHLCV bar. `open_ts` is milliseconds since epoch; windows are
/// monotonic in `open_ts`, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bar {
    pub open_ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Side of a live position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
            Self::Flat => write!(f, "FLAT"),
        }
    }
}

/// Live position as read from the exchange. `Flat` iff `size_base == 0`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub side: PositionSide,
    /// Absolute size in base-asset units, never negative.
    pub size_base: f64,
    pub leverage: u32,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub liq_price: Option<f64>,
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            size_base: 0.0,
            leverage: 0,
            entry_price: 0.0,
            mark_price: 0.0,
            unrealized_pnl: 0.0,
            liq_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size_base == 0.0
    }
}

/// Order side in the exchange dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// The position side an entry on this side establishes.
    pub fn position_side(&self) -> PositionSide {
        match self {
            Self::Buy => PositionSide::Long,
            Self::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Limit,
    Market,
}

/// A single order as the core hands it to the adapter.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// Quantity in base-asset units, already step-rounded by the caller.
    pub qty: f64,
    /// Limit price; required for `OrderKind::Limit`.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// 24h ticker snapshot used to enrich advisor prompts.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub last_price: f64,
    pub price_change_24h_pct: f64,
    pub volume_24h: f64,
    pub funding_rate: f64,
}

/// Error kinds surfaced by the adapter. The split drives retry policy:
/// `Transient` is retryable, everything else fails fast.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
    #[error("symbol filter rejected order: {0}")]
    FilterRejected(String),
    #[error("exchange authentication failed: {0}")]
    Auth(String),
    #[error("exchange error: {0}")]
    Other(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// The facade the core trades through.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Pull up to `limit` bars for a sampled timeframe, oldest first.
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    /// Equity of the unified margin account, in quote units.
    async fn get_balance(&self) -> Result<f64, ExchangeError>;

    async fn get_position(&self, symbol: &str) -> Result<Position, ExchangeError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError>;

    /// Submit an order; returns the exchange order id.
    async fn create_order(&self, req: &OrderRequest) -> Result<String, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError>;
}
