//! Analysis domain: typed advisor verdicts and their persistence.

pub mod store;
pub mod types;

pub use store::{AnalysisStore, SnapshotBundle, StoreError};
pub use types::{Analysis, MarketPhase, RiskLevel, Sentiment, Suggestion, Timeframe, TradingSignal};
