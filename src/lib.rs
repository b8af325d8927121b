// Library crate - exports the trading agent's subsystems

pub mod advisor;
pub mod analysis;
pub mod commands;
pub mod config;
pub mod events;
pub mod exchange;
pub mod market;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod trading;

// Re-export commonly used types
pub use analysis::types::{Analysis, Timeframe, TradingSignal};
pub use config::BotConfig;
pub use events::{BotEvent, EventBus};
pub use pipeline::Pipeline;
pub use scheduler::Scheduler;
