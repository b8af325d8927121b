//! Operator command surface
//!
//! Parses and dispatches the chat commands. Only the admin channel is
//! listened to; acknowledgements go back to it and nowhere else.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::analysis::types::Timeframe;
use crate::exchange::Exchange;
use crate::notify::format;
use crate::notify::telegram::{ChatSender, TelegramClient};
use crate::pipeline::{Pipeline, PipelineError};
use crate::trading::records::TriggerKind;

/// Poll duration for Telegram long polling.
const POLL_SECS: u64 = 25;
/// Trades shown by `/stats`.
const STATS_TAIL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Balance,
    Position,
    Price,
    Analyze(Timeframe),
    Last(Timeframe),
    Trade,
    Stats,
    Stop,
}

impl Command {
    /// Parse one chat message. `None` for anything that is not a command;
    /// `Some(Err(..))` for a command with bad arguments.
    pub fn parse(text: &str) -> Option<Result<Command, String>> {
        let mut parts = text.split_whitespace();
        let head = parts.next()?;
        if !head.starts_with('/') {
            return None;
        }
        // Telegram appends "@botname" in group chats.
        let name = head.trim_start_matches('/').split('@').next().unwrap_or("");

        let command = match name {
            "status" => Command::Status,
            "balance" => Command::Balance,
            "position" => Command::Position,
            "price" => Command::Price,
            "trade" => Command::Trade,
            "stats" => Command::Stats,
            "stop" => Command::Stop,
            "analyze" => match parts.next().map(Timeframe::parse) {
                Some(Some(tf)) if tf != Timeframe::Final => Command::Analyze(tf),
                Some(Some(Timeframe::Final)) => {
                    return Some(Err("use /trade for the combined pipeline".to_string()))
                }
                _ => {
                    return Some(Err(
                        "usage: /analyze <15m|1h|4h|1d>".to_string(),
                    ))
                }
            },
            "last" => match parts.next() {
                None => Command::Last(Timeframe::Final),
                Some(arg) => match Timeframe::parse(arg) {
                    Some(tf) => Command::Last(tf),
                    None => {
                        return Some(Err(
                            "usage: /last [15m|1h|4h|1d|final]".to_string(),
                        ))
                    }
                },
            },
            _ => return Some(Err(format!("unknown command /{}", name))),
        };
        Some(Ok(command))
    }
}

pub struct CommandRouter {
    pipeline: Arc<Pipeline>,
    exchange: Arc<dyn Exchange>,
    symbol: String,
    stop_tx: watch::Sender<bool>,
}

impl CommandRouter {
    pub fn new(
        pipeline: Arc<Pipeline>,
        exchange: Arc<dyn Exchange>,
        symbol: impl Into<String>,
        stop_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            pipeline,
            exchange,
            symbol: symbol.into(),
            stop_tx,
        }
    }

    /// Execute one command and produce the acknowledgement text.
    pub async fn handle(&self, command: Command) -> String {
        match command {
            Command::Status => match self.pipeline.market().window(Timeframe::H1).await {
                Ok(view) => {
                    let row = view.indicators.latest();
                    let trend = view.indicators.trend();
                    format!(
                        "{}\nrsi {:.1} | macd {:.2}/{:.2} | trend {} ({}/100)",
                        format::format_snapshot(&self.symbol, &view.snapshot),
                        row.rsi14,
                        row.macd,
                        row.macd_signal,
                        trend.trend,
                        trend.strength,
                    )
                }
                Err(err) => format!("status unavailable: {}", err),
            },
            Command::Balance => match self.exchange.get_balance().await {
                Ok(equity) => format!("Equity: *{:.2} USDT*", equity),
                Err(err) => format!("balance unavailable: {}", err),
            },
            Command::Position => match self.exchange.get_position(&self.symbol).await {
                Ok(position) => format::format_position(&position),
                Err(err) => format!("position unavailable: {}", err),
            },
            Command::Price => match self.pipeline.market().snapshot().await {
                Ok(snapshot) => format::format_snapshot(&self.symbol, &snapshot),
                Err(err) => format!("price unavailable: {}", err),
            },
            Command::Analyze(tf) => match self.pipeline.run_timeframe(tf).await {
                Ok(analysis) => format!(
                    "*{}* analysis done\n{}",
                    tf,
                    format::format_analysis(&analysis)
                ),
                Err(PipelineError::Busy(tf)) => {
                    format!("{} analysis already running, try again shortly", tf)
                }
                Err(err) => format!("analysis failed: {}", err),
            },
            Command::Last(tf) => match self.pipeline.store().get(tf) {
                Some(analysis) => format!("*{}* snapshot\n{}", tf, format::format_analysis(&analysis)),
                None => format!("no {} analysis stored yet", tf),
            },
            Command::Trade => match self.pipeline.run_final(TriggerKind::Manual).await {
                Ok(()) => "combined pipeline finished (see events above)".to_string(),
                Err(PipelineError::Busy(_)) => {
                    "combined pipeline already running".to_string()
                }
                Err(err) => format!("combined pipeline failed: {}", err),
            },
            Command::Stats => match self.pipeline.store().history_tail(STATS_TAIL) {
                Ok(records) => format::format_trade_history(&records),
                Err(err) => format!("history unavailable: {}", err),
            },
            Command::Stop => {
                let _ = self.stop_tx.send(true);
                "shutting down gracefully".to_string()
            }
        }
    }
}

/// Long-poll the admin channel for commands until shutdown. Messages from
/// any other chat are ignored outright.
pub async fn command_loop(
    router: Arc<CommandRouter>,
    telegram: Arc<TelegramClient>,
    admin_chat_id: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut offset = 0i64;
    info!("command loop listening on admin chat {}", admin_chat_id);

    loop {
        let updates = tokio::select! {
            result = telegram.get_updates(offset, POLL_SECS) => match result {
                Ok(updates) => updates,
                Err(err) => {
                    warn!("getUpdates failed: {}", err);
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            },
            _ = shutdown.changed() => break,
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else { continue };
            if message.chat.id != admin_chat_id {
                continue;
            }
            let Some(text) = message.text else { continue };

            let reply = match Command::parse(&text) {
                None => continue,
                Some(Err(usage)) => usage,
                Some(Ok(command)) => {
                    info!("operator command: {:?}", command);
                    router.handle(command).await
                }
            };
            if let Err(err) = telegram.send(admin_chat_id, &reply).await {
                warn!("failed to acknowledge command: {}", err);
            }
        }
    }
    info!("command loop stopped");
}
