use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use btcpilot::advisor::{AdvisorGateway, OpenAiClient};
use btcpilot::analysis::AnalysisStore;
use btcpilot::commands::{command_loop, CommandRouter};
use btcpilot::config::BotConfig;
use btcpilot::events::EventBus;
use btcpilot::exchange::{BybitClient, Exchange, ExchangeError};
use btcpilot::market::MarketDataService;
use btcpilot::notify::{ChannelConfig, ChannelRole, ChatSender, Notifier, TelegramClient};
use btcpilot::pipeline::Pipeline;
use btcpilot::scheduler::Scheduler;
use btcpilot::trading::{ExecutorConfig, OrderExecutor, SignalPolicy};

/// Grace window for in-flight work on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Instrument to trade (uppercase concatenation)
    #[arg(long, env = "BOT_SYMBOL", default_value = "BTCUSDT")]
    symbol: String,

    /// IANA timezone for schedule boundaries and the daily trade cap
    #[arg(long, env = "BOT_TIMEZONE", default_value = "Asia/Seoul")]
    timezone: String,

    /// Use the exchange testnet endpoint
    #[arg(long, env = "BYBIT_TESTNET", default_value_t = false)]
    testnet: bool,

    /// Enable the optional 15m analysis schedule
    #[arg(long, env = "BOT_ENABLE_15M", default_value_t = false)]
    enable_15m: bool,

    /// Directory for persisted snapshots and trade history
    #[arg(long, env = "BOT_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Admin chat id: receives all events and command acknowledgements
    #[arg(long, env = "TELEGRAM_ADMIN_CHAT_ID")]
    admin_chat_id: i64,

    /// Notify-only chat ids (comma-separated)
    #[arg(long, env = "TELEGRAM_NOTIFY_CHAT_IDS", value_delimiter = ',', num_args = 0..)]
    notify_chat_ids: Vec<i64>,

    /// Minimum advisor confidence for execution
    #[arg(long, env = "BOT_MIN_CONFIDENCE", default_value_t = 70)]
    min_confidence: u8,

    /// Minimum trend strength for execution
    #[arg(long, env = "BOT_MIN_TREND_STRENGTH", default_value_t = 60)]
    min_trend_strength: u8,

    /// Executed plans allowed per local calendar day
    #[arg(long, env = "BOT_MAX_DAILY_TRADES", default_value_t = 3)]
    max_daily_trades: u32,

    /// Minimum minutes between executed plans
    #[arg(long, env = "BOT_COOLDOWN_MINUTES", default_value_t = 60)]
    cooldown_minutes: i64,

    /// Maximum stop distance as percent of entry
    #[arg(long, env = "BOT_MAX_LOSS_PCT", default_value_t = 2.0)]
    max_loss_pct: f64,

    /// Instrument quantity step in base units
    #[arg(long, env = "BOT_STEP_SIZE", default_value_t = 0.001)]
    step_size: f64,

    /// Minimum order value in quote units
    #[arg(long, env = "BOT_MIN_NOTIONAL", default_value_t = 1.0)]
    min_notional: f64,

    /// Messages per minute per notification channel
    #[arg(long, env = "BOT_RATE_LIMIT_PER_MIN", default_value_t = 20)]
    rate_limit_per_min: u32,
}

impl Args {
    fn into_config(self) -> Result<BotConfig> {
        let timezone = self
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid timezone {:?}: {}", self.timezone, e))?;

        let mut channels = vec![ChannelConfig {
            chat_id: self.admin_chat_id,
            role: ChannelRole::Admin,
            rate_limit_per_min: self.rate_limit_per_min,
        }];
        for chat_id in &self.notify_chat_ids {
            channels.push(ChannelConfig {
                chat_id: *chat_id,
                role: ChannelRole::NotifyOnly,
                rate_limit_per_min: self.rate_limit_per_min,
            });
        }

        let config = BotConfig {
            symbol: self.symbol,
            timezone,
            testnet: self.testnet,
            enable_15m: self.enable_15m,
            data_dir: self.data_dir,
            min_confidence: self.min_confidence,
            min_trend_strength: self.min_trend_strength,
            max_daily_trades: self.max_daily_trades,
            cooldown_minutes: self.cooldown_minutes,
            max_loss_pct: self.max_loss_pct,
            step_size: self.step_size,
            min_notional: self.min_notional,
            rate_limit_per_channel: self.rate_limit_per_min,
            channels,
            ..BotConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "btcpilot=info".parse().expect("valid filter")),
        )
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            error!("startup failed: {:#}", err);
            1
        }
    };
    process::exit(code);
}

async fn run() -> Result<i32> {
    // Exit code 2 is reserved for exchange auth failure; bad flags are a
    // config failure (1) like any other.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => {
            eprintln!("{}", err);
            return Ok(1);
        }
    };
    let config = args.into_config()?;
    info!(
        "starting btcpilot: {} ({}) tz={}",
        config.symbol,
        if config.testnet { "testnet" } else { "mainnet" },
        config.timezone,
    );

    // External clients. Missing credentials are a startup failure.
    let exchange: Arc<dyn Exchange> = Arc::new(BybitClient::from_env(config.testnet)?);
    let advisor_transport = Arc::new(OpenAiClient::from_env()?);
    let telegram = Arc::new(TelegramClient::from_env()?);

    // Auth probe: a rejected key is unrecoverable.
    match exchange.get_balance().await {
        Ok(equity) => info!("exchange reachable, equity {:.2} USDT", equity),
        Err(ExchangeError::Auth(msg)) => {
            error!("exchange authentication failed: {}", msg);
            return Ok(2);
        }
        Err(err) => warn!("balance probe failed, continuing: {}", err),
    }

    let store = Arc::new(AnalysisStore::open(&config.data_dir).context("opening analysis store")?);
    let events = EventBus::new(256);
    let notifier = Notifier::start(
        &events,
        telegram.clone() as Arc<dyn ChatSender>,
        config.channels.clone(),
    );

    let pipeline = Arc::new(Pipeline::new(
        config.symbol.clone(),
        MarketDataService::new(exchange.clone(), config.symbol.clone()),
        AdvisorGateway::new(advisor_transport, config.symbol.clone()),
        store,
        events.clone(),
        SignalPolicy::new(config.policy()),
        OrderExecutor::new(exchange.clone(), events.clone(), ExecutorConfig::new(&config.symbol)),
        exchange.clone(),
        config.sizing(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let admin_chat_id = config.channels[0].chat_id;
    let router = Arc::new(CommandRouter::new(
        pipeline.clone(),
        exchange.clone(),
        config.symbol.clone(),
        stop_tx.clone(),
    ));
    let command_handle = tokio::spawn(command_loop(
        router,
        telegram.clone(),
        admin_chat_id,
        stop_rx.clone(),
    ));

    let scheduler = Scheduler::start(pipeline, config.timezone, config.enable_15m);
    info!("btcpilot running; send /stop or press Ctrl-C to shut down");

    let mut stop_signal = stop_rx.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = stop_signal.changed() => info!("stop requested by operator"),
    }

    // Graceful drain: stop firing, finish in-flight work, flush the
    // notifier, then exit.
    let _ = stop_tx.send(true);
    scheduler.stop(SHUTDOWN_GRACE).await;
    notifier.shutdown(SHUTDOWN_GRACE).await;
    if tokio::time::timeout(Duration::from_secs(5), command_handle).await.is_err() {
        warn!("command loop did not stop in time");
    }

    info!("shutdown complete");
    Ok(0)
}
