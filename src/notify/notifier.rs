//! Channel notifier
//!
//! One worker task per chat channel, each with its own view of the event
//! bus. Delivery is per-channel serial, token-bucket rate-limited, and a
//! slow channel never blocks the others. Backlog beyond the bus capacity is
//! dropped oldest-first with a synthetic overflow notice.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::format;
use super::telegram::ChatSender;
use crate::events::{BotEvent, EventBus};

/// How long a rate-limited send may simply wait before the notifier starts
/// coalescing instead.
const MAX_INLINE_WAIT: Duration = Duration::from_secs(5);

/// Channel role. Exactly one channel is `Admin`: it receives every event and
/// all command acknowledgements. `NotifyOnly` channels receive trade and
/// analysis events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Admin,
    NotifyOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub chat_id: i64,
    pub role: ChannelRole,
    /// Messages per minute for this channel's token bucket.
    pub rate_limit_per_min: u32,
}

/// Token bucket over tokio's clock (so tests with paused time work).
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: tokio::time::Instant,
}

impl TokenBucket {
    fn new(per_min: u32) -> Self {
        let capacity = per_min.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last: tokio::time::Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }

    /// Time until one token is available; zero if one is ready now.
    fn wait_time(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }

    fn take(&mut self) {
        self.refill();
        self.tokens = (self.tokens - 1.0).max(0.0);
    }
}

fn deliverable(role: ChannelRole, event: &BotEvent) -> bool {
    match role {
        ChannelRole::Admin => true,
        ChannelRole::NotifyOnly => event.is_broadcastable(),
    }
}

/// Spawns and owns the per-channel workers.
pub struct Notifier {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Notifier {
    pub fn start(
        bus: &EventBus,
        sender: Arc<dyn ChatSender>,
        channels: Vec<ChannelConfig>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = channels
            .into_iter()
            .map(|config| {
                let rx = bus.subscribe();
                let sender = sender.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(channel_worker(config, rx, sender, shutdown))
            })
            .collect();
        Self { shutdown_tx, workers }
    }

    /// Ask every worker to flush and stop, waiting up to `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let drain = async {
            for worker in self.workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("notifier shutdown exceeded {:?}, dropping remaining messages", grace);
        }
    }
}

async fn channel_worker(
    config: ChannelConfig,
    mut rx: tokio::sync::broadcast::Receiver<BotEvent>,
    sender: Arc<dyn ChatSender>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut bucket = TokenBucket::new(config.rate_limit_per_min);
    let mut pending: Vec<BotEvent> = Vec::new();
    info!("notifier channel {} ({:?}) started", config.chat_id, config.role);

    loop {
        // Flush any coalesced backlog as soon as a token is available.
        if !pending.is_empty() {
            let wait = bucket.wait_time();
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
            bucket.take();
            let text = format::format_coalesced(&pending);
            deliver(&*sender, config.chat_id, &text).await;
            pending.clear();
        }

        let event = tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(dropped)) => {
                    warn!("channel {} lagged, {} event(s) dropped", config.chat_id, dropped);
                    BotEvent::NotifierOverflow {
                        channel: config.chat_id.to_string(),
                        dropped,
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };

        if !deliverable(config.role, &event) {
            continue;
        }

        let wait = bucket.wait_time();
        if wait <= MAX_INLINE_WAIT {
            if wait > Duration::ZERO {
                tokio::time::sleep(wait).await;
            }
            bucket.take();
            deliver(&*sender, config.chat_id, &format::format_event(&event)).await;
        } else {
            // Bucket is dry: hold the message and merge whatever else has
            // queued up behind it.
            pending.push(event);
            while let Ok(extra) = rx.try_recv() {
                if deliverable(config.role, &extra) {
                    pending.push(extra);
                }
            }
        }
    }

    // Drain what is left before exiting.
    while let Ok(event) = rx.try_recv() {
        if deliverable(config.role, &event) {
            pending.push(event);
        }
    }
    if !pending.is_empty() {
        let text = format::format_coalesced(&pending);
        deliver(&*sender, config.chat_id, &text).await;
    }
    info!("notifier channel {} stopped", config.chat_id);
}

async fn deliver(sender: &dyn ChatSender, chat_id: i64, text: &str) {
    if let Err(err) = sender.send(chat_id, text).await {
        warn!("delivery to chat {} failed: {}", chat_id, err);
    }
}
