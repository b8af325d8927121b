//! Event bus
//!
//! In-process publish/subscribe over a tokio broadcast channel. Publishers
//! never hold handles to subscribers; the executor in particular reaches the
//! notifier only through this bus.

use tokio::sync::broadcast;
use tracing::debug;

use crate::analysis::types::{Analysis, Timeframe};
use crate::trading::reconciler::Plan;

/// Typed events emitted by the pipeline stages.
#[derive(Debug, Clone)]
pub enum BotEvent {
    AnalysisStarted {
        timeframe: Timeframe,
    },
    AnalysisCompleted {
        timeframe: Timeframe,
        analysis: Analysis,
    },
    AnalysisFailed {
        timeframe: Timeframe,
        reason: String,
    },
    SignalRejected {
        reason: String,
    },
    PlanProduced {
        plan: Plan,
    },
    OrderSubmitted {
        action: String,
        order_id: Option<String>,
    },
    OrderFilled {
        action: String,
    },
    OrderFailed {
        action: String,
        error: String,
    },
    /// Synthetic event a channel emits about itself after dropping backlog.
    NotifierOverflow {
        channel: String,
        dropped: u64,
    },
}

impl BotEvent {
    /// Coalescing key: events of the same kind can be merged when a channel
    /// is rate-limited.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AnalysisStarted { .. } => "analysis_started",
            Self::AnalysisCompleted { .. } => "analysis_completed",
            Self::AnalysisFailed { .. } => "analysis_failed",
            Self::SignalRejected { .. } => "signal_rejected",
            Self::PlanProduced { .. } => "plan_produced",
            Self::OrderSubmitted { .. } => "order_submitted",
            Self::OrderFilled { .. } => "order_filled",
            Self::OrderFailed { .. } => "order_failed",
            Self::NotifierOverflow { .. } => "notifier_overflow",
        }
    }

    /// Trade and analysis events go to every channel; the rest only to the
    /// admin channel.
    pub fn is_broadcastable(&self) -> bool {
        !matches!(self, Self::NotifierOverflow { .. })
    }
}

/// Cheap-to-clone handle for publishing.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BotEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish, dropping silently when nobody is subscribed (startup,
    /// tests).
    pub fn publish(&self, event: BotEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("no subscribers for {}", event.kind());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.tx.subscribe()
    }
}
