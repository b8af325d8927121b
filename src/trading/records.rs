//! Trade history records
//!
//! One record per executed plan, appended to the JSONL history and never
//! mutated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::reconciler::PlanAction;
use crate::analysis::types::TradingSignal;

/// What fired the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Auto,
    Manual,
}

/// Terminal state of one plan action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded {
        order_id: Option<String>,
        attempts: u32,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

/// One action with its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub action: PlanAction,
    #[serde(flatten)]
    pub status: ActionStatus,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ActionStatus::Succeeded { .. } | ActionStatus::Skipped { .. })
    }
}

/// Append-only record of one executed plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub trigger: TriggerKind,
    /// The advisor signal the plan was derived from.
    pub signal: TradingSignal,
    pub plan: Vec<PlanAction>,
    pub outcomes: Vec<ActionOutcome>,
}

impl TradeRecord {
    pub fn fully_succeeded(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|o| o.succeeded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::Suggestion;

    #[test]
    fn test_record_roundtrips_as_json_line() {
        let record = TradeRecord {
            id: Uuid::new_v4(),
            recorded_at: Utc::now(),
            trigger: TriggerKind::Auto,
            signal: TradingSignal {
                position_suggestion: Suggestion::Buy,
                entry_price: Some(60000.0),
                stop_loss: Some(59400.0),
                take_profit1: Some(61200.0),
                take_profit2: None,
                take_profit3: None,
                leverage: 5,
                position_size_pct: 20.0,
                auto_trading_enabled: true,
            },
            plan: vec![PlanAction::SetLeverage(5)],
            outcomes: vec![ActionOutcome {
                action: PlanAction::SetLeverage(5),
                status: ActionStatus::Skipped {
                    reason: "already at 5x".to_string(),
                },
            }],
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        let parsed: TradeRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, record.id);
        assert!(parsed.fully_succeeded());
    }
}
