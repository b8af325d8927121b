//! Position reconciler
//!
//! Compares an admissible signal against the live exchange position and
//! emits an ordered plan of primitive actions. A plan never contains more
//! than one direction change, and a flip always closes before it reopens.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::policy::{Admissible, OrderIntent};
use crate::exchange::{OrderSide, Position};

/// A primitive exchange action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlanAction {
    SetLeverage(u32),
    ClosePosition,
    OpenPosition {
        side: OrderSide,
        qty_base: f64,
        entry_limit: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    /// Signed delta in base units; positive adds in the current direction.
    ResizePosition { delta_base: f64 },
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetLeverage(l) => write!(f, "SetLeverage({}x)", l),
            Self::ClosePosition => write!(f, "ClosePosition"),
            Self::OpenPosition { side, qty_base, entry_limit, .. } => {
                write!(f, "OpenPosition({:?} {} @ {})", side, qty_base, entry_limit)
            }
            Self::ResizePosition { delta_base } => write!(f, "ResizePosition({:+})", delta_base),
        }
    }
}

/// Ordered list of actions produced for one trigger. Ephemeral: plans are
/// never persisted on their own, only inside trade records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub actions: Vec<PlanAction>,
}

impl Plan {
    fn new(actions: Vec<PlanAction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// A plan may not open against a live position: any `OpenPosition` must
    /// be preceded by a `ClosePosition` unless the account starts flat.
    pub fn respects_close_before_open(&self, live: &Position) -> bool {
        let mut open_allowed = live.is_flat();
        for action in &self.actions {
            match action {
                PlanAction::ClosePosition => open_allowed = true,
                PlanAction::OpenPosition { .. } => {
                    if !open_allowed {
                        return false;
                    }
                    open_allowed = false;
                }
                _ => {}
            }
        }
        true
    }
}

/// Instrument sizing filters.
#[derive(Debug, Clone, Copy)]
pub struct SizingConfig {
    /// Minimum base-asset quantity increment.
    pub step_size: f64,
    /// Minimum order value in quote units.
    pub min_notional: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            step_size: 0.001,
            min_notional: 1.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("equity must be positive, got {0}")]
    NonPositiveEquity(f64),
    #[error(
        "target quantity {qty} at {price} is below min notional {min_notional}, refusing plan"
    )]
    BelowMinNotional { qty: f64, price: f64, min_notional: f64 },
}

/// Largest multiple of `step` that is <= `qty`.
fn floor_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return qty;
    }
    ((qty / step) + 1e-9).floor() * step
}

/// Target quantity for an intent: percent of equity, levered, at the entry
/// price, floored to the instrument step.
fn target_qty(intent: &OrderIntent, equity: f64, cfg: &SizingConfig) -> f64 {
    let raw = equity * (intent.size_pct / 100.0) * intent.leverage as f64 / intent.entry_price;
    floor_step(raw, cfg.step_size)
}

/// Build the plan for one admissible signal against a freshly-read position.
///
/// Decision table:
/// - hold (any position)                      -> []
/// - flat, buy/sell                           -> [SetLeverage, Open]
/// - same side, same leverage                 -> [Resize] or [] below filters
/// - same side, different leverage            -> [Close, SetLeverage, Open]
/// - opposite side                            -> [Close, SetLeverage, Open]
pub fn build_plan(
    signal: &Admissible,
    position: &Position,
    equity: f64,
    cfg: &SizingConfig,
) -> Result<Plan, PlanError> {
    let intent = match signal {
        Admissible::Hold => return Ok(Plan::new(vec![])),
        Admissible::Trade(intent) => intent,
    };

    if equity <= 0.0 {
        return Err(PlanError::NonPositiveEquity(equity));
    }

    let qty = target_qty(intent, equity, cfg);
    let open = || -> Result<PlanAction, PlanError> {
        if qty * intent.entry_price < cfg.min_notional {
            return Err(PlanError::BelowMinNotional {
                qty,
                price: intent.entry_price,
                min_notional: cfg.min_notional,
            });
        }
        Ok(PlanAction::OpenPosition {
            side: intent.side,
            qty_base: qty,
            entry_limit: intent.entry_price,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
        })
    };

    let plan = if position.is_flat() {
        Plan::new(vec![PlanAction::SetLeverage(intent.leverage), open()?])
    } else if position.side == intent.side.position_side() {
        if position.leverage == intent.leverage {
            // Same direction, same leverage: adjust size only. Sub-step or
            // sub-notional deltas are a no-op so existing SL/TP stay put.
            let delta = qty - position.size_base;
            let rounded = floor_step(delta.abs(), cfg.step_size) * delta.signum();
            if rounded.abs() < cfg.step_size
                || rounded.abs() * intent.entry_price < cfg.min_notional
            {
                Plan::new(vec![])
            } else {
                Plan::new(vec![PlanAction::ResizePosition { delta_base: rounded }])
            }
        } else {
            // Never a bare leverage change with an open position.
            Plan::new(vec![
                PlanAction::ClosePosition,
                PlanAction::SetLeverage(intent.leverage),
                open()?,
            ])
        }
    } else {
        // Direction flip: close first, always.
        Plan::new(vec![
            PlanAction::ClosePosition,
            PlanAction::SetLeverage(intent.leverage),
            open()?,
        ])
    };

    debug_assert!(plan.respects_close_before_open(position));
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PositionSide;

    fn intent(side: OrderSide, entry: f64, sl: f64, tp: f64, leverage: u32, pct: f64) -> Admissible {
        Admissible::Trade(OrderIntent {
            side,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            leverage,
            size_pct: pct,
        })
    }

    fn long(size: f64, entry: f64, leverage: u32) -> Position {
        Position {
            side: PositionSide::Long,
            size_base: size,
            leverage,
            entry_price: entry,
            mark_price: entry,
            unrealized_pnl: 0.0,
            liq_price: None,
        }
    }

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_cold_start_strong_buy() {
        // 1000 * 0.20 * 5 / 60000 = 0.01666... -> floored to 0.016
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 5, 20.0);
        let plan =
            build_plan(&signal, &Position::flat(), 1000.0, &SizingConfig::default()).unwrap();

        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0], PlanAction::SetLeverage(5));
        match &plan.actions[1] {
            PlanAction::OpenPosition { side, qty_base, entry_limit, stop_loss, take_profit } => {
                assert_eq!(*side, OrderSide::Buy);
                approx(*qty_base, 0.016);
                approx(*entry_limit, 60000.0);
                approx(*stop_loss, 59400.0);
                approx(*take_profit, 61200.0);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_same_side_same_leverage_adds() {
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 5, 20.0);
        let plan = build_plan(&signal, &long(0.010, 59000.0, 5), 1000.0, &SizingConfig::default())
            .unwrap();

        assert_eq!(plan.actions.len(), 1);
        match &plan.actions[0] {
            PlanAction::ResizePosition { delta_base } => approx(*delta_base, 0.006),
            other => panic!("expected resize, got {:?}", other),
        }
    }

    #[test]
    fn test_flip_closes_before_reopening() {
        // 1000 * 0.20 * 5 / 58000 = 0.01724... -> floored to 0.017
        let signal = intent(OrderSide::Sell, 58000.0, 58600.0, 56800.0, 5, 20.0);
        let live = long(0.016, 59000.0, 5);
        let plan = build_plan(&signal, &live, 1000.0, &SizingConfig::default()).unwrap();

        assert_eq!(plan.actions.len(), 3);
        assert_eq!(plan.actions[0], PlanAction::ClosePosition);
        assert_eq!(plan.actions[1], PlanAction::SetLeverage(5));
        match &plan.actions[2] {
            PlanAction::OpenPosition { side, qty_base, .. } => {
                assert_eq!(*side, OrderSide::Sell);
                approx(*qty_base, 0.017);
            }
            other => panic!("expected open, got {:?}", other),
        }
        assert!(plan.respects_close_before_open(&live));
    }

    #[test]
    fn test_leverage_change_closes_and_reopens() {
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 3, 20.0);
        let plan = build_plan(&signal, &long(0.016, 59000.0, 5), 1000.0, &SizingConfig::default())
            .unwrap();
        assert_eq!(plan.actions[0], PlanAction::ClosePosition);
        assert_eq!(plan.actions[1], PlanAction::SetLeverage(3));
        assert!(matches!(plan.actions[2], PlanAction::OpenPosition { .. }));
    }

    #[test]
    fn test_hold_is_a_noop_for_any_position() {
        let plan = build_plan(&Admissible::Hold, &Position::flat(), 1000.0, &SizingConfig::default())
            .unwrap();
        assert!(plan.is_empty());
        let plan =
            build_plan(&Admissible::Hold, &long(0.5, 60000.0, 5), 1000.0, &SizingConfig::default())
                .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_sub_step_delta_is_noop() {
        // Target 0.016 vs current 0.0164: |delta| = 0.0004 < step
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 5, 20.0);
        let plan = build_plan(&signal, &long(0.0164, 60000.0, 5), 1000.0, &SizingConfig::default())
            .unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_resize_trims_with_negative_delta() {
        // Target 0.016 vs current 0.020 -> delta -0.004
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 5, 20.0);
        let plan = build_plan(&signal, &long(0.020, 60000.0, 5), 1000.0, &SizingConfig::default())
            .unwrap();
        match &plan.actions[0] {
            PlanAction::ResizePosition { delta_base } => approx(*delta_base, -0.004),
            other => panic!("expected resize, got {:?}", other),
        }
    }

    #[test]
    fn test_below_min_notional_refuses_plan() {
        let signal = intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 1, 1.0);
        // 5 * 0.01 * 1 / 60000 is sub-step -> qty 0, notional 0
        let err = build_plan(&signal, &Position::flat(), 5.0, &SizingConfig::default()).unwrap_err();
        assert!(matches!(err, PlanError::BelowMinNotional { .. }));
    }

    #[test]
    fn test_quantity_rounding_properties() {
        // Emitted quantity is always the largest step multiple <= computed,
        // and always clears min notional.
        let cfg = SizingConfig::default();
        for equity in [137.0, 499.5, 1000.0, 25000.0] {
            for pct in [5.0, 12.5, 20.0, 30.0] {
                for leverage in [1u32, 3, 5, 10] {
                    let signal =
                        intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, leverage, pct);
                    match build_plan(&signal, &Position::flat(), equity, &cfg) {
                        Ok(plan) => match &plan.actions[1] {
                            PlanAction::OpenPosition { qty_base, .. } => {
                                let raw =
                                    equity * pct / 100.0 * leverage as f64 / 60000.0;
                                let steps = (qty_base / cfg.step_size).round();
                                approx(steps * cfg.step_size, *qty_base);
                                assert!(*qty_base <= raw + 1e-9);
                                assert!(raw - qty_base < cfg.step_size + 1e-9);
                                assert!(qty_base * 60000.0 >= cfg.min_notional);
                            }
                            other => panic!("expected open, got {:?}", other),
                        },
                        Err(PlanError::BelowMinNotional { qty, .. }) => {
                            assert!(qty * 60000.0 < cfg.min_notional);
                        }
                        Err(other) => panic!("unexpected error {:?}", other),
                    }
                }
            }
        }
    }

    #[test]
    fn test_decision_table_is_exhaustive() {
        // Every (position, signal) pair lands in exactly one row.
        let cfg = SizingConfig::default();
        let positions = [
            Position::flat(),
            long(0.016, 60000.0, 5),
            Position {
                side: PositionSide::Short,
                size_base: 0.016,
                leverage: 5,
                entry_price: 60000.0,
                mark_price: 60000.0,
                unrealized_pnl: 0.0,
                liq_price: None,
            },
        ];
        let signals = [
            Admissible::Hold,
            intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 5, 20.0),
            intent(OrderSide::Buy, 60000.0, 59400.0, 61200.0, 3, 20.0),
            intent(OrderSide::Sell, 60000.0, 60600.0, 58800.0, 5, 20.0),
        ];
        for position in &positions {
            for signal in &signals {
                let plan = build_plan(signal, position, 1000.0, &cfg).unwrap();
                assert!(plan.respects_close_before_open(position));
                // At most one direction change per plan.
                let closes = plan
                    .actions
                    .iter()
                    .filter(|a| matches!(a, PlanAction::ClosePosition))
                    .count();
                let opens = plan
                    .actions
                    .iter()
                    .filter(|a| matches!(a, PlanAction::OpenPosition { .. }))
                    .count();
                assert!(closes <= 1 && opens <= 1);
            }
        }
    }
}
