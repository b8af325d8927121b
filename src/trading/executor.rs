//! Order executor
//!
//! Realizes a plan as a linear sequence of exchange calls. Strictly
//! serialized: a single lock guarantees no two plans ever run against the
//! instrument concurrently. The executor never invents compensating trades;
//! on a permanent failure it aborts the remainder and reports.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::records::{ActionOutcome, ActionStatus};
use super::reconciler::{Plan, PlanAction};
use crate::events::{BotEvent, EventBus};
use crate::exchange::{
    Exchange, ExchangeError, OrderKind, OrderRequest, OrderSide, Position, PositionSide,
};

/// Retries after the initial attempt for transient exchange errors.
const MAX_RETRIES: u32 = 3;
const JITTER_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub symbol: String,
    /// How long to poll for a verified flat position after a close.
    pub close_verify_timeout: Duration,
    pub close_poll_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            close_verify_timeout: Duration::from_secs(5),
            close_poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("close not confirmed flat within {0:?}")]
    CloseTimeout(Duration),
    #[error("position desync: {0}")]
    PositionDesync(String),
    #[error("pre-check failed: {0}")]
    PreCheck(String),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Result of running one plan: per-action outcomes in order, plus the abort
/// reason when the plan did not run to completion.
#[derive(Debug)]
pub struct ExecutionReport {
    pub outcomes: Vec<ActionOutcome>,
    pub aborted: Option<String>,
}

impl ExecutionReport {
    pub fn fully_succeeded(&self) -> bool {
        self.aborted.is_none()
    }
}

pub struct OrderExecutor {
    exchange: Arc<dyn Exchange>,
    events: EventBus,
    config: ExecutorConfig,
    exec_lock: Mutex<()>,
}

impl OrderExecutor {
    pub fn new(exchange: Arc<dyn Exchange>, events: EventBus, config: ExecutorConfig) -> Self {
        Self {
            exchange,
            events,
            config,
            exec_lock: Mutex::new(()),
        }
    }

    /// Execute every action in order, stopping at the first failure.
    /// `starting_position` must be the same fresh read the plan was built
    /// from.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        starting_position: &Position,
    ) -> ExecutionReport {
        let _guard = self.exec_lock.lock().await;

        let mut outcomes = Vec::with_capacity(plan.actions.len());
        let mut aborted = None;
        let mut last_position = starting_position.clone();
        let mut current_leverage = if starting_position.leverage > 0 {
            Some(starting_position.leverage)
        } else {
            None
        };

        for action in &plan.actions {
            let result = match action {
                PlanAction::SetLeverage(leverage) => {
                    self.exec_set_leverage(*leverage, &mut current_leverage).await
                }
                PlanAction::ClosePosition => self.exec_close(&mut last_position).await,
                PlanAction::OpenPosition { side, qty_base, entry_limit, stop_loss, take_profit } => {
                    self.exec_open(
                        &last_position,
                        *side,
                        *qty_base,
                        *entry_limit,
                        *stop_loss,
                        *take_profit,
                    )
                    .await
                }
                PlanAction::ResizePosition { delta_base } => {
                    self.exec_resize(&last_position, *delta_base).await
                }
            };

            match result {
                Ok(status) => {
                    outcomes.push(ActionOutcome { action: action.clone(), status });
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!("plan {} aborted at {}: {}", plan.id, action, message);
                    self.events.publish(BotEvent::OrderFailed {
                        action: action.to_string(),
                        error: message.clone(),
                    });
                    outcomes.push(ActionOutcome {
                        action: action.clone(),
                        status: ActionStatus::Failed { error: message.clone() },
                    });
                    aborted = Some(message);
                    break;
                }
            }
        }

        ExecutionReport { outcomes, aborted }
    }

    async fn exec_set_leverage(
        &self,
        leverage: u32,
        current: &mut Option<u32>,
    ) -> Result<ActionStatus, ExecError> {
        if *current == Some(leverage) {
            return Ok(ActionStatus::Skipped {
                reason: format!("leverage already at {}x", leverage),
            });
        }
        let ((), attempts) = self
            .with_retry("set_leverage", || {
                self.exchange.set_leverage(&self.config.symbol, leverage)
            })
            .await?;
        *current = Some(leverage);
        info!("leverage set to {}x", leverage);
        Ok(ActionStatus::Succeeded { order_id: None, attempts })
    }

    async fn exec_close(&self, last_position: &mut Position) -> Result<ActionStatus, ExecError> {
        if last_position.is_flat() {
            return Ok(ActionStatus::Skipped {
                reason: "no live position to close".to_string(),
            });
        }

        let side = match last_position.side {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
            PositionSide::Flat => unreachable!("checked above"),
        };
        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side,
            kind: OrderKind::Market,
            qty: last_position.size_base,
            price: None,
            reduce_only: true,
            stop_loss: None,
            take_profit: None,
        };

        let (order_id, attempts) = self
            .with_retry("close_order", || self.exchange.create_order(&request))
            .await?;
        self.events.publish(BotEvent::OrderSubmitted {
            action: "ClosePosition".to_string(),
            order_id: Some(order_id.clone()),
        });

        // Verify by re-reading until the exchange reports flat.
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= self.config.close_verify_timeout {
                return Err(ExecError::CloseTimeout(self.config.close_verify_timeout));
            }
            tokio::time::sleep(self.config.close_poll_interval).await;
            match self.exchange.get_position(&self.config.symbol).await {
                Ok(position) if position.is_flat() => {
                    // Leave leverage as reported; a close does not reset it.
                    let leverage = if position.leverage > 0 {
                        position.leverage
                    } else {
                        last_position.leverage
                    };
                    *last_position = position;
                    last_position.leverage = leverage;
                    break;
                }
                Ok(_) => continue,
                Err(err) if err.is_transient() => {
                    warn!("position re-read failed during close verify: {}", err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }

        info!("position closed and verified flat");
        self.events.publish(BotEvent::OrderFilled {
            action: "ClosePosition".to_string(),
        });
        Ok(ActionStatus::Succeeded { order_id: Some(order_id), attempts })
    }

    async fn exec_open(
        &self,
        last_position: &Position,
        side: OrderSide,
        qty: f64,
        entry_limit: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<ActionStatus, ExecError> {
        if !last_position.is_flat() {
            return Err(ExecError::PositionDesync(format!(
                "open requested while {} {} is live",
                last_position.side, last_position.size_base
            )));
        }
        if qty <= 0.0 {
            return Err(ExecError::PreCheck(format!("non-positive quantity {}", qty)));
        }
        let levels_ok = match side {
            OrderSide::Buy => stop_loss < entry_limit && entry_limit < take_profit,
            OrderSide::Sell => take_profit < entry_limit && entry_limit < stop_loss,
        };
        if !levels_ok {
            return Err(ExecError::PreCheck(format!(
                "{:?} levels out of order: sl={} entry={} tp={}",
                side, stop_loss, entry_limit, take_profit
            )));
        }

        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side,
            kind: OrderKind::Limit,
            qty,
            price: Some(entry_limit),
            reduce_only: false,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
        };
        let (order_id, attempts) = self
            .with_retry("open_order", || self.exchange.create_order(&request))
            .await?;

        info!(
            "submitted {:?} {} @ {} (sl {}, tp {})",
            side, qty, entry_limit, stop_loss, take_profit
        );
        self.events.publish(BotEvent::OrderSubmitted {
            action: format!("OpenPosition({:?})", side),
            order_id: Some(order_id.clone()),
        });
        Ok(ActionStatus::Succeeded { order_id: Some(order_id), attempts })
    }

    async fn exec_resize(
        &self,
        last_position: &Position,
        delta: f64,
    ) -> Result<ActionStatus, ExecError> {
        if last_position.is_flat() {
            return Err(ExecError::PreCheck("resize requested with no live position".to_string()));
        }
        let position_entry_side = match last_position.side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
            PositionSide::Flat => unreachable!("checked above"),
        };
        let (side, reduce_only) = if delta > 0.0 {
            (position_entry_side, false)
        } else {
            (position_entry_side.opposite(), true)
        };

        let request = OrderRequest {
            symbol: self.config.symbol.clone(),
            side,
            kind: OrderKind::Market,
            qty: delta.abs(),
            price: None,
            reduce_only,
            stop_loss: None,
            take_profit: None,
        };
        let (order_id, attempts) = self
            .with_retry("resize_order", || self.exchange.create_order(&request))
            .await?;

        info!("resized position by {:+}", delta);
        self.events.publish(BotEvent::OrderSubmitted {
            action: format!("ResizePosition({:+})", delta),
            order_id: Some(order_id.clone()),
        });
        Ok(ActionStatus::Succeeded { order_id: Some(order_id), attempts })
    }

    /// Retry transient exchange errors with 1s/2s/4s backoff plus jitter.
    /// Returns the value and the number of attempts made.
    async fn with_retry<T, F, Fut>(
        &self,
        op_name: &str,
        mut op: F,
    ) -> Result<(T, u32), ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ExchangeError>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) if err.is_transient() && attempt <= MAX_RETRIES => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..JITTER_MS));
                    warn!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        op_name,
                        attempt,
                        delay + jitter,
                        err
                    );
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::Timeframe;
    use crate::exchange::{Bar, MarketSnapshot};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MockState {
        position: Option<Position>,
        set_leverage_calls: Vec<u32>,
        set_leverage_failures: u32,
        orders: Vec<OrderRequest>,
        close_never_confirms: bool,
        reject_orders_with_margin: bool,
    }

    struct MockExchange {
        state: StdMutex<MockState>,
    }

    impl MockExchange {
        fn new(position: Position) -> Self {
            Self {
                state: StdMutex::new(MockState {
                    position: Some(position),
                    ..Default::default()
                }),
            }
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        async fn get_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<Bar>, ExchangeError> {
            unimplemented!("not used by executor tests")
        }

        async fn get_balance(&self) -> Result<f64, ExchangeError> {
            Ok(1000.0)
        }

        async fn get_position(&self, _symbol: &str) -> Result<Position, ExchangeError> {
            Ok(self.state.lock().unwrap().position.clone().unwrap_or_else(Position::flat))
        }

        async fn set_leverage(&self, _symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
            let mut state = self.state.lock().unwrap();
            state.set_leverage_calls.push(leverage);
            if state.set_leverage_failures > 0 {
                state.set_leverage_failures -= 1;
                return Err(ExchangeError::Transient("exchange hiccup".to_string()));
            }
            if let Some(pos) = state.position.as_mut() {
                pos.leverage = leverage;
            }
            Ok(())
        }

        async fn create_order(&self, req: &OrderRequest) -> Result<String, ExchangeError> {
            let mut state = self.state.lock().unwrap();
            if state.reject_orders_with_margin {
                return Err(ExchangeError::InsufficientMargin("not enough USDT".to_string()));
            }
            state.orders.push(req.clone());
            if req.reduce_only && !state.close_never_confirms {
                let leverage = state.position.as_ref().map(|p| p.leverage).unwrap_or(0);
                let mut flat = Position::flat();
                flat.leverage = leverage;
                state.position = Some(flat);
            }
            Ok(format!("mock-{}", state.orders.len()))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn get_market_snapshot(&self, _symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
            unimplemented!("not used by executor tests")
        }
    }

    fn long(size: f64, leverage: u32) -> Position {
        Position {
            side: PositionSide::Long,
            size_base: size,
            leverage,
            entry_price: 59000.0,
            mark_price: 59000.0,
            unrealized_pnl: 0.0,
            liq_price: None,
        }
    }

    fn plan(actions: Vec<PlanAction>) -> Plan {
        Plan { id: Uuid::new_v4(), actions }
    }

    fn executor(exchange: Arc<MockExchange>) -> OrderExecutor {
        OrderExecutor::new(exchange, EventBus::new(64), ExecutorConfig::new("BTCUSDT"))
    }

    #[tokio::test]
    async fn test_set_leverage_is_idempotent() {
        let exchange = Arc::new(MockExchange::new(long(0.016, 5)));
        let exec = executor(exchange.clone());

        // Two identical actions in a row: exactly one exchange call.
        let report = exec
            .execute_plan(
                &plan(vec![PlanAction::SetLeverage(3), PlanAction::SetLeverage(3)]),
                &long(0.016, 5),
            )
            .await;
        assert!(report.fully_succeeded());
        assert!(matches!(report.outcomes[0].status, ActionStatus::Succeeded { .. }));
        assert!(matches!(report.outcomes[1].status, ActionStatus::Skipped { .. }));
        assert_eq!(exchange.state.lock().unwrap().set_leverage_calls, vec![3]);
    }

    #[tokio::test]
    async fn test_set_leverage_skipped_when_already_current() {
        let exchange = Arc::new(MockExchange::new(long(0.016, 5)));
        let exec = executor(exchange.clone());
        let report = exec
            .execute_plan(&plan(vec![PlanAction::SetLeverage(5)]), &long(0.016, 5))
            .await;
        assert!(matches!(report.outcomes[0].status, ActionStatus::Skipped { .. }));
        assert!(exchange.state.lock().unwrap().set_leverage_calls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_mid_plan_recovers() {
        // Close succeeds; set-leverage fails twice then succeeds; open
        // succeeds. One report with three outcomes, no duplicate orders.
        let exchange = Arc::new(MockExchange::new(long(0.016, 5)));
        exchange.state.lock().unwrap().set_leverage_failures = 2;
        let exec = executor(exchange.clone());

        let actions = vec![
            PlanAction::ClosePosition,
            PlanAction::SetLeverage(3),
            PlanAction::OpenPosition {
                side: OrderSide::Sell,
                qty_base: 0.017,
                entry_limit: 58000.0,
                stop_loss: 58600.0,
                take_profit: 56800.0,
            },
        ];
        let report = exec.execute_plan(&plan(actions), &long(0.016, 5)).await;

        assert!(report.fully_succeeded(), "aborted: {:?}", report.aborted);
        assert_eq!(report.outcomes.len(), 3);
        match &report.outcomes[1].status {
            ActionStatus::Succeeded { attempts, .. } => assert_eq!(*attempts, 3),
            other => panic!("expected success, got {:?}", other),
        }

        let state = exchange.state.lock().unwrap();
        // One close order, one open order, nothing duplicated.
        assert_eq!(state.orders.len(), 2);
        assert!(state.orders[0].reduce_only);
        assert!(!state.orders[1].reduce_only);
        assert_eq!(state.set_leverage_calls, vec![3, 3, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_aborts_plan() {
        let exchange = Arc::new(MockExchange::new(long(0.016, 5)));
        exchange.state.lock().unwrap().close_never_confirms = true;
        let exec = executor(exchange.clone());

        let actions = vec![PlanAction::ClosePosition, PlanAction::SetLeverage(3)];
        let report = exec.execute_plan(&plan(actions), &long(0.016, 5)).await;

        assert!(!report.fully_succeeded());
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(report.outcomes[0].status, ActionStatus::Failed { .. }));
        // The leverage action never ran.
        assert!(exchange.state.lock().unwrap().set_leverage_calls.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let exchange = Arc::new(MockExchange::new(Position::flat()));
        exchange.state.lock().unwrap().reject_orders_with_margin = true;
        let exec = executor(exchange.clone());

        let actions = vec![PlanAction::OpenPosition {
            side: OrderSide::Buy,
            qty_base: 0.016,
            entry_limit: 60000.0,
            stop_loss: 59400.0,
            take_profit: 61200.0,
        }];
        let report = exec.execute_plan(&plan(actions), &Position::flat()).await;

        assert!(!report.fully_succeeded());
        assert!(report.aborted.unwrap().contains("insufficient margin"));
        // No retries for permanent errors.
        assert!(exchange.state.lock().unwrap().orders.is_empty());
    }

    #[tokio::test]
    async fn test_open_rejected_while_position_live() {
        let exchange = Arc::new(MockExchange::new(long(0.016, 5)));
        let exec = executor(exchange.clone());

        let actions = vec![PlanAction::OpenPosition {
            side: OrderSide::Sell,
            qty_base: 0.017,
            entry_limit: 58000.0,
            stop_loss: 58600.0,
            take_profit: 56800.0,
        }];
        let report = exec.execute_plan(&plan(actions), &long(0.016, 5)).await;
        assert!(!report.fully_succeeded());
        assert!(report.aborted.unwrap().contains("position desync"));
    }

    #[tokio::test]
    async fn test_resize_reduce_only_on_trim() {
        let exchange = Arc::new(MockExchange::new(long(0.020, 5)));
        exchange.state.lock().unwrap().close_never_confirms = true; // keep position live
        let exec = executor(exchange.clone());

        let report = exec
            .execute_plan(
                &plan(vec![PlanAction::ResizePosition { delta_base: -0.004 }]),
                &long(0.020, 5),
            )
            .await;
        assert!(report.fully_succeeded());
        let state = exchange.state.lock().unwrap();
        assert_eq!(state.orders.len(), 1);
        assert!(state.orders[0].reduce_only);
        assert_eq!(state.orders[0].side, OrderSide::Sell);
        assert!((state.orders[0].qty - 0.004).abs() < 1e-12);
    }
}
