//! Analysis and trading pipeline
//!
//! One pipeline instance owns the per-timeframe single-flight flags and the
//! whole chain: market data, advisor, store, policy, reconciler, executor.
//! The scheduler and the operator commands both enter through here, so
//! single-flight holds no matter who triggers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tracing::{info, warn};

use crate::advisor::AdvisorGateway;
use crate::analysis::store::{AnalysisStore, StoreError};
use crate::analysis::types::{Analysis, Timeframe};
use crate::events::{BotEvent, EventBus};
use crate::exchange::Exchange;
use crate::market::MarketDataService;
use crate::trading::policy::SignalPolicy;
use crate::trading::reconciler::{build_plan, SizingConfig};
use crate::trading::records::{TradeRecord, TriggerKind};
use crate::trading::OrderExecutor;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("{0} analysis already in flight, trigger dropped")]
    Busy(Timeframe),
    #[error("{0}")]
    Failed(String),
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Pipeline {
    symbol: String,
    market: MarketDataService,
    advisor: AdvisorGateway,
    store: Arc<AnalysisStore>,
    events: EventBus,
    policy: StdMutex<SignalPolicy>,
    executor: OrderExecutor,
    exchange: Arc<dyn Exchange>,
    sizing: SizingConfig,
    in_flight: HashMap<Timeframe, AtomicBool>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: impl Into<String>,
        market: MarketDataService,
        advisor: AdvisorGateway,
        store: Arc<AnalysisStore>,
        events: EventBus,
        policy: SignalPolicy,
        executor: OrderExecutor,
        exchange: Arc<dyn Exchange>,
        sizing: SizingConfig,
    ) -> Self {
        let in_flight = [
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
            Timeframe::Final,
        ]
        .into_iter()
        .map(|tf| (tf, AtomicBool::new(false)))
        .collect();

        Self {
            symbol: symbol.into(),
            market,
            advisor,
            store,
            events,
            policy: StdMutex::new(policy),
            executor,
            exchange,
            sizing,
            in_flight,
        }
    }

    pub fn store(&self) -> &AnalysisStore {
        &self.store
    }

    pub fn market(&self) -> &MarketDataService {
        &self.market
    }

    fn claim(&self, tf: Timeframe) -> Result<FlightGuard<'_>, PipelineError> {
        let flag = self.in_flight.get(&tf).expect("all timeframes have a flag");
        if flag.swap(true, Ordering::SeqCst) {
            warn!("{} trigger dropped: previous run still in flight", tf);
            return Err(PipelineError::Busy(tf));
        }
        Ok(FlightGuard(flag))
    }

    /// One per-timeframe analysis pass: pull window, consult advisor,
    /// persist the snapshot.
    pub async fn run_timeframe(&self, tf: Timeframe) -> Result<Analysis, PipelineError> {
        let _guard = self.claim(tf)?;
        self.events.publish(BotEvent::AnalysisStarted { timeframe: tf });
        info!("{} analysis started", tf);

        let result = self.analyze_once(tf).await;
        match result {
            Ok(analysis) => {
                self.events.publish(BotEvent::AnalysisCompleted {
                    timeframe: tf,
                    analysis: analysis.clone(),
                });
                info!("{} analysis complete", tf);
                Ok(analysis)
            }
            Err(reason) => {
                warn!("{} analysis failed: {}", tf, reason);
                self.events.publish(BotEvent::AnalysisFailed {
                    timeframe: tf,
                    reason: reason.clone(),
                });
                Err(PipelineError::Failed(reason))
            }
        }
    }

    async fn analyze_once(&self, tf: Timeframe) -> Result<Analysis, String> {
        let view = self.market.window(tf).await.map_err(|e| e.to_string())?;
        let analysis = self
            .advisor
            .analyze_timeframe(tf, &view)
            .await
            .map_err(|e| e.to_string())?;
        self.store.put(analysis.clone()).map_err(|e| e.to_string())?;
        Ok(analysis)
    }

    /// The combined pass: re-prompt the advisor with the four latest
    /// snapshots, then gate, plan and execute if admissible. Skips (with an
    /// event) rather than fails when sources are missing or stale.
    pub async fn run_final(&self, trigger: TriggerKind) -> Result<(), PipelineError> {
        let _guard = self.claim(Timeframe::Final)?;

        // The bundle is fixed here; later per-timeframe updates do not
        // revise an in-flight combined pass.
        let Some(bundle) = self.store.snapshot_bundle() else {
            warn!("combined pass skipped: not all four timeframe snapshots present");
            self.events.publish(BotEvent::AnalysisFailed {
                timeframe: Timeframe::Final,
                reason: "missing source analyses".to_string(),
            });
            return Ok(());
        };

        self.events.publish(BotEvent::AnalysisStarted { timeframe: Timeframe::Final });
        info!("combined analysis started ({:?} trigger)", trigger);

        let analysis = match self.advisor.analyze_final(&bundle).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!("combined analysis failed: {}", err);
                self.events.publish(BotEvent::AnalysisFailed {
                    timeframe: Timeframe::Final,
                    reason: err.to_string(),
                });
                return Err(PipelineError::Failed(err.to_string()));
            }
        };

        match self.store.put(analysis.clone()) {
            Ok(()) => {}
            Err(err @ (StoreError::MissingSources(_) | StoreError::StaleSources(_))) => {
                warn!("combined snapshot rejected: {}", err);
                self.events.publish(BotEvent::AnalysisFailed {
                    timeframe: Timeframe::Final,
                    reason: err.to_string(),
                });
                return Ok(());
            }
            Err(err) => {
                self.events.publish(BotEvent::AnalysisFailed {
                    timeframe: Timeframe::Final,
                    reason: err.to_string(),
                });
                return Err(PipelineError::Failed(err.to_string()));
            }
        }

        self.events.publish(BotEvent::AnalysisCompleted {
            timeframe: Timeframe::Final,
            analysis: analysis.clone(),
        });

        self.trade_on(&analysis, trigger).await
    }

    /// Gate, reconcile and execute one admissible combined analysis.
    async fn trade_on(&self, analysis: &Analysis, trigger: TriggerKind) -> Result<(), PipelineError> {
        let now = Utc::now();
        let admissible = {
            let mut policy = self.policy.lock().expect("policy lock poisoned");
            policy.evaluate(analysis, now)
        };
        let admissible = match admissible {
            Ok(admissible) => admissible,
            Err(reason) => {
                info!("signal not admissible: {}", reason);
                self.events.publish(BotEvent::SignalRejected { reason: reason.to_string() });
                return Ok(());
            }
        };

        // Equity and position are read fresh for every plan.
        let position = match self.exchange.get_position(&self.symbol).await {
            Ok(position) => position,
            Err(err) => return Err(self.planning_failed("position read", err)),
        };
        let equity = match self.exchange.get_balance().await {
            Ok(equity) => equity,
            Err(err) => return Err(self.planning_failed("balance read", err)),
        };

        let plan = match build_plan(&admissible, &position, equity, &self.sizing) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("plan rejected: {}", err);
                self.events.publish(BotEvent::SignalRejected { reason: err.to_string() });
                return Ok(());
            }
        };

        self.events.publish(BotEvent::PlanProduced { plan: plan.clone() });
        if plan.is_empty() {
            info!("plan is empty, nothing to execute");
            return Ok(());
        }

        let report = self.executor.execute_plan(&plan, &position).await;

        let executed_anything = report
            .outcomes
            .iter()
            .any(|o| matches!(o.status, crate::trading::records::ActionStatus::Succeeded { .. }));
        if executed_anything {
            let mut policy = self.policy.lock().expect("policy lock poisoned");
            policy.record_execution(Utc::now());
        }

        let record = TradeRecord {
            id: plan.id,
            recorded_at: Utc::now(),
            trigger,
            signal: analysis.trading_signals.clone(),
            plan: plan.actions.clone(),
            outcomes: report.outcomes,
        };
        if let Err(err) = self.store.append_trade(&record) {
            warn!("failed to append trade record: {}", err);
        }

        match report.aborted {
            None => Ok(()),
            Some(reason) => Err(PipelineError::Failed(reason)),
        }
    }

    fn planning_failed(&self, stage: &str, err: crate::exchange::ExchangeError) -> PipelineError {
        let reason = format!("{} failed: {}", stage, err);
        warn!("plan preparation aborted: {}", reason);
        self.events.publish(BotEvent::OrderFailed {
            action: stage.to_string(),
            error: err.to_string(),
        });
        PipelineError::Failed(reason)
    }
}
