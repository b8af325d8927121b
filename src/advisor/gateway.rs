//! Advisor gateway
//!
//! Drives one advisor exchange: build prompt, call the transport, strip any
//! code fences, parse and validate. An invalid reply earns exactly one
//! re-prompt with the validation error attached; a second failure rejects
//! the trigger. Transport timeouts are retried once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use super::client::{AdvisorTransport, ChatPrompt};
use super::{prompt, AdvisorError};
use crate::analysis::store::SnapshotBundle;
use crate::analysis::types::{
    Analysis, MarketPhase, RiskLevel, Sentiment, Timeframe, TradingSignal,
};
use crate::market::MarketView;

/// Default advisor call deadline.
const ADVISOR_DEADLINE: Duration = Duration::from_secs(60);

/// What the advisor must send back; `Analysis` minus the fields the gateway
/// stamps itself.
#[derive(Debug, Deserialize)]
struct AdvisorReply {
    market_phase: MarketPhase,
    overall_sentiment: Sentiment,
    risk_level: RiskLevel,
    confidence: f64,
    trend_strength: f64,
    trading_signals: TradingSignal,
}

impl AdvisorReply {
    fn into_analysis(self, timeframe: Timeframe) -> Analysis {
        Analysis {
            market_phase: self.market_phase,
            overall_sentiment: self.overall_sentiment,
            risk_level: self.risk_level,
            confidence: self.confidence.round() as u8,
            trend_strength: self.trend_strength.round() as u8,
            trading_signals: self.trading_signals,
            generated_at: Utc::now().timestamp_millis(),
            source_timeframe: timeframe,
        }
    }
}

pub struct AdvisorGateway {
    transport: Arc<dyn AdvisorTransport>,
    symbol: String,
    deadline: Duration,
}

impl AdvisorGateway {
    pub fn new(transport: Arc<dyn AdvisorTransport>, symbol: impl Into<String>) -> Self {
        Self {
            transport,
            symbol: symbol.into(),
            deadline: ADVISOR_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// One per-timeframe analysis.
    pub async fn analyze_timeframe(
        &self,
        timeframe: Timeframe,
        view: &MarketView,
    ) -> Result<Analysis, AdvisorError> {
        let prompt = prompt::timeframe_prompt(&self.symbol, timeframe, view);
        self.run(prompt, timeframe).await
    }

    /// The combined pass over the four latest snapshots.
    pub async fn analyze_final(&self, bundle: &SnapshotBundle) -> Result<Analysis, AdvisorError> {
        let prompt = prompt::final_prompt(&self.symbol, bundle);
        self.run(prompt, Timeframe::Final).await
    }

    async fn run(&self, prompt: ChatPrompt, timeframe: Timeframe) -> Result<Analysis, AdvisorError> {
        let raw = self.complete_with_retry(&prompt).await?;
        match parse_reply(&raw) {
            Ok(reply) => {
                info!("{} advisor verdict accepted", timeframe);
                Ok(reply.into_analysis(timeframe))
            }
            Err(validation_error) => {
                warn!(
                    "{} advisor reply rejected, re-prompting: {}",
                    timeframe, validation_error
                );
                let reprompt = prompt.with_validation_error(&validation_error);
                let raw = self.complete_with_retry(&reprompt).await?;
                match parse_reply(&raw) {
                    Ok(reply) => {
                        info!("{} advisor verdict accepted on re-prompt", timeframe);
                        Ok(reply.into_analysis(timeframe))
                    }
                    Err(second_error) => Err(AdvisorError::Rejected(second_error)),
                }
            }
        }
    }

    /// One transport call with a single retry on timeout/transient failure.
    async fn complete_with_retry(&self, prompt: &ChatPrompt) -> Result<String, AdvisorError> {
        match self.transport.complete(prompt, self.deadline).await {
            Ok(raw) => Ok(raw),
            Err(err) if err.is_transient() => {
                warn!("advisor call failed, retrying once: {}", err);
                self.transport.complete(prompt, self.deadline).await
            }
            Err(err) => Err(err),
        }
    }
}

/// Validator pass: parse, range-check and cross-check one raw reply.
fn parse_reply(raw: &str) -> Result<AdvisorReply, String> {
    let cleaned = strip_code_fences(raw);
    let reply: AdvisorReply =
        serde_json::from_str(cleaned).map_err(|e| format!("schema violation: {}", e))?;

    if !(0.0..=100.0).contains(&reply.confidence) {
        return Err(format!("confidence {} outside 0-100", reply.confidence));
    }
    if !(0.0..=100.0).contains(&reply.trend_strength) {
        return Err(format!("trend_strength {} outside 0-100", reply.trend_strength));
    }
    let signal = &reply.trading_signals;
    if !(1..=10).contains(&signal.leverage) {
        return Err(format!("leverage {} outside 1-10", signal.leverage));
    }
    if !(0.0..=100.0).contains(&signal.position_size_pct) {
        return Err(format!(
            "position_size_pct {} outside 0-100",
            signal.position_size_pct
        ));
    }
    signal.validate_levels()?;

    Ok(reply)
}

/// Advisors sometimes wrap the JSON in a Markdown code fence despite the
/// instructions; accept and strip it.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    body.trim().trim_end_matches("```").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::Suggestion;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    const VALID_BUY: &str = r#"{
        "market_phase": "up",
        "overall_sentiment": "positive",
        "risk_level": "medium",
        "confidence": 80,
        "trend_strength": 70,
        "trading_signals": {
            "position_suggestion": "BUY",
            "entry_price": 60000.0,
            "stop_loss": 59400.0,
            "take_profit1": 61200.0,
            "take_profit2": 62000.0,
            "take_profit3": null,
            "leverage": 5,
            "position_size_pct": 20.0,
            "auto_trading_enabled": true
        }
    }"#;

    enum Script {
        Reply(&'static str),
        Timeout,
    }

    struct ScriptedTransport {
        script: StdMutex<VecDeque<Script>>,
        prompts: StdMutex<Vec<ChatPrompt>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                prompts: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AdvisorTransport for ScriptedTransport {
        async fn complete(
            &self,
            prompt: &ChatPrompt,
            _deadline: Duration,
        ) -> Result<String, AdvisorError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            match self.script.lock().unwrap().pop_front() {
                Some(Script::Reply(raw)) => Ok(raw.to_string()),
                Some(Script::Timeout) => Err(AdvisorError::Timeout),
                None => panic!("transport called more times than scripted"),
            }
        }
    }

    fn view() -> MarketView {
        use crate::exchange::{Bar, MarketSnapshot};
        use crate::market::IndicatorTable;
        let bars: Vec<crate::exchange::Bar> = (0..48)
            .map(|i| Bar {
                open_ts: i as i64 * 3_600_000,
                open: 60000.0,
                high: 60100.0,
                low: 59900.0,
                close: 60000.0,
                volume: 100.0,
            })
            .collect();
        MarketView {
            indicators: IndicatorTable::compute(&bars).unwrap(),
            bars,
            snapshot: MarketSnapshot {
                last_price: 60000.0,
                price_change_24h_pct: 0.0,
                volume_24h: 1000.0,
                funding_rate: 0.01,
            },
        }
    }

    #[tokio::test]
    async fn test_valid_reply_becomes_analysis() {
        let transport = ScriptedTransport::new(vec![Script::Reply(VALID_BUY)]);
        let gateway = AdvisorGateway::new(transport.clone(), "BTCUSDT");
        let analysis = gateway.analyze_timeframe(Timeframe::H1, &view()).await.unwrap();

        assert_eq!(analysis.source_timeframe, Timeframe::H1);
        assert_eq!(analysis.confidence, 80);
        assert_eq!(analysis.trading_signals.position_suggestion, Suggestion::Buy);
        assert!(analysis.generated_at > 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_fenced_reply_is_accepted() {
        let fenced: &'static str = Box::leak(
            format!("```json\n{}\n```", VALID_BUY).into_boxed_str(),
        );
        let transport = ScriptedTransport::new(vec![Script::Reply(fenced)]);
        let gateway = AdvisorGateway::new(transport, "BTCUSDT");
        assert!(gateway.analyze_timeframe(Timeframe::H4, &view()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_enum_gets_one_reprompt_then_rejects() {
        let bad = VALID_BUY.replace("\"BUY\"", "\"MAYBE\"");
        let bad: &'static str = Box::leak(bad.into_boxed_str());
        let transport = ScriptedTransport::new(vec![Script::Reply(bad), Script::Reply(bad)]);
        let gateway = AdvisorGateway::new(transport.clone(), "BTCUSDT");

        let err = gateway.analyze_timeframe(Timeframe::H1, &view()).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Rejected(_)));
        assert_eq!(transport.calls(), 2);

        // The re-prompt carries the validation error back to the advisor.
        let prompts = transport.prompts.lock().unwrap();
        assert!(prompts[1].user.contains("rejected"));
    }

    #[tokio::test]
    async fn test_invalid_then_corrected_reply_succeeds() {
        let bad = VALID_BUY.replace("59400.0", "60600.0"); // stop above entry
        let bad: &'static str = Box::leak(bad.into_boxed_str());
        let transport =
            ScriptedTransport::new(vec![Script::Reply(bad), Script::Reply(VALID_BUY)]);
        let gateway = AdvisorGateway::new(transport.clone(), "BTCUSDT");

        let analysis = gateway.analyze_timeframe(Timeframe::H1, &view()).await.unwrap();
        assert_eq!(analysis.trading_signals.stop_loss, Some(59400.0));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_timeout_retried_once() {
        let transport =
            ScriptedTransport::new(vec![Script::Timeout, Script::Reply(VALID_BUY)]);
        let gateway = AdvisorGateway::new(transport.clone(), "BTCUSDT");
        assert!(gateway.analyze_timeframe(Timeframe::H1, &view()).await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_double_timeout_fails_trigger() {
        let transport = ScriptedTransport::new(vec![Script::Timeout, Script::Timeout]);
        let gateway = AdvisorGateway::new(transport.clone(), "BTCUSDT");
        let err = gateway.analyze_timeframe(Timeframe::H1, &view()).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Timeout));
    }

    #[test]
    fn test_out_of_range_leverage_rejected() {
        let raw = VALID_BUY.replace("\"leverage\": 5", "\"leverage\": 25");
        let err = parse_reply(&raw).unwrap_err();
        assert!(err.contains("leverage"));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
