//! Message formatting
//!
//! Renders bus events and command replies as Telegram Markdown.

use std::collections::BTreeMap;

use crate::analysis::types::{Analysis, Suggestion};
use crate::events::BotEvent;
use crate::exchange::{MarketSnapshot, Position};
use crate::trading::records::TradeRecord;

pub fn format_event(event: &BotEvent) -> String {
    match event {
        BotEvent::AnalysisStarted { timeframe } => {
            format!("🔎 Analyzing *{}*…", timeframe)
        }
        BotEvent::AnalysisCompleted { timeframe, analysis } => {
            format!("✅ *{}* analysis complete\n{}", timeframe, format_analysis(analysis))
        }
        BotEvent::AnalysisFailed { timeframe, reason } => {
            format!("⚠️ *{}* analysis failed: {}", timeframe, reason)
        }
        BotEvent::SignalRejected { reason } => {
            format!("🚫 Signal rejected: {}", reason)
        }
        BotEvent::PlanProduced { plan } => {
            if plan.is_empty() {
                "📋 Plan: nothing to do".to_string()
            } else {
                let actions: Vec<String> =
                    plan.actions.iter().map(|a| a.to_string()).collect();
                format!("📋 Plan: {}", actions.join(" → "))
            }
        }
        BotEvent::OrderSubmitted { action, order_id } => match order_id {
            Some(id) => format!("📤 {} submitted (`{}`)", action, id),
            None => format!("📤 {} submitted", action),
        },
        BotEvent::OrderFilled { action } => format!("💰 {} confirmed", action),
        BotEvent::OrderFailed { action, error } => {
            format!("❌ {} failed: {}", action, error)
        }
        BotEvent::NotifierOverflow { channel, dropped } => {
            format!("📪 Channel {} dropped {} queued update(s)", channel, dropped)
        }
    }
}

/// Merge a backlog into one message: one line per event kind with a count,
/// rendering the most recent instance of each.
pub fn format_coalesced(events: &[BotEvent]) -> String {
    let mut latest: BTreeMap<&'static str, (&BotEvent, usize)> = BTreeMap::new();
    for event in events {
        let entry = latest.entry(event.kind()).or_insert((event, 0));
        entry.0 = event;
        entry.1 += 1;
    }

    let mut lines = Vec::with_capacity(latest.len());
    for (_, (event, count)) in latest {
        if count > 1 {
            lines.push(format!("{} _(×{})_", format_event(event), count));
        } else {
            lines.push(format_event(event));
        }
    }
    lines.join("\n")
}

pub fn format_analysis(analysis: &Analysis) -> String {
    let signal = &analysis.trading_signals;
    let mut out = format!(
        "phase *{:?}* | sentiment *{:?}* | risk *{:?}*\n\
         confidence {} | trend strength {}\n\
         suggestion *{}*",
        analysis.market_phase,
        analysis.overall_sentiment,
        analysis.risk_level,
        analysis.confidence,
        analysis.trend_strength,
        signal.position_suggestion,
    );
    if signal.position_suggestion != Suggestion::Hold {
        if let (Some(entry), Some(sl), Some(tp)) =
            (signal.entry_price, signal.stop_loss, signal.take_profit1)
        {
            out.push_str(&format!(
                "\nentry {:.1} | sl {:.1} | tp {:.1} | {}x | {:.0}% equity",
                entry, sl, tp, signal.leverage, signal.position_size_pct
            ));
        }
    }
    out
}

pub fn format_position(position: &Position) -> String {
    if position.is_flat() {
        return "Position: *FLAT*".to_string();
    }
    format!(
        "Position: *{}* {:.4} BTC @ {:.1} ({}x)\nmark {:.1} | uPnL {:+.2} USDT{}",
        position.side,
        position.size_base,
        position.entry_price,
        position.leverage,
        position.mark_price,
        position.unrealized_pnl,
        position
            .liq_price
            .map(|p| format!(" | liq {:.1}", p))
            .unwrap_or_default(),
    )
}

pub fn format_snapshot(symbol: &str, snapshot: &MarketSnapshot) -> String {
    format!(
        "*{}* {:.1} ({:+.2}% 24h)\nvolume {:.0} | funding {:.4}%",
        symbol,
        snapshot.last_price,
        snapshot.price_change_24h_pct,
        snapshot.volume_24h,
        snapshot.funding_rate,
    )
}

pub fn format_trade_history(records: &[TradeRecord]) -> String {
    if records.is_empty() {
        return "No trades recorded yet.".to_string();
    }
    let mut lines = vec![format!("Last {} trade(s):", records.len())];
    for record in records {
        let ok = record.outcomes.iter().filter(|o| o.succeeded()).count();
        lines.push(format!(
            "`{}` {} {} - {}/{} actions ok",
            record.recorded_at.format("%m-%d %H:%M"),
            match record.trigger {
                crate::trading::records::TriggerKind::Auto => "auto",
                crate::trading::records::TriggerKind::Manual => "manual",
            },
            record.signal.position_suggestion,
            ok,
            record.outcomes.len(),
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::Timeframe;

    #[test]
    fn test_coalesced_counts_by_kind() {
        let events = vec![
            BotEvent::AnalysisStarted { timeframe: Timeframe::H1 },
            BotEvent::AnalysisStarted { timeframe: Timeframe::H4 },
            BotEvent::SignalRejected { reason: "cooldown".to_string() },
        ];
        let text = format_coalesced(&events);
        assert!(text.contains("×2"));
        assert!(text.contains("cooldown"));
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_flat_position_renders_flat() {
        assert!(format_position(&Position::flat()).contains("FLAT"));
    }
}
