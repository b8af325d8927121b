//! Prompt templating
//!
//! Builds the system and user messages for per-timeframe analyses and for
//! the combined pass. The system message carries the schema contract the
//! validator enforces on the way back.

use crate::analysis::store::SnapshotBundle;
use crate::analysis::types::Timeframe;
use crate::market::MarketView;

use super::client::ChatPrompt;

/// Bars of indicator history included in a prompt.
const INDICATOR_TAIL: usize = 10;

const SYSTEM_PROMPT: &str = r#"You are a disciplined BTC/USDT derivatives trader. You analyze one
timeframe at a time and reply with a machine-readable verdict.

Reply with a single JSON object, nothing else, exactly this shape:
{
    "market_phase": "up" | "down" | "accumulate" | "distribute",
    "overall_sentiment": "positive" | "negative" | "neutral",
    "risk_level": "high" | "medium" | "low",
    "confidence": integer 0-100,
    "trend_strength": integer 0-100,
    "trading_signals": {
        "position_suggestion": "BUY" | "SELL" | "HOLD",
        "entry_price": number or null,
        "stop_loss": number or null,
        "take_profit1": number or null,
        "take_profit2": number or null,
        "take_profit3": number or null,
        "leverage": integer 1-10,
        "position_size_pct": number 0-100,
        "auto_trading_enabled": boolean
    }
}

Price-level rules, orders fail if violated:
- BUY:  stop_loss < entry_price < take_profit1 < take_profit2 < take_profit3
- SELL: take_profit3 < take_profit2 < take_profit1 < entry_price < stop_loss
- HOLD: price levels may be null.

position_size_pct is a percent of account equity, never a base quantity.
Confidence measures how internally consistent the evidence is; trend_strength
measures how strongly the market is moving. They are not the same number.
Set auto_trading_enabled to false whenever you would not take the trade
yourself."#;

pub fn timeframe_prompt(symbol: &str, timeframe: Timeframe, view: &MarketView) -> ChatPrompt {
    let snapshot = &view.snapshot;
    let trend = view.indicators.trend();

    let mut user = format!(
        "Analyze {} on the {} timeframe.\n\n\
         Market snapshot:\n\
         - last price: {:.2}\n\
         - 24h change: {:+.2}%\n\
         - 24h volume: {:.0}\n\
         - funding rate: {:.4}%\n\
         - trend: {} (strength {}/100)\n\n\
         Indicators, last {} bars (oldest first):\n",
        symbol,
        timeframe,
        snapshot.last_price,
        snapshot.price_change_24h_pct,
        snapshot.volume_24h,
        snapshot.funding_rate,
        trend.trend,
        trend.strength,
        INDICATOR_TAIL,
    );

    for row in view.indicators.tail(INDICATOR_TAIL) {
        user.push_str(&format!(
            "close {:.2} | rsi {:.1} | macd {:.2}/{:.2} | bb {:.2}/{:.2}/{:.2} | \
             sma20 {:.2} sma50 {:.2} | vwap {:.2} | adx {:.1} | vol {:.0}\n",
            row.close,
            row.rsi14,
            row.macd,
            row.macd_signal,
            row.bb_lower,
            row.bb_middle,
            row.bb_upper,
            row.sma20,
            row.sma50,
            row.vwap,
            row.adx14,
            row.volume,
        ));
    }

    user.push_str("\nReply with the JSON verdict only.");

    ChatPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}

pub fn final_prompt(symbol: &str, bundle: &SnapshotBundle) -> ChatPrompt {
    let mut user = format!(
        "Produce the combined verdict for {} from the latest analyses of all \
         four timeframes. Weigh longer timeframes more for direction and \
         shorter ones for entry timing.\n",
        symbol
    );

    for (tf, analysis) in bundle.entries() {
        let rendered =
            serde_json::to_string_pretty(analysis).unwrap_or_else(|_| "{}".to_string());
        user.push_str(&format!("\n--- {} analysis ---\n{}\n", tf, rendered));
    }

    user.push_str("\nReply with one JSON verdict in the exact schema, nothing else.");

    ChatPrompt {
        system: SYSTEM_PROMPT.to_string(),
        user,
    }
}
