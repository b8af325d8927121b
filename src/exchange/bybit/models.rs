//! Bybit v5 API Data Models
//!
//! Request and response types for the Bybit v5 REST API. Bybit serializes
//! most numeric fields as strings; parsing to `f64` happens here so the rest
//! of the crate never sees the wire format.

use serde::{Deserialize, Serialize};

use crate::exchange::ExchangeError;

/// Parse one of Bybit's stringly-typed numeric fields. Empty strings stand
/// in for "not set" on several endpoints and parse as zero.
pub(crate) fn parse_num(field: &str, raw: &str) -> Result<f64, ExchangeError> {
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .map_err(|_| ExchangeError::Other(format!("unparseable {} value: {:?}", field, raw)))
}

// ============================================================================
// Envelope
// ============================================================================

/// Every v5 response carries this envelope; `result` is endpoint-specific.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
}

// ============================================================================
// Market data
// ============================================================================

/// Result of `/v5/market/kline`. Each row is
/// `[startTime, open, high, low, close, volume, turnover]`, newest first.
#[derive(Debug, Deserialize)]
pub struct KlineResult {
    pub list: Vec<Vec<String>>,
}

/// Result of `/v5/market/tickers`.
#[derive(Debug, Deserialize)]
pub struct TickerResult {
    pub list: Vec<TickerInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerInfo {
    pub symbol: String,
    pub last_price: String,
    #[serde(default)]
    pub price24h_pcnt: String,
    #[serde(default)]
    pub volume24h: String,
    #[serde(default)]
    pub funding_rate: String,
}

// ============================================================================
// Account
// ============================================================================

/// Result of `/v5/account/wallet-balance`.
#[derive(Debug, Deserialize)]
pub struct WalletResult {
    pub list: Vec<WalletAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAccount {
    #[serde(default)]
    pub total_equity: String,
    #[serde(default)]
    pub total_wallet_balance: String,
}

// ============================================================================
// Positions
// ============================================================================

/// Result of `/v5/position/list`.
#[derive(Debug, Deserialize)]
pub struct PositionResult {
    pub list: Vec<PositionInfo>,
}

/// One position entry. `side` is `"Buy"`, `"Sell"`, or `"None"` when flat.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInfo {
    pub symbol: String,
    pub side: String,
    pub size: String,
    #[serde(default)]
    pub avg_price: String,
    #[serde(default)]
    pub leverage: String,
    #[serde(default)]
    pub mark_price: String,
    #[serde(default, alias = "unrealizedPnl")]
    pub unrealised_pnl: String,
    #[serde(default)]
    pub liq_price: String,
}

// ============================================================================
// Orders
// ============================================================================

/// Body of `/v5/position/set-leverage`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLeverageRequest {
    pub category: &'static str,
    pub symbol: String,
    pub buy_leverage: String,
    pub sell_leverage: String,
}

/// Body of `/v5/order/create`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub category: &'static str,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub time_in_force: String,
    pub position_idx: i32,
    pub reduce_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<String>,
}

/// Body of `/v5/order/cancel`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub category: &'static str,
    pub symbol: String,
    pub order_id: String,
}

/// Result of `/v5/order/create` and `/v5/order/cancel`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResult {
    pub order_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses() {
        let raw = r#"{"retCode":0,"retMsg":"OK","result":{"orderId":"abc-123"}}"#;
        let resp: ApiResponse<OrderResult> = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.ret_code, 0);
        assert_eq!(resp.result.unwrap().order_id, "abc-123");
    }

    #[test]
    fn test_position_field_variants() {
        // Bybit spells it "unrealisedPnl"; some mirrors use "unrealizedPnl".
        let a = r#"{"symbol":"BTCUSDT","side":"Buy","size":"0.016","avgPrice":"60000","leverage":"5","markPrice":"60100","unrealisedPnl":"1.6","liqPrice":"48000"}"#;
        let b = r#"{"symbol":"BTCUSDT","side":"Buy","size":"0.016","avgPrice":"60000","leverage":"5","markPrice":"60100","unrealizedPnl":"1.6","liqPrice":""}"#;
        let pa: PositionInfo = serde_json::from_str(a).unwrap();
        let pb: PositionInfo = serde_json::from_str(b).unwrap();
        assert_eq!(pa.unrealised_pnl, "1.6");
        assert_eq!(pb.unrealised_pnl, "1.6");
        assert!(pb.liq_price.is_empty());
    }

    #[test]
    fn test_parse_num_empty_is_zero() {
        assert_eq!(parse_num("liqPrice", "").unwrap(), 0.0);
        assert_eq!(parse_num("size", "0.016").unwrap(), 0.016);
        assert!(parse_num("size", "abc").is_err());
    }
}
