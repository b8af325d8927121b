//! Bybit v5 REST Client
//!
//! HTTP client for the Bybit v5 unified-account API with HMAC request
//! signing. Implements the `Exchange` facade; nothing outside this module
//! sees Bybit's wire format.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::{debug, warn};

use super::models::*;
use crate::analysis::types::Timeframe;
use crate::exchange::{
    Bar, Exchange, ExchangeError, MarketSnapshot, OrderKind, OrderRequest, Position, PositionSide,
};

type HmacSha256 = Hmac<Sha256>;

/// Mainnet REST endpoint.
pub const MAINNET_URL: &str = "https://api.bybit.com";
/// Testnet REST endpoint.
pub const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Deadline for public market-data calls.
const MARKET_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline for signed account/trade calls.
const TRADE_DEADLINE: Duration = Duration::from_secs(15);

/// Ret codes that mean "leverage already at the requested value".
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;

/// Bybit v5 API client
pub struct BybitClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    recv_window: String,
}

impl BybitClient {
    /// Create a new client from environment variables
    ///
    /// Expects:
    /// - `BYBIT_API_KEY` - API key for the unified account
    /// - `BYBIT_API_SECRET` - matching secret
    pub fn from_env(testnet: bool) -> Result<Self> {
        let api_key =
            std::env::var("BYBIT_API_KEY").context("BYBIT_API_KEY environment variable not set")?;
        let api_secret = std::env::var("BYBIT_API_SECRET")
            .context("BYBIT_API_SECRET environment variable not set")?;
        Ok(Self::new(api_key, api_secret, testnet))
    }

    /// Create a new client with explicit credentials. `testnet` selects the
    /// endpoint only; the API surface is identical.
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Self {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: base_url.to_string(),
            api_key,
            api_secret,
            recv_window: "5000".to_string(),
        }
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`.
    fn sign(&self, timestamp: &str, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(timestamp.as_bytes());
        mac.update(self.api_key.as_bytes());
        mac.update(self.recv_window.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> String {
        chrono::Utc::now().timestamp_millis().to_string()
    }

    fn classify_http(err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ExchangeError::Transient(err.to_string())
        } else {
            ExchangeError::Other(err.to_string())
        }
    }

    /// Map a non-zero v5 ret code onto the error taxonomy.
    fn classify_ret(ret_code: i64, ret_msg: &str) -> ExchangeError {
        let msg = format!("[{}] {}", ret_code, ret_msg);
        match ret_code {
            10003 | 10004 | 10005 | 33004 => ExchangeError::Auth(msg),
            10006 | 10018 => ExchangeError::Transient(msg),
            110007 | 110012 | 110045 => ExchangeError::InsufficientMargin(msg),
            10001 | 110003 | 110017 | 170136 | 170140 => ExchangeError::FilterRejected(msg),
            _ => ExchangeError::Other(msg),
        }
    }

    async fn read_envelope<R: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<R, ExchangeError> {
        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Transient(format!("HTTP {}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Other(format!("HTTP {}: {}", status, body)));
        }

        let envelope: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("malformed response: {}", e)))?;

        if envelope.ret_code != 0 {
            return Err(Self::classify_ret(envelope.ret_code, &envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| ExchangeError::Other("response missing result".to_string()))
    }

    /// Unsigned GET for public market endpoints.
    async fn get_public<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<R, ExchangeError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .timeout(MARKET_DEADLINE)
            .send()
            .await
            .map_err(Self::classify_http)?;
        Self::read_envelope(response).await
    }

    /// Signed GET for account endpoints.
    async fn get_signed<R: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<R, ExchangeError> {
        let query_string = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(&timestamp, &query_string);

        let response = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query_string))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .header("X-BAPI-SIGN", signature)
            .timeout(TRADE_DEADLINE)
            .send()
            .await
            .map_err(Self::classify_http)?;
        Self::read_envelope(response).await
    }

    /// Signed POST for trade endpoints. Returns the raw envelope so callers
    /// can special-case benign ret codes.
    async fn post_signed_raw<T: serde::Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<ApiResponse<R>, ExchangeError> {
        let raw_body =
            serde_json::to_string(body).map_err(|e| ExchangeError::Other(e.to_string()))?;
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(&timestamp, &raw_body);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", &self.recv_window)
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(raw_body)
            .timeout(TRADE_DEADLINE)
            .send()
            .await
            .map_err(Self::classify_http)?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Transient(format!("HTTP {}: {}", status, body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Other(format!("HTTP {}: {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| ExchangeError::Other(format!("malformed response: {}", e)))
    }

    async fn post_signed<T: serde::Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R, ExchangeError> {
        let envelope: ApiResponse<R> = self.post_signed_raw(path, body).await?;
        if envelope.ret_code != 0 {
            return Err(Self::classify_ret(envelope.ret_code, &envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| ExchangeError::Other("response missing result".to_string()))
    }
}

/// Format a quantity or price for the wire without float noise.
fn fmt_decimal(value: f64) -> String {
    let s = format!("{:.8}", value);
    let trimmed = s.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

fn parse_bar(row: &[String]) -> Result<Bar, ExchangeError> {
    if row.len() < 6 {
        return Err(ExchangeError::Other(format!(
            "kline row has {} fields, expected at least 6",
            row.len()
        )));
    }
    Ok(Bar {
        open_ts: row[0]
            .parse::<i64>()
            .map_err(|_| ExchangeError::Other(format!("unparseable kline timestamp {:?}", row[0])))?,
        open: parse_num("open", &row[1])?,
        high: parse_num("high", &row[2])?,
        low: parse_num("low", &row[3])?,
        close: parse_num("close", &row[4])?,
        volume: parse_num("volume", &row[5])?,
    })
}

#[async_trait]
impl Exchange for BybitClient {
    async fn get_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let query = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", timeframe.kline_interval().to_string()),
            ("limit", limit.to_string()),
        ];
        let result: KlineResult = self.get_public("/v5/market/kline", &query).await?;

        // Bybit returns newest first; the core wants oldest first.
        let mut bars = result
            .list
            .iter()
            .map(|row| parse_bar(row))
            .collect::<Result<Vec<_>, _>>()?;
        bars.reverse();
        debug!("fetched {} {} bars for {}", bars.len(), timeframe, symbol);
        Ok(bars)
    }

    async fn get_balance(&self) -> Result<f64, ExchangeError> {
        let query = [("accountType", "UNIFIED".to_string())];
        let result: WalletResult = self.get_signed("/v5/account/wallet-balance", &query).await?;
        let account = result
            .list
            .first()
            .ok_or_else(|| ExchangeError::Other("wallet-balance returned no accounts".to_string()))?;
        parse_num("totalEquity", &account.total_equity)
    }

    async fn get_position(&self, symbol: &str) -> Result<Position, ExchangeError> {
        let query = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let result: PositionResult = self.get_signed("/v5/position/list", &query).await?;

        let info = match result.list.first() {
            Some(info) => info,
            None => return Ok(Position::flat()),
        };

        let size = parse_num("size", &info.size)?;
        let side = match info.side.as_str() {
            _ if size == 0.0 => PositionSide::Flat,
            "Buy" => PositionSide::Long,
            "Sell" => PositionSide::Short,
            "None" | "" => PositionSide::Flat,
            other => {
                return Err(ExchangeError::Other(format!(
                    "unknown position side {:?}",
                    other
                )))
            }
        };
        let liq = parse_num("liqPrice", &info.liq_price)?;

        Ok(Position {
            side,
            size_base: size,
            leverage: parse_num("leverage", &info.leverage)? as u32,
            entry_price: parse_num("avgPrice", &info.avg_price)?,
            mark_price: parse_num("markPrice", &info.mark_price)?,
            unrealized_pnl: parse_num("unrealisedPnl", &info.unrealised_pnl)?,
            liq_price: if liq > 0.0 { Some(liq) } else { None },
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        let body = SetLeverageRequest {
            category: "linear",
            symbol: symbol.to_string(),
            buy_leverage: leverage.to_string(),
            sell_leverage: leverage.to_string(),
        };
        let envelope: ApiResponse<serde_json::Value> =
            self.post_signed_raw("/v5/position/set-leverage", &body).await?;
        match envelope.ret_code {
            0 => Ok(()),
            RET_LEVERAGE_NOT_MODIFIED => {
                warn!("leverage for {} already at {}x", symbol, leverage);
                Ok(())
            }
            code => Err(Self::classify_ret(code, &envelope.ret_msg)),
        }
    }

    async fn create_order(&self, req: &OrderRequest) -> Result<String, ExchangeError> {
        let order_type = match req.kind {
            OrderKind::Limit => "Limit",
            OrderKind::Market => "Market",
        };
        let body = CreateOrderRequest {
            category: "linear",
            symbol: req.symbol.clone(),
            side: req.side.to_string(),
            order_type: order_type.to_string(),
            qty: fmt_decimal(req.qty),
            price: req.price.map(fmt_decimal),
            time_in_force: match req.kind {
                OrderKind::Limit => "GTC".to_string(),
                OrderKind::Market => "IOC".to_string(),
            },
            position_idx: 0,
            reduce_only: req.reduce_only,
            stop_loss: req.stop_loss.map(fmt_decimal),
            take_profit: req.take_profit.map(fmt_decimal),
        };
        let result: OrderResult = self.post_signed("/v5/order/create", &body).await?;
        Ok(result.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let body = CancelOrderRequest {
            category: "linear",
            symbol: symbol.to_string(),
            order_id: order_id.to_string(),
        };
        let _: OrderResult = self.post_signed("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn get_market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let query = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let result: TickerResult = self.get_public("/v5/market/tickers", &query).await?;
        let ticker = result
            .list
            .into_iter()
            .find(|t| t.symbol == symbol)
            .ok_or_else(|| ExchangeError::Other(format!("no ticker for {}", symbol)))?;

        Ok(MarketSnapshot {
            last_price: parse_num("lastPrice", &ticker.last_price)?,
            price_change_24h_pct: parse_num("price24hPcnt", &ticker.price24h_pcnt)? * 100.0,
            volume_24h: parse_num("volume24h", &ticker.volume24h)?,
            funding_rate: parse_num("fundingRate", &ticker.funding_rate)? * 100.0,
        })
    }
}
