//! # Bybit v5 Venue Gateway
//!
//! Signed REST client implementing [`VenueClient`]. Requests are signed with
//! HMAC-SHA256 over `timestamp + api_key + recv_window + payload` and sent
//! through a per-key request limiter.
//!
//! Two transports back the order channels: the low-latency client uses a
//! tight timeout and a short receive window, the standard client favors
//! completion over speed. Private numeric fields arrive as strings and are
//! parsed defensively; a field that fails to parse is a malformed response,
//! not a zero.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::domain::entities::liquidation::PositionSide;
use crate::domain::entities::order::{OrderChannel, OrderRequest, OrderStatus, OrderType};
use crate::domain::errors::VenueError;
use crate::domain::repositories::venue_client::{
    ClosedPnlRecord, ExecutionRecord, ProtectionRequest, Quote, RemotePosition, VenueClient,
    VenueResult,
};
use crate::infrastructure::rate_limit::RequestLimiter;
use crate::secrets::VenueCredentials;

const BYBIT_API_BASE: &str = "https://api.bybit.com";
const CATEGORY: &str = "linear";

/// Leverage already at the requested value.
const RET_LEVERAGE_NOT_MODIFIED: i64 = 110043;
/// Position mode already one-way.
const RET_MODE_NOT_MODIFIED: i64 = 110025;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct BybitConfig {
    pub api_base: String,
    pub recv_window_ms: u64,
    pub fast_recv_window_ms: u64,
}

impl Default for BybitConfig {
    fn default() -> Self {
        BybitConfig {
            api_base: BYBIT_API_BASE.to_string(),
            recv_window_ms: 5000,
            fast_recv_window_ms: 2000,
        }
    }
}

pub struct BybitClient {
    standard: Client,
    fast: Client,
    config: BybitConfig,
    credentials: VenueCredentials,
    limiter: RequestLimiter,
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish()
    }
}

// ---- wire DTOs -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope<T> {
    #[serde(rename = "retCode")]
    pub(crate) ret_code: i64,
    #[serde(rename = "retMsg", default)]
    pub(crate) ret_msg: String,
    pub(crate) result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub(crate) list: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OrderIdResult {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderEntry {
    order_status: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    cum_exec_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionEntry {
    symbol: String,
    side: String,
    size: String,
    avg_price: String,
    #[serde(default)]
    stop_loss: String,
    #[serde(default)]
    trailing_stop: String,
    #[serde(default)]
    unrealised_pnl: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    created_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedPnlEntry {
    symbol: String,
    order_id: String,
    avg_entry_price: String,
    avg_exit_price: String,
    qty: String,
    side: String,
    closed_pnl: String,
    created_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionEntry {
    #[serde(default)]
    exec_fee: String,
    #[serde(default)]
    is_maker: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    #[serde(default)]
    bid1_price: String,
    #[serde(default)]
    ask1_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletAccount {
    total_equity: String,
}

// ---- parsing helpers -------------------------------------------------------

fn parse_num(field: &str, raw: &str) -> VenueResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| VenueError::Malformed(format!("{field}: '{raw}'")))
}

/// Optional numeric fields come back empty (or "0") when unset.
fn parse_opt_num(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value > 0.0 => Some(value),
        _ => None,
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn position_side_from(side: &str) -> VenueResult<PositionSide> {
    match side {
        "Buy" => Ok(PositionSide::Long),
        "Sell" => Ok(PositionSide::Short),
        other => Err(VenueError::Malformed(format!("position side: '{other}'"))),
    }
}

fn format_qty(value: f64) -> String {
    // Already rounded to the lot step upstream; shortest round-trip form.
    format!("{}", value)
}

fn map_transport_error(e: reqwest::Error) -> VenueError {
    if e.is_timeout() {
        VenueError::Timeout(e.to_string())
    } else {
        VenueError::Network(e.to_string())
    }
}

fn map_ret_code(code: i64, msg: &str) -> VenueError {
    match code {
        10003 | 10004 | 10005 => VenueError::Auth(format!("{code}: {msg}")),
        10006 | 10018 => VenueError::RateLimited,
        _ => VenueError::Rejected(format!("{code}: {msg}")),
    }
}

// ---- client ----------------------------------------------------------------

impl BybitClient {
    pub fn new(
        credentials: VenueCredentials,
        config: BybitConfig,
        limiter: RequestLimiter,
    ) -> VenueResult<Self> {
        let standard = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VenueError::Network(format!("client build: {e}")))?;
        let fast = Client::builder()
            .timeout(Duration::from_secs(2))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| VenueError::Network(format!("client build: {e}")))?;

        Ok(BybitClient { standard, fast, config, credentials, limiter })
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// HMAC-SHA256 over `timestamp + api_key + recv_window + payload`, hex.
    fn sign(&self, timestamp: u64, recv_window: u64, payload: &str) -> VenueResult<String> {
        let message = format!("{}{}{}{}", timestamp, self.credentials.api_key, recv_window, payload);
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .map_err(|e| VenueError::Auth(format!("hmac init: {e}")))?;
        mac.update(message.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn unwrap_envelope<T>(envelope: ApiEnvelope<T>) -> VenueResult<T> {
        if envelope.ret_code != 0 {
            return Err(map_ret_code(envelope.ret_code, &envelope.ret_msg));
        }
        envelope
            .result
            .ok_or_else(|| VenueError::Malformed("missing result".to_string()))
    }

    async fn get_signed<T: DeserializeOwned>(&self, path: &str, query: &str) -> VenueResult<T> {
        self.limiter.until_ready().await;

        let timestamp = Self::timestamp_ms();
        let recv_window = self.config.recv_window_ms;
        let signature = self.sign(timestamp, recv_window, query)?;
        let url = format!("{}{}?{}", self.config.api_base, path, query);

        let response = self
            .standard
            .get(&url)
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", recv_window.to_string())
            .header("X-BAPI-SIGN", signature)
            .send()
            .await
            .map_err(map_transport_error)?;

        let envelope: ApiEnvelope<T> = response.json().await.map_err(map_transport_error)?;
        Self::unwrap_envelope(envelope)
    }

    async fn post_signed<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        channel: OrderChannel,
    ) -> VenueResult<T> {
        self.limiter.until_ready().await;

        let (client, recv_window) = match channel {
            OrderChannel::LowLatency => (&self.fast, self.config.fast_recv_window_ms),
            OrderChannel::Standard => (&self.standard, self.config.recv_window_ms),
        };

        let payload = body.to_string();
        let timestamp = Self::timestamp_ms();
        let signature = self.sign(timestamp, recv_window, &payload)?;
        let url = format!("{}{}", self.config.api_base, path);

        let response = client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", recv_window.to_string())
            .header("X-BAPI-SIGN", signature)
            .header("Content-Type", "application/json")
            .body(payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let envelope: ApiEnvelope<T> = response.json().await.map_err(map_transport_error)?;
        Self::unwrap_envelope(envelope)
    }

    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &str) -> VenueResult<T> {
        self.limiter.until_ready().await;

        let url = format!("{}{}?{}", self.config.api_base, path, query);
        let response = self.standard.get(&url).send().await.map_err(map_transport_error)?;
        let envelope: ApiEnvelope<T> = response.json().await.map_err(map_transport_error)?;
        Self::unwrap_envelope(envelope)
    }

    fn remote_position_from(entry: &PositionEntry) -> VenueResult<Option<RemotePosition>> {
        let quantity = parse_num("size", &entry.size)?;
        if quantity <= 0.0 {
            return Ok(None);
        }
        Ok(Some(RemotePosition {
            symbol: entry.symbol.clone(),
            side: position_side_from(&entry.side)?,
            quantity,
            avg_price: parse_num("avgPrice", &entry.avg_price)?,
            stop_loss: parse_opt_num(&entry.stop_loss),
            trailing_stop: parse_opt_num(&entry.trailing_stop),
            unrealized_pnl: parse_num("unrealisedPnl", &entry.unrealised_pnl).unwrap_or(0.0),
            mark_price: parse_num("markPrice", &entry.mark_price).unwrap_or(0.0),
            created_at: parse_millis(&entry.created_time),
        }))
    }

    async fn order_lookup(&self, path: &str, symbol: &str, order_id: &str) -> VenueResult<Vec<OrderEntry>> {
        let query = format!("category={CATEGORY}&symbol={symbol}&orderId={order_id}");
        let result: ListResult<OrderEntry> = self.get_signed(path, &query).await?;
        Ok(result.list)
    }
}

#[async_trait]
impl VenueClient for BybitClient {
    fn name(&self) -> &str {
        "bybit"
    }

    async fn place_order(&self, req: &OrderRequest, channel: OrderChannel) -> VenueResult<String> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": req.symbol,
            "side": req.side.to_string(),
            "orderType": req.order_type.to_string(),
            "qty": format_qty(req.quantity),
            "positionIdx": 0,
        });
        match req.order_type {
            OrderType::Market => {
                body["timeInForce"] = json!("IOC");
            }
            OrderType::Limit => {
                let price = req.price.ok_or_else(|| {
                    VenueError::Rejected("limit order without price".to_string())
                })?;
                body["price"] = json!(format_qty(price));
                body["timeInForce"] = json!("GTC");
            }
        }
        if req.reduce_only {
            body["reduceOnly"] = json!(true);
        }

        let result: OrderIdResult = self.post_signed("/v5/order/create", &body, channel).await?;
        debug!(symbol = %req.symbol, order_id = %result.order_id, ?channel, "order accepted");
        Ok(result.order_id)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "orderId": order_id,
        });
        let _: serde_json::Value =
            self.post_signed("/v5/order/cancel", &body, OrderChannel::Standard).await?;
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> VenueResult<OrderStatus> {
        // Live orders first, then the short-term history the venue moves
        // terminal orders into.
        let mut entries = self.order_lookup("/v5/order/realtime", symbol, order_id).await?;
        if entries.is_empty() {
            entries = self.order_lookup("/v5/order/history", symbol, order_id).await?;
        }
        let entry = match entries.into_iter().next() {
            Some(entry) => entry,
            None => return Ok(OrderStatus::Unknown),
        };

        let status = match entry.order_status.as_str() {
            "New" | "Untriggered" | "Triggered" => OrderStatus::New,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Filled" => OrderStatus::Filled {
                avg_price: parse_num("avgPrice", &entry.avg_price)?,
                cum_qty: parse_num("cumExecQty", &entry.cum_exec_qty)?,
            },
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
            "Rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        };
        Ok(status)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self
            .post_signed::<serde_json::Value>("/v5/position/set-leverage", &body, OrderChannel::Standard)
            .await
        {
            Ok(_) => Ok(()),
            // Already at the requested value: idempotent success.
            Err(VenueError::Rejected(msg))
                if msg.starts_with(&RET_LEVERAGE_NOT_MODIFIED.to_string()) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_one_way_mode(&self, symbol: &str) -> VenueResult<()> {
        let body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "mode": 0,
        });
        match self
            .post_signed::<serde_json::Value>("/v5/position/switch-mode", &body, OrderChannel::Standard)
            .await
        {
            Ok(_) => Ok(()),
            Err(VenueError::Rejected(msg))
                if msg.starts_with(&RET_MODE_NOT_MODIFIED.to_string()) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_trading_stop(&self, symbol: &str, req: &ProtectionRequest) -> VenueResult<()> {
        let mut body = json!({
            "category": CATEGORY,
            "symbol": symbol,
            "positionIdx": 0,
        });
        if let Some(stop_loss) = req.stop_loss {
            body["stopLoss"] = json!(format_qty(stop_loss));
        }
        if let Some(take_profit) = req.take_profit {
            body["takeProfit"] = json!(format_qty(take_profit));
        }
        if let Some(trailing) = req.trailing_stop {
            body["trailingStop"] = json!(format_qty(trailing));
        }
        if let Some(active) = req.active_price {
            body["activePrice"] = json!(format_qty(active));
        }

        let _: serde_json::Value =
            self.post_signed("/v5/position/trading-stop", &body, OrderChannel::Standard).await?;
        Ok(())
    }

    async fn list_open_positions(&self) -> VenueResult<Vec<RemotePosition>> {
        let query = format!("category={CATEGORY}&settleCoin=USDT&limit=200");
        let result: ListResult<PositionEntry> =
            self.get_signed("/v5/position/list", &query).await?;

        let mut positions = Vec::with_capacity(result.list.len());
        for entry in &result.list {
            if let Some(position) = Self::remote_position_from(entry)? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn position_for(&self, symbol: &str) -> VenueResult<Option<RemotePosition>> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result: ListResult<PositionEntry> =
            self.get_signed("/v5/position/list", &query).await?;
        match result.list.first() {
            Some(entry) => Self::remote_position_from(entry),
            None => Ok(None),
        }
    }

    async fn list_closed_pnl(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> VenueResult<Vec<ClosedPnlRecord>> {
        let mut query = format!("category={CATEGORY}&limit={limit}");
        if let Some(symbol) = symbol {
            query.push_str(&format!("&symbol={symbol}"));
        }
        let result: ListResult<ClosedPnlEntry> =
            self.get_signed("/v5/position/closed-pnl", &query).await?;

        let mut records = Vec::with_capacity(result.list.len());
        for entry in &result.list {
            // `side` here is the side of the closing order, so the closed
            // position held the opposite side.
            let closed_side = position_side_from(&entry.side)?.opposite();
            records.push(ClosedPnlRecord {
                symbol: entry.symbol.clone(),
                order_id: entry.order_id.clone(),
                avg_entry_price: parse_num("avgEntryPrice", &entry.avg_entry_price)?,
                avg_exit_price: parse_num("avgExitPrice", &entry.avg_exit_price)?,
                qty: parse_num("qty", &entry.qty)?,
                side: closed_side,
                closed_pnl: parse_num("closedPnl", &entry.closed_pnl)?,
                created_time: parse_millis(&entry.created_time)
                    .ok_or_else(|| VenueError::Malformed("createdTime".to_string()))?,
            });
        }
        Ok(records)
    }

    async fn list_executions(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> VenueResult<Vec<ExecutionRecord>> {
        let query = format!("category={CATEGORY}&symbol={symbol}&orderId={order_id}");
        let result: ListResult<ExecutionEntry> =
            self.get_signed("/v5/execution/list", &query).await?;

        let mut executions = Vec::with_capacity(result.list.len());
        for entry in &result.list {
            executions.push(ExecutionRecord {
                fee: parse_num("execFee", &entry.exec_fee).unwrap_or(0.0),
                is_maker: entry.is_maker,
            });
        }
        Ok(executions)
    }

    async fn best_quote(&self, symbol: &str) -> VenueResult<Quote> {
        let query = format!("category={CATEGORY}&symbol={symbol}");
        let result: ListResult<TickerEntry> =
            self.get_public("/v5/market/tickers", &query).await?;
        let ticker = result
            .list
            .first()
            .ok_or_else(|| VenueError::Malformed(format!("no ticker for {symbol}")))?;
        Ok(Quote {
            bid: parse_num("bid1Price", &ticker.bid1_price)?,
            ask: parse_num("ask1Price", &ticker.ask1_price)?,
        })
    }

    async fn wallet_balance(&self) -> VenueResult<f64> {
        let result: ListResult<WalletAccount> = self
            .get_signed("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let account = result
            .list
            .first()
            .ok_or_else(|| VenueError::Malformed("no wallet account".to_string()))?;
        parse_num("totalEquity", &account.total_equity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opt_num_treats_unset_as_none() {
        assert_eq!(parse_opt_num(""), None);
        assert_eq!(parse_opt_num("0"), None);
        assert_eq!(parse_opt_num("0.0"), None);
        assert_eq!(parse_opt_num("95.5"), Some(95.5));
    }

    #[test]
    fn test_parse_num_rejects_garbage() {
        assert!(parse_num("qty", "1.5").is_ok());
        assert!(matches!(parse_num("qty", "abc"), Err(VenueError::Malformed(_))));
    }

    #[test]
    fn test_closed_pnl_side_inversion() {
        // A Sell closing order means the closed position was long.
        let closed = position_side_from("Sell").unwrap().opposite();
        assert_eq!(closed, PositionSide::Long);
        let closed = position_side_from("Buy").unwrap().opposite();
        assert_eq!(closed, PositionSide::Short);
        assert!(position_side_from("Both").is_err());
    }

    #[test]
    fn test_ret_code_mapping() {
        assert!(matches!(map_ret_code(10006, "rate"), VenueError::RateLimited));
        assert!(matches!(map_ret_code(10003, "key"), VenueError::Auth(_)));
        assert!(matches!(map_ret_code(110007, "balance"), VenueError::Rejected(_)));
    }

    #[test]
    fn test_format_qty_shortest_form() {
        assert_eq!(format_qty(0.001), "0.001");
        assert_eq!(format_qty(25.0), "25");
    }

    #[test]
    fn test_signature_is_stable_hex() {
        let credentials = VenueCredentials {
            api_key: "key".to_string(),
            api_secret: zeroize::Zeroizing::new("secret".to_string()),
        };
        let limiter = crate::infrastructure::rate_limit::create_limiter(Default::default());
        let client = BybitClient::new(credentials, BybitConfig::default(), limiter).unwrap();

        let first = client.sign(1_700_000_000_000, 5000, "category=linear").unwrap();
        let second = client.sign(1_700_000_000_000, 5000, "category=linear").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
