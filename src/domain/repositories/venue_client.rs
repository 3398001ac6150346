//! Venue Gateway Trait
//!
//! Common interface to the derivatives venue. Keeps the engines independent
//! of the concrete transport and makes every remote interaction mockable in
//! tests. All calls are at-least-once from the venue's perspective: a timeout
//! only bounds local waiting, so callers check state before resubmitting
//! rather than assuming the call never landed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::entities::liquidation::PositionSide;
use crate::domain::entities::order::{OrderChannel, OrderRequest, OrderStatus};
use crate::domain::errors::VenueError;

pub type VenueResult<T> = Result<T, VenueError>;

/// A position as the venue currently sees it.
#[derive(Debug, Clone)]
pub struct RemotePosition {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_price: f64,
    pub stop_loss: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub unrealized_pnl: f64,
    pub mark_price: f64,
    pub created_at: Option<DateTime<Utc>>,
}

impl RemotePosition {
    /// No protective order of any kind is live on the venue side.
    pub fn is_naked(&self) -> bool {
        self.stop_loss.is_none() && self.trailing_stop.is_none()
    }
}

/// One settled close from the venue's closed-PnL history. Carries no key back
/// to the originating entry; association is heuristic (see reconciliation).
#[derive(Debug, Clone)]
pub struct ClosedPnlRecord {
    pub symbol: String,
    /// Id of the closing order. Globally consumed at most once.
    pub order_id: String,
    pub avg_entry_price: f64,
    pub avg_exit_price: f64,
    pub qty: f64,
    /// Side of the position that was closed.
    pub side: PositionSide,
    /// The venue's authoritative realized PnL.
    pub closed_pnl: f64,
    pub created_time: DateTime<Utc>,
}

/// One execution (fill leg) for fee and maker/taker attribution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub fee: f64,
    pub is_maker: bool,
}

/// Protective-order update. Fields left `None` are not touched.
#[derive(Debug, Clone, Default)]
pub struct ProtectionRequest {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub active_price: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

#[async_trait]
pub trait VenueClient: Send + Sync {
    fn name(&self) -> &str;

    /// Submit an order, returning the venue-assigned order id.
    async fn place_order(&self, req: &OrderRequest, channel: OrderChannel) -> VenueResult<String>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> VenueResult<()>;

    async fn order_status(&self, symbol: &str, order_id: &str) -> VenueResult<OrderStatus>;

    /// Idempotent; venues answer "already set" with a non-error or a
    /// recognizable rejection.
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> VenueResult<()>;

    /// Idempotent, same contract as `set_leverage`.
    async fn set_one_way_mode(&self, symbol: &str) -> VenueResult<()>;

    /// Attach or replace protective orders on an open position.
    async fn set_trading_stop(&self, symbol: &str, req: &ProtectionRequest) -> VenueResult<()>;

    async fn list_open_positions(&self) -> VenueResult<Vec<RemotePosition>>;

    /// Single-symbol snapshot, used to re-read blended averages after a fill.
    async fn position_for(&self, symbol: &str) -> VenueResult<Option<RemotePosition>>;

    async fn list_closed_pnl(
        &self,
        symbol: Option<&str>,
        limit: usize,
    ) -> VenueResult<Vec<ClosedPnlRecord>>;

    async fn list_executions(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> VenueResult<Vec<ExecutionRecord>>;

    async fn best_quote(&self, symbol: &str) -> VenueResult<Quote>;

    /// Total equity in the settlement currency.
    async fn wallet_balance(&self) -> VenueResult<f64>;
}
