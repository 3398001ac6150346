use chrono::{DateTime, Utc};

use crate::domain::entities::liquidation::PositionSide;

/// An open counter-position tracked by the ledger.
///
/// At most one exists per symbol. Created on a confirmed entry fill, mutated
/// on each DCA add and on protection healing, removed atomically with the
/// creation of a `ClosedTrade`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Volume-weighted entry price across all fills.
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub trailing_distance: Option<f64>,
    pub trailing_activation_price: Option<f64>,
    pub open_time: DateTime<Utc>,
    /// Number of DCA adds already executed; 0 for a fresh entry.
    pub dca_level: usize,
    /// Full notional the split schedule pyramids toward.
    pub total_budget_notional: f64,
    /// Price of the liquidation that triggered the most recent entry or add.
    /// Used for the next improvement check, not the fill price.
    pub last_entry_price: f64,
    /// Venue order id of the initial entry, for fee attribution on close.
    pub entry_order_id: Option<String>,
    #[serde(default)]
    pub mark_price: Option<f64>,
    #[serde(default)]
    pub unrealized_pnl: Option<f64>,
}

impl Position {
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// True when neither a stop-loss nor a trailing stop is attached.
    pub fn is_naked(&self) -> bool {
        self.stop_loss_price.is_none() && self.trailing_distance.is_none()
    }

    pub fn has_trailing(&self) -> bool {
        self.trailing_distance.is_some()
    }

    /// Absorb the venue's blended average after a DCA fill.
    pub fn apply_blended_fill(&mut self, avg_price: f64, quantity: f64) {
        self.entry_price = avg_price;
        self.quantity = quantity;
    }

    /// Unrealized PnL at the given mark, sign-adjusted for side.
    pub fn unrealized_at(&self, mark: f64) -> f64 {
        match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - mark) * self.quantity,
        }
    }

    /// Whether `price` is on the profitable side of entry for this position.
    pub fn in_profit_at(&self, price: f64) -> bool {
        self.unrealized_at(price) > 0.0
    }
}
