//! Liquidation domain entity.
//!
//! A [`LiquidationEvent`] is an immutable, ephemeral record parsed from the
//! venue's forced-liquidation stream. The engine counter-trades the liquidated
//! flow: longs liquidated are faded with a Buy (opening a long), shorts with a
//! Sell (opening a short).

use chrono::{DateTime, Utc};

use crate::domain::entities::order::OrderSide;

/// The side of the position that was force-liquidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// The other side.
    pub fn opposite(self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "Long"),
            PositionSide::Short => write!(f, "Short"),
        }
    }
}

/// A qualifying or non-qualifying liquidation, as reported by the venue.
///
/// Immutable once constructed. `usd_value` and `qualifies` are derived from the
/// price, quantity, and the configured qualification threshold at parse time.
#[derive(Debug, Clone)]
pub struct LiquidationEvent {
    pub symbol: String,
    /// The side that was liquidated.
    pub position_side: PositionSide,
    pub price: f64,
    pub quantity: f64,
    pub usd_value: f64,
    pub qualifies: bool,
    pub timestamp: DateTime<Utc>,
}

impl LiquidationEvent {
    /// Build an event, deriving notional value and qualification against the
    /// configured USD threshold.
    pub fn new(
        symbol: String,
        position_side: PositionSide,
        price: f64,
        quantity: f64,
        qualify_threshold_usd: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let usd_value = price * quantity;
        LiquidationEvent {
            symbol,
            position_side,
            price,
            quantity,
            usd_value,
            qualifies: usd_value >= qualify_threshold_usd,
            timestamp,
        }
    }

    /// The position side to open when countering this liquidation's flow.
    pub fn counter_position_side(&self) -> PositionSide {
        self.position_side
    }

    /// The order side to open the counter-position.
    pub fn counter_side(&self) -> OrderSide {
        match self.position_side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}
