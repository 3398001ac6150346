use chrono::{DateTime, Utc};

use crate::domain::entities::liquidation::PositionSide;
use crate::domain::entities::position::Position;

/// How a position left the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExitType {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Manual,
    /// Closed without a settled venue record; repairable by the backfill sweep.
    Unresolved,
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitType::StopLoss => write!(f, "stop_loss"),
            ExitType::TakeProfit => write!(f, "take_profit"),
            ExitType::TrailingStop => write!(f, "trailing_stop"),
            ExitType::Manual => write!(f, "manual"),
            ExitType::Unresolved => write!(f, "unresolved"),
        }
    }
}

impl ExitType {
    /// Best-effort classification from the exit price relative to the
    /// protective levels that were armed when the position closed. The venue's
    /// settlement records carry no exit cause.
    pub fn classify(position: &Position, exit_price: f64) -> ExitType {
        let tolerance = exit_price.abs() * 0.002;

        if let Some(sl) = position.stop_loss_price {
            if (exit_price - sl).abs() <= tolerance {
                return ExitType::StopLoss;
            }
        }
        if let Some(tp) = position.take_profit_price {
            let reached = match position.side {
                PositionSide::Long => exit_price >= tp - tolerance,
                PositionSide::Short => exit_price <= tp + tolerance,
            };
            if reached {
                return ExitType::TakeProfit;
            }
        }
        if position.has_trailing() && position.in_profit_at(exit_price) {
            return ExitType::TrailingStop;
        }
        ExitType::Manual
    }
}

/// Fee attribution per leg, from the venue's execution records.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct TradeFees {
    pub open: f64,
    pub close: f64,
}

impl TradeFees {
    pub fn total(&self) -> f64 {
        self.open + self.close
    }
}

/// A settled (or provisionally settled) round trip.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: f64,
    pub gross_pnl: f64,
    pub fees: TradeFees,
    pub net_pnl: f64,
    pub exit_type: ExitType,
    pub entry_is_maker: bool,
    pub exit_is_maker: bool,
    /// Venue close-order id when a settlement record was matched. Consumed at
    /// most once across the process lifetime.
    pub close_order_id: Option<String>,
    pub open_time: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    /// A trade whose exit never matched a settlement record. The backfill
    /// sweep may later repair it in place.
    pub fn is_unsettled(&self) -> bool {
        self.close_order_id.is_none()
    }
}
