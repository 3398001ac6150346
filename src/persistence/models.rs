use chrono::{DateTime, Utc};

use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ClosedTrade;
use crate::domain::services::ledger::PositionLedger;

/// Everything needed to resume after a restart.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct StateSnapshot {
    pub positions: Vec<Position>,
    pub history: Vec<ClosedTrade>,
    pub consumed_close_ids: Vec<String>,
    pub saved_at: DateTime<Utc>,
}

impl StateSnapshot {
    pub fn capture(ledger: &PositionLedger) -> Self {
        StateSnapshot {
            positions: ledger.positions_snapshot(),
            history: ledger.history_snapshot(),
            consumed_close_ids: ledger.consumed_close_ids(),
            saved_at: Utc::now(),
        }
    }

    pub fn restore_into(self, ledger: &PositionLedger) {
        ledger.restore(self.positions, self.history, self.consumed_close_ids);
    }
}
