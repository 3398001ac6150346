//! Position Ledger
//!
//! In-process map of symbol to open position, plus the bookkeeping the
//! lifecycle invariants hang off: per-symbol pending locks, the globally
//! consumed close-order-id set, the closed-trade history, and recent-close
//! stamps for the reconciliation dedup guard.
//!
//! All interior mutexes are std (not tokio) and never held across an await:
//! every critical section is a plain map operation, so cooperative scheduling
//! cannot interleave two mutations of the same structure.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

use crate::domain::entities::position::Position;
use crate::domain::entities::trade::ClosedTrade;

/// Holds the per-symbol pending lock for one engine invocation.
///
/// Acquired synchronously (no suspension between check and acquire) and
/// released on drop, which covers every exit path of the invocation.
pub struct SymbolLock {
    symbol: String,
    pending: Arc<Mutex<HashSet<String>>>,
}

impl SymbolLock {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }
}

impl Drop for SymbolLock {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.symbol);
        }
    }
}

/// Single logical writer per symbol; collaborators share one instance by
/// handle, so independent engines (e.g. per account) can run side by side
/// under test.
pub struct PositionLedger {
    positions: Mutex<HashMap<String, Position>>,
    pending: Arc<Mutex<HashSet<String>>>,
    consumed_close_ids: Mutex<HashSet<String>>,
    history: Mutex<Vec<ClosedTrade>>,
    recent_closes: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl PositionLedger {
    pub fn new() -> Self {
        PositionLedger {
            positions: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
            consumed_close_ids: Mutex::new(HashSet::new()),
            history: Mutex::new(Vec::new()),
            recent_closes: Mutex::new(HashMap::new()),
        }
    }

    /// Re-seed state from a persisted snapshot.
    pub fn restore(
        &self,
        positions: Vec<Position>,
        history: Vec<ClosedTrade>,
        consumed_close_ids: Vec<String>,
    ) {
        {
            let mut map = self.positions.lock().expect("ledger poisoned");
            for position in positions {
                map.insert(position.symbol.clone(), position);
            }
        }
        *self.history.lock().expect("ledger poisoned") = history;
        self.consumed_close_ids
            .lock()
            .expect("ledger poisoned")
            .extend(consumed_close_ids);
    }

    /// Try to take the per-symbol pending lock. Synchronous: there is no
    /// await point between the membership check and the insert.
    pub fn try_lock_symbol(&self, symbol: &str) -> Option<SymbolLock> {
        let mut pending = self.pending.lock().expect("ledger poisoned");
        if pending.contains(symbol) {
            return None;
        }
        pending.insert(symbol.to_string());
        Some(SymbolLock {
            symbol: symbol.to_string(),
            pending: Arc::clone(&self.pending),
        })
    }

    pub fn is_pending(&self, symbol: &str) -> bool {
        self.pending.lock().expect("ledger poisoned").contains(symbol)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("ledger poisoned").len()
    }

    pub fn open_count(&self) -> usize {
        self.positions.lock().expect("ledger poisoned").len()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.lock().expect("ledger poisoned").contains_key(symbol)
    }

    pub fn get(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().expect("ledger poisoned").get(symbol).cloned()
    }

    pub fn open_symbols(&self) -> Vec<String> {
        self.positions.lock().expect("ledger poisoned").keys().cloned().collect()
    }

    pub fn positions_snapshot(&self) -> Vec<Position> {
        self.positions.lock().expect("ledger poisoned").values().cloned().collect()
    }

    /// Insert a freshly opened or adopted position. At most one open position
    /// may exist per symbol; a duplicate insert replaces and is reported.
    pub fn insert(&self, position: Position) {
        let mut positions = self.positions.lock().expect("ledger poisoned");
        if let Some(previous) = positions.insert(position.symbol.clone(), position) {
            warn!(
                symbol = %previous.symbol,
                "ledger replaced an existing open position; single-entry invariant violated upstream"
            );
        }
    }

    /// Apply a mutation to the open position for `symbol`, if any.
    pub fn update<F>(&self, symbol: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.lock().expect("ledger poisoned");
        match positions.get_mut(symbol) {
            Some(position) => {
                mutate(position);
                true
            }
            None => false,
        }
    }

    /// Remove the open position after a close decision, stamping the dedup
    /// window so the next reconcile ticks skip re-processing the symbol.
    /// The matching `ClosedTrade` is appended by the settlement path once
    /// (or if never) a remote record resolves.
    pub fn take_position(&self, symbol: &str) -> Option<Position> {
        let taken = self.positions.lock().expect("ledger poisoned").remove(symbol);
        if taken.is_some() {
            self.recent_closes
                .lock()
                .expect("ledger poisoned")
                .insert(symbol.to_string(), Utc::now());
        }
        taken
    }

    pub fn recently_closed_within(&self, symbol: &str, window_secs: i64) -> bool {
        let recents = self.recent_closes.lock().expect("ledger poisoned");
        match recents.get(symbol) {
            Some(stamp) => Utc::now() - *stamp < ChronoDuration::seconds(window_secs),
            None => false,
        }
    }

    /// Mark a close-order id as consumed. Returns false when it was already
    /// consumed, in which case the caller must not build a trade from it.
    pub fn consume_close_id(&self, order_id: &str) -> bool {
        self.consumed_close_ids
            .lock()
            .expect("ledger poisoned")
            .insert(order_id.to_string())
    }

    pub fn is_close_id_consumed(&self, order_id: &str) -> bool {
        self.consumed_close_ids
            .lock()
            .expect("ledger poisoned")
            .contains(order_id)
    }

    pub fn consumed_close_ids(&self) -> Vec<String> {
        self.consumed_close_ids
            .lock()
            .expect("ledger poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn append_trade(&self, trade: ClosedTrade) {
        self.history.lock().expect("ledger poisoned").push(trade);
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().expect("ledger poisoned").len()
    }

    pub fn history_snapshot(&self) -> Vec<ClosedTrade> {
        self.history.lock().expect("ledger poisoned").clone()
    }

    /// Run a closure against the mutable history. Used by the backfill sweep
    /// to repair unresolved rows in place instead of duplicating them.
    pub fn with_history_mut<R>(&self, f: impl FnOnce(&mut Vec<ClosedTrade>) -> R) -> R {
        let mut history = self.history.lock().expect("ledger poisoned");
        f(&mut history)
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::liquidation::PositionSide;
    use crate::domain::entities::trade::{ExitType, TradeFees};

    fn position(symbol: &str) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            quantity: 1.0,
            stop_loss_price: Some(95.0),
            take_profit_price: None,
            trailing_distance: None,
            trailing_activation_price: None,
            open_time: Utc::now(),
            dca_level: 0,
            total_budget_notional: 100.0,
            last_entry_price: 100.0,
            entry_order_id: Some("e-1".to_string()),
            mark_price: None,
            unrealized_pnl: None,
        }
    }

    fn trade(symbol: &str, close_id: Option<&str>) -> ClosedTrade {
        ClosedTrade {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            entry_price: 100.0,
            exit_price: 105.0,
            quantity: 1.0,
            gross_pnl: 5.0,
            fees: TradeFees { open: 0.05, close: 0.05 },
            net_pnl: 4.9,
            exit_type: ExitType::TakeProfit,
            entry_is_maker: false,
            exit_is_maker: false,
            close_order_id: close_id.map(str::to_string),
            open_time: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_symbol_lock_exclusive_and_released_on_drop() {
        let ledger = PositionLedger::new();

        let guard = ledger.try_lock_symbol("BTCUSDT");
        assert!(guard.is_some());
        assert!(ledger.try_lock_symbol("BTCUSDT").is_none());
        assert!(ledger.is_pending("BTCUSDT"));

        // Another symbol is unaffected.
        assert!(ledger.try_lock_symbol("ETHUSDT").is_some());

        drop(guard);
        assert!(!ledger.is_pending("BTCUSDT"));
        assert!(ledger.try_lock_symbol("BTCUSDT").is_some());
    }

    #[test]
    fn test_at_most_one_position_per_symbol() {
        let ledger = PositionLedger::new();
        ledger.insert(position("BTCUSDT"));
        ledger.insert(position("BTCUSDT"));
        assert_eq!(ledger.open_count(), 1);
    }

    #[test]
    fn test_take_position_stamps_dedup_window() {
        let ledger = PositionLedger::new();
        ledger.insert(position("BTCUSDT"));

        let taken = ledger.take_position("BTCUSDT");
        assert!(taken.is_some());
        assert_eq!(ledger.open_count(), 0);
        assert!(ledger.recently_closed_within("BTCUSDT", 10));
        assert!(!ledger.recently_closed_within("ETHUSDT", 10));

        // A second take is a no-op.
        assert!(ledger.take_position("BTCUSDT").is_none());
    }

    #[test]
    fn test_close_id_consumed_at_most_once() {
        let ledger = PositionLedger::new();
        assert!(ledger.consume_close_id("c-1"));
        assert!(!ledger.consume_close_id("c-1"));
        assert!(ledger.is_close_id_consumed("c-1"));
        assert!(!ledger.is_close_id_consumed("c-2"));
    }

    #[test]
    fn test_update_and_history() {
        let ledger = PositionLedger::new();
        ledger.insert(position("BTCUSDT"));

        assert!(ledger.update("BTCUSDT", |p| p.dca_level = 2));
        assert_eq!(ledger.get("BTCUSDT").unwrap().dca_level, 2);
        assert!(!ledger.update("ETHUSDT", |p| p.dca_level = 1));

        ledger.append_trade(trade("BTCUSDT", Some("c-1")));
        assert_eq!(ledger.history_len(), 1);
    }

    #[test]
    fn test_restore_round_trip() {
        let ledger = PositionLedger::new();
        ledger.restore(
            vec![position("BTCUSDT"), position("ETHUSDT")],
            vec![trade("SOLUSDT", Some("c-9"))],
            vec!["c-9".to_string()],
        );

        assert_eq!(ledger.open_count(), 2);
        assert_eq!(ledger.history_len(), 1);
        assert!(ledger.is_close_id_consumed("c-9"));
    }
}
