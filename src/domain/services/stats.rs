//! Aggregate trading statistics for the read-only surface.

use std::sync::Mutex;
use std::time::Duration;

use crate::domain::errors::ExecutionOutcome;
use crate::domain::services::ledger::PositionLedger;

#[derive(Debug, Default)]
struct DecisionCounters {
    events: u64,
    filled: u64,
    skipped: u64,
    failed: u64,
    errors: u64,
    latency_total_us: u128,
    latency_max_us: u128,
}

/// Rolling decision counters, fed by the execution engine.
pub struct TradingStats {
    counters: Mutex<DecisionCounters>,
}

impl TradingStats {
    pub fn new() -> Self {
        TradingStats { counters: Mutex::new(DecisionCounters::default()) }
    }

    pub fn record_decision(&self, latency: Duration, outcome: &ExecutionOutcome) {
        let mut counters = self.counters.lock().expect("stats poisoned");
        counters.events += 1;
        match outcome {
            ExecutionOutcome::Filled(_) => counters.filled += 1,
            ExecutionOutcome::Skipped(_) => counters.skipped += 1,
            ExecutionOutcome::Failed(_) => counters.failed += 1,
            ExecutionOutcome::Error(_) => counters.errors += 1,
        }
        let micros = latency.as_micros();
        counters.latency_total_us += micros;
        counters.latency_max_us = counters.latency_max_us.max(micros);
    }

    /// Point-in-time aggregate over the counters and the ledger's history.
    pub fn snapshot(&self, ledger: &PositionLedger) -> StatsSnapshot {
        let counters = self.counters.lock().expect("stats poisoned");
        let history = ledger.history_snapshot();

        let trades = history.len();
        let wins = history.iter().filter(|t| t.net_pnl > 0.0).count();
        let gross_pnl: f64 = history.iter().map(|t| t.gross_pnl).sum();
        let net_pnl: f64 = history.iter().map(|t| t.net_pnl).sum();
        let fees_total: f64 = history.iter().map(|t| t.fees.total()).sum();

        StatsSnapshot {
            open_positions: ledger.open_count(),
            pending_locks: ledger.pending_count(),
            closed_trades: trades,
            win_rate: if trades > 0 { wins as f64 / trades as f64 } else { 0.0 },
            gross_pnl,
            net_pnl,
            fees_total,
            events_seen: counters.events,
            entries_filled: counters.filled,
            events_skipped: counters.skipped,
            entries_failed: counters.failed,
            engine_errors: counters.errors,
            avg_decision_us: if counters.events > 0 {
                (counters.latency_total_us / counters.events as u128) as u64
            } else {
                0
            },
            max_decision_us: counters.latency_max_us as u64,
        }
    }
}

impl Default for TradingStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub open_positions: usize,
    pub pending_locks: usize,
    pub closed_trades: usize,
    pub win_rate: f64,
    pub gross_pnl: f64,
    pub net_pnl: f64,
    pub fees_total: f64,
    pub events_seen: u64,
    pub entries_filled: u64,
    pub events_skipped: u64,
    pub entries_failed: u64,
    pub engine_errors: u64,
    pub avg_decision_us: u64,
    pub max_decision_us: u64,
}
