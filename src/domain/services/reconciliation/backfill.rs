//! Backfill sweep
//!
//! Periodic pass over the venue's recent closed-PnL history, independent of
//! the live diff. Consumed ids are skipped, unresolved rows are repaired in
//! place with the authoritative settlement, and closures the engine never saw
//! (downtime, missed ticks) are appended.

use tracing::{debug, info};

use crate::domain::entities::trade::{ClosedTrade, ExitType, TradeFees};
use crate::domain::errors::VenueError;
use crate::domain::repositories::venue_client::ClosedPnlRecord;
use crate::domain::services::reconciliation::matching::within_pct;
use crate::domain::services::reconciliation::ReconciliationEngine;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub examined: usize,
    pub skipped_consumed: usize,
    pub skipped_represented: usize,
    pub repaired: usize,
    pub appended: usize,
}

impl ReconciliationEngine {
    pub async fn backfill_sweep(&self) -> Result<SweepReport, VenueError> {
        let mut records = self
            .venue
            .list_closed_pnl(None, self.cfg.closed_pnl_limit)
            .await?;
        // Oldest first so appended history stays chronological.
        records.sort_by(|a, b| a.created_time.cmp(&b.created_time));

        let mut report = SweepReport::default();
        for record in &records {
            report.examined += 1;

            if self.ledger.is_close_id_consumed(&record.order_id) {
                report.skipped_consumed += 1;
                continue;
            }

            if self.try_repair_unresolved(record) {
                self.ledger.consume_close_id(&record.order_id);
                report.repaired += 1;
                continue;
            }

            if self.is_represented(record) {
                report.skipped_represented += 1;
                continue;
            }

            self.ledger.consume_close_id(&record.order_id);
            let trade = self.build_backfilled_trade(record).await;
            info!(symbol = %record.symbol, order_id = %record.order_id, "backfilled missed closure");
            self.ledger.append_trade(trade);
            report.appended += 1;
        }

        debug!(?report, "backfill sweep complete");
        Ok(report)
    }

    /// Repair an earlier row that closed without a settled match: same
    /// symbol, quantity in DCA tolerance, close time within the bucket. The
    /// venue's PnL replaces the local estimate; the old estimate is logged as
    /// a diagnostic, never used to adjust anything else.
    fn try_repair_unresolved(&self, record: &ClosedPnlRecord) -> bool {
        let bucket = self.cfg.backfill_bucket_secs;
        self.ledger.with_history_mut(|history| {
            let candidate = history.iter_mut().find(|trade| {
                trade.is_unsettled()
                    && trade.symbol == record.symbol
                    && within_pct(record.qty, trade.quantity, 0.20)
                    && (trade.closed_at - record.created_time).num_seconds().abs() <= bucket
            });

            match candidate {
                Some(trade) => {
                    let old_estimate = trade.net_pnl;
                    let disagreement = (old_estimate - record.closed_pnl).abs();
                    if disagreement > record.closed_pnl.abs().max(1.0) * 0.05 {
                        info!(
                            symbol = %record.symbol,
                            venue_pnl = record.closed_pnl,
                            local_estimate = old_estimate,
                            "repairing unresolved trade; local estimate disagreed"
                        );
                    }

                    trade.entry_price = record.avg_entry_price;
                    trade.exit_price = record.avg_exit_price;
                    trade.quantity = record.qty;
                    trade.gross_pnl = match trade.side {
                        crate::domain::entities::liquidation::PositionSide::Long => {
                            (record.avg_exit_price - record.avg_entry_price) * record.qty
                        }
                        crate::domain::entities::liquidation::PositionSide::Short => {
                            (record.avg_entry_price - record.avg_exit_price) * record.qty
                        }
                    };
                    trade.net_pnl = record.closed_pnl;
                    trade.close_order_id = Some(record.order_id.clone());
                    trade.closed_at = record.created_time;
                    if trade.exit_type == ExitType::Unresolved {
                        trade.exit_type = ExitType::Manual;
                    }
                    true
                }
                None => false,
            }
        })
    }

    /// Already represented: a settled history row for the same symbol close
    /// in time. Its id may differ (partial closes), so it is neither consumed
    /// nor appended.
    fn is_represented(&self, record: &ClosedPnlRecord) -> bool {
        let bucket = self.cfg.backfill_bucket_secs;
        self.ledger.history_snapshot().iter().any(|trade| {
            trade.symbol == record.symbol
                && !trade.is_unsettled()
                && (trade.closed_at - record.created_time).num_seconds().abs() <= bucket
        })
    }

    async fn build_backfilled_trade(&self, record: &ClosedPnlRecord) -> ClosedTrade {
        let (close_fee, exit_is_maker) = match self
            .venue
            .list_executions(&record.symbol, &record.order_id)
            .await
        {
            Ok(execs) if !execs.is_empty() => {
                let fee = execs.iter().map(|e| e.fee).sum();
                (fee, execs.iter().all(|e| e.is_maker))
            }
            _ => (0.0, false),
        };

        let gross_pnl = match record.side {
            crate::domain::entities::liquidation::PositionSide::Long => {
                (record.avg_exit_price - record.avg_entry_price) * record.qty
            }
            crate::domain::entities::liquidation::PositionSide::Short => {
                (record.avg_entry_price - record.avg_exit_price) * record.qty
            }
        };

        ClosedTrade {
            symbol: record.symbol.clone(),
            side: record.side,
            entry_price: record.avg_entry_price,
            exit_price: record.avg_exit_price,
            quantity: record.qty,
            gross_pnl,
            fees: TradeFees { open: 0.0, close: close_fee },
            net_pnl: record.closed_pnl,
            exit_type: ExitType::Manual,
            entry_is_maker: false,
            exit_is_maker,
            // The originating entry is unknown for a backfilled closure.
            close_order_id: Some(record.order_id.clone()),
            open_time: record.created_time,
            closed_at: record.created_time,
        }
    }
}

// Sweep behavior against a scripted venue is covered by the reconciliation
// integration suite.
