//! Reconciliation Engine
//!
//! Periodically diffs the ledger against a fresh remote open-position
//! snapshot: adopts untracked positions, detects closes and settles their
//! PnL through tiered matching, and self-heals protective orders the venue
//! side silently lost. A slower, independent sweep backfills closures missed
//! entirely (see `backfill`).

pub mod backfill;
pub mod matching;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::position::Position;
use crate::domain::entities::trade::{ClosedTrade, ExitType, TradeFees};
use crate::domain::errors::VenueError;
use crate::domain::repositories::venue_client::{ClosedPnlRecord, RemotePosition, VenueClient};
use crate::domain::services::ledger::PositionLedger;
use crate::domain::services::protection::ProtectionManager;
use self::matching::{find_match, RetryPolicy};

/// What one live-diff tick did, for logging and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub remote_open: usize,
    pub adopted: usize,
    pub closes_detected: usize,
    pub heals_started: usize,
    pub emergency_protected: usize,
}

pub struct ReconciliationEngine {
    cfg: EngineConfig,
    ledger: Arc<PositionLedger>,
    venue: Arc<dyn VenueClient>,
    protection: Arc<ProtectionManager>,
}

impl ReconciliationEngine {
    pub fn new(
        cfg: EngineConfig,
        ledger: Arc<PositionLedger>,
        venue: Arc<dyn VenueClient>,
        protection: Arc<ProtectionManager>,
    ) -> Self {
        ReconciliationEngine { cfg, ledger, venue, protection }
    }

    /// One live-diff pass. Transient snapshot failures propagate so the
    /// circuit-breaker loop can count them; everything downstream is handled
    /// locally.
    pub async fn tick(self: Arc<Self>) -> Result<TickReport, VenueError> {
        let remote = self.venue.list_open_positions().await?;
        let mut report = TickReport { remote_open: remote.len(), ..Default::default() };

        for position in &remote {
            if self.ledger.contains(&position.symbol) {
                self.refresh_and_heal(position, &mut report).await;
            } else if !self.ledger.is_pending(&position.symbol) {
                // Not tracked and not mid-open by the execution engine.
                self.adopt_untracked(position, &mut report).await;
            }
        }

        let remote_symbols: std::collections::HashSet<&str> =
            remote.iter().map(|p| p.symbol.as_str()).collect();

        for symbol in self.ledger.open_symbols() {
            if remote_symbols.contains(symbol.as_str()) {
                continue;
            }
            if self.ledger.is_pending(&symbol) {
                continue;
            }
            let position = match self.ledger.get(&symbol) {
                Some(position) => position,
                None => continue,
            };
            // Grace window: a just-confirmed fill may not have propagated to
            // the position snapshot yet.
            if Utc::now() - position.open_time
                < ChronoDuration::seconds(self.cfg.open_grace_secs)
            {
                continue;
            }
            if self.ledger.recently_closed_within(&symbol, self.cfg.close_dedup_secs) {
                continue;
            }
            let taken = match self.ledger.take_position(&symbol) {
                Some(position) => position,
                None => continue,
            };
            report.closes_detected += 1;
            info!(symbol = %symbol, "remote close detected; settling PnL");

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.settle_close(taken).await;
            });
        }

        debug!(?report, "reconcile tick complete");
        Ok(report)
    }

    /// Symbols present on both sides: refresh marks, re-arm lost protection.
    async fn refresh_and_heal(&self, remote: &RemotePosition, report: &mut TickReport) {
        let symbol = remote.symbol.as_str();
        self.ledger.update(symbol, |p| {
            p.mark_price = Some(remote.mark_price);
            p.unrealized_pnl = Some(remote.unrealized_pnl);
        });

        let position = match self.ledger.get(symbol) {
            Some(position) => position,
            None => return,
        };

        if position.is_naked() && remote.is_naked() {
            // Nothing to re-submit from: compute fresh protection now. This is
            // the restart path where a persisted entry never got its stops.
            warn!(symbol, "naked position detected; attaching protection");
            report.emergency_protected += 1;
            if let Some(levels) = self
                .protection
                .ensure(symbol, position.side, position.entry_price, position.quantity)
                .await
            {
                self.ledger.update(symbol, |p| {
                    p.stop_loss_price = levels.stop_loss.or(p.stop_loss_price);
                    p.take_profit_price = levels.take_profit.or(p.take_profit_price);
                    p.trailing_distance = levels.trailing_distance.or(p.trailing_distance);
                    p.trailing_activation_price =
                        levels.trailing_activation.or(p.trailing_activation_price);
                });
            }
            return;
        }

        let lost_stop = position.stop_loss_price.is_some() && remote.stop_loss.is_none();
        let lost_trailing = position.trailing_distance.is_some() && remote.trailing_stop.is_none();
        if lost_stop || lost_trailing {
            warn!(symbol, lost_stop, lost_trailing, "protective order missing on venue; re-submitting");
            report.heals_started += 1;
            let protection = Arc::clone(&self.protection);
            tokio::spawn(async move {
                let (stop_ok, trailing_ok) = protection.reattach(&position).await;
                debug!(symbol = %position.symbol, stop_ok, trailing_ok, "protection re-submit finished");
            });
        }
    }

    /// Remote-only symbol: adopt it, and treat a naked remote as an emergency.
    ///
    /// A symbol reappearing here right after its own close decision is taken
    /// as a genuinely new remote position, not an error.
    async fn adopt_untracked(&self, remote: &RemotePosition, report: &mut TickReport) {
        let symbol = remote.symbol.as_str();
        if self.ledger.recently_closed_within(symbol, self.cfg.close_dedup_secs) {
            info!(symbol, "symbol reappeared within dedup window; adopting as fresh");
        }

        let naked = remote.is_naked();
        let mut position = Position {
            symbol: symbol.to_string(),
            side: remote.side,
            entry_price: remote.avg_price,
            quantity: remote.quantity,
            stop_loss_price: remote.stop_loss,
            take_profit_price: None,
            trailing_distance: remote.trailing_stop,
            trailing_activation_price: None,
            open_time: remote.created_at.unwrap_or_else(Utc::now),
            // Treated as fully deployed: adopted positions are not pyramided.
            dca_level: self.cfg.final_dca_level(),
            total_budget_notional: remote.avg_price * remote.quantity,
            last_entry_price: remote.avg_price,
            entry_order_id: None,
            mark_price: Some(remote.mark_price),
            unrealized_pnl: Some(remote.unrealized_pnl),
        };

        info!(symbol, side = %remote.side, qty = remote.quantity, naked, "adopting untracked position");
        report.adopted += 1;

        if naked {
            report.emergency_protected += 1;
            if let Some(levels) = self
                .protection
                .ensure(symbol, remote.side, remote.avg_price, remote.quantity)
                .await
            {
                position.stop_loss_price = levels.stop_loss;
                position.take_profit_price = levels.take_profit;
                position.trailing_distance = levels.trailing_distance;
                position.trailing_activation_price = levels.trailing_activation;
            } else {
                warn!(symbol, "emergency protection attach failed; will retry next tick");
            }
        }

        self.ledger.insert(position);
    }

    // ---- settlement -------------------------------------------------------

    /// Associate a disappeared position with a closed-PnL record and append
    /// the resulting trade. Retries on a fixed schedule; the trailing
    /// attempts relax the time-ordering filter. When every attempt comes up
    /// empty the trade is recorded unresolved and left to the backfill sweep.
    pub async fn settle_close(&self, position: Position) {
        let symbol = position.symbol.clone();
        let policy = RetryPolicy::from_config(&self.cfg);

        for attempt in 0..policy.attempts {
            // Settlement lags position disappearance; wait before every look.
            sleep(policy.delay).await;

            let records = match self
                .venue
                .list_closed_pnl(Some(&symbol), self.cfg.closed_pnl_limit)
                .await
            {
                Ok(records) => records,
                Err(e) => {
                    debug!(symbol = %symbol, attempt, error = %e, "closed-pnl fetch failed");
                    continue;
                }
            };

            let mut candidates: Vec<&ClosedPnlRecord> = records
                .iter()
                .filter(|r| !self.ledger.is_close_id_consumed(&r.order_id))
                .filter(|r| policy.is_relaxed(attempt) || r.created_time >= position.open_time)
                .collect();
            candidates.sort_by(|a, b| b.created_time.cmp(&a.created_time));

            if let Some((tier, record)) = find_match(&position, &candidates) {
                if !self.ledger.consume_close_id(&record.order_id) {
                    // Raced with the backfill sweep; look again.
                    continue;
                }
                info!(symbol = %symbol, tier, order_id = %record.order_id, "settlement matched");
                let trade = self.build_settled_trade(&position, record).await;
                self.ledger.append_trade(trade);
                return;
            }

            debug!(symbol = %symbol, attempt, "no settlement match yet");
        }

        warn!(symbol = %symbol, "settlement unmatched after retries; recording unresolved");
        self.ledger.append_trade(build_unresolved_trade(&position, self.cfg.fee_rate));
    }

    /// Fees and maker flags for one order leg; lookup failures degrade to
    /// zero-fee taker rather than blocking settlement.
    async fn leg_attribution(&self, symbol: &str, order_id: &str) -> (f64, bool) {
        match self.venue.list_executions(symbol, order_id).await {
            Ok(execs) if !execs.is_empty() => {
                let fee = execs.iter().map(|e| e.fee).sum();
                let is_maker = execs.iter().all(|e| e.is_maker);
                (fee, is_maker)
            }
            Ok(_) => (0.0, false),
            Err(e) => {
                debug!(symbol, order_id, error = %e, "execution lookup failed");
                (0.0, false)
            }
        }
    }

    async fn build_settled_trade(
        &self,
        position: &Position,
        record: &ClosedPnlRecord,
    ) -> ClosedTrade {
        let symbol = position.symbol.as_str();

        let (open_fee, entry_is_maker) = match &position.entry_order_id {
            Some(order_id) => self.leg_attribution(symbol, order_id).await,
            None => (0.0, false),
        };
        let (close_fee, exit_is_maker) = self.leg_attribution(symbol, &record.order_id).await;
        let fees = TradeFees { open: open_fee, close: close_fee };

        let gross_pnl = directional_pnl(
            position,
            record.avg_entry_price,
            record.avg_exit_price,
            record.qty,
        );

        // The venue's number is authoritative. The local estimate is only a
        // diagnostic here; material disagreement is logged, never applied.
        let local_estimate = gross_pnl - fees.total();
        let disagreement = (local_estimate - record.closed_pnl).abs();
        if disagreement > record.closed_pnl.abs().max(1.0) * 0.05 {
            info!(
                symbol,
                venue_pnl = record.closed_pnl,
                local_estimate,
                "local PnL estimate disagrees with settled record"
            );
        }

        ClosedTrade {
            symbol: symbol.to_string(),
            side: position.side,
            entry_price: record.avg_entry_price,
            exit_price: record.avg_exit_price,
            quantity: record.qty,
            gross_pnl,
            fees,
            net_pnl: record.closed_pnl,
            exit_type: ExitType::classify(position, record.avg_exit_price),
            entry_is_maker,
            exit_is_maker,
            close_order_id: Some(record.order_id.clone()),
            open_time: position.open_time,
            closed_at: record.created_time,
        }
    }
}

fn directional_pnl(position: &Position, entry: f64, exit: f64, qty: f64) -> f64 {
    match position.side {
        crate::domain::entities::liquidation::PositionSide::Long => (exit - entry) * qty,
        crate::domain::entities::liquidation::PositionSide::Short => (entry - exit) * qty,
    }
}

/// Local fallback when no settlement record was ever matched: estimated from
/// the last observed mark and configured fee rate, flagged unresolved so the
/// backfill sweep can repair it in place.
fn build_unresolved_trade(position: &Position, fee_rate: f64) -> ClosedTrade {
    let exit_price = position.mark_price.unwrap_or(position.entry_price);
    let gross_pnl = directional_pnl(position, position.entry_price, exit_price, position.quantity);
    let fees = TradeFees {
        open: position.entry_price * position.quantity * fee_rate,
        close: exit_price * position.quantity * fee_rate,
    };

    ClosedTrade {
        symbol: position.symbol.clone(),
        side: position.side,
        entry_price: position.entry_price,
        exit_price,
        quantity: position.quantity,
        gross_pnl,
        fees,
        net_pnl: gross_pnl - fees.total(),
        exit_type: ExitType::Unresolved,
        entry_is_maker: false,
        exit_is_maker: false,
        close_order_id: None,
        open_time: position.open_time,
        closed_at: Utc::now(),
    }
}
