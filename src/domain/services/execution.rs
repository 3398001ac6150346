//! Execution Engine
//!
//! Consumes qualifying liquidation events and decides skip / fresh entry /
//! DCA add. Sizing, order submission (low-latency channel with standard
//! fallback, optional passive entry), fill confirmation, protection
//! attachment, and ledger updates all happen inside one invocation, under the
//! per-symbol pending lock.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::entities::liquidation::{LiquidationEvent, PositionSide};
use crate::domain::entities::order::{OrderChannel, OrderRequest, OrderSide, OrderStatus};
use crate::domain::entities::position::Position;
use crate::domain::errors::{ExecutionOutcome, SkipReason, VenueError};
use crate::domain::repositories::indicator_provider::{IndicatorProvider, VwapBand};
use crate::domain::repositories::instrument_registry::InstrumentRegistry;
use crate::domain::repositories::venue_client::{Quote, VenueClient, VenueResult};
use crate::domain::services::ledger::PositionLedger;
use crate::domain::services::protection::ProtectionManager;
use crate::domain::services::stats::TradingStats;

const READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(250);
const FILL_POLL_ATTEMPTS: u32 = 5;
const FILL_POLL_DELAY: Duration = Duration::from_millis(200);

/// Captured result of a best-effort side effect (leverage, one-way mode).
#[derive(Debug, Clone)]
struct ModeSetup {
    attempted: bool,
    succeeded: bool,
    error: Option<String>,
}

pub struct ExecutionEngine {
    cfg: EngineConfig,
    ledger: Arc<PositionLedger>,
    venue: Arc<dyn VenueClient>,
    indicators: Arc<dyn IndicatorProvider>,
    instruments: Arc<dyn InstrumentRegistry>,
    protection: Arc<ProtectionManager>,
    stats: Arc<TradingStats>,
    /// Symbols whose leverage/one-way mode has been set this process.
    modes_set: Arc<Mutex<HashSet<String>>>,
    balance_cache: Mutex<Option<(f64, Instant)>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        ledger: Arc<PositionLedger>,
        venue: Arc<dyn VenueClient>,
        indicators: Arc<dyn IndicatorProvider>,
        instruments: Arc<dyn InstrumentRegistry>,
        protection: Arc<ProtectionManager>,
        stats: Arc<TradingStats>,
    ) -> Self {
        ExecutionEngine {
            cfg,
            ledger,
            venue,
            indicators,
            instruments,
            protection,
            stats,
            modes_set: Arc::new(Mutex::new(HashSet::new())),
            balance_cache: Mutex::new(None),
        }
    }

    /// Entry point for one liquidation event. Never fails outward: every
    /// failure mode is folded into the returned outcome.
    pub async fn on_liquidation(&self, event: &LiquidationEvent) -> ExecutionOutcome {
        let started = Instant::now();
        let outcome = self.decide(event).await;
        self.stats.record_decision(started.elapsed(), &outcome);

        match &outcome {
            ExecutionOutcome::Filled(position) => info!(
                symbol = %event.symbol,
                side = %position.side,
                entry = position.entry_price,
                qty = position.quantity,
                dca_level = position.dca_level,
                "position filled"
            ),
            ExecutionOutcome::Skipped(reason) => {
                debug!(symbol = %event.symbol, %reason, "event skipped")
            }
            ExecutionOutcome::Failed(reason) => {
                warn!(symbol = %event.symbol, %reason, "entry failed")
            }
            ExecutionOutcome::Error(reason) => {
                warn!(symbol = %event.symbol, %reason, "entry errored")
            }
        }

        outcome
    }

    async fn decide(&self, event: &LiquidationEvent) -> ExecutionOutcome {
        if !event.qualifies {
            return ExecutionOutcome::Skipped(SkipReason::NotQualified);
        }

        if self.ledger.open_count() + self.ledger.pending_count() >= self.cfg.max_positions {
            return ExecutionOutcome::Skipped(SkipReason::CapacityReached);
        }

        // Synchronous acquire: no await between the check above and here, so
        // two same-tick events on one symbol cannot both proceed.
        let _lock = match self.ledger.try_lock_symbol(&event.symbol) {
            Some(lock) => lock,
            None => return ExecutionOutcome::Skipped(SkipReason::Pending),
        };

        match self.ledger.get(&event.symbol) {
            Some(position) => self.dca_add(event, position).await,
            None => self.fresh_entry(event).await,
        }
        // _lock drops here, on every path.
    }

    // ---- fresh entry ------------------------------------------------------

    async fn fresh_entry(&self, event: &LiquidationEvent) -> ExecutionOutcome {
        let symbol = event.symbol.as_str();

        if !self.instruments.is_tradable(symbol).await {
            return ExecutionOutcome::Skipped(SkipReason::Untradable);
        }

        let quote = match retry_read(READ_RETRIES, READ_RETRY_DELAY, || {
            self.venue.best_quote(symbol)
        })
        .await
        {
            Ok(quote) => quote,
            Err(e) => return ExecutionOutcome::Error(format!("quote fetch: {e}")),
        };
        if !self.spread_acceptable(&quote) {
            return ExecutionOutcome::Skipped(SkipReason::Illiquid);
        }

        let balance = match self.balance().await {
            Some(balance) => balance,
            None => return ExecutionOutcome::Skipped(SkipReason::NoBalance),
        };

        let total_budget = self.total_budget(balance);
        let entry_notional = total_budget * self.cfg.splits[0];
        let quantity = self.instruments.round_qty(symbol, entry_notional / event.price).await;
        if !self.meets_min_qty(symbol, quantity).await {
            return ExecutionOutcome::Skipped(SkipReason::BelowMinQuantity);
        }

        self.ensure_symbol_modes(symbol);

        let side = event.counter_side();
        let order_id = if self.cfg.passive_entry {
            match self.passive_entry(symbol, side, quantity, &quote).await {
                Ok(order_id) => order_id,
                Err(outcome) => return outcome,
            }
        } else {
            match self.submit_with_fallback(&OrderRequest::market(symbol, side, quantity)).await {
                Ok(order_id) => order_id,
                Err(outcome) => return outcome,
            }
        };

        // Re-read the true fill price before computing protection from it.
        let (fill_price, fill_qty) = match self.confirm_fill(symbol, &order_id).await {
            Ok(fill) => fill,
            Err(outcome) => return outcome,
        };

        let position_side = event.counter_position_side();
        let levels = self
            .protection
            .ensure(symbol, position_side, fill_price, fill_qty)
            .await;
        if levels.is_none() {
            warn!(symbol, "entered naked; health check will attach protection");
        }
        let levels = levels.unwrap_or_default();

        let position = Position {
            symbol: symbol.to_string(),
            side: position_side,
            entry_price: fill_price,
            quantity: fill_qty,
            stop_loss_price: levels.stop_loss,
            take_profit_price: levels.take_profit,
            trailing_distance: levels.trailing_distance,
            trailing_activation_price: levels.trailing_activation,
            open_time: Utc::now(),
            dca_level: 0,
            total_budget_notional: total_budget,
            last_entry_price: event.price,
            entry_order_id: Some(order_id),
            mark_price: None,
            unrealized_pnl: None,
        };

        self.ledger.insert(position.clone());
        self.retighten_all_stops().await;

        ExecutionOutcome::Filled(Box::new(position))
    }

    // ---- DCA add ----------------------------------------------------------

    async fn dca_add(&self, event: &LiquidationEvent, mut position: Position) -> ExecutionOutcome {
        let symbol = event.symbol.as_str();

        if position.dca_level >= self.cfg.final_dca_level() {
            return ExecutionOutcome::Skipped(SkipReason::MaxDcaLevel);
        }

        let band = self.indicators.vwap_band(symbol).await;
        if !improvement_passed(
            position.side,
            event.price,
            band,
            self.cfg.vwap_band_k,
            position.last_entry_price,
            self.cfg.dca_improvement_pct,
        ) {
            return ExecutionOutcome::Skipped(SkipReason::NoImprovement);
        }

        let next_level = position.dca_level + 1;
        let notional = position.total_budget_notional * self.cfg.splits[next_level];
        let quantity = self.instruments.round_qty(symbol, notional / event.price).await;
        if !self.meets_min_qty(symbol, quantity).await {
            return ExecutionOutcome::Skipped(SkipReason::BelowMinQuantity);
        }

        let side = order_side(position.side);
        let order_id = match self
            .submit_with_fallback(&OrderRequest::market(symbol, side, quantity))
            .await
        {
            Ok(order_id) => order_id,
            Err(outcome) => return outcome,
        };

        let (fill_price, fill_qty) = match self.confirm_fill(symbol, &order_id).await {
            Ok(fill) => fill,
            Err(outcome) => return outcome,
        };

        // The venue's blended average is authoritative; blend locally only
        // when the re-read fails.
        match retry_read(READ_RETRIES, READ_RETRY_DELAY, || self.venue.position_for(symbol)).await
        {
            Ok(Some(remote)) => position.apply_blended_fill(remote.avg_price, remote.quantity),
            Ok(None) | Err(_) => {
                let total_qty = position.quantity + fill_qty;
                if total_qty > 0.0 {
                    position.entry_price = (position.entry_price * position.quantity
                        + fill_price * fill_qty)
                        / total_qty;
                    position.quantity = total_qty;
                }
            }
        }

        let levels = self
            .protection
            .refresh_after_fill(
                symbol,
                position.side,
                position.entry_price,
                position.quantity,
                position.trailing_distance,
            )
            .await;
        if let Some(stop) = levels.stop_loss {
            position.stop_loss_price = Some(stop);
        }
        if let Some(activation) = levels.trailing_activation {
            position.trailing_activation_price = Some(activation);
        }

        position.dca_level = next_level;
        // The next improvement check keys off the trigger price, not the fill.
        position.last_entry_price = event.price;

        let updated = position.clone();
        self.ledger.update(symbol, move |p| *p = updated);

        ExecutionOutcome::Filled(Box::new(position))
    }

    // ---- shared-risk tightening -------------------------------------------

    /// Recompute every open position's risk-share stop after the ledger grew.
    /// Stops only ratchet tighter; an ATR stop tighter than the share stays.
    pub async fn retighten_all_stops(&self) {
        let balance = match self.balance().await {
            Some(balance) => balance,
            None => return,
        };
        let open_count = self.ledger.open_count();

        for position in self.ledger.positions_snapshot() {
            let symbol = position.symbol.as_str();
            let tick = self
                .instruments
                .tick_size(symbol)
                .await
                .unwrap_or(position.entry_price * 1e-6);
            let distance = self.protection.clamp_stop_distance(
                self.protection
                    .risk_stop_distance(balance, position.quantity, open_count),
                tick,
                position.entry_price,
            );
            let candidate = match position.side {
                PositionSide::Long => position.entry_price - distance,
                PositionSide::Short => position.entry_price + distance,
            };
            let candidate = self.instruments.round_price(symbol, candidate).await;

            let tighter = match (position.stop_loss_price, position.side) {
                (Some(current), PositionSide::Long) => candidate > current + tick / 2.0,
                (Some(current), PositionSide::Short) => candidate < current - tick / 2.0,
                (None, _) => true,
            };
            if !tighter {
                continue;
            }

            let request = crate::domain::repositories::venue_client::ProtectionRequest {
                stop_loss: Some(candidate),
                ..Default::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => {
                    self.ledger.update(symbol, |p| p.stop_loss_price = Some(candidate));
                    debug!(symbol, stop = candidate, "stop tightened for shared risk");
                }
                Err(e) => warn!(symbol, error = %e, "shared-risk stop update failed"),
            }
        }
    }

    // ---- helpers ----------------------------------------------------------

    fn spread_acceptable(&self, quote: &Quote) -> bool {
        let mid = (quote.bid + quote.ask) / 2.0;
        if mid <= 0.0 || quote.bid <= 0.0 || quote.ask <= 0.0 {
            return false;
        }
        (quote.ask - quote.bid) / mid <= self.cfg.max_spread_pct
    }

    fn total_budget(&self, balance: f64) -> f64 {
        self.cfg.position_usd.max(balance * self.cfg.min_balance_pct) * self.cfg.leverage as f64
    }

    async fn meets_min_qty(&self, symbol: &str, quantity: f64) -> bool {
        if quantity <= 0.0 {
            return false;
        }
        match self.instruments.min_qty(symbol).await {
            Some(min) => quantity >= min,
            None => true,
        }
    }

    async fn balance(&self) -> Option<f64> {
        {
            let cache = self.balance_cache.lock().expect("balance cache poisoned");
            if let Some((balance, at)) = *cache {
                if at.elapsed() < Duration::from_secs(self.cfg.balance_cache_secs) {
                    return Some(balance);
                }
            }
        }

        match retry_read(READ_RETRIES, READ_RETRY_DELAY, || self.venue.wallet_balance()).await {
            Ok(balance) => {
                let mut cache = self.balance_cache.lock().expect("balance cache poisoned");
                *cache = Some((balance, Instant::now()));
                Some(balance)
            }
            Err(e) => {
                warn!(error = %e, "wallet balance unavailable");
                None
            }
        }
    }

    /// Best-effort leverage and one-way mode, once per symbol per process.
    /// Runs detached so it never blocks the entry; failures un-cache the
    /// symbol so the next entry retries.
    fn ensure_symbol_modes(&self, symbol: &str) {
        {
            let mut set = self.modes_set.lock().expect("modes set poisoned");
            if !set.insert(symbol.to_string()) {
                return;
            }
        }

        let venue = Arc::clone(&self.venue);
        let modes_set = Arc::clone(&self.modes_set);
        let leverage = self.cfg.leverage;
        let symbol = symbol.to_string();

        tokio::spawn(async move {
            let mut setup = ModeSetup { attempted: true, succeeded: true, error: None };

            if let Err(e) = venue.set_leverage(&symbol, leverage).await {
                setup.succeeded = false;
                setup.error = Some(format!("leverage: {e}"));
            } else if let Err(e) = venue.set_one_way_mode(&symbol).await {
                setup.succeeded = false;
                setup.error = Some(format!("one-way mode: {e}"));
            }

            if setup.succeeded {
                debug!(symbol = %symbol, "symbol modes set");
            } else {
                warn!(symbol = %symbol, ?setup, "symbol mode setup failed");
                if let Ok(mut set) = modes_set.lock() {
                    set.remove(&symbol);
                }
            }
        });
    }

    async fn submit_with_fallback(
        &self,
        request: &OrderRequest,
    ) -> Result<String, ExecutionOutcome> {
        match self.venue.place_order(request, OrderChannel::LowLatency).await {
            Ok(order_id) => Ok(order_id),
            Err(first) => {
                debug!(symbol = %request.symbol, error = %first, "low-latency channel failed, falling back");
                match self.venue.place_order(request, OrderChannel::Standard).await {
                    Ok(order_id) => Ok(order_id),
                    Err(VenueError::Rejected(msg)) => {
                        Err(ExecutionOutcome::Failed(format!("order rejected: {msg}")))
                    }
                    Err(e) => Err(ExecutionOutcome::Error(format!("order submission: {e}"))),
                }
            }
        }
    }

    /// Passive entry: rest at the touch, wait out the settle window, verify,
    /// cancel on non-fill. A fill that lands during cancellation still wins:
    /// status is re-checked before giving up.
    async fn passive_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        quote: &Quote,
    ) -> Result<String, ExecutionOutcome> {
        let touch = match side {
            OrderSide::Buy => quote.bid,
            OrderSide::Sell => quote.ask,
        };
        let price = self.instruments.round_price(symbol, touch).await;
        let order_id = self
            .submit_with_fallback(&OrderRequest::limit(symbol, side, quantity, price))
            .await?;

        sleep(Duration::from_secs(self.cfg.passive_settle_secs)).await;

        if let Ok(status) = self.venue.order_status(symbol, &order_id).await {
            if status.is_filled() {
                return Ok(order_id);
            }
        }

        if let Err(e) = self.venue.cancel_order(symbol, &order_id).await {
            debug!(symbol, error = %e, "passive cancel failed; checking status");
        }
        match self.venue.order_status(symbol, &order_id).await {
            Ok(status) if status.is_filled() => Ok(order_id),
            _ => Err(ExecutionOutcome::Skipped(SkipReason::PassiveUnfilled)),
        }
    }

    /// Poll until the venue reports a terminal state. A timeout is unknown,
    /// not success: the entry is abandoned rather than double-submitted.
    async fn confirm_fill(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<(f64, f64), ExecutionOutcome> {
        for attempt in 0..FILL_POLL_ATTEMPTS {
            match self.venue.order_status(symbol, order_id).await {
                Ok(OrderStatus::Filled { avg_price, cum_qty }) => return Ok((avg_price, cum_qty)),
                Ok(OrderStatus::Rejected) => {
                    return Err(ExecutionOutcome::Failed("entry rejected".to_string()))
                }
                Ok(OrderStatus::Cancelled) => {
                    return Err(ExecutionOutcome::Failed("entry cancelled".to_string()))
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    debug!(symbol, attempt, error = %e, "fill confirmation retry")
                }
                Err(e) => return Err(ExecutionOutcome::Error(format!("fill confirmation: {e}"))),
            }
            sleep(FILL_POLL_DELAY).await;
        }
        Err(ExecutionOutcome::Failed("fill unconfirmed".to_string()))
    }
}

fn order_side(side: PositionSide) -> OrderSide {
    match side {
        PositionSide::Long => OrderSide::Buy,
        PositionSide::Short => OrderSide::Sell,
    }
}

/// DCA price-improvement gate. Preferred check: price beyond the VWAP band on
/// the side the position accumulates into. Fallback: simple improvement vs.
/// the previous trigger price.
fn improvement_passed(
    side: PositionSide,
    event_price: f64,
    band: Option<VwapBand>,
    band_k: f64,
    last_trigger_price: f64,
    fallback_pct: f64,
) -> bool {
    match band {
        Some(band) => match side {
            PositionSide::Long => event_price < band.lower(band_k),
            PositionSide::Short => event_price > band.upper(band_k),
        },
        None => match side {
            PositionSide::Long => event_price < last_trigger_price * (1.0 - fallback_pct),
            PositionSide::Short => event_price > last_trigger_price * (1.0 + fallback_pct),
        },
    }
}

async fn retry_read<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> VenueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = VenueResult<T>>,
{
    let mut wait = delay;
    let mut last = VenueError::Network("no attempts made".to_string());
    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                sleep(wait).await;
                wait *= 2;
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_band_side_dependent() {
        let band = Some(VwapBand { vwap: 100.0, stddev: 2.0 });
        // Long adds accumulate below the lower band.
        assert!(improvement_passed(PositionSide::Long, 96.0, band, 1.5, 100.0, 0.004));
        assert!(!improvement_passed(PositionSide::Long, 98.0, band, 1.5, 100.0, 0.004));
        // Short adds accumulate above the upper band.
        assert!(improvement_passed(PositionSide::Short, 104.0, band, 1.5, 100.0, 0.004));
        assert!(!improvement_passed(PositionSide::Short, 102.0, band, 1.5, 100.0, 0.004));
    }

    #[test]
    fn test_improvement_fallback_vs_last_trigger() {
        assert!(improvement_passed(PositionSide::Long, 99.0, None, 1.5, 100.0, 0.004));
        assert!(!improvement_passed(PositionSide::Long, 99.8, None, 1.5, 100.0, 0.004));
        assert!(improvement_passed(PositionSide::Short, 101.0, None, 1.5, 100.0, 0.004));
        assert!(!improvement_passed(PositionSide::Short, 100.2, None, 1.5, 100.0, 0.004));
    }

    #[test]
    fn test_order_side_for_position() {
        assert_eq!(order_side(PositionSide::Long), OrderSide::Buy);
        assert_eq!(order_side(PositionSide::Short), OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_retry_read_recovers_from_transient() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = retry_read(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(VenueError::Timeout("first".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_read_gives_up_on_rejection() {
        let result: VenueResult<i32> = retry_read(3, Duration::from_millis(1), || async {
            Err(VenueError::Rejected("no".to_string()))
        })
        .await;
        assert!(matches!(result, Err(VenueError::Rejected(_))));
    }
}
