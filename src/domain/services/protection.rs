//! Protection Manager
//!
//! Computes and attaches protective exits: stop-loss, trailing stop, and
//! take-profit. Used at entry, after DCA fills, and by the reconciliation
//! health check when the venue side loses a protective order.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::domain::entities::liquidation::PositionSide;
use crate::domain::entities::position::Position;
use crate::domain::repositories::indicator_provider::IndicatorProvider;
use crate::domain::repositories::instrument_registry::InstrumentRegistry;
use crate::domain::repositories::venue_client::{ProtectionRequest, VenueClient};
use crate::domain::services::ledger::PositionLedger;

/// Levels confirmed set on the venue. Fields the venue rejected (or that were
/// never applicable) stay `None`; the health check retries them later.
#[derive(Debug, Clone, Default)]
pub struct ProtectionLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing_distance: Option<f64>,
    pub trailing_activation: Option<f64>,
}

impl ProtectionLevels {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none()
            && self.take_profit.is_none()
            && self.trailing_distance.is_none()
    }
}

pub struct ProtectionManager {
    cfg: EngineConfig,
    venue: Arc<dyn VenueClient>,
    indicators: Arc<dyn IndicatorProvider>,
    instruments: Arc<dyn InstrumentRegistry>,
    ledger: Arc<PositionLedger>,
}

impl ProtectionManager {
    pub fn new(
        cfg: EngineConfig,
        venue: Arc<dyn VenueClient>,
        indicators: Arc<dyn IndicatorProvider>,
        instruments: Arc<dyn InstrumentRegistry>,
        ledger: Arc<PositionLedger>,
    ) -> Self {
        ProtectionManager { cfg, venue, indicators, instruments, ledger }
    }

    /// Shared-risk stop distance in price units: the configured risk budget
    /// split across open positions, expressed per unit of quantity.
    pub fn risk_stop_distance(&self, balance: f64, quantity: f64, open_positions: usize) -> f64 {
        let share = balance * self.cfg.risk_budget_pct / open_positions.max(1) as f64;
        if quantity <= 0.0 {
            return 0.0;
        }
        share / quantity
    }

    /// Clamp a stop distance to [1 tick, 90% of the reference price].
    pub fn clamp_stop_distance(&self, distance: f64, tick: f64, reference_price: f64) -> f64 {
        let ceiling = reference_price * 0.9;
        distance.clamp(tick.min(ceiling), ceiling)
    }

    async fn tick_for(&self, symbol: &str, entry_price: f64) -> f64 {
        self.instruments
            .tick_size(symbol)
            .await
            .unwrap_or(entry_price * 1e-6)
    }

    /// Stop distance for a position: ATR-based when the indicator answers,
    /// otherwise the shared risk budget, always clamped.
    async fn stop_distance(
        &self,
        symbol: &str,
        entry_price: f64,
        quantity: f64,
        atr: Option<f64>,
        tick: f64,
    ) -> Option<f64> {
        let raw = match atr {
            Some(value) => value * self.cfg.atr_stop_mult,
            None => {
                let balance = match self.venue.wallet_balance().await {
                    Ok(balance) => balance,
                    Err(e) => {
                        warn!(symbol, error = %e, "no ATR and no balance; stop deferred to healing");
                        return None;
                    }
                };
                self.risk_stop_distance(balance, quantity, self.ledger.open_count())
            }
        };
        Some(self.clamp_stop_distance(raw, tick, entry_price))
    }

    fn offset(side: PositionSide, base: f64, distance: f64) -> f64 {
        match side {
            PositionSide::Long => base - distance,
            PositionSide::Short => base + distance,
        }
    }

    fn profit_offset(side: PositionSide, base: f64, distance: f64) -> f64 {
        match side {
            PositionSide::Long => base + distance,
            PositionSide::Short => base - distance,
        }
    }

    /// Activation buffer sized so a stop-out right after activation still
    /// nets break-even once estimated round-trip fees are paid.
    fn fee_buffer(&self, entry_price: f64) -> f64 {
        entry_price * self.cfg.fee_rate * 2.0
    }

    /// Compute and attach protection for a position at `entry_price`.
    ///
    /// Two venue calls: stop-loss/take-profit first, trailing second. Each is
    /// independently fallible and non-fatal; the returned levels reflect only
    /// what the venue confirmed. `None` when nothing could be attached.
    pub async fn ensure(
        &self,
        symbol: &str,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
    ) -> Option<ProtectionLevels> {
        let atr = self.indicators.atr(symbol).await;
        let tick = self.tick_for(symbol, entry_price).await;

        let stop_price = match self.stop_distance(symbol, entry_price, quantity, atr, tick).await {
            Some(distance) => Some(
                self.instruments
                    .round_price(symbol, Self::offset(side, entry_price, distance))
                    .await,
            ),
            None => None,
        };

        // Trailing is indicator-only; with trailing armed there is no fixed
        // take-profit, and vice versa.
        let trailing = if self.cfg.trailing_enabled {
            atr.map(|value| {
                let distance = (value * self.cfg.atr_trail_mult).max(tick);
                let activation = Self::profit_offset(
                    side,
                    entry_price,
                    distance + self.fee_buffer(entry_price),
                );
                (distance, activation)
            })
        } else {
            None
        };

        let take_profit = if trailing.is_none() {
            let raw = match atr {
                Some(value) => value * self.cfg.atr_tp_mult,
                None => entry_price * self.cfg.fallback_tp_pct,
            };
            let distance = raw.max(entry_price * self.cfg.min_profit_pct);
            Some(
                self.instruments
                    .round_price(symbol, Self::profit_offset(side, entry_price, distance))
                    .await,
            )
        } else {
            None
        };

        let mut confirmed = ProtectionLevels::default();

        if stop_price.is_some() || take_profit.is_some() {
            let request = ProtectionRequest {
                stop_loss: stop_price,
                take_profit,
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => {
                    confirmed.stop_loss = stop_price;
                    confirmed.take_profit = take_profit;
                }
                Err(e) => warn!(symbol, error = %e, "stop-loss/take-profit attach failed"),
            }
        }

        if let Some((distance, activation)) = trailing {
            let activation = self.instruments.round_price(symbol, activation).await;
            let request = ProtectionRequest {
                trailing_stop: Some(distance),
                active_price: Some(activation),
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => {
                    confirmed.trailing_distance = Some(distance);
                    confirmed.trailing_activation = Some(activation);
                }
                Err(e) => warn!(symbol, error = %e, "trailing attach failed"),
            }
        }

        if confirmed.is_empty() {
            None
        } else {
            debug!(symbol, ?confirmed, "protection attached");
            Some(confirmed)
        }
    }

    /// Recompute the stop (and trailing activation, when armed) from a new
    /// blended entry after a DCA fill. The take-profit is left untouched.
    pub async fn refresh_after_fill(
        &self,
        symbol: &str,
        side: PositionSide,
        blended_entry: f64,
        quantity: f64,
        trailing_distance: Option<f64>,
    ) -> ProtectionLevels {
        let atr = self.indicators.atr(symbol).await;
        let tick = self.tick_for(symbol, blended_entry).await;
        let mut confirmed = ProtectionLevels::default();

        if let Some(distance) =
            self.stop_distance(symbol, blended_entry, quantity, atr, tick).await
        {
            let stop_price = self
                .instruments
                .round_price(symbol, Self::offset(side, blended_entry, distance))
                .await;
            let request = ProtectionRequest {
                stop_loss: Some(stop_price),
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => confirmed.stop_loss = Some(stop_price),
                Err(e) => warn!(symbol, error = %e, "stop refresh failed after add"),
            }
        }

        if let Some(distance) = trailing_distance {
            let activation = self.instruments.round_price(
                symbol,
                Self::profit_offset(side, blended_entry, distance + self.fee_buffer(blended_entry)),
            )
            .await;
            let request = ProtectionRequest {
                trailing_stop: Some(distance),
                active_price: Some(activation),
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => {
                    confirmed.trailing_distance = Some(distance);
                    confirmed.trailing_activation = Some(activation);
                }
                Err(e) => warn!(symbol, error = %e, "trailing refresh failed after add"),
            }
        }

        confirmed
    }

    /// Re-submit protective orders the venue side lost, from the values the
    /// ledger still expects. Stop first, trailing second; independent calls.
    pub async fn reattach(&self, position: &Position) -> (bool, bool) {
        let symbol = position.symbol.as_str();
        let mut stop_ok = false;
        let mut trailing_ok = false;

        if let Some(stop) = position.stop_loss_price {
            let request = ProtectionRequest {
                stop_loss: Some(stop),
                take_profit: position.take_profit_price,
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => stop_ok = true,
                Err(e) => warn!(symbol, error = %e, "stop re-submit failed"),
            }
        }

        if let Some(distance) = position.trailing_distance {
            let request = ProtectionRequest {
                trailing_stop: Some(distance),
                active_price: position.trailing_activation_price,
                ..ProtectionRequest::default()
            };
            match self.venue.set_trading_stop(symbol, &request).await {
                Ok(()) => trailing_ok = true,
                Err(e) => warn!(symbol, error = %e, "trailing re-submit failed"),
            }
        }

        (stop_ok, trailing_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Distance math is exercised here; the venue round trips are covered by
    // the integration suites with mock collaborators.

    fn manager() -> ProtectionManager {
        use crate::domain::repositories::venue_client::tests_support::NullVenue;
        ProtectionManager::new(
            EngineConfig::default(),
            Arc::new(NullVenue),
            Arc::new(crate::domain::repositories::indicator_provider::tests_support::NoIndicators),
            Arc::new(
                crate::domain::repositories::instrument_registry::tests_support::IdentityRegistry,
            ),
            Arc::new(PositionLedger::new()),
        )
    }

    #[test]
    fn test_risk_stop_distance_splits_budget() {
        let m = manager();
        // 2% of 10_000 = 200 risk budget; over 2 positions = 100; qty 4 -> 25.
        let distance = m.risk_stop_distance(10_000.0, 4.0, 2);
        assert!((distance - 25.0).abs() < 1e-9);
        // Zero open positions counts as one.
        assert!((m.risk_stop_distance(10_000.0, 4.0, 0) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_clamp_stop_distance_bounds() {
        let m = manager();
        assert_eq!(m.clamp_stop_distance(1000.0, 0.5, 100.0), 90.0);
        assert_eq!(m.clamp_stop_distance(0.0001, 0.5, 100.0), 0.5);
        let inside = m.clamp_stop_distance(5.0, 0.5, 100.0);
        assert_eq!(inside, 5.0);
    }

    #[test]
    fn test_offsets_side_dependent() {
        assert_eq!(ProtectionManager::offset(PositionSide::Long, 100.0, 5.0), 95.0);
        assert_eq!(ProtectionManager::offset(PositionSide::Short, 100.0, 5.0), 105.0);
        assert_eq!(ProtectionManager::profit_offset(PositionSide::Long, 100.0, 5.0), 105.0);
        assert_eq!(ProtectionManager::profit_offset(PositionSide::Short, 100.0, 5.0), 95.0);
    }

    #[test]
    fn test_fee_buffer_covers_round_trip() {
        let m = manager();
        let buffer = m.fee_buffer(100.0);
        // Worst-case stop-out right after activation exits at entry + buffer,
        // which must cover both legs of fees.
        assert!(buffer >= 100.0 * m.cfg.fee_rate * 2.0);
    }
}
