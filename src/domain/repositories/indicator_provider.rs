//! Indicator Service Trait
//!
//! Pure lookups over precomputed volatility indicators. Unavailability is a
//! `None`, never an error: every caller has a configured fallback path.

use async_trait::async_trait;

/// Volume-weighted average price with the dispersion around it.
#[derive(Debug, Clone, Copy)]
pub struct VwapBand {
    pub vwap: f64,
    pub stddev: f64,
}

impl VwapBand {
    pub fn upper(&self, k: f64) -> f64 {
        self.vwap + k * self.stddev
    }

    pub fn lower(&self, k: f64) -> f64 {
        self.vwap - k * self.stddev
    }
}

#[async_trait]
pub trait IndicatorProvider: Send + Sync {
    /// Average true range, in price units.
    async fn atr(&self, symbol: &str) -> Option<f64>;

    async fn vwap_band(&self, symbol: &str) -> Option<VwapBand>;
}
