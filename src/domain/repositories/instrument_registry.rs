//! Instrument Registry Trait
//!
//! Instrument metadata and rounding. Quantities round down to the lot step,
//! prices to the tick; an unknown symbol rounds to itself and reports
//! untradable.

use async_trait::async_trait;

#[async_trait]
pub trait InstrumentRegistry: Send + Sync {
    async fn is_tradable(&self, symbol: &str) -> bool;

    async fn tick_size(&self, symbol: &str) -> Option<f64>;

    async fn min_qty(&self, symbol: &str) -> Option<f64>;

    async fn round_price(&self, symbol: &str, value: f64) -> f64;

    /// Rounded down, never up: sizing must not exceed budget.
    async fn round_qty(&self, symbol: &str, value: f64) -> f64;
}


/// Floor `value` to an integer multiple of `step`.
pub fn floor_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(1.2345, 0.001), 1.234);
        assert_eq!(floor_to_step(10.0, 0.5), 10.0);
        assert_eq!(floor_to_step(9.99, 0.5), 9.5);
    }

    #[test]
    fn test_floor_to_step_degenerate() {
        assert_eq!(floor_to_step(1.23, 0.0), 1.23);
        assert_eq!(floor_to_step(1.23, -1.0), 1.23);
    }
}
