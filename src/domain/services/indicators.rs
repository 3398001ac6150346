//! Volatility indicator computation over candles.

use crate::domain::repositories::indicator_provider::VwapBand;

#[derive(Debug, Clone)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Average true range with Wilder smoothing.
pub struct Atr {
    pub period: usize,
}

impl Atr {
    pub fn new(period: usize) -> Self {
        Atr { period }
    }

    pub fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.period == 0 || candles.len() < self.period + 1 {
            return vec![];
        }

        let mut true_ranges = Vec::with_capacity(candles.len() - 1);
        for i in 1..candles.len() {
            let high_low = candles[i].high - candles[i].low;
            let high_close = (candles[i].high - candles[i - 1].close).abs();
            let low_close = (candles[i].low - candles[i - 1].close).abs();
            true_ranges.push(high_low.max(high_close).max(low_close));
        }

        // First ATR is the simple mean of the initial window.
        let mut atr: f64 = true_ranges[..self.period].iter().sum::<f64>() / self.period as f64;
        let mut values = vec![atr];

        for tr in true_ranges.iter().skip(self.period) {
            atr = (atr * (self.period as f64 - 1.0) + tr) / self.period as f64;
            values.push(atr);
        }

        values
    }

    /// The most recent smoothed value, if enough candles exist.
    pub fn latest(&self, candles: &[Candle]) -> Option<f64> {
        self.calculate(candles).last().copied()
    }
}

/// Volume-weighted average price with the volume-weighted dispersion of
/// typical prices around it.
pub fn vwap_band(candles: &[Candle]) -> Option<VwapBand> {
    let total_volume: f64 = candles.iter().map(|c| c.volume).sum();
    if candles.is_empty() || total_volume <= 0.0 {
        return None;
    }

    let vwap = candles
        .iter()
        .map(|c| c.typical_price() * c.volume)
        .sum::<f64>()
        / total_volume;

    let variance = candles
        .iter()
        .map(|c| {
            let diff = c.typical_price() - vwap;
            diff * diff * c.volume
        })
        .sum::<f64>()
        / total_volume;

    Some(VwapBand {
        vwap,
        stddev: variance.sqrt(),
    })
}
