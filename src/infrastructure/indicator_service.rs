//! Kline-backed indicator provider.
//!
//! Fetches recent candles from the venue's public market endpoint, computes
//! ATR and the VWAP band with the pure domain routines, and caches series per
//! symbol with a short TTL. Any failure along the way is "indicator
//! unavailable", never an error.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use tracing::debug;

use crate::domain::repositories::indicator_provider::{IndicatorProvider, VwapBand};
use crate::domain::services::indicators::{vwap_band, Atr, Candle};
use crate::infrastructure::bybit_client::{ApiEnvelope, ListResult};

#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub api_base: String,
    /// Kline interval in minutes, as the venue spells it.
    pub interval: String,
    pub kline_limit: usize,
    pub atr_period: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        IndicatorConfig {
            api_base: "https://api.bybit.com".to_string(),
            interval: "5".to_string(),
            kline_limit: 100,
            atr_period: 14,
            cache_ttl_secs: 60,
            cache_capacity: 64,
        }
    }
}

struct CachedSeries {
    candles: Vec<Candle>,
    fetched_at: Instant,
}

pub struct KlineIndicatorService {
    client: Client,
    config: IndicatorConfig,
    cache: Mutex<LruCache<String, CachedSeries>>,
}

impl KlineIndicatorService {
    pub fn new(config: IndicatorConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        KlineIndicatorService {
            client: Client::new(),
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn candles(&self, symbol: &str) -> Option<Vec<Candle>> {
        {
            let mut cache = self.cache.lock().expect("indicator cache poisoned");
            if let Some(series) = cache.get(symbol) {
                if series.fetched_at.elapsed() < Duration::from_secs(self.config.cache_ttl_secs) {
                    return Some(series.candles.clone());
                }
            }
        }

        let candles = self.fetch_candles(symbol).await?;
        let mut cache = self.cache.lock().expect("indicator cache poisoned");
        cache.put(
            symbol.to_string(),
            CachedSeries { candles: candles.clone(), fetched_at: Instant::now() },
        );
        Some(candles)
    }

    async fn fetch_candles(&self, symbol: &str) -> Option<Vec<Candle>> {
        let url = format!(
            "{}/v5/market/kline?category=linear&symbol={}&interval={}&limit={}",
            self.config.api_base, symbol, self.config.interval, self.config.kline_limit
        );

        let envelope: ApiEnvelope<ListResult<Vec<String>>> = match self.client.get(&url).send().await
        {
            Ok(response) => match response.json().await {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(symbol, error = %e, "kline decode failed");
                    return None;
                }
            },
            Err(e) => {
                debug!(symbol, error = %e, "kline fetch failed");
                return None;
            }
        };

        if envelope.ret_code != 0 {
            debug!(symbol, code = envelope.ret_code, msg = %envelope.ret_msg, "kline request rejected");
            return None;
        }

        // Entries are [start, open, high, low, close, volume, turnover],
        // newest first; flip to chronological order.
        let mut candles = Vec::new();
        for row in envelope.result?.list {
            if row.len() < 6 {
                return None;
            }
            let parse = |raw: &String| raw.parse::<f64>().ok();
            candles.push(Candle {
                open: parse(&row[1])?,
                high: parse(&row[2])?,
                low: parse(&row[3])?,
                close: parse(&row[4])?,
                volume: parse(&row[5])?,
            });
        }
        candles.reverse();

        if candles.is_empty() {
            None
        } else {
            Some(candles)
        }
    }
}

#[async_trait]
impl IndicatorProvider for KlineIndicatorService {
    async fn atr(&self, symbol: &str) -> Option<f64> {
        let candles = self.candles(symbol).await?;
        Atr::new(self.config.atr_period).latest(&candles)
    }

    async fn vwap_band(&self, symbol: &str) -> Option<VwapBand> {
        let candles = self.candles(symbol).await?;
        vwap_band(&candles)
    }
}
