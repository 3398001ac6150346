//! Cached instrument metadata from the venue's public instruments endpoint.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::domain::repositories::instrument_registry::{floor_to_step, InstrumentRegistry};
use crate::infrastructure::bybit_client::{ApiEnvelope, ListResult};

#[derive(Debug, Clone, Copy)]
struct InstrumentInfo {
    tick_size: f64,
    qty_step: f64,
    min_qty: f64,
    tradable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    #[serde(default)]
    tick_size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    #[serde(default)]
    qty_step: String,
    #[serde(default)]
    min_order_qty: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentEntry {
    #[serde(default)]
    status: String,
    price_filter: Option<PriceFilter>,
    lot_size_filter: Option<LotSizeFilter>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub api_base: String,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            api_base: "https://api.bybit.com".to_string(),
            // Filters change rarely; refresh hourly.
            cache_ttl_secs: 3600,
            cache_capacity: 256,
        }
    }
}

pub struct BybitInstrumentRegistry {
    client: Client,
    config: RegistryConfig,
    cache: Mutex<LruCache<String, (InstrumentInfo, Instant)>>,
}

impl BybitInstrumentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        BybitInstrumentRegistry {
            client: Client::new(),
            config,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn info(&self, symbol: &str) -> Option<InstrumentInfo> {
        {
            let mut cache = self.cache.lock().expect("instrument cache poisoned");
            if let Some((info, fetched_at)) = cache.get(symbol) {
                if fetched_at.elapsed() < Duration::from_secs(self.config.cache_ttl_secs) {
                    return Some(*info);
                }
            }
        }

        let info = self.fetch_info(symbol).await?;
        let mut cache = self.cache.lock().expect("instrument cache poisoned");
        cache.put(symbol.to_string(), (info, Instant::now()));
        Some(info)
    }

    async fn fetch_info(&self, symbol: &str) -> Option<InstrumentInfo> {
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&symbol={}",
            self.config.api_base, symbol
        );

        let envelope: ApiEnvelope<ListResult<InstrumentEntry>> =
            match self.client.get(&url).send().await {
                Ok(response) => response.json().await.ok()?,
                Err(e) => {
                    debug!(symbol, error = %e, "instrument fetch failed");
                    return None;
                }
            };
        if envelope.ret_code != 0 {
            debug!(symbol, code = envelope.ret_code, "instrument request rejected");
            return None;
        }

        let entry = envelope.result?.list.into_iter().next()?;
        let parse = |raw: &str| raw.parse::<f64>().ok().filter(|v| *v > 0.0);

        Some(InstrumentInfo {
            tick_size: entry
                .price_filter
                .as_ref()
                .and_then(|f| parse(&f.tick_size))
                .unwrap_or(0.0),
            qty_step: entry
                .lot_size_filter
                .as_ref()
                .and_then(|f| parse(&f.qty_step))
                .unwrap_or(0.0),
            min_qty: entry
                .lot_size_filter
                .as_ref()
                .and_then(|f| parse(&f.min_order_qty))
                .unwrap_or(0.0),
            tradable: entry.status == "Trading",
        })
    }
}

#[async_trait]
impl InstrumentRegistry for BybitInstrumentRegistry {
    async fn is_tradable(&self, symbol: &str) -> bool {
        self.info(symbol).await.map(|i| i.tradable).unwrap_or(false)
    }

    async fn tick_size(&self, symbol: &str) -> Option<f64> {
        self.info(symbol).await.map(|i| i.tick_size).filter(|v| *v > 0.0)
    }

    async fn min_qty(&self, symbol: &str) -> Option<f64> {
        self.info(symbol).await.map(|i| i.min_qty).filter(|v| *v > 0.0)
    }

    async fn round_price(&self, symbol: &str, value: f64) -> f64 {
        match self.tick_size(symbol).await {
            Some(tick) => (value / tick).round() * tick,
            None => value,
        }
    }

    async fn round_qty(&self, symbol: &str, value: f64) -> f64 {
        match self.info(symbol).await.map(|i| i.qty_step).filter(|v| *v > 0.0) {
            Some(step) => floor_to_step(value, step),
            None => value,
        }
    }
}
