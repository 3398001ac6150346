//! Shared mock collaborators for the integration suites.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use kontra::config::EngineConfig;
use kontra::domain::entities::order::{OrderChannel, OrderRequest, OrderStatus};
use kontra::domain::errors::VenueError;
use kontra::domain::repositories::indicator_provider::{IndicatorProvider, VwapBand};
use kontra::domain::repositories::instrument_registry::{floor_to_step, InstrumentRegistry};
use kontra::domain::repositories::venue_client::{
    ClosedPnlRecord, ExecutionRecord, ProtectionRequest, Quote, RemotePosition, VenueClient,
    VenueResult,
};
use kontra::domain::services::execution::ExecutionEngine;
use kontra::domain::services::ledger::PositionLedger;
use kontra::domain::services::protection::ProtectionManager;
use kontra::domain::services::reconciliation::ReconciliationEngine;
use kontra::domain::services::stats::TradingStats;

/// Scriptable venue double. Every interaction is recorded; responses come
/// from the scripted fields, falling back to permissive defaults.
pub struct MockVenue {
    next_order_id: AtomicUsize,
    pub placed: Mutex<Vec<(String, OrderRequest, OrderChannel)>>,
    /// Per-call scripted order results; empty means auto-accept.
    pub place_results: Mutex<VecDeque<VenueResult<String>>>,
    /// Suspend inside place_order, to force task interleaving.
    pub place_delay_ms: AtomicU64,
    pub reject_low_latency: AtomicBool,
    /// Status overrides by order id; unscripted orders fill at `fill_price`.
    pub statuses: Mutex<HashMap<String, OrderStatus>>,
    pub fill_price: Mutex<Option<f64>>,
    pub protection_calls: Mutex<Vec<(String, ProtectionRequest)>>,
    pub fail_protection: AtomicBool,
    pub cancels: Mutex<Vec<String>>,
    pub open_positions: Mutex<Vec<RemotePosition>>,
    pub position_for_result: Mutex<Option<RemotePosition>>,
    /// Per-call scripted closed-pnl pages; when exhausted, `closed_pnl` serves.
    pub closed_pnl_scripts: Mutex<VecDeque<Vec<ClosedPnlRecord>>>,
    pub closed_pnl: Mutex<Vec<ClosedPnlRecord>>,
    pub executions: Mutex<HashMap<String, Vec<ExecutionRecord>>>,
    pub quote: Mutex<Quote>,
    pub balance: Mutex<f64>,
    pub leverage_calls: AtomicUsize,
}

impl MockVenue {
    pub fn new() -> Self {
        MockVenue {
            next_order_id: AtomicUsize::new(1),
            placed: Mutex::new(Vec::new()),
            place_results: Mutex::new(VecDeque::new()),
            place_delay_ms: AtomicU64::new(0),
            reject_low_latency: AtomicBool::new(false),
            statuses: Mutex::new(HashMap::new()),
            fill_price: Mutex::new(None),
            protection_calls: Mutex::new(Vec::new()),
            fail_protection: AtomicBool::new(false),
            cancels: Mutex::new(Vec::new()),
            open_positions: Mutex::new(Vec::new()),
            position_for_result: Mutex::new(None),
            closed_pnl_scripts: Mutex::new(VecDeque::new()),
            closed_pnl: Mutex::new(Vec::new()),
            executions: Mutex::new(HashMap::new()),
            quote: Mutex::new(Quote { bid: 99.99, ask: 100.01 }),
            balance: Mutex::new(10_000.0),
            leverage_calls: AtomicUsize::new(0),
        }
    }

    pub fn placed_requests(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().iter().map(|(_, r, _)| r.clone()).collect()
    }

    pub fn protection_request_count(&self) -> usize {
        self.protection_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl VenueClient for MockVenue {
    fn name(&self) -> &str {
        "mock"
    }

    async fn place_order(&self, req: &OrderRequest, channel: OrderChannel) -> VenueResult<String> {
        let delay = self.place_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            sleep(Duration::from_millis(delay)).await;
        }
        if channel == OrderChannel::LowLatency && self.reject_low_latency.load(Ordering::SeqCst) {
            return Err(VenueError::Timeout("fast channel".to_string()));
        }
        if let Some(result) = self.place_results.lock().unwrap().pop_front() {
            if let Ok(id) = &result {
                self.placed.lock().unwrap().push((id.clone(), req.clone(), channel));
            }
            return result;
        }
        let id = format!("mock-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        self.placed.lock().unwrap().push((id.clone(), req.clone(), channel));
        Ok(id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> VenueResult<()> {
        self.cancels.lock().unwrap().push(order_id.to_string());
        Ok(())
    }

    async fn order_status(&self, _symbol: &str, order_id: &str) -> VenueResult<OrderStatus> {
        if let Some(status) = self.statuses.lock().unwrap().get(order_id) {
            return Ok(status.clone());
        }
        let placed = self.placed.lock().unwrap();
        let entry = placed.iter().find(|(id, _, _)| id == order_id);
        match entry {
            Some((_, req, _)) => {
                let avg = self
                    .fill_price
                    .lock()
                    .unwrap()
                    .or(req.price)
                    .unwrap_or(100.0);
                Ok(OrderStatus::Filled { avg_price: avg, cum_qty: req.quantity })
            }
            None => Ok(OrderStatus::Unknown),
        }
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> VenueResult<()> {
        self.leverage_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_one_way_mode(&self, _symbol: &str) -> VenueResult<()> {
        Ok(())
    }

    async fn set_trading_stop(&self, symbol: &str, req: &ProtectionRequest) -> VenueResult<()> {
        if self.fail_protection.load(Ordering::SeqCst) {
            return Err(VenueError::Rejected("protection scripted to fail".to_string()));
        }
        self.protection_calls.lock().unwrap().push((symbol.to_string(), req.clone()));
        Ok(())
    }

    async fn list_open_positions(&self) -> VenueResult<Vec<RemotePosition>> {
        Ok(self.open_positions.lock().unwrap().clone())
    }

    async fn position_for(&self, symbol: &str) -> VenueResult<Option<RemotePosition>> {
        if let Some(position) = self.position_for_result.lock().unwrap().clone() {
            return Ok(Some(position));
        }
        Ok(self
            .open_positions
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned())
    }

    async fn list_closed_pnl(
        &self,
        symbol: Option<&str>,
        _limit: usize,
    ) -> VenueResult<Vec<ClosedPnlRecord>> {
        if let Some(page) = self.closed_pnl_scripts.lock().unwrap().pop_front() {
            return Ok(page);
        }
        let records = self.closed_pnl.lock().unwrap();
        Ok(records
            .iter()
            .filter(|r| symbol.map(|s| r.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn list_executions(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> VenueResult<Vec<ExecutionRecord>> {
        Ok(self.executions.lock().unwrap().get(order_id).cloned().unwrap_or_default())
    }

    async fn best_quote(&self, _symbol: &str) -> VenueResult<Quote> {
        Ok(*self.quote.lock().unwrap())
    }

    async fn wallet_balance(&self) -> VenueResult<f64> {
        Ok(*self.balance.lock().unwrap())
    }
}

pub struct MockIndicators {
    pub atr: Mutex<Option<f64>>,
    pub band: Mutex<Option<VwapBand>>,
}

impl MockIndicators {
    pub fn new(atr: Option<f64>, band: Option<VwapBand>) -> Self {
        MockIndicators { atr: Mutex::new(atr), band: Mutex::new(band) }
    }
}

#[async_trait]
impl IndicatorProvider for MockIndicators {
    async fn atr(&self, _symbol: &str) -> Option<f64> {
        *self.atr.lock().unwrap()
    }

    async fn vwap_band(&self, _symbol: &str) -> Option<VwapBand> {
        *self.band.lock().unwrap()
    }
}

pub struct MockRegistry {
    pub tick: f64,
    pub qty_step: f64,
    pub min_qty: f64,
    pub tradable: AtomicBool,
}

impl MockRegistry {
    pub fn new() -> Self {
        MockRegistry {
            tick: 0.01,
            qty_step: 0.001,
            min_qty: 0.001,
            tradable: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl InstrumentRegistry for MockRegistry {
    async fn is_tradable(&self, _symbol: &str) -> bool {
        self.tradable.load(Ordering::SeqCst)
    }

    async fn tick_size(&self, _symbol: &str) -> Option<f64> {
        Some(self.tick)
    }

    async fn min_qty(&self, _symbol: &str) -> Option<f64> {
        Some(self.min_qty)
    }

    async fn round_price(&self, _symbol: &str, value: f64) -> f64 {
        (value / self.tick).round() * self.tick
    }

    async fn round_qty(&self, _symbol: &str, value: f64) -> f64 {
        floor_to_step(value, self.qty_step)
    }
}

/// Fully wired engine stack over the mocks.
pub struct Harness {
    pub cfg: EngineConfig,
    pub venue: Arc<MockVenue>,
    pub indicators: Arc<MockIndicators>,
    pub registry: Arc<MockRegistry>,
    pub ledger: Arc<PositionLedger>,
    pub stats: Arc<TradingStats>,
    pub protection: Arc<ProtectionManager>,
    pub engine: Arc<ExecutionEngine>,
    pub reconciliation: Arc<ReconciliationEngine>,
}

pub fn harness_with(cfg: EngineConfig, atr: Option<f64>, band: Option<VwapBand>) -> Harness {
    let venue = Arc::new(MockVenue::new());
    let indicators = Arc::new(MockIndicators::new(atr, band));
    let registry = Arc::new(MockRegistry::new());
    let ledger = Arc::new(PositionLedger::new());
    let stats = Arc::new(TradingStats::new());

    let protection = Arc::new(ProtectionManager::new(
        cfg.clone(),
        venue.clone() as Arc<dyn VenueClient>,
        indicators.clone() as Arc<dyn IndicatorProvider>,
        registry.clone() as Arc<dyn InstrumentRegistry>,
        ledger.clone(),
    ));
    let engine = Arc::new(ExecutionEngine::new(
        cfg.clone(),
        ledger.clone(),
        venue.clone() as Arc<dyn VenueClient>,
        indicators.clone() as Arc<dyn IndicatorProvider>,
        registry.clone() as Arc<dyn InstrumentRegistry>,
        protection.clone(),
        stats.clone(),
    ));
    let reconciliation = Arc::new(ReconciliationEngine::new(
        cfg.clone(),
        ledger.clone(),
        venue.clone() as Arc<dyn VenueClient>,
        protection.clone(),
    ));

    Harness { cfg, venue, indicators, registry, ledger, stats, protection, engine, reconciliation }
}

