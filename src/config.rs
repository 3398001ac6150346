//! Engine configuration with validated environment overrides.
//!
//! Every knob has a default; invalid values are logged and fall back rather
//! than aborting startup.

use std::str::FromStr;

use tracing::warn;

fn env_parse<T: FromStr + std::fmt::Display>(name: &str, current: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid {} value '{}', using default: {}", name, raw, current);
                current
            }
        },
        Err(_) => current,
    }
}

fn env_fraction(name: &str, current: f64) -> f64 {
    let value = env_parse(name, current);
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        warn!(
            "{} must be within [0.0, 1.0], got {}, using default: {}",
            name, value, current
        );
        current
    }
}

/// Decision, sizing, protection, and reconciliation parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Liquidation notional below this is ignored.
    pub qualify_threshold_usd: f64,
    /// Cap on `open + pending` positions.
    pub max_positions: usize,
    /// Configured USD margin per position before leverage.
    pub position_usd: f64,
    /// Floor on position margin as a fraction of wallet balance.
    pub min_balance_pct: f64,
    pub leverage: u32,
    /// Ascending DCA split schedule; must sum to 1.0.
    pub splits: Vec<f64>,
    /// Fallback price-improvement requirement when the VWAP band is
    /// unavailable, as a fraction of the last trigger price.
    pub dca_improvement_pct: f64,
    /// Band half-width in standard deviations for the preferred DCA check.
    pub vwap_band_k: f64,
    pub atr_stop_mult: f64,
    pub atr_tp_mult: f64,
    pub atr_trail_mult: f64,
    /// Whether trailing stops are armed at all; with trailing off, the
    /// indicator drives a fixed take-profit instead.
    pub trailing_enabled: bool,
    /// Fixed take-profit distance when no indicator is available.
    pub fallback_tp_pct: f64,
    /// Minimum profit floor as a fraction of notional; widens TP if tighter.
    pub min_profit_pct: f64,
    /// Shared risk budget as a fraction of balance, divided across open
    /// positions.
    pub risk_budget_pct: f64,
    /// Estimated single-leg taker fee rate, for break-even buffers.
    pub fee_rate: f64,
    /// Reject entries when the spread exceeds this fraction of mid.
    pub max_spread_pct: f64,
    pub passive_entry: bool,
    pub passive_settle_secs: u64,
    /// Skip close detection within this window after an open (fill
    /// propagation race).
    pub open_grace_secs: i64,
    /// Skip re-processing a symbol within this window after a close decision.
    pub close_dedup_secs: i64,
    /// Naked-position window tolerated before healing is considered overdue.
    pub protection_grace_secs: u64,
    pub reconcile_interval_secs: u64,
    pub backfill_interval_secs: u64,
    /// Settlement matching retry schedule.
    pub match_attempts: u32,
    pub match_delay_secs: u64,
    /// Attempts from this index on drop the time-ordering filter.
    pub match_relax_after: u32,
    pub closed_pnl_limit: usize,
    /// Time-bucket proximity for backfill dedup against existing history.
    pub backfill_bucket_secs: i64,
    pub balance_cache_secs: u64,
    pub snapshot_interval_secs: u64,
    pub snapshot_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            qualify_threshold_usd: 10_000.0,
            max_positions: 5,
            position_usd: 100.0,
            min_balance_pct: 0.02,
            leverage: 10,
            splits: vec![0.08, 0.12, 0.16, 0.24, 0.40],
            dca_improvement_pct: 0.004,
            vwap_band_k: 1.5,
            atr_stop_mult: 2.0,
            atr_tp_mult: 3.0,
            atr_trail_mult: 1.5,
            trailing_enabled: true,
            fallback_tp_pct: 0.01,
            min_profit_pct: 0.004,
            risk_budget_pct: 0.02,
            fee_rate: 0.00055,
            max_spread_pct: 0.005,
            passive_entry: false,
            passive_settle_secs: 3,
            open_grace_secs: 15,
            close_dedup_secs: 10,
            protection_grace_secs: 30,
            reconcile_interval_secs: 10,
            backfill_interval_secs: 300,
            match_attempts: 5,
            match_delay_secs: 3,
            match_relax_after: 3,
            closed_pnl_limit: 50,
            backfill_bucket_secs: 120,
            balance_cache_secs: 30,
            snapshot_interval_secs: 60,
            snapshot_path: "kontra_state.json".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineConfig {
        let mut cfg = EngineConfig::default();

        cfg.qualify_threshold_usd =
            env_parse("QUALIFY_THRESHOLD_USD", cfg.qualify_threshold_usd);
        cfg.max_positions = env_parse("MAX_POSITIONS", cfg.max_positions);
        cfg.position_usd = env_parse("POSITION_USD", cfg.position_usd);
        cfg.min_balance_pct = env_fraction("MIN_BALANCE_PCT", cfg.min_balance_pct);
        cfg.leverage = env_parse("LEVERAGE", cfg.leverage);
        cfg.dca_improvement_pct = env_fraction("DCA_IMPROVEMENT_PCT", cfg.dca_improvement_pct);
        cfg.vwap_band_k = env_parse("VWAP_BAND_K", cfg.vwap_band_k);
        cfg.atr_stop_mult = env_parse("ATR_STOP_MULT", cfg.atr_stop_mult);
        cfg.atr_tp_mult = env_parse("ATR_TP_MULT", cfg.atr_tp_mult);
        cfg.atr_trail_mult = env_parse("ATR_TRAIL_MULT", cfg.atr_trail_mult);
        cfg.trailing_enabled = env_parse("TRAILING_ENABLED", cfg.trailing_enabled);
        cfg.fallback_tp_pct = env_fraction("FALLBACK_TP_PCT", cfg.fallback_tp_pct);
        cfg.min_profit_pct = env_fraction("MIN_PROFIT_PCT", cfg.min_profit_pct);
        cfg.risk_budget_pct = env_fraction("RISK_BUDGET_PCT", cfg.risk_budget_pct);
        cfg.fee_rate = env_fraction("FEE_RATE", cfg.fee_rate);
        cfg.max_spread_pct = env_fraction("MAX_SPREAD_PCT", cfg.max_spread_pct);
        cfg.passive_entry = env_parse("PASSIVE_ENTRY", cfg.passive_entry);
        cfg.passive_settle_secs = env_parse("PASSIVE_SETTLE_SECS", cfg.passive_settle_secs);
        cfg.open_grace_secs = env_parse("OPEN_GRACE_SECS", cfg.open_grace_secs);
        cfg.close_dedup_secs = env_parse("CLOSE_DEDUP_SECS", cfg.close_dedup_secs);
        cfg.protection_grace_secs =
            env_parse("PROTECTION_GRACE_SECS", cfg.protection_grace_secs);
        cfg.reconcile_interval_secs =
            env_parse("RECONCILE_INTERVAL_SECS", cfg.reconcile_interval_secs);
        cfg.backfill_interval_secs =
            env_parse("BACKFILL_INTERVAL_SECS", cfg.backfill_interval_secs);
        cfg.match_attempts = env_parse("MATCH_ATTEMPTS", cfg.match_attempts);
        cfg.match_delay_secs = env_parse("MATCH_DELAY_SECS", cfg.match_delay_secs);
        cfg.match_relax_after = env_parse("MATCH_RELAX_AFTER", cfg.match_relax_after);
        cfg.closed_pnl_limit = env_parse("CLOSED_PNL_LIMIT", cfg.closed_pnl_limit);
        cfg.backfill_bucket_secs =
            env_parse("BACKFILL_BUCKET_SECS", cfg.backfill_bucket_secs);
        cfg.balance_cache_secs = env_parse("BALANCE_CACHE_SECS", cfg.balance_cache_secs);
        cfg.snapshot_interval_secs =
            env_parse("SNAPSHOT_INTERVAL_SECS", cfg.snapshot_interval_secs);
        if let Ok(path) = std::env::var("SNAPSHOT_PATH") {
            cfg.snapshot_path = path;
        }

        if let Ok(raw) = std::env::var("DCA_SPLITS") {
            match parse_splits(&raw) {
                Some(splits) => cfg.splits = splits,
                None => warn!(
                    "invalid DCA_SPLITS '{}' (need ascending fractions summing to 1.0), using default",
                    raw
                ),
            }
        }

        cfg
    }

    pub fn final_dca_level(&self) -> usize {
        self.splits.len().saturating_sub(1)
    }
}

/// Parse a comma-separated split schedule; ascending, summing to 1.0.
fn parse_splits(raw: &str) -> Option<Vec<f64>> {
    let splits: Vec<f64> = raw
        .split(',')
        .map(|part| part.trim().parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()?;
    if splits.is_empty() || splits.iter().any(|s| *s <= 0.0) {
        return None;
    }
    if splits.windows(2).any(|w| w[0] > w[1]) {
        return None;
    }
    let sum: f64 = splits.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        return None;
    }
    Some(splits)
}

/// Liquidation feed parameters.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub symbols: Vec<String>,
    pub reconnect_max_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            reconnect_max_secs: 60,
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> FeedConfig {
        let mut cfg = FeedConfig::default();
        if let Ok(url) = std::env::var("FEED_WS_URL") {
            cfg.ws_url = url;
        }
        if let Ok(raw) = std::env::var("FEED_SYMBOLS") {
            let symbols: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if symbols.is_empty() {
                warn!("FEED_SYMBOLS is empty, using default symbol set");
            } else {
                cfg.symbols = symbols;
            }
        }
        cfg.reconnect_max_secs = env_parse("FEED_RECONNECT_MAX_SECS", cfg.reconnect_max_secs);
        cfg
    }
}
