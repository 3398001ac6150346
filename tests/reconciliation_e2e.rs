//! Reconciliation tests against mock collaborators: live-diff adoption and
//! close detection, tiered settlement matching with retry relaxation,
//! protection healing, and the backfill sweep.

mod support;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use kontra::config::EngineConfig;
use kontra::domain::entities::liquidation::PositionSide;
use kontra::domain::entities::position::Position;
use kontra::domain::entities::trade::{ClosedTrade, ExitType, TradeFees};
use kontra::domain::repositories::venue_client::{
    ClosedPnlRecord, ExecutionRecord, RemotePosition,
};

use support::harness_with;

fn tracked_position(symbol: &str, entry: f64, qty: f64, opened_secs_ago: i64) -> Position {
    Position {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        entry_price: entry,
        quantity: qty,
        stop_loss_price: Some(entry * 0.96),
        take_profit_price: None,
        trailing_distance: None,
        trailing_activation_price: None,
        open_time: Utc::now() - ChronoDuration::seconds(opened_secs_ago),
        dca_level: 0,
        total_budget_notional: entry * qty,
        last_entry_price: entry,
        entry_order_id: Some("e-1".to_string()),
        mark_price: Some(entry * 1.02),
        unrealized_pnl: None,
    }
}

fn remote_position(symbol: &str, qty: f64, avg: f64, stop: Option<f64>) -> RemotePosition {
    RemotePosition {
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        quantity: qty,
        avg_price: avg,
        stop_loss: stop,
        trailing_stop: None,
        unrealized_pnl: 12.5,
        mark_price: avg * 1.01,
        created_at: Some(Utc::now() - ChronoDuration::seconds(300)),
    }
}

fn pnl_record(id: &str, symbol: &str, entry: f64, exit: f64, qty: f64, pnl: f64) -> ClosedPnlRecord {
    ClosedPnlRecord {
        symbol: symbol.to_string(),
        order_id: id.to_string(),
        avg_entry_price: entry,
        avg_exit_price: exit,
        qty,
        side: PositionSide::Long,
        closed_pnl: pnl,
        created_time: Utc::now(),
    }
}

fn fast_settle_config(attempts: u32) -> EngineConfig {
    EngineConfig {
        match_delay_secs: 0,
        match_attempts: attempts,
        match_relax_after: attempts.saturating_sub(2),
        ..EngineConfig::default()
    }
}

// Scenario C: the first two attempts find nothing, attempt three lands a
// tier-1 match. The venue's PnL is taken verbatim and fees come from the
// matched execution records.
#[tokio::test]
async fn scenario_c_settlement_matches_on_third_attempt() {
    let h = harness_with(fast_settle_config(5), None, None);

    {
        let mut scripts = h.venue.closed_pnl_scripts.lock().unwrap();
        scripts.push_back(vec![]);
        scripts.push_back(vec![]);
    }
    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-3", "BTCUSDT", 100.2, 104.0, 1.6, 7.77));
    {
        let mut executions = h.venue.executions.lock().unwrap();
        executions.insert("e-1".to_string(), vec![ExecutionRecord { fee: 0.05, is_maker: false }]);
        executions.insert("c-3".to_string(), vec![ExecutionRecord { fee: 0.07, is_maker: false }]);
    }

    let position = tracked_position("BTCUSDT", 100.0, 1.6, 120);
    h.reconciliation.settle_close(position).await;

    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    let trade = &history[0];

    // The venue's number, exactly.
    assert_eq!(trade.net_pnl, 7.77);
    assert!((trade.fees.total() - 0.12).abs() < 1e-12);
    assert_eq!(trade.close_order_id.as_deref(), Some("c-3"));
    assert_eq!(trade.entry_price, 100.2);
    assert_eq!(trade.exit_price, 104.0);
    assert!(h.ledger.is_close_id_consumed("c-3"));
}

#[tokio::test]
async fn unmatched_settlement_is_recorded_unresolved() {
    let h = harness_with(fast_settle_config(2), None, None);

    let position = tracked_position("BTCUSDT", 100.0, 2.0, 120);
    h.reconciliation.settle_close(position).await;

    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    let trade = &history[0];
    assert_eq!(trade.exit_type, ExitType::Unresolved);
    assert!(trade.is_unsettled());
    // Estimated from the last mark: (102 - 100) * 2.
    assert!((trade.gross_pnl - 4.0).abs() < 1e-9);
    assert!(trade.net_pnl < trade.gross_pnl);
}

#[tokio::test]
async fn consumed_close_id_is_never_reused() {
    let h = harness_with(fast_settle_config(2), None, None);

    h.ledger.consume_close_id("c-9");
    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-9", "BTCUSDT", 100.0, 104.0, 1.6, 6.4));

    let position = tracked_position("BTCUSDT", 100.0, 1.6, 120);
    h.reconciliation.settle_close(position).await;

    // The only candidate was already consumed, so the close stays unresolved.
    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_unsettled());
}

#[tokio::test]
async fn relaxed_attempts_accept_records_older_than_the_open() {
    let h = harness_with(fast_settle_config(3), None, None);

    // Settlement stamped before the local open time: the strict attempts
    // filter it, the relaxed final attempt accepts it.
    let mut record = pnl_record("c-5", "BTCUSDT", 100.1, 103.0, 1.6, 4.2);
    record.created_time = Utc::now() - ChronoDuration::seconds(600);
    h.venue.closed_pnl.lock().unwrap().push(record);

    let position = tracked_position("BTCUSDT", 100.0, 1.6, 120);
    h.reconciliation.settle_close(position).await;

    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].close_order_id.as_deref(), Some("c-5"));
    assert_eq!(history[0].net_pnl, 4.2);
}

#[tokio::test]
async fn tick_applies_grace_window_then_detects_close() {
    let h = harness_with(fast_settle_config(1), None, None);

    // Freshly opened: the fill may not have propagated remotely yet.
    h.ledger.insert(tracked_position("BTCUSDT", 100.0, 1.6, 0));
    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.closes_detected, 0);
    assert_eq!(h.ledger.open_count(), 1);

    // Past the grace window the disappearance is a real close.
    h.ledger.update("BTCUSDT", |p| p.open_time = Utc::now() - ChronoDuration::seconds(60));
    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.closes_detected, 1);
    assert_eq!(h.ledger.open_count(), 0);

    // Let the spawned settlement task finish (no records -> unresolved).
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.ledger.history_len(), 1);

    // A symbol re-inserted within the dedup window is not re-processed.
    h.ledger.insert(tracked_position("BTCUSDT", 100.0, 1.6, 60));
    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.closes_detected, 0);
}

#[tokio::test]
async fn tick_does_not_adopt_symbols_held_by_the_execution_engine() {
    let h = harness_with(fast_settle_config(1), None, None);
    h.venue.open_positions.lock().unwrap().push(remote_position("BTCUSDT", 1.0, 100.0, Some(96.0)));

    let guard = h.ledger.try_lock_symbol("BTCUSDT").unwrap();
    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.adopted, 0);
    assert_eq!(h.ledger.open_count(), 0);

    drop(guard);
    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert!(h.ledger.contains("BTCUSDT"));
}

#[tokio::test]
async fn adopted_position_is_fully_deployed_and_keeps_remote_stops() {
    let h = harness_with(fast_settle_config(1), None, None);
    h.venue.open_positions.lock().unwrap().push(remote_position("ETHUSDT", 2.0, 50.0, Some(48.0)));

    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.emergency_protected, 0);

    let position = h.ledger.get("ETHUSDT").unwrap();
    assert_eq!(position.dca_level, h.cfg.final_dca_level());
    assert!((position.total_budget_notional - 100.0).abs() < 1e-9);
    assert_eq!(position.stop_loss_price, Some(48.0));
    assert!(position.entry_order_id.is_none());
}

#[tokio::test]
async fn adopting_a_naked_remote_attaches_protection_immediately() {
    let h = harness_with(fast_settle_config(1), Some(1.0), None);
    h.venue.open_positions.lock().unwrap().push(remote_position("SOLUSDT", 10.0, 20.0, None));

    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.emergency_protected, 1);

    let position = h.ledger.get("SOLUSDT").unwrap();
    assert!(!position.is_naked());
    assert!(h.venue.protection_request_count() > 0);
}

// Scenario D: a restored ledger entry has no protection and the venue side
// has none either; the first tick detects and repairs it.
#[tokio::test]
async fn scenario_d_naked_restored_position_is_protected_on_first_tick() {
    let h = harness_with(fast_settle_config(1), Some(2.0), None);

    let mut restored = tracked_position("BTCUSDT", 100.0, 1.6, 60);
    restored.stop_loss_price = None;
    restored.trailing_distance = None;
    assert!(restored.is_naked());
    h.ledger.insert(restored);
    h.venue.open_positions.lock().unwrap().push(remote_position("BTCUSDT", 1.6, 100.0, None));

    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.emergency_protected, 1);

    let position = h.ledger.get("BTCUSDT").unwrap();
    assert!(!position.is_naked());
    assert!(h.venue.protection_request_count() > 0);
}

#[tokio::test]
async fn lost_protection_is_resubmitted_stop_first() {
    let h = harness_with(fast_settle_config(1), None, None);

    let mut position = tracked_position("BTCUSDT", 100.0, 1.6, 60);
    position.trailing_distance = Some(1.5);
    position.trailing_activation_price = Some(103.0);
    h.ledger.insert(position);
    // Remote lost both protective orders.
    h.venue.open_positions.lock().unwrap().push(remote_position("BTCUSDT", 1.6, 100.0, None));

    let report = h.reconciliation.clone().tick().await.unwrap();
    assert_eq!(report.heals_started, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = h.venue.protection_calls.lock().unwrap();
    assert!(calls.len() >= 2);
    // Stop-loss re-submitted before the trailing stop.
    assert!(calls[0].1.stop_loss.is_some());
    assert!(calls[0].1.trailing_stop.is_none());
    assert!(calls[1].1.trailing_stop.is_some());
}

#[tokio::test]
async fn tick_refreshes_mark_price_and_unrealized() {
    let h = harness_with(fast_settle_config(1), None, None);
    h.ledger.insert(tracked_position("BTCUSDT", 100.0, 1.6, 60));
    h.venue.open_positions.lock().unwrap().push(remote_position("BTCUSDT", 1.6, 100.0, Some(96.0)));

    h.reconciliation.clone().tick().await.unwrap();

    let position = h.ledger.get("BTCUSDT").unwrap();
    assert_eq!(position.unrealized_pnl, Some(12.5));
    assert!((position.mark_price.unwrap() - 101.0).abs() < 1e-9);
}

// Scenario E: a backfill record whose id is already consumed is skipped and
// history stays untouched.
#[tokio::test]
async fn scenario_e_backfill_skips_consumed_ids() {
    let h = harness_with(fast_settle_config(1), None, None);

    h.ledger.consume_close_id("c-1");
    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-1", "BTCUSDT", 100.0, 104.0, 1.6, 6.4));

    let before = h.stats.snapshot(&h.ledger);
    let report = h.reconciliation.backfill_sweep().await.unwrap();
    let after = h.stats.snapshot(&h.ledger);

    assert_eq!(report.skipped_consumed, 1);
    assert_eq!(report.appended, 0);
    assert_eq!(h.ledger.history_len(), 0);
    assert_eq!(before.net_pnl, after.net_pnl);
    assert_eq!(before.closed_trades, after.closed_trades);
}

#[tokio::test]
async fn backfill_repairs_unresolved_rows_in_place() {
    let h = harness_with(fast_settle_config(1), None, None);

    h.ledger.append_trade(ClosedTrade {
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        entry_price: 100.0,
        exit_price: 102.0,
        quantity: 1.6,
        gross_pnl: 3.2,
        fees: TradeFees { open: 0.09, close: 0.09 },
        net_pnl: 3.02,
        exit_type: ExitType::Unresolved,
        entry_is_maker: false,
        exit_is_maker: false,
        close_order_id: None,
        open_time: Utc::now() - ChronoDuration::seconds(300),
        closed_at: Utc::now(),
    });
    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-7", "BTCUSDT", 100.1, 104.5, 1.6, 6.9));

    let report = h.reconciliation.backfill_sweep().await.unwrap();
    assert_eq!(report.repaired, 1);
    assert_eq!(report.appended, 0);

    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    let trade = &history[0];
    assert_eq!(trade.net_pnl, 6.9);
    assert_eq!(trade.close_order_id.as_deref(), Some("c-7"));
    assert!(!trade.is_unsettled());
    assert!(h.ledger.is_close_id_consumed("c-7"));

    // A second sweep sees the id as consumed and changes nothing.
    let report = h.reconciliation.backfill_sweep().await.unwrap();
    assert_eq!(report.skipped_consumed, 1);
    assert_eq!(h.ledger.history_len(), 1);
}

#[tokio::test]
async fn backfill_appends_missed_closures_once() {
    let h = harness_with(fast_settle_config(1), None, None);

    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-8", "SOLUSDT", 20.0, 21.0, 10.0, 9.6));
    h.venue
        .executions
        .lock()
        .unwrap()
        .insert("c-8".to_string(), vec![ExecutionRecord { fee: 0.11, is_maker: true }]);

    let report = h.reconciliation.backfill_sweep().await.unwrap();
    assert_eq!(report.appended, 1);

    let history = h.ledger.history_snapshot();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].symbol, "SOLUSDT");
    assert_eq!(history[0].net_pnl, 9.6);
    assert!((history[0].fees.close - 0.11).abs() < 1e-12);
    assert!(history[0].exit_is_maker);
    assert!(h.ledger.is_close_id_consumed("c-8"));

    // A same-symbol record close in time is already represented: neither
    // consumed nor appended.
    h.venue
        .closed_pnl
        .lock()
        .unwrap()
        .push(pnl_record("c-9", "SOLUSDT", 20.0, 21.1, 4.0, 2.2));
    let report = h.reconciliation.backfill_sweep().await.unwrap();
    assert_eq!(report.skipped_represented, 1);
    assert_eq!(report.appended, 0);
    assert!(!h.ledger.is_close_id_consumed("c-9"));
    assert_eq!(h.ledger.history_len(), 1);
}
