//! End-to-end pipeline tests driving the governance chain against the paper
//! venue and a shared store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use arbiter_config::{AppConfig, ExecutionSettings, FilterSettings};
use arbiter_core::{
    FillEvent, MarketSnapshot, OrderIntent, OrderStatus, Side, Signal, TradeReason,
    VirtualAccount,
};
use arbiter_engine::{EngineError, ExecutionLoop};
use arbiter_exchange::ExchangeEvents;
use arbiter_paper::PaperExchange;
use arbiter_store::Store;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    // Keep the window gate out of the way; the window tests live with the
    // filter unit tests where the clock is pinned.
    config.filters = FilterSettings {
        trading_window_start: String::new(),
        trading_window_end: String::new(),
        ..FilterSettings::default()
    };
    config
}

fn snapshot(symbol: &str, bid: f64, ask: f64, last: f64) -> MarketSnapshot {
    MarketSnapshot {
        symbol: symbol.into(),
        bid: Decimal::from_f64(bid).unwrap(),
        ask: Decimal::from_f64(ask).unwrap(),
        last: Decimal::from_f64(last).unwrap(),
        as_of: Utc::now(),
        source_latency_ms: 10.0,
    }
}

fn buy_signal(va_id: &str, symbol: &str, qty: i64, price: f64) -> Signal {
    Signal::new(
        va_id,
        symbol,
        Side::Buy,
        Decimal::from(qty),
        snapshot(symbol, price - 0.01, price + 0.01, price),
    )
}

fn sell_signal(va_id: &str, symbol: &str, qty: i64, price: f64) -> Signal {
    Signal::new(
        va_id,
        symbol,
        Side::Sell,
        Decimal::from(qty),
        snapshot(symbol, price - 0.01, price + 0.01, price),
    )
}

struct Harness {
    engine: Arc<ExecutionLoop>,
    store: Arc<Store>,
    venue: PaperExchange,
    _events: ExchangeEvents,
}

fn harness_with(config: AppConfig, accounts: &[&str]) -> Harness {
    let store = Arc::new(Store::open_in_memory().unwrap());
    for va_id in accounts {
        store
            .create_va(&VirtualAccount::new(*va_id, Decimal::from(100_000)))
            .unwrap();
    }
    let (venue, events) = PaperExchange::new("paper");
    venue.set_auto_fill(false);
    let engine = Arc::new(
        ExecutionLoop::build(&config, Arc::clone(&store), Arc::new(venue.clone())).unwrap(),
    );
    engine.rehydrate().unwrap();
    Harness {
        engine,
        store,
        venue,
        _events: events,
    }
}

fn harness(accounts: &[&str]) -> Harness {
    harness_with(test_config(), accounts)
}

impl Harness {
    /// Entry order regardless of terminal state; filled entries are located
    /// through their protective stop's back-link.
    fn entry_order_any(&self, symbol: &str) -> arbiter_core::Order {
        let open = self.store.open_orders_for_symbol(symbol).unwrap();
        if let Some(order) = open.iter().find(|o| o.intent == OrderIntent::Entry) {
            return order.clone();
        }
        let stop = open
            .iter()
            .find(|o| o.intent == OrderIntent::StopLoss)
            .expect("stop order to locate entry");
        self.store
            .get_order(stop.linked_entry_id.as_deref().unwrap())
            .unwrap()
            .unwrap()
    }

    /// The single live entry order for a symbol.
    fn entry_order(&self, symbol: &str) -> arbiter_core::Order {
        self.store
            .open_orders_for_symbol(symbol)
            .unwrap()
            .into_iter()
            .find(|order| order.intent == OrderIntent::Entry)
            .expect("entry order")
    }

    fn exit_order(&self, symbol: &str) -> arbiter_core::Order {
        self.store
            .open_orders_for_symbol(symbol)
            .unwrap()
            .into_iter()
            .find(|order| order.intent == OrderIntent::ReduceOnlyExit)
            .expect("reduce-only exit order")
    }

    async fn fill(&self, order_id: &str, qty: i64, price: f64) {
        self.fill_decimal(order_id, Decimal::from(qty), Decimal::from_f64(price).unwrap())
            .await;
    }

    async fn fill_decimal(&self, order_id: &str, qty: Decimal, price: Decimal) {
        self.engine
            .order_manager()
            .apply_fill(FillEvent {
                order_id: order_id.to_string(),
                qty_increment: qty,
                price,
                ts: Utc::now(),
            })
            .await
            .unwrap();
    }

    /// Open a position by pushing one signal through the pipeline and
    /// filling the entry in full.
    async fn open_position(&self, va_id: &str, symbol: &str, qty: i64, price: f64) {
        self.engine
            .handle_signal(buy_signal(va_id, symbol, qty, price))
            .await;
        let entry = self.entry_order(symbol);
        self.fill(&entry.order_id, qty, price).await;
    }

    /// Close the open position with a manual exit filled at `price`.
    async fn close_position(&self, va_id: &str, symbol: &str, qty: i64, price: f64) {
        self.engine
            .handle_signal(sell_signal(va_id, symbol, qty, price))
            .await;
        let exit = self.exit_order(symbol);
        self.fill(&exit.order_id, qty, price).await;
    }
}

#[tokio::test]
async fn one_symbol_per_account_is_enforced() {
    let h = harness(&["VA001"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;
    assert!(h.store.get_position("VA001", "AAPL").unwrap().is_some());

    h.engine
        .handle_signal(buy_signal("VA001", "GOOGL", 5, 120.0))
        .await;

    assert!(h.store.open_orders_for_symbol("GOOGL").unwrap().is_empty());
    assert_eq!(h.engine.stats().rejected(), 1);
}

#[tokio::test]
async fn symbol_ownership_blocks_other_accounts_at_placement() {
    let h = harness(&["VA001", "VA002"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;

    // VA002 is free as far as its own router slot goes, but the symbol is
    // owned globally.
    h.engine
        .handle_signal(buy_signal("VA002", "AAPL", 5, 100.0))
        .await;
    let orders = h.store.open_orders_for_symbol("AAPL").unwrap();
    assert!(orders.iter().all(|order| order.va_id == "VA001"));
}

#[tokio::test]
async fn three_losses_activate_cooldown_and_block_signals() {
    let h = harness(&["VA002"]);
    for _ in 0..3 {
        h.open_position("VA002", "AAPL", 10, 100.0).await;
        h.close_position("VA002", "AAPL", 10, 99.5).await;
    }

    let va = h.store.expect_va("VA002").unwrap();
    assert_eq!(va.consecutive_losses, 3);
    assert!(va.in_cooldown(Utc::now()));

    let rejected_before = h.engine.stats().rejected();
    h.engine
        .handle_signal(buy_signal("VA002", "AAPL", 10, 100.0))
        .await;
    assert_eq!(h.engine.stats().rejected(), rejected_before + 1);
    assert!(h.store.open_orders_for_symbol("AAPL").unwrap().is_empty());
}

#[tokio::test]
async fn entry_fill_attaches_linked_stop_loss() {
    let h = harness(&["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");
    assert_eq!(entry.stop_loss_price, Some(Decimal::from(98)));

    h.fill(&entry.order_id, 10, 100.0).await;

    let stop = h
        .store
        .live_stop_for_entry(&entry.order_id)
        .unwrap()
        .expect("protective stop");
    assert_eq!(stop.side, Side::Sell);
    assert_eq!(stop.intent, OrderIntent::StopLoss);
    assert_eq!(stop.qty_requested, Decimal::from(10));
    assert_eq!(stop.stop_loss_price, Some(Decimal::from(98)));

    let position = h.store.get_position("VA001", "AAPL").unwrap().unwrap();
    assert_eq!(position.stop_loss_price, Decimal::from(98));
}

#[tokio::test]
async fn wide_spread_is_rejected_before_any_order() {
    let h = harness(&["VA001"]);
    let mut signal = buy_signal("VA001", "AAPL", 10, 100.10);
    signal.snapshot = snapshot("AAPL", 100.00, 100.20, 100.10);
    h.engine.handle_signal(signal).await;

    assert_eq!(h.engine.stats().rejected(), 1);
    assert!(h.store.open_orders_for_symbol("AAPL").unwrap().is_empty());
}

#[tokio::test]
async fn stop_trigger_exits_books_trade_and_releases_symbol() {
    let h = harness(&["VA001"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;

    h.engine
        .order_manager()
        .on_snapshot(&snapshot("AAPL", 97.90, 98.00, 97.95))
        .await
        .unwrap();

    let exit = h.exit_order("AAPL");
    assert_eq!(exit.qty_requested, Decimal::from(10));
    h.fill(&exit.order_id, 10, 97.95).await;

    assert!(h.store.get_position("VA001", "AAPL").unwrap().is_none());
    let trades = h.store.trades_for_va("VA001").unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].reason, TradeReason::StopLoss);
    assert_eq!(trades[0].realized_pnl, Decimal::from_f64(-20.5).unwrap());

    let va = h.store.expect_va("VA001").unwrap();
    assert_eq!(va.realized_pnl, Decimal::from_f64(-20.5).unwrap());
    assert_eq!(va.losses, 1);

    // Symbol released: a different symbol is routable again.
    h.engine
        .handle_signal(buy_signal("VA001", "GOOGL", 5, 120.0))
        .await;
    assert!(!h.store.open_orders_for_symbol("GOOGL").unwrap().is_empty());
}

#[tokio::test]
async fn partial_fills_merge_into_weighted_average_and_resize_stop() {
    let h = harness(&["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    h.fill(&entry.order_id, 4, 100.0).await;
    h.fill(&entry.order_id, 6, 101.0).await;

    let position = h.store.get_position("VA001", "AAPL").unwrap().unwrap();
    assert_eq!(position.qty, Decimal::from(10));
    assert_eq!(position.avg_entry_price, Decimal::from_f64(100.6).unwrap());

    let order = h.store.get_order(&entry.order_id).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    assert_eq!(order.avg_fill_price, Some(Decimal::from_f64(100.6).unwrap()));

    let stop = h
        .store
        .live_stop_for_entry(&entry.order_id)
        .unwrap()
        .expect("protective stop");
    assert_eq!(stop.qty_requested, Decimal::from(10));
}

#[tokio::test]
async fn partial_reduce_signal_shrinks_without_closing() {
    let h = harness(&["VA001"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;

    // The signal asks to reduce by 4; the exit must be sized by the request,
    // not by the whole position.
    h.engine
        .handle_signal(sell_signal("VA001", "AAPL", 4, 102.0))
        .await;
    let exit = h.exit_order("AAPL");
    assert_eq!(exit.qty_requested, Decimal::from(4));
    h.fill(&exit.order_id, 4, 102.0).await;

    let position = h.store.get_position("VA001", "AAPL").unwrap().unwrap();
    assert_eq!(position.qty, Decimal::from(6));
    // No trade yet; the realized portion folds into the eventual close.
    assert!(h.store.trades_for_va("VA001").unwrap().is_empty());

    // The resting stop was resized down to the remaining quantity.
    let stop = h
        .store
        .open_orders_for_symbol("AAPL")
        .unwrap()
        .into_iter()
        .find(|o| o.intent == OrderIntent::StopLoss)
        .expect("protective stop");
    assert_eq!(stop.qty_requested, Decimal::from(6));

    // Closing the remainder books one trade covering the full round trip.
    h.engine
        .handle_signal(sell_signal("VA001", "AAPL", 6, 102.0))
        .await;
    let exit = h.exit_order("AAPL");
    assert_eq!(exit.qty_requested, Decimal::from(6));
    h.fill(&exit.order_id, 6, 102.0).await;

    assert!(h.store.get_position("VA001", "AAPL").unwrap().is_none());
    let trades = h.store.trades_for_va("VA001").unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].qty, Decimal::from(10));
    assert_eq!(trades[0].exit_price, Decimal::from(102));
    assert_eq!(trades[0].realized_pnl, Decimal::from(20));

    let va = h.store.expect_va("VA001").unwrap();
    assert_eq!(va.realized_pnl, Decimal::from(20));
    assert_eq!(h.store.sum_trade_pnl("VA001").unwrap(), va.realized_pnl);
}

#[tokio::test]
async fn inconsistent_fill_is_rejected_and_reported() {
    let h = harness(&["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    let err = h
        .engine
        .order_manager()
        .apply_fill(FillEvent {
            order_id: entry.order_id.clone(),
            qty_increment: Decimal::from(12),
            price: Decimal::from(100),
            ts: Utc::now(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InconsistentFill { .. }));

    // Never auto-corrected: the order is untouched and no position exists.
    let order = h.store.get_order(&entry.order_id).unwrap().unwrap();
    assert_eq!(order.qty_filled, Decimal::ZERO);
    assert!(h.store.get_position("VA001", "AAPL").unwrap().is_none());
    let incidents = h.store.list_incidents(5).unwrap();
    assert!(incidents.iter().any(|i| i.kind == "inconsistent_fill"));
}

#[tokio::test]
async fn out_of_order_fills_are_dropped() {
    let h = harness(&["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    let newer = Utc::now();
    let older = newer - Duration::seconds(5);
    h.engine
        .order_manager()
        .apply_fill(FillEvent {
            order_id: entry.order_id.clone(),
            qty_increment: Decimal::from(4),
            price: Decimal::from(100),
            ts: newer,
        })
        .await
        .unwrap();
    h.engine
        .order_manager()
        .apply_fill(FillEvent {
            order_id: entry.order_id.clone(),
            qty_increment: Decimal::from(6),
            price: Decimal::from(101),
            ts: older,
        })
        .await
        .unwrap();

    let order = h.store.get_order(&entry.order_id).unwrap().unwrap();
    assert_eq!(order.qty_filled, Decimal::from(4));
}

#[tokio::test]
async fn failed_stop_attach_panic_closes_the_position() {
    let h = harness(&["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    h.venue.reject_stop_orders(true);
    let err = h
        .engine
        .order_manager()
        .apply_fill(FillEvent {
            order_id: entry.order_id.clone(),
            qty_increment: Decimal::from(10),
            price: Decimal::from(100),
            ts: Utc::now(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StopLossAttachFailed { .. }));

    // The position is not left naked: a market reduce-only exit is in flight.
    let exit = h.exit_order("AAPL");
    assert_eq!(exit.qty_requested, Decimal::from(10));

    let incidents = h.store.list_incidents(10).unwrap();
    assert!(incidents.iter().any(|i| i.kind == "stop_attach_failed"));
    assert!(incidents.iter().any(|i| i.kind == "panic_close"));
}

#[tokio::test]
async fn reconciliation_cancels_stale_pending_orders() {
    let mut config = test_config();
    config.execution = ExecutionSettings {
        stale_threshold_seconds: 0,
        ..ExecutionSettings::default()
    };
    let h = harness_with(config, &["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    h.engine.order_manager().reconcile(Utc::now()).await.unwrap();

    let order = h.store.get_order(&entry.order_id).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Canceled);
}

#[tokio::test]
async fn reconciliation_adopts_fills_the_stream_missed() {
    let mut config = test_config();
    config.execution = ExecutionSettings {
        stale_threshold_seconds: 0,
        ..ExecutionSettings::default()
    };
    let h = harness_with(config, &["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    let entry = h.entry_order("AAPL");

    // The venue executed, but the fill event never reached the engine.
    h.venue
        .fill(&entry.order_id, Decimal::from(10), Decimal::from(100))
        .await;

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    h.engine.order_manager().reconcile(Utc::now()).await.unwrap();

    let order = h.store.get_order(&entry.order_id).unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Filled);
    let position = h.store.get_position("VA001", "AAPL").unwrap().unwrap();
    assert_eq!(position.qty, Decimal::from(10));
    // The catch-up fill also attached protection.
    assert!(h
        .store
        .live_stop_for_entry(&entry.order_id)
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn unreachable_venue_escalates_after_repeated_passes() {
    let mut config = test_config();
    config.execution = ExecutionSettings {
        stale_threshold_seconds: 0,
        reconcile_failure_limit: 3,
        exchange_call_timeout_ms: 50,
        ..ExecutionSettings::default()
    };
    let h = harness_with(config, &["VA001"]);
    h.engine
        .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
        .await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    h.venue.set_offline(true);
    let manager = h.engine.order_manager();
    assert!(manager.reconcile(Utc::now()).await.is_ok());
    assert!(manager.reconcile(Utc::now()).await.is_ok());
    let err = manager.reconcile(Utc::now()).await.unwrap_err();
    assert!(matches!(err, EngineError::ReconciliationTimeout));
    let incidents = h.store.list_incidents(5).unwrap();
    assert!(incidents.iter().any(|i| i.kind == "reconciliation_timeout"));
}

#[tokio::test]
async fn reconciliation_reattaches_missing_stops() {
    let h = harness(&["VA001"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;
    let entry = h.entry_order_any("AAPL");

    // Kill the resting stop behind the engine's back.
    let mut stop = h
        .store
        .live_stop_for_entry(&entry.order_id)
        .unwrap()
        .unwrap();
    stop.status = OrderStatus::Canceled;
    h.store.save_order(&stop).unwrap();

    h.engine.order_manager().reconcile(Utc::now()).await.unwrap();

    let open = h.store.open_orders_for_symbol("AAPL").unwrap();
    assert!(open.iter().any(|o| o.intent == OrderIntent::StopLoss));
}

#[tokio::test]
async fn accounting_stays_consistent_across_round_trips() {
    let h = harness(&["VA003"]);
    h.open_position("VA003", "TSLA", 10, 100.0).await;
    h.close_position("VA003", "TSLA", 10, 103.0).await;
    h.open_position("VA003", "TSLA", 4, 103.0).await;
    h.close_position("VA003", "TSLA", 4, 101.5).await;

    let va = h.store.expect_va("VA003").unwrap();
    assert_eq!(h.store.sum_trade_pnl("VA003").unwrap(), va.realized_pnl);
    assert_eq!(va.wins, 1);
    assert_eq!(va.losses, 1);
    assert_eq!(va.balance, Decimal::from(100_000) + va.realized_pnl);
}

#[tokio::test]
async fn dashboard_snapshot_reflects_state_without_mutation() {
    let h = harness(&["VA001"]);
    h.open_position("VA001", "AAPL", 10, 100.0).await;

    let before = h.store.list_positions().unwrap();
    let view = h.engine.snapshot(Utc::now()).unwrap();
    assert_eq!(view.accounts.len(), 1);
    assert_eq!(view.positions.len(), 1);
    assert_eq!(view.positions[0].stop_loss_price, Decimal::from(98));
    assert_eq!(view.system.reconcile_interval_secs, 5);
    assert!(!view.system.kill_switch);
    assert_eq!(h.store.list_positions().unwrap().len(), before.len());
}

#[tokio::test]
async fn full_loop_round_trip_over_the_event_stream() {
    let config = test_config();
    let store = Arc::new(Store::open_in_memory().unwrap());
    store
        .create_va(&VirtualAccount::new("VA001", Decimal::from(100_000)))
        .unwrap();
    let (venue, events) = PaperExchange::new("paper");
    let engine = Arc::new(
        ExecutionLoop::build(&config, Arc::clone(&store), Arc::new(venue.clone())).unwrap(),
    );
    let shutdown = engine.shutdown_signal();
    let queue = engine.queue();
    let runner = tokio::spawn(Arc::clone(&engine).run(events));

    venue.push_snapshot(snapshot("AAPL", 99.99, 100.01, 100.0)).await;
    queue.push(buy_signal("VA001", "AAPL", 10, 100.0));

    // Auto-fill plus the pump need a few ticks to settle.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let position = store.get_position("VA001", "AAPL").unwrap();
    assert!(position.is_some(), "entry should have filled into a position");

    shutdown.trigger();
    runner.await.unwrap().unwrap();

    // Graceful shutdown leaves the protective stop resting on the venue.
    let open = store.open_orders().unwrap();
    assert!(open.iter().any(|o| o.intent == OrderIntent::StopLoss));
}

#[tokio::test]
async fn state_survives_restart_including_peak_equity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arbiter.db");
    {
        let store = Arc::new(Store::open(&path).unwrap());
        store
            .create_va(&VirtualAccount::new("VA001", Decimal::from(100_000)))
            .unwrap();
        let (venue, _events) = PaperExchange::new("paper");
        venue.set_auto_fill(false);
        let engine = Arc::new(
            ExecutionLoop::build(&test_config(), Arc::clone(&store), Arc::new(venue.clone()))
                .unwrap(),
        );
        engine.rehydrate().unwrap();

        // One winning round trip lifts peak equity, then a position is left open.
        engine
            .handle_signal(buy_signal("VA001", "AAPL", 10, 100.0))
            .await;
        let entry = store
            .open_orders_for_symbol("AAPL")
            .unwrap()
            .into_iter()
            .find(|o| o.intent == OrderIntent::Entry)
            .unwrap();
        engine
            .order_manager()
            .apply_fill(FillEvent {
                order_id: entry.order_id.clone(),
                qty_increment: Decimal::from(10),
                price: Decimal::from(100),
                ts: Utc::now(),
            })
            .await
            .unwrap();
        engine
            .handle_signal(sell_signal("VA001", "AAPL", 10, 102.0))
            .await;
        let exit = store
            .open_orders_for_symbol("AAPL")
            .unwrap()
            .into_iter()
            .find(|o| o.intent == OrderIntent::ReduceOnlyExit)
            .unwrap();
        engine
            .order_manager()
            .apply_fill(FillEvent {
                order_id: exit.order_id.clone(),
                qty_increment: Decimal::from(10),
                price: Decimal::from(102),
                ts: Utc::now(),
            })
            .await
            .unwrap();
        engine
            .handle_signal(buy_signal("VA001", "MSFT", 5, 300.0))
            .await;
        let entry = store
            .open_orders_for_symbol("MSFT")
            .unwrap()
            .into_iter()
            .find(|o| o.intent == OrderIntent::Entry)
            .unwrap();
        engine
            .order_manager()
            .apply_fill(FillEvent {
                order_id: entry.order_id.clone(),
                qty_increment: Decimal::from(5),
                price: Decimal::from(300),
                ts: Utc::now(),
            })
            .await
            .unwrap();
    }

    // Fresh process: peak equity persisted, reservations rehydrate from the
    // open position and keep enforcing the one-symbol rule.
    let store = Arc::new(Store::open(&path).unwrap());
    let va = store.expect_va("VA001").unwrap();
    assert_eq!(va.peak_equity, Decimal::from(100_020));

    let (venue, _events) = PaperExchange::new("paper");
    venue.set_auto_fill(false);
    let engine = Arc::new(
        ExecutionLoop::build(&test_config(), Arc::clone(&store), Arc::new(venue.clone()))
            .unwrap(),
    );
    engine.rehydrate().unwrap();
    engine
        .handle_signal(buy_signal("VA001", "TSLA", 5, 200.0))
        .await;
    assert!(store.open_orders_for_symbol("TSLA").unwrap().is_empty());
}

