//! Order lifecycle, mandatory stop-loss enforcement, fill accounting,
//! reconciliation and stop-loss trigger detection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use arbiter_config::ExecutionSettings;
use arbiter_core::{
    FillEvent, MarketSnapshot, Order, OrderId, OrderIntent, OrderStatus, Position, Price,
    Quantity, Side, Signal, Symbol, Trade, TradeReason, VaId,
};
use arbiter_exchange::{ExchangeClient, ExchangeError, OrderSpec};
use arbiter_store::{Store, StoreError};

use crate::governor::Governor;
use crate::router::SignalRouter;
use crate::{EngineError, EngineResult};

/// Knobs governing order handling.
#[derive(Clone, Debug)]
pub struct OrderPolicy {
    /// Stop distance from the entry reference price, in percent.
    pub stop_loss_pct: Decimal,
    /// Age without progress after which an open order is reconciled.
    pub stale_threshold: Duration,
    /// Per-call deadline on every exchange round trip.
    pub call_timeout: StdDuration,
    /// Consecutive stop-attach failures before the kill switch engages.
    pub sl_attach_failure_limit: u32,
    /// Consecutive unreachable reconciliation passes before escalating.
    pub reconcile_failure_limit: u32,
}

impl OrderPolicy {
    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self {
            stop_loss_pct: settings.stop_loss_percentage,
            stale_threshold: Duration::seconds(settings.stale_threshold_seconds as i64),
            call_timeout: StdDuration::from_millis(settings.exchange_call_timeout_ms),
            sl_attach_failure_limit: settings.sl_attach_failure_limit,
            reconcile_failure_limit: settings.reconcile_failure_limit,
        }
    }
}

/// Protective price for an entry at `reference`: below for longs, above for
/// shorts.
#[must_use]
pub fn stop_price(reference: Price, side: Side, stop_loss_pct: Decimal) -> Price {
    let fraction = stop_loss_pct / Decimal::from(100);
    match side {
        Side::Buy => reference * (Decimal::ONE - fraction),
        Side::Sell => reference * (Decimal::ONE + fraction),
    }
}

#[derive(Default)]
struct ExitAccumulator {
    qty: Quantity,
    notional: Price,
    realized: Price,
}

/// Owns every order mutation and the position lifecycle that follows from
/// fills. All durable writes go through the store; the governor and router
/// caches are updated only after a commit succeeds.
pub struct OrderManager {
    store: Arc<Store>,
    exchange: Arc<dyn ExchangeClient>,
    governor: Arc<Governor>,
    router: Arc<SignalRouter>,
    policy: OrderPolicy,
    kill_switch: Arc<AtomicBool>,
    sl_attach_failures: AtomicU32,
    reconcile_failures: AtomicU32,
    last_fill_ts: Mutex<HashMap<OrderId, DateTime<Utc>>>,
    exit_reasons: Mutex<HashMap<OrderId, TradeReason>>,
    exit_accumulators: Mutex<HashMap<(VaId, Symbol), ExitAccumulator>>,
}

impl OrderManager {
    pub fn new(
        store: Arc<Store>,
        exchange: Arc<dyn ExchangeClient>,
        governor: Arc<Governor>,
        router: Arc<SignalRouter>,
        policy: OrderPolicy,
        kill_switch: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            exchange,
            governor,
            router,
            policy,
            kill_switch,
            sl_attach_failures: AtomicU32::new(0),
            reconcile_failures: AtomicU32::new(0),
            last_fill_ts: Mutex::new(HashMap::new()),
            exit_reasons: Mutex::new(HashMap::new()),
            exit_accumulators: Mutex::new(HashMap::new()),
        }
    }

    // ---- placement ------------------------------------------------------

    /// Place an entry order for an admitted signal. The stop price is fixed
    /// here from the reference price; the stop order itself is attached on
    /// the first fill.
    pub async fn place_entry(&self, signal: &Signal) -> EngineResult<Order> {
        // Ownership re-check at the placement boundary; the router only sees
        // its own account's reservation.
        if let Some(owner) = self.store.symbol_owner(&signal.symbol)? {
            if owner != signal.va_id {
                return Err(EngineError::Store(StoreError::SymbolOwned {
                    symbol: signal.symbol.clone(),
                }));
            }
        }

        let now = Utc::now();
        let reference = signal.expected_price.unwrap_or(signal.snapshot.last);
        let stop = stop_price(reference, signal.side, self.policy.stop_loss_pct);
        let order = Order::new(
            signal.va_id.clone(),
            signal.symbol.clone(),
            signal.side,
            OrderIntent::Entry,
            signal.desired_qty,
            now,
        )
        .with_stop_loss(stop);
        self.store.save_order(&order)?;

        let spec = OrderSpec {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty_requested,
            reduce_only: false,
            trigger_price: None,
        };
        self.submit_or_mark(order, spec).await
    }

    /// Submit a reduce-only market exit for up to `qty` of the position.
    /// Reduce-only never flips: the requested quantity is clamped to what is
    /// actually held.
    pub async fn place_exit(
        &self,
        position: &Position,
        qty: Quantity,
        reason: TradeReason,
    ) -> EngineResult<Order> {
        let now = Utc::now();
        let qty = std::cmp::min(qty, position.qty);
        let order = Order::new(
            position.va_id.clone(),
            position.symbol.clone(),
            position.side.inverse(),
            OrderIntent::ReduceOnlyExit,
            qty,
            now,
        );
        self.store.save_order(&order)?;
        self.exit_reasons
            .lock()
            .unwrap()
            .insert(order.order_id.clone(), reason);

        let spec = OrderSpec {
            order_id: order.order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty_requested,
            reduce_only: true,
            trigger_price: None,
        };
        self.submit_or_mark(order, spec).await
    }

    /// Shared submission tail: rejections turn the order terminal, timeouts
    /// leave it pending for reconciliation to resolve, acks refresh the
    /// progress clock.
    async fn submit_or_mark(&self, mut order: Order, spec: OrderSpec) -> EngineResult<Order> {
        match timeout(self.policy.call_timeout, self.exchange.submit_order(spec)).await {
            Ok(Ok(_ack)) => {
                order.last_update_at = Utc::now();
                self.store.save_order(&order)?;
                info!(
                    order_id = %order.order_id,
                    va_id = %order.va_id,
                    symbol = %order.symbol,
                    side = ?order.side,
                    intent = ?order.intent,
                    qty = %order.qty_requested,
                    "order submitted"
                );
                Ok(order)
            }
            Ok(Err(err)) if err.is_transient() => {
                warn!(
                    order_id = %order.order_id,
                    error = %err,
                    "submission outcome unknown, reconciliation will resolve"
                );
                Ok(order)
            }
            Ok(Err(err)) => {
                order.status = OrderStatus::Rejected;
                order.last_update_at = Utc::now();
                self.store.save_order(&order)?;
                warn!(order_id = %order.order_id, error = %err, "order rejected by exchange");
                Err(EngineError::ExchangeRejected(err.to_string()))
            }
            Err(_elapsed) => {
                warn!(
                    order_id = %order.order_id,
                    "submission timed out, order state unknown until reconciliation"
                );
                Ok(order)
            }
        }
    }

    // ---- fill processing ------------------------------------------------

    /// Apply one fill event atomically: order progress plus the position,
    /// trade and account consequences.
    pub async fn apply_fill(&self, fill: FillEvent) -> EngineResult<()> {
        let Some(mut order) = self.store.get_order(&fill.order_id)? else {
            warn!(order_id = %fill.order_id, "fill for unknown order dropped");
            return Ok(());
        };

        {
            let mut seen = self.last_fill_ts.lock().unwrap();
            if let Some(prev) = seen.get(&order.order_id) {
                if fill.ts < *prev {
                    warn!(
                        order_id = %order.order_id,
                        fill_ts = %fill.ts,
                        newest_ts = %prev,
                        "out-of-order fill dropped"
                    );
                    return Ok(());
                }
            }
            seen.insert(order.order_id.clone(), fill.ts);
        }

        if order.status.is_terminal() {
            warn!(
                order_id = %order.order_id,
                status = ?order.status,
                "fill after terminal status ignored"
            );
            return Ok(());
        }

        if order.qty_filled + fill.qty_increment > order.qty_requested {
            self.store.record_incident(
                "inconsistent_fill",
                &format!(
                    "order {} reported {} filled beyond requested {}",
                    order.order_id,
                    order.qty_filled + fill.qty_increment,
                    order.qty_requested
                ),
            )?;
            return Err(EngineError::InconsistentFill {
                order_id: order.order_id,
            });
        }

        order.record_fill(fill.qty_increment, fill.price, fill.ts);
        debug!(
            order_id = %order.order_id,
            qty = %fill.qty_increment,
            price = %fill.price,
            cumulative = %order.qty_filled,
            "fill applied"
        );

        match order.intent {
            OrderIntent::Entry => self.on_entry_fill(order, &fill).await,
            OrderIntent::ReduceOnlyExit | OrderIntent::StopLoss => {
                self.on_exit_fill(order, &fill).await
            }
        }
    }

    async fn on_entry_fill(&self, order: Order, fill: &FillEvent) -> EngineResult<()> {
        let existing = self.store.get_position(&order.va_id, &order.symbol)?;
        let newly_opened = existing.is_none();
        let protective = order
            .stop_loss_price
            .unwrap_or_else(|| stop_price(fill.price, order.side, self.policy.stop_loss_pct));

        let mut position = match existing {
            Some(mut position) => {
                position.add_fill(fill.qty_increment, fill.price);
                position.stop_loss_price = protective;
                position
            }
            None => Position::open(
                order.va_id.clone(),
                order.symbol.clone(),
                order.side,
                fill.qty_increment,
                fill.price,
                protective,
                fill.ts,
            ),
        };
        position.mark(fill.price);

        match self.store.apply_entry_fill(&order, &position, newly_opened) {
            Ok(()) => {}
            Err(StoreError::SymbolOwned { symbol }) => {
                // The global constraint caught a conflicting fill; the venue
                // position exists, so it must not stay unbooked and naked.
                self.store.record_incident(
                    "symbol_ownership_violation",
                    &format!("entry fill on {symbol} conflicts with another account"),
                )?;
                self.panic_close(&order, order.qty_filled).await?;
                return Err(EngineError::Store(StoreError::SymbolOwned { symbol }));
            }
            Err(err) => return Err(err.into()),
        }
        if newly_opened {
            self.governor.on_position_opened(&order.va_id);
        }

        self.ensure_stop(&order).await
    }

    /// Guarantee a live protective stop sized to the entry's cumulative
    /// fill. Resizes by cancel-and-replace when a partial fill grows the
    /// position under a resting stop.
    async fn ensure_stop(&self, entry: &Order) -> EngineResult<()> {
        let Some(trigger) = entry.stop_loss_price else {
            return Ok(());
        };
        match self.store.live_stop_for_entry(&entry.order_id)? {
            Some(stop) if stop.qty_requested == entry.qty_filled => Ok(()),
            Some(mut stop) => {
                debug!(
                    stop_id = %stop.order_id,
                    old_qty = %stop.qty_requested,
                    new_qty = %entry.qty_filled,
                    "resizing protective stop"
                );
                let _ = timeout(
                    self.policy.call_timeout,
                    self.exchange.cancel_order(&stop.order_id),
                )
                .await;
                stop.status = OrderStatus::Canceled;
                stop.last_update_at = Utc::now();
                self.store.save_order(&stop)?;
                self.submit_protective_stop(
                    &entry.va_id,
                    &entry.symbol,
                    entry.side,
                    entry.qty_filled,
                    trigger,
                    Some(entry.order_id.clone()),
                )
                .await
            }
            None => {
                self.submit_protective_stop(
                    &entry.va_id,
                    &entry.symbol,
                    entry.side,
                    entry.qty_filled,
                    trigger,
                    Some(entry.order_id.clone()),
                )
                .await
            }
        }
    }

    /// Persist and submit a resting stop. A venue rejection is a safety
    /// fault: incident, failure counter (kill switch past the limit) and
    /// panic-close of the unprotected quantity.
    async fn submit_protective_stop(
        &self,
        va_id: &str,
        symbol: &str,
        position_side: Side,
        qty: Quantity,
        trigger: Price,
        linked_entry: Option<OrderId>,
    ) -> EngineResult<()> {
        let now = Utc::now();
        let mut stop = Order::new(
            va_id.to_string(),
            symbol.to_string(),
            position_side.inverse(),
            OrderIntent::StopLoss,
            qty,
            now,
        )
        .with_stop_loss(trigger);
        stop.linked_entry_id = linked_entry.clone();
        self.store.save_order(&stop)?;

        let spec = OrderSpec {
            order_id: stop.order_id.clone(),
            symbol: symbol.to_string(),
            side: stop.side,
            qty,
            reduce_only: true,
            trigger_price: Some(trigger),
        };
        match timeout(self.policy.call_timeout, self.exchange.submit_order(spec)).await {
            Ok(Ok(_ack)) => {
                self.sl_attach_failures.store(0, Ordering::SeqCst);
                stop.last_update_at = Utc::now();
                self.store.save_order(&stop)?;
                info!(
                    stop_id = %stop.order_id,
                    symbol,
                    trigger = %trigger,
                    qty = %qty,
                    "protective stop resting"
                );
                Ok(())
            }
            Ok(Err(err)) if err.is_transient() => {
                warn!(
                    stop_id = %stop.order_id,
                    error = %err,
                    "stop submission unresolved, reconciliation will re-enforce"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                stop.status = OrderStatus::Rejected;
                stop.last_update_at = Utc::now();
                self.store.save_order(&stop)?;
                self.on_stop_attach_failure(va_id, symbol, linked_entry, &err)
                    .await
            }
            Err(_elapsed) => {
                warn!(
                    stop_id = %stop.order_id,
                    "stop submission timed out, reconciliation will re-enforce"
                );
                Ok(())
            }
        }
    }

    async fn on_stop_attach_failure(
        &self,
        va_id: &str,
        symbol: &str,
        linked_entry: Option<OrderId>,
        err: &ExchangeError,
    ) -> EngineResult<()> {
        self.store.record_incident(
            "stop_attach_failed",
            &format!("stop for {va_id}/{symbol} rejected: {err}"),
        )?;
        let failures = self.sl_attach_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.policy.sl_attach_failure_limit
            && !self.kill_switch.swap(true, Ordering::SeqCst)
        {
            self.store.record_incident(
                "kill_switch_engaged",
                &format!("{failures} consecutive stop attach failures"),
            )?;
            error!(failures, "kill switch engaged after repeated stop attach failures");
        }

        if let Some(position) = self.store.get_position(va_id, symbol)? {
            warn!(va_id, symbol, "panic-closing unprotected position");
            self.store.record_incident(
                "panic_close",
                &format!("market exit of {} {symbol} for {va_id}", position.qty),
            )?;
            self.place_exit(&position, position.qty, TradeReason::StopLoss)
                .await?;
        }

        Err(EngineError::StopLossAttachFailed {
            entry_id: linked_entry.unwrap_or_default(),
        })
    }

    /// Market reduce-only of a freshly filled quantity that cannot be booked
    /// or protected.
    async fn panic_close(&self, entry: &Order, qty: Quantity) -> EngineResult<()> {
        let position = Position::open(
            entry.va_id.clone(),
            entry.symbol.clone(),
            entry.side,
            qty,
            entry.avg_fill_price.unwrap_or_default(),
            entry.stop_loss_price.unwrap_or_default(),
            Utc::now(),
        );
        self.place_exit(&position, qty, TradeReason::StopLoss).await?;
        Ok(())
    }

    async fn on_exit_fill(&self, order: Order, fill: &FillEvent) -> EngineResult<()> {
        let Some(mut position) = self.store.get_position(&order.va_id, &order.symbol)? else {
            warn!(
                order_id = %order.order_id,
                symbol = %order.symbol,
                "exit fill without a tracked position"
            );
            self.store.save_order(&order)?;
            return Ok(());
        };

        let closing_qty = std::cmp::min(fill.qty_increment, position.qty);
        let realized = position.realized_on_exit(closing_qty, fill.price);
        let remaining = position.qty - closing_qty;
        let key = (order.va_id.clone(), order.symbol.clone());

        if remaining > Decimal::ZERO {
            position.qty = remaining;
            position.mark(fill.price);
            self.store.apply_exit_fill(&order, &position)?;
            {
                let mut accumulators = self.exit_accumulators.lock().unwrap();
                let acc = accumulators.entry(key).or_default();
                acc.qty += closing_qty;
                acc.notional += fill.price * closing_qty;
                acc.realized += realized;
            }
            debug!(
                order_id = %order.order_id,
                remaining = %remaining,
                realized = %realized,
                "position partially closed"
            );
            self.resync_stop_to_position(&position).await;
            return Ok(());
        }

        // Full close: fold any earlier partial exits into the trade record.
        let mut acc = self
            .exit_accumulators
            .lock()
            .unwrap()
            .remove(&key)
            .unwrap_or_default();
        acc.qty += closing_qty;
        acc.notional += fill.price * closing_qty;
        acc.realized += realized;
        let exit_price = if acc.qty.is_zero() {
            fill.price
        } else {
            acc.notional / acc.qty
        };

        let reason = if order.intent == OrderIntent::StopLoss {
            TradeReason::StopLoss
        } else {
            self.exit_reasons
                .lock()
                .unwrap()
                .remove(&order.order_id)
                .unwrap_or(TradeReason::ManualExit)
        };

        let mut va = self.store.expect_va(&order.va_id)?;
        self.governor.settle_trade(&mut va, acc.realized, fill.ts);
        let trade = Trade {
            trade_id: None,
            va_id: order.va_id.clone(),
            symbol: order.symbol.clone(),
            side: position.side,
            qty: acc.qty,
            entry_price: position.avg_entry_price,
            exit_price,
            realized_pnl: acc.realized,
            closed_at: fill.ts,
            reason,
        };
        self.store.close_position(&order, &trade, &va)?;
        self.governor.on_position_closed(&order.va_id);
        self.router.release(&order.va_id, &order.symbol);
        info!(
            va_id = %order.va_id,
            symbol = %order.symbol,
            qty = %trade.qty,
            realized_pnl = %trade.realized_pnl,
            reason = ?trade.reason,
            "position closed"
        );

        self.cancel_lingering_exits(&order.order_id, &order.symbol).await;
        Ok(())
    }

    /// After a position closes, no exit order for the symbol may stay live.
    async fn cancel_lingering_exits(&self, closed_by: &str, symbol: &str) {
        let lingering = match self.store.open_orders_for_symbol(symbol) {
            Ok(orders) => orders,
            Err(err) => {
                error!(symbol, error = %err, "failed to scan for lingering exits");
                return;
            }
        };
        for mut order in lingering {
            if order.order_id == closed_by || order.intent == OrderIntent::Entry {
                continue;
            }
            let _ = timeout(
                self.policy.call_timeout,
                self.exchange.cancel_order(&order.order_id),
            )
            .await;
            order.status = OrderStatus::Canceled;
            order.last_update_at = Utc::now();
            if let Err(err) = self.store.save_order(&order) {
                error!(order_id = %order.order_id, error = %err, "failed to persist cancel");
            }
        }
    }

    /// After a partial manual exit, shrink the resting stop to the remaining
    /// quantity.
    async fn resync_stop_to_position(&self, position: &Position) {
        let stops = match self.store.open_orders_for_symbol(&position.symbol) {
            Ok(orders) => orders,
            Err(err) => {
                error!(symbol = %position.symbol, error = %err, "failed to scan stops");
                return;
            }
        };
        for mut stop in stops {
            if stop.intent != OrderIntent::StopLoss || stop.qty_requested == position.qty {
                continue;
            }
            let trigger = stop.stop_loss_price.unwrap_or(position.stop_loss_price);
            let linked = stop.linked_entry_id.clone();
            let _ = timeout(
                self.policy.call_timeout,
                self.exchange.cancel_order(&stop.order_id),
            )
            .await;
            stop.status = OrderStatus::Canceled;
            stop.last_update_at = Utc::now();
            if let Err(err) = self.store.save_order(&stop) {
                error!(order_id = %stop.order_id, error = %err, "failed to persist cancel");
                continue;
            }
            if let Err(err) = self
                .submit_protective_stop(
                    &position.va_id,
                    &position.symbol,
                    position.side,
                    position.qty,
                    trigger,
                    linked,
                )
                .await
            {
                error!(symbol = %position.symbol, error = %err, "stop resize failed");
            }
        }
    }

    // ---- reconciliation -------------------------------------------------

    /// Periodic pass: the exchange is authoritative for stale orders, stale
    /// pendings are canceled, and every position must end the pass protected.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> EngineResult<()> {
        let stale_cutoff = now - self.policy.stale_threshold;
        for order in self.store.open_orders()? {
            if order.last_update_at > stale_cutoff {
                continue;
            }
            self.reconcile_order(order, now).await?;
        }
        self.enforce_stop_liveness().await?;
        Ok(())
    }

    async fn reconcile_order(&self, mut order: Order, now: DateTime<Utc>) -> EngineResult<()> {
        let query = match timeout(
            self.policy.call_timeout,
            self.exchange.query_order(&order.order_id),
        )
        .await
        {
            Ok(Ok(query)) => {
                self.reconcile_failures.store(0, Ordering::SeqCst);
                query
            }
            Ok(Err(err)) if !err.is_transient() => {
                // The venue has no record of this order; it never landed.
                warn!(order_id = %order.order_id, error = %err, "order unknown on venue, expiring");
                order.status = OrderStatus::Expired;
                order.last_update_at = now;
                self.store.save_order(&order)?;
                return Ok(());
            }
            Ok(Err(err)) => return self.note_reconcile_failure(&err.to_string()),
            Err(_elapsed) => return self.note_reconcile_failure("query timed out"),
        };

        if query.qty_filled > order.qty_filled {
            let price = query
                .avg_fill_price
                .or(order.avg_fill_price)
                .unwrap_or(order.stop_loss_price.unwrap_or_default());
            let missing = FillEvent {
                order_id: order.order_id.clone(),
                qty_increment: query.qty_filled - order.qty_filled,
                price,
                ts: now,
            };
            warn!(
                order_id = %order.order_id,
                missing_qty = %missing.qty_increment,
                "reconciliation found unreported fills"
            );
            self.apply_fill(missing).await?;
            let Some(refreshed) = self.store.get_order(&order.order_id)? else {
                return Ok(());
            };
            order = refreshed;
        }

        match query.status {
            status if status.is_terminal() => {
                if !order.status.is_terminal() {
                    info!(
                        order_id = %order.order_id,
                        local = ?order.status,
                        remote = ?status,
                        "adopting terminal status from venue"
                    );
                    order.status = status;
                    order.last_update_at = now;
                    self.store.save_order(&order)?;
                }
            }
            _ if order.intent == OrderIntent::StopLoss => {
                // Protective stops rest indefinitely by design; only their
                // progress clock moves.
                order.last_update_at = now;
                self.store.save_order(&order)?;
            }
            _ => {
                // Still resting past the stale threshold with no progress.
                info!(order_id = %order.order_id, "canceling stale order");
                let _ = timeout(
                    self.policy.call_timeout,
                    self.exchange.cancel_order(&order.order_id),
                )
                .await;
                order.status = OrderStatus::Canceled;
                order.last_update_at = now;
                self.store.save_order(&order)?;
            }
        }
        Ok(())
    }

    fn note_reconcile_failure(&self, detail: &str) -> EngineResult<()> {
        let failures = self.reconcile_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(failures, detail, "exchange unreachable during reconciliation");
        if failures >= self.policy.reconcile_failure_limit {
            self.reconcile_failures.store(0, Ordering::SeqCst);
            self.store.record_incident(
                "reconciliation_timeout",
                &format!("exchange unreachable for {failures} passes: {detail}"),
            )?;
            return Err(EngineError::ReconciliationTimeout);
        }
        Ok(())
    }

    /// A position without a live stop or in-flight exit must not survive a
    /// reconciliation pass: re-attach, or panic-close via the failure path.
    async fn enforce_stop_liveness(&self) -> EngineResult<()> {
        for position in self.store.list_positions()? {
            let open = self.store.open_orders_for_symbol(&position.symbol)?;
            let protected = open
                .iter()
                .any(|order| order.intent != OrderIntent::Entry);
            if protected {
                continue;
            }
            warn!(
                va_id = %position.va_id,
                symbol = %position.symbol,
                "naked position found, re-attaching stop"
            );
            if let Err(err) = self
                .submit_protective_stop(
                    &position.va_id,
                    &position.symbol,
                    position.side,
                    position.qty,
                    position.stop_loss_price,
                    None,
                )
                .await
            {
                error!(
                    symbol = %position.symbol,
                    error = %err,
                    "stop re-attachment failed"
                );
            }
        }
        Ok(())
    }

    // ---- stop-loss trigger detection ------------------------------------

    /// Mark positions against a fresh snapshot and fire reduce-only exits for
    /// any whose stop is crossed. Never double-submits: a live reduce-only
    /// exit suppresses the trigger.
    pub async fn on_snapshot(&self, snapshot: &MarketSnapshot) -> EngineResult<()> {
        for mut position in self.store.list_positions()? {
            if position.symbol != snapshot.symbol {
                continue;
            }
            position.mark(snapshot.last);
            self.store.update_position(&position)?;
            if let Some(mut va) = self.store.get_va(&position.va_id)? {
                // One symbol per account, so the position's mark is the
                // account's whole unrealized PnL.
                va.unrealized_pnl = position.unrealized_pnl;
                self.store.update_va(&va)?;
            }

            if !position.stop_triggered(snapshot.last) {
                continue;
            }
            let open = self.store.open_orders_for_symbol(&position.symbol)?;
            if open.iter().any(|o| o.intent == OrderIntent::ReduceOnlyExit) {
                continue;
            }
            warn!(
                va_id = %position.va_id,
                symbol = %position.symbol,
                last = %snapshot.last,
                stop = %position.stop_loss_price,
                "stop loss triggered"
            );
            // Replace the resting stop with an immediate market exit.
            for mut stop in open {
                if stop.intent != OrderIntent::StopLoss {
                    continue;
                }
                let _ = timeout(
                    self.policy.call_timeout,
                    self.exchange.cancel_order(&stop.order_id),
                )
                .await;
                stop.status = OrderStatus::Canceled;
                stop.last_update_at = Utc::now();
                self.store.save_order(&stop)?;
            }
            if let Err(err) = self
                .place_exit(&position, position.qty, TradeReason::StopLoss)
                .await
            {
                error!(symbol = %position.symbol, error = %err, "stop exit failed");
                self.store.record_incident(
                    "stop_exit_failed",
                    &format!("{}/{}: {err}", position.va_id, position.symbol),
                )?;
            }
        }
        Ok(())
    }

    // ---- shutdown -------------------------------------------------------

    /// Cancel every non-terminal order. Fatal-fault escalation only; a
    /// graceful shutdown leaves protective stops resting on the venue.
    pub async fn cancel_all_open(&self) -> EngineResult<()> {
        for mut order in self.store.open_orders()? {
            let _ = timeout(
                self.policy.call_timeout,
                self.exchange.cancel_order(&order.order_id),
            )
            .await;
            order.status = OrderStatus::Canceled;
            order.last_update_at = Utc::now();
            self.store.save_order(&order)?;
            info!(order_id = %order.order_id, "open order canceled");
        }
        Ok(())
    }
}
