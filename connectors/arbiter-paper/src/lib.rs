//! Simple paper-trading connector used by the integration tests and demo feed.
//!
//! The connector acknowledges orders synchronously and pushes fills and
//! market snapshots over the adapter event stream. Resting stop orders are
//! parked until canceled; trigger detection lives in the engine, which keeps
//! a single authoritative stop path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use arbiter_core::{FillEvent, MarketSnapshot, OrderId, OrderStatus, Price, Quantity, Symbol};
use arbiter_exchange::{
    CancelAck, ExchangeClient, ExchangeError, ExchangeEvent, ExchangeEvents, ExchangeInfo,
    ExchangeResult, OrderQuery, OrderSpec, SubmitAck,
};

const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const AUTO_FILL_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone, Debug)]
struct PaperOrder {
    spec: OrderSpec,
    status: OrderStatus,
    qty_filled: Quantity,
    avg_fill_price: Option<Price>,
}

struct Inner {
    info: ExchangeInfo,
    orders: Mutex<HashMap<OrderId, PaperOrder>>,
    prices: Mutex<HashMap<Symbol, Price>>,
    next_submit_failure: Mutex<Option<String>>,
    reject_stop_orders: AtomicBool,
    offline: AtomicBool,
    auto_fill: AtomicBool,
    events_tx: mpsc::Sender<ExchangeEvent>,
}

impl Inner {
    /// Update internal order state for a fill and build the outgoing event.
    /// Returns `None` when the order cannot accept the increment.
    fn book_fill(&self, order_id: &str, qty: Quantity, price: Price) -> Option<FillEvent> {
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(order_id)?;
        if order.status.is_terminal() {
            warn!(order_id, "ignoring fill for terminal paper order");
            return None;
        }
        let prev_notional = order
            .avg_fill_price
            .map(|avg| avg * order.qty_filled)
            .unwrap_or(Decimal::ZERO);
        order.qty_filled += qty;
        order.avg_fill_price = Some((prev_notional + price * qty) / order.qty_filled);
        order.status = if order.qty_filled >= order.spec.qty {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        Some(FillEvent {
            order_id: order_id.to_string(),
            qty_increment: qty,
            price,
            ts: Utc::now(),
        })
    }
}

/// In-memory execution venue. Cloning shares the underlying book.
#[derive(Clone)]
pub struct PaperExchange {
    inner: Arc<Inner>,
}

impl PaperExchange {
    /// Create a venue and the event stream the engine consumes.
    pub fn new(name: impl Into<String>) -> (Self, ExchangeEvents) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let venue = Self {
            inner: Arc::new(Inner {
                info: ExchangeInfo {
                    name: name.into(),
                    supports_partial_fills: true,
                },
                orders: Mutex::new(HashMap::new()),
                prices: Mutex::new(HashMap::new()),
                next_submit_failure: Mutex::new(None),
                reject_stop_orders: AtomicBool::new(false),
                offline: AtomicBool::new(false),
                auto_fill: AtomicBool::new(true),
                events_tx,
            }),
        };
        (venue, events_rx)
    }

    /// Disable immediate fills so tests can script partial executions.
    pub fn set_auto_fill(&self, enabled: bool) {
        self.inner.auto_fill.store(enabled, Ordering::SeqCst);
    }

    /// Simulate an unreachable venue; calls return `ExchangeError::Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// The next `submit_order` call is rejected with `reason`.
    pub fn fail_next_submit(&self, reason: impl Into<String>) {
        *self.inner.next_submit_failure.lock().unwrap() = Some(reason.into());
    }

    /// Reject every stop (trigger-price) submission until turned off again.
    pub fn reject_stop_orders(&self, enabled: bool) {
        self.inner.reject_stop_orders.store(enabled, Ordering::SeqCst);
    }

    /// Publish a market snapshot and remember the last trade price.
    pub async fn push_snapshot(&self, snapshot: MarketSnapshot) {
        self.inner
            .prices
            .lock()
            .unwrap()
            .insert(snapshot.symbol.clone(), snapshot.last);
        if self
            .inner
            .events_tx
            .send(ExchangeEvent::Snapshot(snapshot))
            .await
            .is_err()
        {
            debug!("snapshot dropped: event stream closed");
        }
    }

    /// Manually execute part of a resting order and push the fill event.
    pub async fn fill(&self, order_id: &str, qty: Quantity, price: Price) {
        let event = self.inner.book_fill(order_id, qty, price);
        match event {
            Some(event) => {
                if self
                    .inner
                    .events_tx
                    .send(ExchangeEvent::Fill(event))
                    .await
                    .is_err()
                {
                    debug!(order_id, "fill dropped: event stream closed");
                }
            }
            None => warn!(order_id, "manual fill for unknown or terminal order"),
        }
    }

    /// Push a fill event without touching the internal book. Used to model a
    /// misbehaving venue (duplicate or oversized executions).
    pub async fn emit_rogue_fill(&self, order_id: &str, qty: Quantity, price: Price) {
        let event = FillEvent {
            order_id: order_id.to_string(),
            qty_increment: qty,
            price,
            ts: Utc::now(),
        };
        let _ = self.inner.events_tx.send(ExchangeEvent::Fill(event)).await;
    }

    /// Last price seen for a symbol, if any.
    #[must_use]
    pub fn last_price(&self, symbol: &str) -> Option<Price> {
        self.inner.prices.lock().unwrap().get(symbol).copied()
    }

    fn spawn_auto_fill(&self, spec: OrderSpec) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(AUTO_FILL_DELAY).await;
            let price = inner.prices.lock().unwrap().get(&spec.symbol).copied();
            let Some(price) = price else {
                warn!(
                    symbol = %spec.symbol,
                    order_id = %spec.order_id,
                    "no market price known, leaving paper order resting"
                );
                return;
            };
            if let Some(event) = inner.book_fill(&spec.order_id, spec.qty, price) {
                let _ = inner.events_tx.send(ExchangeEvent::Fill(event)).await;
            }
        });
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn info(&self) -> ExchangeInfo {
        self.inner.info.clone()
    }

    async fn submit_order(&self, spec: OrderSpec) -> ExchangeResult<SubmitAck> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("paper venue offline".into()));
        }
        if let Some(reason) = self.inner.next_submit_failure.lock().unwrap().take() {
            return Err(ExchangeError::Rejected(reason));
        }
        if spec.trigger_price.is_some() && self.inner.reject_stop_orders.load(Ordering::SeqCst) {
            return Err(ExchangeError::Rejected(
                "stop orders disabled on paper venue".into(),
            ));
        }

        let order_id = spec.order_id.clone();
        let resting = spec.trigger_price.is_some();
        self.inner.orders.lock().unwrap().insert(
            order_id.clone(),
            PaperOrder {
                spec: spec.clone(),
                status: OrderStatus::Pending,
                qty_filled: Decimal::ZERO,
                avg_fill_price: None,
            },
        );

        info!(
            order_id = %order_id,
            symbol = %spec.symbol,
            side = ?spec.side,
            qty = %spec.qty,
            reduce_only = spec.reduce_only,
            resting,
            "paper order accepted"
        );

        if !resting && self.inner.auto_fill.load(Ordering::SeqCst) {
            self.spawn_auto_fill(spec);
        }
        Ok(SubmitAck { order_id })
    }

    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<CancelAck> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("paper venue offline".into()));
        }
        let mut orders = self.inner.orders.lock().unwrap();
        match orders.get_mut(order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok(CancelAck::Canceled)
            }
            Some(_) => Ok(CancelAck::Canceled),
            None => Ok(CancelAck::Unknown),
        }
    }

    async fn query_order(&self, order_id: &str) -> ExchangeResult<OrderQuery> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unavailable("paper venue offline".into()));
        }
        let orders = self.inner.orders.lock().unwrap();
        match orders.get(order_id) {
            Some(order) => Ok(OrderQuery {
                status: order.status,
                qty_filled: order.qty_filled,
                avg_fill_price: order.avg_fill_price,
            }),
            None => Err(ExchangeError::Rejected(format!(
                "unknown order id {order_id}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_core::Side;

    fn spec(order_id: &str, qty: i64) -> OrderSpec {
        OrderSpec {
            order_id: order_id.into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: Decimal::from(qty),
            reduce_only: false,
            trigger_price: None,
        }
    }

    #[tokio::test]
    async fn manual_fills_flow_through_the_event_stream() {
        let (venue, mut events) = PaperExchange::new("paper");
        venue.set_auto_fill(false);
        venue.submit_order(spec("ord-1", 10)).await.unwrap();
        venue.fill("ord-1", Decimal::from(4), Decimal::from(100)).await;

        match events.recv().await {
            Some(ExchangeEvent::Fill(fill)) => {
                assert_eq!(fill.order_id, "ord-1");
                assert_eq!(fill.qty_increment, Decimal::from(4));
            }
            other => panic!("expected fill event, got {other:?}"),
        }

        let query = venue.query_order("ord-1").await.unwrap();
        assert_eq!(query.status, OrderStatus::Partial);
        assert_eq!(query.qty_filled, Decimal::from(4));
    }

    #[tokio::test]
    async fn scripted_rejection_hits_next_submit_only() {
        let (venue, _events) = PaperExchange::new("paper");
        venue.set_auto_fill(false);
        venue.fail_next_submit("insufficient margin");
        let err = venue.submit_order(spec("ord-1", 1)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Rejected(_)));
        venue.submit_order(spec("ord-2", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_unknown_order_reports_unknown() {
        let (venue, _events) = PaperExchange::new("paper");
        assert_eq!(
            venue.cancel_order("missing").await.unwrap(),
            CancelAck::Unknown
        );
    }
}
