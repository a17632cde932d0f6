//! Exchange-agnostic traits used by the rest of the framework.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use arbiter_core::{
    FillEvent, MarketSnapshot, OrderId, OrderStatus, Price, Quantity, Side, Symbol,
};

/// Convenience alias for exchange adapter results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Common error type returned by exchange adapter implementations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The call did not complete within the configured deadline.
    #[error("exchange call timed out")]
    Timeout,
    /// The venue could not be reached at all.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    /// The venue understood the request and refused it.
    #[error("exchange rejected request: {0}")]
    Rejected(String),
    /// Transport-level failures (connection reset, malformed frame, ...).
    #[error("transport error: {0}")]
    Transport(String),
}

impl ExchangeError {
    /// Transient faults are resolved by reconciliation rather than by the
    /// caller; protocol faults are final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_) | Self::Transport(_))
    }
}

/// Metadata describing a connector, surfaced in logs and the dashboard.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ExchangeInfo {
    pub name: String,
    pub supports_partial_fills: bool,
}

/// Parameters the engine hands to the venue when placing an order.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderSpec {
    /// Client order id; the engine's `order_id` doubles as the venue key.
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Quantity,
    /// Reduce-only orders may shrink a position but never flip it.
    pub reduce_only: bool,
    /// Present on resting stop orders.
    pub trigger_price: Option<Price>,
}

/// Acknowledgement of an accepted submission.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitAck {
    pub order_id: OrderId,
}

/// Result of a cancel request. `Unknown` means the venue has no record of
/// the order; reconciliation decides what that implies.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum CancelAck {
    Canceled,
    Unknown,
}

/// Authoritative order state as reported by the venue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderQuery {
    pub status: OrderStatus,
    pub qty_filled: Quantity,
    pub avg_fill_price: Option<Price>,
}

/// Asynchronous updates pushed by the venue.
#[derive(Clone, Debug)]
pub enum ExchangeEvent {
    Fill(FillEvent),
    Snapshot(MarketSnapshot),
}

/// Receiver half of the venue's push stream.
pub type ExchangeEvents = mpsc::Receiver<ExchangeEvent>;

/// Trait describing the execution interface of a venue.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Return metadata about the connector for telemetry.
    fn info(&self) -> ExchangeInfo;

    /// Place a new order on the exchange.
    async fn submit_order(&self, spec: OrderSpec) -> ExchangeResult<SubmitAck>;

    /// Cancel an existing order by identifier.
    async fn cancel_order(&self, order_id: &str) -> ExchangeResult<CancelAck>;

    /// Fetch the venue's authoritative view of an order.
    async fn query_order(&self, order_id: &str) -> ExchangeResult<OrderQuery>;
}
