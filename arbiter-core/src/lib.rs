//! Fundamental data types shared across the entire workspace.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `AAPL`).
pub type Symbol = String;
/// Identifier of a virtual account.
pub type VaId = String;
/// Unique identifier assigned to orders (generated by the order manager).
pub type OrderId = String;

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed direction used in PnL arithmetic (long = +1, short = -1).
    #[must_use]
    pub fn direction(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Stable string form used by the persistence layer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// What an order is allowed to do to the position book.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderIntent {
    /// Opens or grows a position.
    Entry,
    /// May only shrink an existing position, never flip it.
    ReduceOnlyExit,
    /// Protective exit linked to an entry order.
    StopLoss,
}

impl OrderIntent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::ReduceOnlyExit => "REDUCE_ONLY_EXIT",
            Self::StopLoss => "STOP_LOSS",
        }
    }
}

/// Order lifecycle state. Transitions are monotonic except `Partial` -> `Partial`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderStatus {
    Pending,
    Partial,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected | Self::Expired)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Partial => "PARTIAL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Why a closed position was closed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum TradeReason {
    ManualExit,
    StopLoss,
    ReconciledClose,
}

impl TradeReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManualExit => "MANUAL_EXIT",
            Self::StopLoss => "STOP_LOSS",
            Self::ReconciledClose => "RECONCILED_CLOSE",
        }
    }
}

/// Point-in-time view of the market used by the pre-trade filters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub bid: Price,
    pub ask: Price,
    pub last: Price,
    pub as_of: DateTime<Utc>,
    pub source_latency_ms: f64,
}

impl MarketSnapshot {
    /// A snapshot is coherent when both sides of the book make sense.
    #[must_use]
    pub fn is_coherent(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask >= self.bid
    }

    /// Midpoint of the book, if coherent.
    #[must_use]
    pub fn mid(&self) -> Option<Price> {
        if self.is_coherent() {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else {
            None
        }
    }

    /// Quoted spread expressed in basis points of the midpoint.
    #[must_use]
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid()?;
        if mid.is_zero() {
            return None;
        }
        Some(Decimal::from(10_000) * (self.ask - self.bid) / mid)
    }
}

/// High-level trading intent produced outside the engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Signal {
    pub va_id: VaId,
    pub symbol: Symbol,
    pub side: Side,
    pub desired_qty: Quantity,
    /// Price the producer expects to trade at; absent for pure market intents.
    pub expected_price: Option<Price>,
    pub snapshot: MarketSnapshot,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    /// Convenience constructor stamping the receive time.
    #[must_use]
    pub fn new(
        va_id: impl Into<VaId>,
        symbol: impl Into<Symbol>,
        side: Side,
        desired_qty: Quantity,
        snapshot: MarketSnapshot,
    ) -> Self {
        Self {
            va_id: va_id.into(),
            symbol: symbol.into(),
            side,
            desired_qty,
            expected_price: None,
            snapshot,
            received_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_expected_price(mut self, price: Price) -> Self {
        self.expected_price = Some(price);
        self
    }
}

/// Incremental execution report pushed by the exchange adapter.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub qty_increment: Quantity,
    pub price: Price,
    pub ts: DateTime<Utc>,
}

/// Order representation persisted by the store and mirrored on the exchange.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Order {
    pub order_id: OrderId,
    pub va_id: VaId,
    pub symbol: Symbol,
    pub side: Side,
    pub intent: OrderIntent,
    pub qty_requested: Quantity,
    pub qty_filled: Quantity,
    pub avg_fill_price: Option<Price>,
    pub status: OrderStatus,
    /// Required for entries; the protective price the linked stop will carry.
    pub stop_loss_price: Option<Price>,
    /// Set on stop orders: the entry they protect.
    pub linked_entry_id: Option<OrderId>,
    pub created_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}

impl Order {
    /// Build a fresh order in `Pending` state with a generated identifier.
    #[must_use]
    pub fn new(
        va_id: impl Into<VaId>,
        symbol: impl Into<Symbol>,
        side: Side,
        intent: OrderIntent,
        qty_requested: Quantity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4().to_string(),
            va_id: va_id.into(),
            symbol: symbol.into(),
            side,
            intent,
            qty_requested,
            qty_filled: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            stop_loss_price: None,
            linked_entry_id: None,
            created_at: now,
            last_update_at: now,
        }
    }

    #[must_use]
    pub fn with_stop_loss(mut self, price: Price) -> Self {
        self.stop_loss_price = Some(price);
        self
    }

    #[must_use]
    pub fn with_linked_entry(mut self, entry_id: OrderId) -> Self {
        self.linked_entry_id = Some(entry_id);
        self
    }

    /// Quantity still outstanding on the exchange.
    #[must_use]
    pub fn remaining(&self) -> Quantity {
        self.qty_requested - self.qty_filled
    }

    /// Apply one fill increment: quantity-weighted average price, monotonic
    /// filled quantity, `Partial`/`Filled` status. The caller is responsible
    /// for rejecting increments that would exceed `qty_requested`.
    pub fn record_fill(&mut self, qty_increment: Quantity, price: Price, ts: DateTime<Utc>) {
        debug_assert!(self.qty_filled + qty_increment <= self.qty_requested);
        let prev_notional = self
            .avg_fill_price
            .map(|avg| avg * self.qty_filled)
            .unwrap_or(Decimal::ZERO);
        self.qty_filled += qty_increment;
        if !self.qty_filled.is_zero() {
            self.avg_fill_price =
                Some((prev_notional + price * qty_increment) / self.qty_filled);
        }
        self.status = if self.qty_filled >= self.qty_requested {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
        self.last_update_at = ts;
    }
}

/// Open exposure held by one virtual account. At most one VA may hold a
/// position in any given symbol; every position carries a stop price.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Position {
    pub va_id: VaId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Quantity,
    pub avg_entry_price: Price,
    pub current_price: Price,
    pub stop_loss_price: Price,
    pub unrealized_pnl: Price,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Open a new position from the first entry fill.
    #[must_use]
    pub fn open(
        va_id: impl Into<VaId>,
        symbol: impl Into<Symbol>,
        side: Side,
        qty: Quantity,
        price: Price,
        stop_loss_price: Price,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            va_id: va_id.into(),
            symbol: symbol.into(),
            side,
            qty,
            avg_entry_price: price,
            current_price: price,
            stop_loss_price,
            unrealized_pnl: Decimal::ZERO,
            opened_at: now,
        }
    }

    /// Merge an additional entry fill into the quantity-weighted entry price.
    pub fn add_fill(&mut self, qty: Quantity, price: Price) {
        let total = self.qty + qty;
        if total.is_zero() {
            return;
        }
        self.avg_entry_price =
            (self.avg_entry_price * self.qty + price * qty) / total;
        self.qty = total;
        self.current_price = price;
    }

    /// Refresh the mark price and unrealized PnL.
    pub fn mark(&mut self, price: Price) {
        self.current_price = price;
        let delta = match self.side {
            Side::Buy => price - self.avg_entry_price,
            Side::Sell => self.avg_entry_price - price,
        };
        self.unrealized_pnl = delta * self.qty;
    }

    /// Whether the last price has crossed the protective stop.
    #[must_use]
    pub fn stop_triggered(&self, last: Price) -> bool {
        match self.side {
            Side::Buy => last <= self.stop_loss_price,
            Side::Sell => last >= self.stop_loss_price,
        }
    }

    /// PnL realized by exiting `qty` at `exit_price`.
    #[must_use]
    pub fn realized_on_exit(&self, qty: Quantity, exit_price: Price) -> Price {
        (exit_price - self.avg_entry_price) * qty * self.side.direction()
    }
}

/// Isolated risk and accounting unit sharing the real exchange connection.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VirtualAccount {
    pub va_id: VaId,
    pub balance: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub max_drawdown: Price,
    pub peak_equity: Price,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub kill_switch: bool,
}

impl VirtualAccount {
    #[must_use]
    pub fn new(va_id: impl Into<VaId>, balance: Price) -> Self {
        Self {
            va_id: va_id.into(),
            balance,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            wins: 0,
            losses: 0,
            consecutive_losses: 0,
            max_drawdown: Decimal::ZERO,
            peak_equity: balance,
            cooldown_until: None,
            kill_switch: false,
        }
    }

    /// True while an armed cooldown has not yet expired.
    #[must_use]
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Immutable record appended when a position closes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Trade {
    pub trade_id: Option<i64>,
    pub va_id: VaId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Quantity,
    pub entry_price: Price,
    pub exit_price: Price,
    pub realized_pnl: Price,
    pub closed_at: DateTime<Utc>,
    pub reason: TradeReason,
}

/// Reason a signal was turned away by the governance pipeline. These are
/// observable outcomes, not errors.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum RejectReason {
    SymbolConflict { reserved: Symbol },
    InCooldown { until: DateTime<Utc> },
    KillSwitchEngaged,
    Throttled { open_positions: usize },
    SpreadTooWide { spread_bps: Decimal },
    SlippageTooHigh { slippage_bps: Decimal },
    LatencyTooHigh { latency_ms: f64 },
    OutsideTradingWindow,
    InvalidMarket,
}

impl RejectReason {
    /// Short gate label used in logs and counters.
    #[must_use]
    pub fn gate(&self) -> &'static str {
        match self {
            Self::SymbolConflict { .. } => "symbol_conflict",
            Self::InCooldown { .. } => "in_cooldown",
            Self::KillSwitchEngaged => "kill_switch",
            Self::Throttled { .. } => "throttled",
            Self::SpreadTooWide { .. } => "spread",
            Self::SlippageTooHigh { .. } => "slippage",
            Self::LatencyTooHigh { .. } => "latency",
            Self::OutsideTradingWindow => "trading_window",
            Self::InvalidMarket => "invalid_market",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SymbolConflict { reserved } => {
                write!(f, "account already trading {reserved}")
            }
            Self::InCooldown { until } => write!(f, "in cooldown until {until}"),
            Self::KillSwitchEngaged => write!(f, "kill switch engaged"),
            Self::Throttled { open_positions } => {
                write!(f, "open position limit reached ({open_positions})")
            }
            Self::SpreadTooWide { spread_bps } => {
                write!(f, "spread {spread_bps} bps above limit")
            }
            Self::SlippageTooHigh { slippage_bps } => {
                write!(f, "slippage {slippage_bps} bps above limit")
            }
            Self::LatencyTooHigh { latency_ms } => {
                write!(f, "market data {latency_ms:.1} ms stale")
            }
            Self::OutsideTradingWindow => write!(f, "outside trading window"),
            Self::InvalidMarket => write!(f, "incoherent market snapshot"),
        }
    }
}

/// Result of running a signal through an admission gate.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum AdmissionOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl AdmissionOutcome {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn snapshot(bid: f64, ask: f64, last: f64) -> MarketSnapshot {
        MarketSnapshot {
            symbol: "AAPL".into(),
            bid: Decimal::from_f64(bid).unwrap(),
            ask: Decimal::from_f64(ask).unwrap(),
            last: Decimal::from_f64(last).unwrap(),
            as_of: Utc::now(),
            source_latency_ms: 0.0,
        }
    }

    #[test]
    fn spread_bps_uses_midpoint() {
        let snap = snapshot(100.0, 100.20, 100.10);
        let bps = snap.spread_bps().unwrap();
        assert!(bps > Decimal::from(19) && bps < Decimal::from(21));
    }

    #[test]
    fn crossed_book_is_incoherent() {
        let snap = snapshot(100.0, 99.0, 99.5);
        assert!(!snap.is_coherent());
        assert!(snap.spread_bps().is_none());
    }

    #[test]
    fn order_fill_merging_tracks_weighted_average() {
        let mut order = Order::new(
            "VA001",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        order.record_fill(Decimal::from(4), Decimal::from(100), Utc::now());
        assert_eq!(order.status, OrderStatus::Partial);
        order.record_fill(Decimal::from(6), Decimal::from(101), Utc::now());
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.qty_filled, Decimal::from(10));
        assert_eq!(
            order.avg_fill_price,
            Some(Decimal::from_f64(100.6).unwrap())
        );
    }

    #[test]
    fn position_entry_average_matches_contributing_fills() {
        let now = Utc::now();
        let mut position = Position::open(
            "VA001",
            "AAPL",
            Side::Buy,
            Decimal::from(4),
            Decimal::from(100),
            Decimal::from(98),
            now,
        );
        position.add_fill(Decimal::from(6), Decimal::from(101));
        assert_eq!(position.qty, Decimal::from(10));
        assert_eq!(position.avg_entry_price, Decimal::from_f64(100.6).unwrap());
    }

    #[test]
    fn long_stop_triggers_at_or_below_stop_price() {
        let position = Position::open(
            "VA001",
            "AAPL",
            Side::Buy,
            Decimal::from(10),
            Decimal::from(100),
            Decimal::from(98),
            Utc::now(),
        );
        assert!(!position.stop_triggered(Decimal::from_f64(98.01).unwrap()));
        assert!(position.stop_triggered(Decimal::from(98)));
        assert!(position.stop_triggered(Decimal::from_f64(97.95).unwrap()));
    }

    #[test]
    fn short_position_realizes_inverse_pnl() {
        let mut position = Position::open(
            "VA002",
            "TSLA",
            Side::Sell,
            Decimal::from(5),
            Decimal::from(200),
            Decimal::from(204),
            Utc::now(),
        );
        position.mark(Decimal::from(195));
        assert_eq!(position.unrealized_pnl, Decimal::from(25));
        assert_eq!(
            position.realized_on_exit(Decimal::from(5), Decimal::from(195)),
            Decimal::from(25)
        );
    }

    #[test]
    fn cooldown_expires_by_clock() {
        let mut va = VirtualAccount::new("VA001", Decimal::from(100_000));
        let now = Utc::now();
        va.cooldown_until = Some(now + chrono::Duration::seconds(10));
        assert!(va.in_cooldown(now));
        assert!(!va.in_cooldown(now + chrono::Duration::seconds(11)));
    }
}
