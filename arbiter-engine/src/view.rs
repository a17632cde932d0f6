//! Read-only dashboard projection. Nothing here mutates state.

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use arbiter_core::{Position, Price, Quantity, Side, Symbol, VaId, VirtualAccount};

use crate::runtime::ExecutionLoop;
use crate::EngineResult;

/// Per-account dashboard row.
#[derive(Clone, Debug, Serialize)]
pub struct AccountView {
    pub va_id: VaId,
    pub balance: Price,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    pub max_drawdown: Price,
    pub cooldown_remaining_secs: Option<i64>,
    pub kill_switch: bool,
}

impl AccountView {
    fn from_va(va: VirtualAccount, now: DateTime<Utc>) -> Self {
        let cooldown_remaining_secs = va
            .cooldown_until
            .filter(|until| *until > now)
            .map(|until| (until - now).num_seconds());
        Self {
            va_id: va.va_id,
            balance: va.balance,
            realized_pnl: va.realized_pnl,
            unrealized_pnl: va.unrealized_pnl,
            wins: va.wins,
            losses: va.losses,
            consecutive_losses: va.consecutive_losses,
            max_drawdown: va.max_drawdown,
            cooldown_remaining_secs,
            kill_switch: va.kill_switch,
        }
    }
}

/// Per-position dashboard row.
#[derive(Clone, Debug, Serialize)]
pub struct PositionView {
    pub va_id: VaId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: Quantity,
    pub avg_entry_price: Price,
    pub current_price: Price,
    pub unrealized_pnl: Price,
    pub stop_loss_price: Price,
}

impl From<Position> for PositionView {
    fn from(position: Position) -> Self {
        Self {
            va_id: position.va_id,
            symbol: position.symbol,
            side: position.side,
            qty: position.qty,
            avg_entry_price: position.avg_entry_price,
            current_price: position.current_price,
            unrealized_pnl: position.unrealized_pnl,
            stop_loss_price: position.stop_loss_price,
        }
    }
}

/// Engine-wide status block.
#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub kill_switch: bool,
    pub max_spread_bps: Decimal,
    pub max_slippage_bps: Decimal,
    pub max_latency_ms: f64,
    pub reconcile_interval_secs: u64,
    pub signals_accepted: u64,
    pub signals_rejected: u64,
    pub signals_dropped: u64,
    pub last_error: Option<String>,
}

/// Consistent point-in-time view for the dashboard renderer.
#[derive(Clone, Debug, Serialize)]
pub struct DashboardSnapshot {
    pub generated_at: DateTime<Utc>,
    pub accounts: Vec<AccountView>,
    pub positions: Vec<PositionView>,
    pub system: SystemStatus,
}

impl ExecutionLoop {
    /// Project the current persisted state plus loop counters.
    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineResult<DashboardSnapshot> {
        let accounts = self
            .store
            .list_vas()?
            .into_iter()
            .map(|va| AccountView::from_va(va, now))
            .collect();
        let positions = self
            .store
            .list_positions()?
            .into_iter()
            .map(PositionView::from)
            .collect();
        let system = SystemStatus {
            kill_switch: self.kill_switch.load(Ordering::SeqCst),
            max_spread_bps: self.filters.max_spread_bps(),
            max_slippage_bps: self.filters.max_slippage_bps(),
            max_latency_ms: self.filters.max_latency_ms(),
            reconcile_interval_secs: self.settings.reconcile_interval.as_secs(),
            signals_accepted: self.stats.accepted(),
            signals_rejected: self.stats.rejected(),
            signals_dropped: self.queue.dropped(),
            last_error: self.stats.last_error(),
        };
        Ok(DashboardSnapshot {
            generated_at: now,
            accounts,
            positions,
            system,
        })
    }
}
