//! Transactional persistence for the execution engine.
//!
//! A single SQLite connection behind a mutex is the serialization point for
//! every state change the invariants care about. Mutations that must be
//! atomic (entry fill + position upsert, position close + trade append + VA
//! accounting) run inside one transaction so a crash between steps leaves a
//! valid state. The `UNIQUE(symbol)` constraint on `positions` is the global
//! backstop for the one-owner-per-symbol rule.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use thiserror::Error;

use arbiter_core::{
    Order, OrderIntent, OrderStatus, Position, Price, Side, Symbol, Trade, TradeReason, VaId,
    VirtualAccount,
};

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-specific error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps any SQLite-level failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Raised when a position insert collides with another account's holding.
    #[error("symbol {symbol} is already owned by another account")]
    SymbolOwned { symbol: Symbol },
    /// A row the caller relied on does not exist.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    /// Filesystem trouble around the database file.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operator-visible fault persisted for later inspection.
#[derive(Clone, Debug)]
pub struct Incident {
    pub incident_id: i64,
    pub kind: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS virtual_accounts (
    va_id TEXT PRIMARY KEY,
    balance TEXT NOT NULL,
    realized_pnl TEXT NOT NULL DEFAULT '0',
    unrealized_pnl TEXT NOT NULL DEFAULT '0',
    wins INTEGER NOT NULL DEFAULT 0,
    losses INTEGER NOT NULL DEFAULT 0,
    consecutive_losses INTEGER NOT NULL DEFAULT 0,
    max_drawdown TEXT NOT NULL DEFAULT '0',
    peak_equity TEXT NOT NULL,
    cooldown_until TEXT,
    kill_switch INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    va_id TEXT NOT NULL REFERENCES virtual_accounts(va_id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    intent TEXT NOT NULL,
    qty_requested TEXT NOT NULL,
    qty_filled TEXT NOT NULL DEFAULT '0',
    avg_fill_price TEXT,
    status TEXT NOT NULL,
    stop_loss_price TEXT,
    linked_entry_id TEXT,
    created_at TEXT NOT NULL,
    last_update_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);

CREATE TABLE IF NOT EXISTS positions (
    va_id TEXT NOT NULL REFERENCES virtual_accounts(va_id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty TEXT NOT NULL,
    avg_entry_price TEXT NOT NULL,
    current_price TEXT NOT NULL,
    stop_loss_price TEXT NOT NULL,
    unrealized_pnl TEXT NOT NULL DEFAULT '0',
    opened_at TEXT NOT NULL,
    PRIMARY KEY (va_id, symbol),
    UNIQUE (symbol)
);

CREATE TABLE IF NOT EXISTS trades (
    trade_id INTEGER PRIMARY KEY AUTOINCREMENT,
    va_id TEXT NOT NULL REFERENCES virtual_accounts(va_id),
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    qty TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    exit_price TEXT NOT NULL,
    realized_pnl TEXT NOT NULL,
    closed_at TEXT NOT NULL,
    reason TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS incidents (
    incident_id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// SQLite-backed store shared by every engine component.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store used by unit tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Location of the backing file, when not in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ---- virtual accounts ----------------------------------------------

    pub fn create_va(&self, va: &VirtualAccount) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        save_va(&conn, va)?;
        Ok(())
    }

    pub fn update_va(&self, va: &VirtualAccount) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        save_va(&conn, va)?;
        Ok(())
    }

    pub fn get_va(&self, va_id: &str) -> StoreResult<Option<VirtualAccount>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT va_id, balance, realized_pnl, unrealized_pnl, wins, losses,
                        consecutive_losses, max_drawdown, peak_equity, cooldown_until,
                        kill_switch
                 FROM virtual_accounts WHERE va_id = ?1",
                params![va_id],
                row_to_va,
            )
            .optional()?;
        Ok(row)
    }

    pub fn expect_va(&self, va_id: &str) -> StoreResult<VirtualAccount> {
        self.get_va(va_id)?.ok_or_else(|| StoreError::NotFound {
            entity: "virtual account",
            key: va_id.to_string(),
        })
    }

    pub fn list_vas(&self) -> StoreResult<Vec<VirtualAccount>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT va_id, balance, realized_pnl, unrealized_pnl, wins, losses,
                    consecutive_losses, max_drawdown, peak_equity, cooldown_until, kill_switch
             FROM virtual_accounts ORDER BY va_id",
        )?;
        let rows = stmt.query_map([], row_to_va)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---- orders ---------------------------------------------------------

    pub fn save_order(&self, order: &Order) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        upsert_order(&conn, order)?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> StoreResult<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{ORDER_SELECT} WHERE order_id = ?1"),
                params![order_id],
                row_to_order,
            )
            .optional()?;
        Ok(row)
    }

    /// Orders that are still live on the venue (`PENDING` or `PARTIAL`).
    pub fn open_orders(&self) -> StoreResult<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{ORDER_SELECT} WHERE status IN ('PENDING', 'PARTIAL') ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_order)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn open_orders_for_symbol(&self, symbol: &str) -> StoreResult<Vec<Order>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "{ORDER_SELECT} WHERE symbol = ?1 AND status IN ('PENDING', 'PARTIAL')
             ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![symbol], row_to_order)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The live protective stop linked to an entry order, if one exists.
    pub fn live_stop_for_entry(&self, entry_id: &str) -> StoreResult<Option<Order>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!(
                    "{ORDER_SELECT} WHERE intent = 'STOP_LOSS' AND linked_entry_id = ?1
                     AND status IN ('PENDING', 'PARTIAL')"
                ),
                params![entry_id],
                row_to_order,
            )
            .optional()?;
        Ok(row)
    }

    // ---- positions ------------------------------------------------------

    pub fn get_position(&self, va_id: &str, symbol: &str) -> StoreResult<Option<Position>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                &format!("{POSITION_SELECT} WHERE va_id = ?1 AND symbol = ?2"),
                params![va_id, symbol],
                row_to_position,
            )
            .optional()?;
        Ok(row)
    }

    /// Who currently owns a symbol, if anyone. Backs the pre-placement
    /// ownership re-check.
    pub fn symbol_owner(&self, symbol: &str) -> StoreResult<Option<VaId>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT va_id FROM positions WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_positions(&self) -> StoreResult<Vec<Position>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!("{POSITION_SELECT} ORDER BY va_id, symbol"))?;
        let rows = stmt.query_map([], row_to_position)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_positions_for_va(&self, va_id: &str) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM positions WHERE va_id = ?1",
            params![va_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Mark-to-market refresh outside of fill handling.
    pub fn update_position(&self, position: &Position) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        update_position_row(&conn, position)?;
        Ok(())
    }

    // ---- composite transactions ----------------------------------------

    /// Persist an entry fill: order progress plus position create/grow, one
    /// transaction. A brand-new position may collide with another account's
    /// holding, which surfaces as [`StoreError::SymbolOwned`].
    pub fn apply_entry_fill(
        &self,
        order: &Order,
        position: &Position,
        newly_opened: bool,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        upsert_order(&tx, order)?;
        if newly_opened {
            insert_position(&tx, position)?;
        } else {
            update_position_row(&tx, position)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Persist a partial exit: order progress plus reduced position.
    pub fn apply_exit_fill(&self, order: &Order, position: &Position) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        upsert_order(&tx, order)?;
        update_position_row(&tx, position)?;
        tx.commit()?;
        Ok(())
    }

    /// Close a position in full: final order state, position delete, trade
    /// append and the settled account row commit together so the trade ledger
    /// and account totals can never diverge.
    pub fn close_position(
        &self,
        order: &Order,
        trade: &Trade,
        va: &VirtualAccount,
    ) -> StoreResult<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        upsert_order(&tx, order)?;
        tx.execute(
            "DELETE FROM positions WHERE va_id = ?1 AND symbol = ?2",
            params![trade.va_id, trade.symbol],
        )?;
        insert_trade(&tx, trade)?;
        let trade_id = tx.last_insert_rowid();
        save_va(&tx, va)?;
        tx.commit()?;
        Ok(trade_id)
    }

    /// Record the stop order alongside the entry it protects.
    pub fn attach_stop(&self, entry: &Order, stop: &Order) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        upsert_order(&tx, entry)?;
        upsert_order(&tx, stop)?;
        tx.commit()?;
        Ok(())
    }

    // ---- trades ---------------------------------------------------------

    pub fn trades_for_va(&self, va_id: &str) -> StoreResult<Vec<Trade>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT trade_id, va_id, symbol, side, qty, entry_price, exit_price,
                    realized_pnl, closed_at, reason
             FROM trades WHERE va_id = ?1 ORDER BY trade_id",
        )?;
        let rows = stmt.query_map(params![va_id], row_to_trade)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Sum of realized PnL across the trade ledger of one account.
    pub fn sum_trade_pnl(&self, va_id: &str) -> StoreResult<Price> {
        let trades = self.trades_for_va(va_id)?;
        Ok(trades.iter().map(|t| t.realized_pnl).sum())
    }

    // ---- incidents ------------------------------------------------------

    pub fn record_incident(&self, kind: &str, detail: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO incidents (kind, detail, created_at) VALUES (?1, ?2, ?3)",
            params![kind, detail, Utc::now().to_rfc3339()],
        )?;
        tracing::error!(kind, detail, "incident recorded");
        Ok(())
    }

    pub fn list_incidents(&self, limit: usize) -> StoreResult<Vec<Incident>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT incident_id, kind, detail, created_at
             FROM incidents ORDER BY incident_id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(Incident {
                incident_id: row.get(0)?,
                kind: row.get(1)?,
                detail: row.get(2)?,
                created_at: col_ts(row, 3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ---- row/statement helpers ----------------------------------------------

const ORDER_SELECT: &str = "SELECT order_id, va_id, symbol, side, intent, qty_requested, \
     qty_filled, avg_fill_price, status, stop_loss_price, linked_entry_id, created_at, \
     last_update_at FROM orders";

const POSITION_SELECT: &str = "SELECT va_id, symbol, side, qty, avg_entry_price, \
     current_price, stop_loss_price, unrealized_pnl, opened_at FROM positions";

fn save_va(conn: &Connection, va: &VirtualAccount) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO virtual_accounts
            (va_id, balance, realized_pnl, unrealized_pnl, wins, losses,
             consecutive_losses, max_drawdown, peak_equity, cooldown_until, kill_switch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            va.va_id,
            va.balance.to_string(),
            va.realized_pnl.to_string(),
            va.unrealized_pnl.to_string(),
            va.wins,
            va.losses,
            va.consecutive_losses,
            va.max_drawdown.to_string(),
            va.peak_equity.to_string(),
            va.cooldown_until.map(|ts| ts.to_rfc3339()),
            va.kill_switch,
        ],
    )?;
    Ok(())
}

fn upsert_order(conn: &Connection, order: &Order) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO orders
            (order_id, va_id, symbol, side, intent, qty_requested, qty_filled,
             avg_fill_price, status, stop_loss_price, linked_entry_id, created_at,
             last_update_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            order.order_id,
            order.va_id,
            order.symbol,
            order.side.as_str(),
            order.intent.as_str(),
            order.qty_requested.to_string(),
            order.qty_filled.to_string(),
            order.avg_fill_price.map(|p| p.to_string()),
            order.status.as_str(),
            order.stop_loss_price.map(|p| p.to_string()),
            order.linked_entry_id,
            order.created_at.to_rfc3339(),
            order.last_update_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_position(conn: &Connection, position: &Position) -> StoreResult<()> {
    let result = conn.execute(
        "INSERT INTO positions
            (va_id, symbol, side, qty, avg_entry_price, current_price,
             stop_loss_price, unrealized_pnl, opened_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            position.va_id,
            position.symbol,
            position.side.as_str(),
            position.qty.to_string(),
            position.avg_entry_price.to_string(),
            position.current_price.to_string(),
            position.stop_loss_price.to_string(),
            position.unrealized_pnl.to_string(),
            position.opened_at.to_rfc3339(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::SymbolOwned {
                symbol: position.symbol.clone(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn update_position_row(conn: &Connection, position: &Position) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE positions
         SET side = ?3, qty = ?4, avg_entry_price = ?5, current_price = ?6,
             stop_loss_price = ?7, unrealized_pnl = ?8, opened_at = ?9
         WHERE va_id = ?1 AND symbol = ?2",
        params![
            position.va_id,
            position.symbol,
            position.side.as_str(),
            position.qty.to_string(),
            position.avg_entry_price.to_string(),
            position.current_price.to_string(),
            position.stop_loss_price.to_string(),
            position.unrealized_pnl.to_string(),
            position.opened_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_trade(conn: &Connection, trade: &Trade) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO trades
            (va_id, symbol, side, qty, entry_price, exit_price, realized_pnl,
             closed_at, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            trade.va_id,
            trade.symbol,
            trade.side.as_str(),
            trade.qty.to_string(),
            trade.entry_price.to_string(),
            trade.exit_price.to_string(),
            trade.realized_pnl.to_string(),
            trade.closed_at.to_rfc3339(),
            trade.reason.as_str(),
        ],
    )?;
    Ok(())
}

fn row_to_va(row: &Row<'_>) -> rusqlite::Result<VirtualAccount> {
    Ok(VirtualAccount {
        va_id: row.get(0)?,
        balance: col_decimal(row, 1)?,
        realized_pnl: col_decimal(row, 2)?,
        unrealized_pnl: col_decimal(row, 3)?,
        wins: row.get(4)?,
        losses: row.get(5)?,
        consecutive_losses: row.get(6)?,
        max_drawdown: col_decimal(row, 7)?,
        peak_equity: col_decimal(row, 8)?,
        cooldown_until: col_opt_ts(row, 9)?,
        kill_switch: row.get(10)?,
    })
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        order_id: row.get(0)?,
        va_id: row.get(1)?,
        symbol: row.get(2)?,
        side: col_side(row, 3)?,
        intent: col_intent(row, 4)?,
        qty_requested: col_decimal(row, 5)?,
        qty_filled: col_decimal(row, 6)?,
        avg_fill_price: col_opt_decimal(row, 7)?,
        status: col_status(row, 8)?,
        stop_loss_price: col_opt_decimal(row, 9)?,
        linked_entry_id: row.get(10)?,
        created_at: col_ts(row, 11)?,
        last_update_at: col_ts(row, 12)?,
    })
}

fn row_to_position(row: &Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        va_id: row.get(0)?,
        symbol: row.get(1)?,
        side: col_side(row, 2)?,
        qty: col_decimal(row, 3)?,
        avg_entry_price: col_decimal(row, 4)?,
        current_price: col_decimal(row, 5)?,
        stop_loss_price: col_decimal(row, 6)?,
        unrealized_pnl: col_decimal(row, 7)?,
        opened_at: col_ts(row, 8)?,
    })
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        trade_id: Some(row.get(0)?),
        va_id: row.get(1)?,
        symbol: row.get(2)?,
        side: col_side(row, 3)?,
        qty: col_decimal(row, 4)?,
        entry_price: col_decimal(row, 5)?,
        exit_price: col_decimal(row, 6)?,
        realized_pnl: col_decimal(row, 7)?,
        closed_at: col_ts(row, 8)?,
        reason: col_reason(row, 9)?,
    })
}

fn conversion_err(idx: usize, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::<dyn std::error::Error + Send + Sync>::from(detail),
    )
}

fn col_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    Decimal::from_str(&raw).map_err(|err| conversion_err(idx, err.to_string()))
}

fn col_opt_decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        Decimal::from_str(&value).map_err(|err| conversion_err(idx, err.to_string()))
    })
    .transpose()
}

fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| conversion_err(idx, err.to_string()))
}

fn col_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        DateTime::parse_from_rfc3339(&value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| conversion_err(idx, err.to_string()))
    })
    .transpose()
}

fn col_side(row: &Row<'_>, idx: usize) -> rusqlite::Result<Side> {
    let raw: String = row.get(idx)?;
    match raw.as_str() {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(conversion_err(idx, format!("unknown side '{other}'"))),
    }
}

fn col_intent(row: &Row<'_>, idx: usize) -> rusqlite::Result<OrderIntent> {
    let raw: String = row.get(idx)?;
    match raw.as_str() {
        "ENTRY" => Ok(OrderIntent::Entry),
        "REDUCE_ONLY_EXIT" => Ok(OrderIntent::ReduceOnlyExit),
        "STOP_LOSS" => Ok(OrderIntent::StopLoss),
        other => Err(conversion_err(idx, format!("unknown intent '{other}'"))),
    }
}

fn col_status(row: &Row<'_>, idx: usize) -> rusqlite::Result<OrderStatus> {
    let raw: String = row.get(idx)?;
    match raw.as_str() {
        "PENDING" => Ok(OrderStatus::Pending),
        "PARTIAL" => Ok(OrderStatus::Partial),
        "FILLED" => Ok(OrderStatus::Filled),
        "CANCELED" => Ok(OrderStatus::Canceled),
        "REJECTED" => Ok(OrderStatus::Rejected),
        "EXPIRED" => Ok(OrderStatus::Expired),
        other => Err(conversion_err(idx, format!("unknown status '{other}'"))),
    }
}

fn col_reason(row: &Row<'_>, idx: usize) -> rusqlite::Result<TradeReason> {
    let raw: String = row.get(idx)?;
    match raw.as_str() {
        "MANUAL_EXIT" => Ok(TradeReason::ManualExit),
        "STOP_LOSS" => Ok(TradeReason::StopLoss),
        "RECONCILED_CLOSE" => Ok(TradeReason::ReconciledClose),
        other => Err(conversion_err(idx, format!("unknown reason '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    fn sample_va(va_id: &str) -> VirtualAccount {
        VirtualAccount::new(va_id, Decimal::from(100_000))
    }

    fn sample_position(va_id: &str, symbol: &str, qty: i64) -> Position {
        Position::open(
            va_id,
            symbol,
            Side::Buy,
            Decimal::from(qty),
            Decimal::from(100),
            Decimal::from(98),
            Utc::now(),
        )
    }

    #[test]
    fn account_round_trip_preserves_cooldown() {
        let store = Store::open_in_memory().unwrap();
        let mut va = sample_va("VA001");
        va.cooldown_until = Some(Utc::now() + chrono::Duration::seconds(300));
        va.consecutive_losses = 3;
        store.create_va(&va).unwrap();

        let loaded = store.expect_va("VA001").unwrap();
        assert_eq!(loaded.consecutive_losses, 3);
        assert!(loaded.cooldown_until.is_some());
        assert_eq!(loaded.balance, Decimal::from(100_000));
    }

    #[test]
    fn symbol_ownership_is_globally_unique() {
        let store = Store::open_in_memory().unwrap();
        store.create_va(&sample_va("VA001")).unwrap();
        store.create_va(&sample_va("VA002")).unwrap();

        let entry = Order::new(
            "VA001",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        store
            .apply_entry_fill(&entry, &sample_position("VA001", "AAPL", 10), true)
            .unwrap();

        let rival = Order::new(
            "VA002",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(5),
            Utc::now(),
        );
        let err = store
            .apply_entry_fill(&rival, &sample_position("VA002", "AAPL", 5), true)
            .unwrap_err();
        assert!(matches!(err, StoreError::SymbolOwned { .. }));

        // The rejected transaction must not leave the rival order behind.
        assert!(store.get_order(&rival.order_id).unwrap().is_none());
        assert_eq!(store.symbol_owner("AAPL").unwrap().as_deref(), Some("VA001"));
    }

    #[test]
    fn close_position_commits_trade_and_account_together() {
        let store = Store::open_in_memory().unwrap();
        let mut va = sample_va("VA001");
        store.create_va(&va).unwrap();

        let mut entry = Order::new(
            "VA001",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        entry.record_fill(Decimal::from(10), Decimal::from(100), Utc::now());
        store
            .apply_entry_fill(&entry, &sample_position("VA001", "AAPL", 10), true)
            .unwrap();

        let mut exit = Order::new(
            "VA001",
            "AAPL",
            Side::Sell,
            OrderIntent::ReduceOnlyExit,
            Decimal::from(10),
            Utc::now(),
        );
        exit.record_fill(Decimal::from(10), Decimal::from(102), Utc::now());
        let pnl = Decimal::from(20);
        va.balance += pnl;
        va.realized_pnl += pnl;
        va.wins += 1;
        let trade = Trade {
            trade_id: None,
            va_id: "VA001".into(),
            symbol: "AAPL".into(),
            side: Side::Buy,
            qty: Decimal::from(10),
            entry_price: Decimal::from(100),
            exit_price: Decimal::from(102),
            realized_pnl: pnl,
            closed_at: Utc::now(),
            reason: TradeReason::ManualExit,
        };
        let trade_id = store.close_position(&exit, &trade, &va).unwrap();
        assert!(trade_id > 0);

        assert!(store.get_position("VA001", "AAPL").unwrap().is_none());
        assert_eq!(store.sum_trade_pnl("VA001").unwrap(), pnl);
        assert_eq!(store.expect_va("VA001").unwrap().realized_pnl, pnl);
    }

    #[test]
    fn open_orders_excludes_terminal_states() {
        let store = Store::open_in_memory().unwrap();
        store.create_va(&sample_va("VA001")).unwrap();

        let mut live = Order::new(
            "VA001",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        live.record_fill(Decimal::from(4), Decimal::from(100), Utc::now());
        let mut dead = Order::new(
            "VA001",
            "MSFT",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        dead.status = OrderStatus::Canceled;
        store.save_order(&live).unwrap();
        store.save_order(&dead).unwrap();

        let open = store.open_orders().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, live.order_id);
    }

    #[test]
    fn decimal_columns_round_trip_exactly() {
        let store = Store::open_in_memory().unwrap();
        store.create_va(&sample_va("VA001")).unwrap();
        let mut position = sample_position("VA001", "AAPL", 10);
        position.avg_entry_price = Decimal::from_f64(100.6).unwrap();
        let order = Order::new(
            "VA001",
            "AAPL",
            Side::Buy,
            OrderIntent::Entry,
            Decimal::from(10),
            Utc::now(),
        );
        store.apply_entry_fill(&order, &position, true).unwrap();
        let loaded = store.get_position("VA001", "AAPL").unwrap().unwrap();
        assert_eq!(loaded.avg_entry_price, Decimal::from_f64(100.6).unwrap());
    }

    #[test]
    fn incidents_are_appended_and_listed_newest_first() {
        let store = Store::open_in_memory().unwrap();
        store.record_incident("stop_attach_failed", "order abc").unwrap();
        store.record_incident("panic_close", "symbol AAPL").unwrap();
        let incidents = store.list_incidents(10).unwrap();
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].kind, "panic_close");
    }
}
