//! Plain-text rendering of the dashboard read model.

use std::fmt::Write;

use arbiter_engine::DashboardSnapshot;

/// Format the snapshot as a block of aligned tables.
pub fn render_snapshot(snapshot: &DashboardSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "== arbiter @ {} ==",
        snapshot.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let _ = writeln!(
        out,
        "{:<8} {:>12} {:>10} {:>10} {:>7} {:>9} {:>10}  {}",
        "VA", "BALANCE", "REALIZED", "UNREAL", "W/L", "STREAK", "MAX DD", "STATUS"
    );
    for account in &snapshot.accounts {
        let status = if account.kill_switch {
            "KILLED".to_string()
        } else if let Some(remaining) = account.cooldown_remaining_secs {
            format!("COOLDOWN ({remaining}s)")
        } else {
            "ACTIVE".to_string()
        };
        let _ = writeln!(
            out,
            "{:<8} {:>12} {:>10} {:>10} {:>7} {:>9} {:>10}  {}",
            account.va_id,
            account.balance.round_dp(2),
            account.realized_pnl.round_dp(2),
            account.unrealized_pnl.round_dp(2),
            format!("{}/{}", account.wins, account.losses),
            account.consecutive_losses,
            account.max_drawdown.round_dp(2),
            status
        );
    }

    if snapshot.positions.is_empty() {
        let _ = writeln!(out, "(no open positions)");
    } else {
        let _ = writeln!(
            out,
            "{:<8} {:<8} {:>5} {:>8} {:>10} {:>10} {:>10} {:>10}",
            "VA", "SYMBOL", "SIDE", "QTY", "ENTRY", "CURRENT", "UPNL", "STOP"
        );
        for position in &snapshot.positions {
            let _ = writeln!(
                out,
                "{:<8} {:<8} {:>5} {:>8} {:>10} {:>10} {:>10} {:>10}",
                position.va_id,
                position.symbol,
                format!("{:?}", position.side),
                position.qty.round_dp(2),
                position.avg_entry_price.round_dp(2),
                position.current_price.round_dp(2),
                position.unrealized_pnl.round_dp(2),
                position.stop_loss_price.round_dp(2)
            );
        }
    }

    let system = &snapshot.system;
    let _ = writeln!(
        out,
        "kill_switch={} spread<= {}bps slippage<= {}bps latency<= {}ms reconcile={}s \
         signals ok/rej/drop={}/{}/{}{}",
        if system.kill_switch { "ON" } else { "off" },
        system.max_spread_bps,
        system.max_slippage_bps,
        system.max_latency_ms,
        system.reconcile_interval_secs,
        system.signals_accepted,
        system.signals_rejected,
        system.signals_dropped,
        system
            .last_error
            .as_ref()
            .map(|err| format!(" last_error={err}"))
            .unwrap_or_default()
    );
    out
}
