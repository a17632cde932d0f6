//! Per-VA rate and damage control: cooldown state machine, throttling and
//! trade accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use arbiter_config::GovernorSettings;
use arbiter_core::{AdmissionOutcome, Price, RejectReason, VaId, VirtualAccount};
use arbiter_store::Store;

use crate::EngineResult;

/// Thresholds applied by the governor.
#[derive(Clone, Debug)]
pub struct GovernorConfig {
    pub max_loss_cooldown: u32,
    pub cooldown_duration: Duration,
    pub max_open_positions_per_va: usize,
}

impl GovernorConfig {
    pub fn from_settings(settings: &GovernorSettings) -> Self {
        Self {
            max_loss_cooldown: settings.max_loss_cooldown,
            cooldown_duration: Duration::seconds(settings.cooldown_duration_seconds as i64),
            max_open_positions_per_va: settings.max_open_positions_per_va,
        }
    }
}

/// Admission and accounting authority for virtual accounts.
///
/// The open-position counter is a write-through cache rebuilt at startup;
/// durable account state lives in the store and is only mutated here and by
/// the order manager's close transaction.
pub struct Governor {
    store: Arc<Store>,
    config: GovernorConfig,
    kill_switch: Arc<AtomicBool>,
    open_positions: Mutex<HashMap<VaId, usize>>,
}

impl Governor {
    pub fn new(store: Arc<Store>, config: GovernorConfig, kill_switch: Arc<AtomicBool>) -> Self {
        Self {
            store,
            config,
            kill_switch,
            open_positions: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the open-position counters from persisted positions.
    pub fn rehydrate(&self) -> EngineResult<()> {
        let mut counts: HashMap<VaId, usize> = HashMap::new();
        for position in self.store.list_positions()? {
            *counts.entry(position.va_id).or_insert(0) += 1;
        }
        *self.open_positions.lock().unwrap() = counts;
        Ok(())
    }

    /// Check order: kill switch, cooldown, throttle. An expired cooldown is
    /// cleared on observation, returning the account to `ACTIVE` with a fresh
    /// loss streak.
    pub fn admit(&self, va_id: &str, now: DateTime<Utc>) -> EngineResult<AdmissionOutcome> {
        let mut va = self.store.expect_va(va_id)?;

        if self.kill_switch.load(Ordering::SeqCst) || va.kill_switch {
            return Ok(AdmissionOutcome::Rejected(RejectReason::KillSwitchEngaged));
        }

        if let Some(until) = va.cooldown_until {
            if until > now {
                return Ok(AdmissionOutcome::Rejected(RejectReason::InCooldown { until }));
            }
            va.cooldown_until = None;
            va.consecutive_losses = 0;
            self.store.update_va(&va)?;
            info!(va_id, "cooldown expired, account active again");
        }

        let open_positions = self.open_position_count(va_id);
        if open_positions >= self.config.max_open_positions_per_va {
            return Ok(AdmissionOutcome::Rejected(RejectReason::Throttled {
                open_positions,
            }));
        }

        Ok(AdmissionOutcome::Accepted)
    }

    /// Apply a closed trade to the account: balance, realized PnL, win/loss
    /// streaks, peak equity and drawdown. A loss that reaches the configured
    /// streak arms the cooldown; a win resets the streak but never clears a
    /// cooldown that is still running.
    pub fn settle_trade(&self, va: &mut VirtualAccount, realized_pnl: Price, now: DateTime<Utc>) {
        // Results can land here without passing through `admit` (stop-trigger
        // closes do). A cooldown that already ran out by wall clock is cleared
        // first so a late result counts toward stats but never extends it.
        if va.cooldown_until.is_some_and(|until| until <= now) {
            va.cooldown_until = None;
            va.consecutive_losses = 0;
        }

        va.balance += realized_pnl;
        va.realized_pnl += realized_pnl;

        if realized_pnl < Decimal::ZERO {
            va.losses += 1;
            va.consecutive_losses += 1;
        } else {
            va.wins += 1;
            va.consecutive_losses = 0;
        }

        if va.balance > va.peak_equity {
            va.peak_equity = va.balance;
        }
        let drawdown = std::cmp::max(va.peak_equity - va.balance, Decimal::ZERO);
        if drawdown > va.max_drawdown {
            va.max_drawdown = drawdown;
        }

        if realized_pnl < Decimal::ZERO && va.consecutive_losses >= self.config.max_loss_cooldown {
            va.cooldown_until = Some(now + self.config.cooldown_duration);
            info!(
                va_id = %va.va_id,
                consecutive_losses = va.consecutive_losses,
                until = %va.cooldown_until.unwrap(),
                "cooldown armed after loss streak"
            );
        }
    }

    pub fn on_position_opened(&self, va_id: &str) {
        let mut counts = self.open_positions.lock().unwrap();
        let count = counts.entry(va_id.to_string()).or_insert(0);
        *count += 1;
        debug!(va_id, open_positions = *count, "position opened");
    }

    pub fn on_position_closed(&self, va_id: &str) {
        let mut counts = self.open_positions.lock().unwrap();
        if let Some(count) = counts.get_mut(va_id) {
            *count = count.saturating_sub(1);
            debug!(va_id, open_positions = *count, "position closed");
        }
    }

    #[must_use]
    pub fn open_position_count(&self, va_id: &str) -> usize {
        self.open_positions
            .lock()
            .unwrap()
            .get(va_id)
            .copied()
            .unwrap_or(0)
    }
}
