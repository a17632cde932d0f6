//! One-symbol-per-VA reservations, the cheap first gate of the pipeline.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use arbiter_core::{AdmissionOutcome, Position, RejectReason, Symbol, VaId};

/// Tracks which symbol each virtual account is currently committed to.
///
/// The router does not consult the position table on the hot path; the
/// store's unique-symbol constraint remains the global backstop and ownership
/// is re-checked before order placement.
#[derive(Default)]
pub struct SignalRouter {
    reservations: Mutex<HashMap<VaId, Symbol>>,
}

impl SignalRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild reservations from the open positions found at startup.
    pub fn rehydrate(&self, positions: &[Position]) {
        let mut reservations = self.reservations.lock().unwrap();
        reservations.clear();
        for position in positions {
            reservations.insert(position.va_id.clone(), position.symbol.clone());
        }
        debug!(count = reservations.len(), "router reservations rehydrated");
    }

    /// Accept the signal if the account is free or already committed to the
    /// same symbol; reserve on first contact.
    pub fn route(&self, va_id: &str, symbol: &str) -> AdmissionOutcome {
        let mut reservations = self.reservations.lock().unwrap();
        match reservations.get(va_id) {
            None => {
                reservations.insert(va_id.to_string(), symbol.to_string());
                AdmissionOutcome::Accepted
            }
            Some(reserved) if reserved == symbol => AdmissionOutcome::Accepted,
            Some(reserved) => AdmissionOutcome::Rejected(RejectReason::SymbolConflict {
                reserved: reserved.clone(),
            }),
        }
    }

    /// Release a reservation once the backing position is gone. Idempotent;
    /// a mismatched symbol is left untouched.
    pub fn release(&self, va_id: &str, symbol: &str) {
        let mut reservations = self.reservations.lock().unwrap();
        if reservations.get(va_id).is_some_and(|reserved| reserved == symbol) {
            reservations.remove(va_id);
            debug!(va_id, symbol, "symbol reservation released");
        }
    }

    /// Current reservation of an account, if any.
    #[must_use]
    pub fn reserved(&self, va_id: &str) -> Option<Symbol> {
        self.reservations.lock().unwrap().get(va_id).cloned()
    }
}
