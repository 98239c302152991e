//! Credit reservation guard for embedding spend.
//!
//! Every embedding call is wrapped in a reservation placed before the true
//! cost is known, resolved afterwards by exactly one `adjust` (charge the
//! actual usage) or `refund` (release the estimate). BYOK calls reserve for
//! audit only and are never charged against the platform pool.
//!
//! # Invariants
//! - `spent + reserved <= balance` for billable reservations (admission control)
//! - a reservation id resolves at most once: both `adjust` and `refund` fail
//!   on an id that is unknown or already resolved

use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::error::CreditError;

/// Identifier of one open reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationId(Uuid);

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    estimate: u64,
    billable: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    spent: u64,
    reserved: u64,
    open: HashMap<Uuid, Reservation>,
    audit_resolved: u64,
}

/// Pre-charge ledger for embedding credits, in token units.
pub struct CreditGuard {
    balance: u64,
    state: Mutex<Ledger>,
}

impl CreditGuard {
    /// Create a guard over a platform credit pool.
    pub fn new(balance: u64) -> Self {
        Self {
            balance,
            state: Mutex::new(Ledger::default()),
        }
    }

    /// Reserve estimated credits ahead of a generation call.
    ///
    /// Billable reservations are admission-controlled against the pool;
    /// non-billable (BYOK) reservations always succeed and exist for audit.
    pub fn reserve(&self, estimate: u64, billable: bool) -> Result<ReservationId, CreditError> {
        let mut state = self.state.lock().expect("credit ledger poisoned");

        if billable {
            let committed = state.spent.saturating_add(state.reserved);
            let available = self.balance.saturating_sub(committed);
            if estimate > available {
                return Err(CreditError::Insufficient {
                    needed: estimate,
                    available,
                });
            }
            state.reserved += estimate;
        }

        let id = Uuid::new_v4();
        state.open.insert(id, Reservation { estimate, billable });
        Ok(ReservationId(id))
    }

    /// Resolve a reservation with the actual usage.
    pub fn adjust(&self, id: ReservationId, actual: u64) -> Result<(), CreditError> {
        let mut state = self.state.lock().expect("credit ledger poisoned");
        let reservation = state
            .open
            .remove(&id.0)
            .ok_or_else(|| CreditError::UnknownReservation(id.to_string()))?;

        if reservation.billable {
            state.reserved = state.reserved.saturating_sub(reservation.estimate);
            state.spent = state.spent.saturating_add(actual);
        } else {
            state.audit_resolved += 1;
        }
        Ok(())
    }

    /// Resolve a reservation by releasing the full estimate (the generation
    /// failed, nothing was billed).
    pub fn refund(&self, id: ReservationId) -> Result<(), CreditError> {
        let mut state = self.state.lock().expect("credit ledger poisoned");
        let reservation = state
            .open
            .remove(&id.0)
            .ok_or_else(|| CreditError::UnknownReservation(id.to_string()))?;

        if reservation.billable {
            state.reserved = state.reserved.saturating_sub(reservation.estimate);
        } else {
            state.audit_resolved += 1;
        }
        Ok(())
    }

    /// Credits spent so far.
    pub fn spent(&self) -> u64 {
        self.state.lock().expect("credit ledger poisoned").spent
    }

    /// Credits currently held by open reservations.
    pub fn reserved(&self) -> u64 {
        self.state.lock().expect("credit ledger poisoned").reserved
    }

    /// Credits still available for new billable reservations.
    pub fn available(&self) -> u64 {
        let state = self.state.lock().expect("credit ledger poisoned");
        self.balance
            .saturating_sub(state.spent.saturating_add(state.reserved))
    }

    /// Number of reservations awaiting resolution.
    pub fn open_reservations(&self) -> usize {
        self.state.lock().expect("credit ledger poisoned").open.len()
    }
}
