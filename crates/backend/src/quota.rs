//! Admission control for bytes sent to a backend.
//!
//! A manager reserves a chunk's size before sending it, then commits the
//! reservation on success or releases it on failure.

use std::sync::Mutex;

use tracing::debug;

use crate::error::BackendError;

pub trait QuotaGate: Send + Sync {
    /// Reserves `cost` bytes, failing with `QuotaOrPermission` if the
    /// budget cannot cover them.
    fn check_and_reserve(&self, cost: u64) -> Result<(), BackendError>;

    /// Turns a reservation into usage.
    fn commit(&self, cost: u64);

    /// Returns a reservation that was not used.
    fn release(&self, cost: u64);
}

/// Admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl QuotaGate for Unlimited {
    fn check_and_reserve(&self, _cost: u64) -> Result<(), BackendError> {
        Ok(())
    }

    fn commit(&self, _cost: u64) {}

    fn release(&self, _cost: u64) {}
}

#[derive(Debug, Default)]
struct Usage {
    used: u64,
    reserved: u64,
}

/// Fixed byte budget shared by every manager holding the gate.
#[derive(Debug)]
pub struct ByteBudget {
    limit: u64,
    usage: Mutex<Usage>,
}

impl ByteBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            usage: Mutex::new(Usage::default()),
        }
    }

    /// Bytes committed so far.
    pub fn used(&self) -> u64 {
        self.usage.lock().unwrap().used
    }

    /// Bytes neither committed nor reserved.
    pub fn remaining(&self) -> u64 {
        let usage = self.usage.lock().unwrap();
        self.limit
            .saturating_sub(usage.used)
            .saturating_sub(usage.reserved)
    }
}

impl QuotaGate for ByteBudget {
    fn check_and_reserve(&self, cost: u64) -> Result<(), BackendError> {
        let mut usage = self.usage.lock().unwrap();
        let committed = usage.used.saturating_add(usage.reserved);
        if committed.saturating_add(cost) > self.limit {
            return Err(BackendError::QuotaOrPermission(format!(
                "byte budget exceeded: {cost} requested, {} of {} available",
                self.limit.saturating_sub(committed),
                self.limit
            )));
        }
        usage.reserved += cost;
        debug!(cost, reserved = usage.reserved, "quota reserved");
        Ok(())
    }

    fn commit(&self, cost: u64) {
        let mut usage = self.usage.lock().unwrap();
        usage.reserved = usage.reserved.saturating_sub(cost);
        usage.used = usage.used.saturating_add(cost);
    }

    fn release(&self, cost: u64) {
        let mut usage = self.usage.lock().unwrap();
        usage.reserved = usage.reserved.saturating_sub(cost);
    }
}
