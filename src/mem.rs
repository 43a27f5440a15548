//! Session memory accounting.
//!
//! Decode-side buffers (ANS tables, ICC scratch) can grow to megabytes on
//! attacker-controlled input. Instead of touching the process allocator
//! directly, the growable paths charge a [`MemoryBudget`] owned by the
//! session, so embedders can apply a hard cap and reject early.

use crate::error::{Error, Result};

/// Default hard cap per session: 1 GiB.
pub const DEFAULT_MEMORY_CAP: usize = 1 << 30;

/// Byte-accounted hard cap for one encode or decode session.
#[derive(Debug, Clone)]
pub struct MemoryBudget {
    cap: usize,
    used: usize,
}

impl MemoryBudget {
    /// Creates a budget with the given cap in bytes.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self { cap, used: 0 }
    }

    /// Charges `bytes` against the cap.
    pub fn charge(&mut self, bytes: usize) -> Result<()> {
        let remaining = self.cap - self.used;
        if bytes > remaining {
            return Err(Error::MemoryLimitExceeded {
                requested: bytes,
                remaining,
            });
        }
        self.used += bytes;
        Ok(())
    }

    /// Bytes charged so far.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_within_cap() {
        let mut budget = MemoryBudget::new(1024);
        budget.charge(1000).unwrap();
        assert_eq!(budget.used(), 1000);
        budget.charge(24).unwrap();
    }

    #[test]
    fn test_charge_over_cap_rejected() {
        let mut budget = MemoryBudget::new(100);
        budget.charge(64).unwrap();
        let err = budget.charge(64).unwrap_err();
        assert_eq!(
            err,
            Error::MemoryLimitExceeded {
                requested: 64,
                remaining: 36
            }
        );
    }
}
