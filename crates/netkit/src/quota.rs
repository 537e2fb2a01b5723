//! Per-priority admission quotas.
//!
//! Each priority bucket may have at most `quota` calls active at a time. A
//! quota of zero means the bucket is unlimited.

use serde::{Deserialize, Serialize};

use crate::behavior::Priority;

/// Maximum concurrently active calls per priority bucket (0 = unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    quotas: [usize; Priority::COUNT],
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            quotas: [0, 4, 2, 1],
        }
    }
}

impl QuotaPolicy {
    /// A policy with no limit on any bucket.
    pub fn unlimited() -> Self {
        Self {
            quotas: [0; Priority::COUNT],
        }
    }

    /// Set the quota for one bucket.
    #[must_use]
    pub fn with_quota(mut self, priority: Priority, quota: usize) -> Self {
        self.quotas[priority.index()] = quota;
        self
    }

    /// Quota for a bucket. Zero means unlimited.
    pub fn quota(&self, priority: Priority) -> usize {
        self.quotas[priority.index()]
    }

    /// Whether a bucket with `in_flight` active calls may admit another one.
    pub fn allows(&self, priority: Priority, in_flight: usize) -> bool {
        let quota = self.quota(priority);
        quota == 0 || in_flight < quota
    }
}

/// In-flight counters for every bucket.
///
/// Incremented once per admission and decremented once when the attempt
/// leaves the active state.
#[derive(Debug, Default)]
pub(crate) struct InFlightLedger {
    in_flight: [usize; Priority::COUNT],
}

impl InFlightLedger {
    pub(crate) fn has_capacity(&self, policy: &QuotaPolicy, priority: Priority) -> bool {
        policy.allows(priority, self.in_flight[priority.index()])
    }

    pub(crate) fn admit(&mut self, priority: Priority) {
        self.in_flight[priority.index()] += 1;
    }

    /// Returns `false` if the bucket was already empty, which means the
    /// caller broke the admit/release pairing.
    pub(crate) fn release(&mut self, priority: Priority) -> bool {
        let slot = &mut self.in_flight[priority.index()];
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }

    pub(crate) fn in_flight(&self, priority: Priority) -> usize {
        self.in_flight[priority.index()]
    }

    pub(crate) fn total(&self) -> usize {
        self.in_flight.iter().sum()
    }
}
