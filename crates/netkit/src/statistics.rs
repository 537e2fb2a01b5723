//! Scheduler statistics.
//!
//! Counters are updated by the scheduler inside the same critical section as
//! the state transition they describe. Readers get a [`StatisticsSnapshot`],
//! an owned copy that later transitions never touch.

use std::time::Duration;

use serde::Serialize;

use crate::{behavior::Priority, error::CallErrorKind, quota::InFlightLedger};

/// Terminal failures, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailureTotals {
    pub no_connection: u64,
    pub timed_out: u64,
    pub bad_request: u64,
    pub bad_server: u64,
    pub internal: u64,
}

impl FailureTotals {
    pub fn get(&self, kind: CallErrorKind) -> u64 {
        match kind {
            CallErrorKind::NoConnection => self.no_connection,
            CallErrorKind::TimedOut => self.timed_out,
            CallErrorKind::BadRequest => self.bad_request,
            CallErrorKind::BadServer => self.bad_server,
            CallErrorKind::Internal => self.internal,
        }
    }

    pub fn total(&self) -> u64 {
        CallErrorKind::ALL.iter().map(|kind| self.get(*kind)).sum()
    }

    fn record(&mut self, kind: CallErrorKind) {
        let slot = match kind {
            CallErrorKind::NoConnection => &mut self.no_connection,
            CallErrorKind::TimedOut => &mut self.timed_out,
            CallErrorKind::BadRequest => &mut self.bad_request,
            CallErrorKind::BadServer => &mut self.bad_server,
            CallErrorKind::Internal => &mut self.internal,
        };
        *slot += 1;
    }
}

/// Point-in-time copy of the scheduler's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    /// Calls with an attempt in flight.
    pub num_calls_in_flight: u64,
    /// Live calls that have been retried at least once.
    pub num_retries_in_flight: u64,
    /// In-flight calls per bucket, indexed by [`Priority::index`].
    pub in_flight_by_priority: [u64; Priority::COUNT],
    /// Queued calls per bucket, indexed by [`Priority::index`].
    pub queued_by_priority: [u64; Priority::COUNT],
    /// Terminal failures by kind.
    pub failures: FailureTotals,
    pub total_submitted: u64,
    pub total_successful_calls: u64,
    pub total_failed_calls: u64,
    pub total_cancelled_calls: u64,
    /// Retries scheduled, over all calls.
    pub total_retries: u64,
    /// Mean duration of the successful attempt, over successful calls.
    pub mean_latency: Duration,
}

impl StatisticsSnapshot {
    pub fn in_flight(&self, priority: Priority) -> u64 {
        self.in_flight_by_priority[priority.index()]
    }

    pub fn queued(&self, priority: Priority) -> u64 {
        self.queued_by_priority[priority.index()]
    }

    /// Calculate the success rate over completed calls.
    pub fn success_rate(&self) -> f64 {
        let completed = self.total_successful_calls + self.total_failed_calls;
        if completed == 0 {
            0.0
        } else {
            self.total_successful_calls as f64 / completed as f64
        }
    }

    /// Calculate the error rate over completed calls.
    pub fn error_rate(&self) -> f64 {
        let completed = self.total_successful_calls + self.total_failed_calls;
        if completed == 0 {
            0.0
        } else {
            self.total_failed_calls as f64 / completed as f64
        }
    }
}

/// Write side of the statistics, owned by the scheduler state.
#[derive(Debug, Default)]
pub(crate) struct StatisticsRecorder {
    failures: FailureTotals,
    submitted: u64,
    successful: u64,
    failed: u64,
    cancelled: u64,
    retries: u64,
    retries_in_flight: u64,
    latency_sum: Duration,
}

impl StatisticsRecorder {
    pub(crate) fn record_submitted(&mut self) {
        self.submitted += 1;
    }

    /// Count a scheduled retry. `first` marks the call's first retry.
    pub(crate) fn record_retry(&mut self, first: bool) {
        self.retries += 1;
        if first {
            self.retries_in_flight += 1;
        }
    }

    pub(crate) fn record_success(&mut self, latency: Duration, retried: bool) {
        self.successful += 1;
        self.latency_sum += latency;
        self.record_exit(retried);
    }

    pub(crate) fn record_failure(&mut self, kind: CallErrorKind, retried: bool) {
        self.failed += 1;
        self.failures.record(kind);
        self.record_exit(retried);
    }

    pub(crate) fn record_cancel(&mut self, retried: bool) {
        self.cancelled += 1;
        self.record_exit(retried);
    }

    fn record_exit(&mut self, retried: bool) {
        if retried {
            self.retries_in_flight = self.retries_in_flight.saturating_sub(1);
        }
    }

    pub(crate) fn snapshot(
        &self,
        ledger: &InFlightLedger,
        queued: [usize; Priority::COUNT],
    ) -> StatisticsSnapshot {
        let mut in_flight_by_priority = [0; Priority::COUNT];
        for priority in Priority::ALL {
            in_flight_by_priority[priority.index()] = ledger.in_flight(priority) as u64;
        }
        let mean_latency = if self.successful == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.latency_sum.as_secs_f64() / self.successful as f64)
        };

        StatisticsSnapshot {
            num_calls_in_flight: ledger.total() as u64,
            num_retries_in_flight: self.retries_in_flight,
            in_flight_by_priority,
            queued_by_priority: queued.map(|n| n as u64),
            failures: self.failures,
            total_submitted: self.submitted,
            total_successful_calls: self.successful,
            total_failed_calls: self.failed,
            total_cancelled_calls: self.cancelled,
            total_retries: self.retries,
            mean_latency,
        }
    }
}
