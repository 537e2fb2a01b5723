//! Scheduler configuration.

use std::time::Duration;

use crate::{
    behavior::CallBehavior,
    error::{NetkitError, NetkitResult},
    quota::QuotaPolicy,
};

/// Configuration for a [`crate::CallScheduler`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Per-priority admission quotas.
    pub quotas: QuotaPolicy,

    /// Period of the maintenance tick that detects timeouts and admits
    /// queued calls.
    pub maintenance_interval: Duration,

    /// Behavior used by the `get`/`post` shortcuts.
    pub default_behavior: CallBehavior,

    /// Capacity of the state-transition broadcast channel.
    pub transition_channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quotas: QuotaPolicy::default(),
            maintenance_interval: Duration::from_millis(500),
            default_behavior: CallBehavior::default(),
            transition_channel_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the admission quotas.
    #[must_use]
    pub fn quotas(mut self, quotas: QuotaPolicy) -> Self {
        self.quotas = quotas;
        self
    }

    /// Set the maintenance tick period.
    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the default call behavior.
    #[must_use]
    pub fn default_behavior(mut self, behavior: CallBehavior) -> Self {
        self.default_behavior = behavior;
        self
    }

    /// Set the transition channel capacity.
    #[must_use]
    pub fn transition_channel_capacity(mut self, capacity: usize) -> Self {
        self.transition_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> NetkitResult<()> {
        if self.maintenance_interval.is_zero() {
            return Err(NetkitError::config("Maintenance interval must be > 0"));
        }
        if self.transition_channel_capacity == 0 {
            return Err(NetkitError::config(
                "Transition channel capacity must be > 0",
            ));
        }
        self.default_behavior.validate()
    }
}
