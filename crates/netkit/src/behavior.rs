//! Per-call behavior policy.
//!
//! A [`CallBehavior`] does not change anything about the request itself. The
//! scheduler reads it to decide how the call is gated, timed out, retried and
//! redirected once it has been submitted. The value is snapshotted at
//! submission, so a behavior can be reused and modified freely afterwards.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    context::ContextId,
    error::{NetkitError, NetkitResult},
};

/// Admission class of a call.
///
/// Each priority has its own bucket with its own quota of concurrently
/// active calls (see [`crate::QuotaPolicy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// UX-critical loads. Never quota-limited by default.
    High,
    /// Most API calls that return data to the user.
    Medium,
    /// Calls that must go out eventually but are not time-critical.
    Low,
    /// Bulk or non-critical transfers, one at a time by default.
    Background,
}

impl Priority {
    /// Number of priority buckets.
    pub const COUNT: usize = 4;

    /// All priorities, highest first.
    pub const ALL: [Priority; Self::COUNT] = [
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Background,
    ];

    /// Bucket index of this priority.
    pub fn index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
            Self::Background => 3,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Background => "background",
        };
        f.write_str(name)
    }
}

/// How long to wait before a retry re-enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryDelayPolicy {
    /// Wait the configured retry delay every time.
    #[default]
    FixedInterval,
    /// Wait an amount that grows logarithmically with the retry count.
    LogarithmicBackoff,
}

/// Which URL a retry targets after the call has been redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RedirectRetryPolicy {
    /// Retries always start again from the URL the call was submitted with.
    #[default]
    RetryFromTopURL,
    /// Every redirect target is pushed onto the call's redirect stack and
    /// retries go straight to the most recent one.
    StoreRedirectStack,
}

/// Immutable policy governing one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallBehavior {
    priority: Priority,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    retry_delay_policy: RetryDelayPolicy,
    retry_jitter: f64,
    redirect_retry_policy: RedirectRetryPolicy,
    accept_compression: bool,
    allow_cached_responses: bool,
    context: ContextId,
}

impl Default for CallBehavior {
    fn default() -> Self {
        Self {
            priority: Priority::Medium,
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            retry_delay_policy: RetryDelayPolicy::FixedInterval,
            retry_jitter: 0.0,
            redirect_retry_policy: RedirectRetryPolicy::RetryFromTopURL,
            accept_compression: true,
            allow_cached_responses: false,
            context: ContextId::main(),
        }
    }
}

impl CallBehavior {
    /// Upper bound for the base retry delay and for any computed delay.
    pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

    /// Start building a behavior from the defaults.
    pub fn builder() -> CallBehaviorBuilder {
        CallBehaviorBuilder {
            inner: Self::default(),
        }
    }

    /// Start building a modified copy of this behavior.
    pub fn to_builder(&self) -> CallBehaviorBuilder {
        CallBehaviorBuilder {
            inner: self.clone(),
        }
    }

    /// Copy of this behavior with a different priority.
    pub fn with_priority(&self, priority: Priority) -> Self {
        Self {
            priority,
            ..self.clone()
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn retry_delay_policy(&self) -> RetryDelayPolicy {
        self.retry_delay_policy
    }

    pub fn retry_jitter(&self) -> f64 {
        self.retry_jitter
    }

    pub fn redirect_retry_policy(&self) -> RedirectRetryPolicy {
        self.redirect_retry_policy
    }

    pub fn accept_compression(&self) -> bool {
        self.accept_compression
    }

    pub fn allow_cached_responses(&self) -> bool {
        self.allow_cached_responses
    }

    /// Execution context that receives this call's callbacks.
    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// Validate the behavior.
    pub fn validate(&self) -> NetkitResult<()> {
        if self.timeout.is_zero() {
            return Err(NetkitError::config("Call timeout must be > 0"));
        }
        if self.retry_delay > Self::MAX_RETRY_DELAY {
            return Err(NetkitError::config(format!(
                "Retry delay must be <= {}s",
                Self::MAX_RETRY_DELAY.as_secs()
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) || !self.retry_jitter.is_finite() {
            return Err(NetkitError::config(
                "Retry jitter must be between 0.0 and 1.0",
            ));
        }
        if self.context.as_str().is_empty() {
            return Err(NetkitError::config("Callback context id cannot be empty"));
        }
        Ok(())
    }
}

/// Builder for [`CallBehavior`]. Values are checked in [`build`](Self::build),
/// never clamped.
#[derive(Debug, Clone)]
pub struct CallBehaviorBuilder {
    inner: CallBehavior,
}

impl CallBehaviorBuilder {
    /// Set the priority bucket.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.inner.priority = priority;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.inner.timeout = timeout;
        self
    }

    /// Set the per-attempt timeout in seconds.
    ///
    /// Non-positive and non-finite values are rejected by `build`.
    #[must_use]
    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.inner.timeout = Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO);
        self
    }

    /// Set the maximum number of retries after the first attempt.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.inner.max_retries = retries;
        self
    }

    /// Set the base delay between retries.
    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.inner.retry_delay = delay;
        self
    }

    /// Set the retry delay policy.
    #[must_use]
    pub fn retry_delay_policy(mut self, policy: RetryDelayPolicy) -> Self {
        self.inner.retry_delay_policy = policy;
        self
    }

    /// Set the random jitter factor (0.0-1.0) applied to retry delays.
    #[must_use]
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.inner.retry_jitter = jitter;
        self
    }

    /// Set the redirect retry policy.
    #[must_use]
    pub fn redirect_retry_policy(mut self, policy: RedirectRetryPolicy) -> Self {
        self.inner.redirect_retry_policy = policy;
        self
    }

    /// Set whether compressed responses are accepted.
    #[must_use]
    pub fn accept_compression(mut self, accept: bool) -> Self {
        self.inner.accept_compression = accept;
        self
    }

    /// Set whether cached responses are acceptable.
    #[must_use]
    pub fn allow_cached_responses(mut self, allow: bool) -> Self {
        self.inner.allow_cached_responses = allow;
        self
    }

    /// Set the execution context that receives callbacks.
    #[must_use]
    pub fn context(mut self, context: impl Into<ContextId>) -> Self {
        self.inner.context = context.into();
        self
    }

    /// Validate and build the behavior.
    pub fn build(self) -> NetkitResult<CallBehavior> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let behavior = CallBehavior::default();
        assert_eq!(behavior.priority(), Priority::Medium);
        assert_eq!(behavior.timeout(), Duration::from_secs(30));
        assert_eq!(behavior.max_retries(), 2);
        assert_eq!(behavior.retry_delay_policy(), RetryDelayPolicy::FixedInterval);
        assert_eq!(
            behavior.redirect_retry_policy(),
            RedirectRetryPolicy::RetryFromTopURL
        );
        assert!(behavior.accept_compression());
        assert!(!behavior.allow_cached_responses());
        assert_eq!(behavior.context().as_str(), "main");
        assert!(behavior.validate().is_ok());
    }

    #[test]
    fn test_builder_derives_copy() {
        let base = CallBehavior::default();
        let derived = base
            .to_builder()
            .priority(Priority::Background)
            .max_retries(5)
            .context("uploads")
            .build()
            .unwrap();

        assert_eq!(derived.priority(), Priority::Background);
        assert_eq!(derived.max_retries(), 5);
        assert_eq!(derived.context().as_str(), "uploads");
        // The source is untouched.
        assert_eq!(base.priority(), Priority::Medium);
        assert_eq!(base.max_retries(), 2);
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let err = CallBehavior::builder()
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, NetkitError::Config { .. }));

        assert!(CallBehavior::builder().timeout_secs(-1.0).build().is_err());
        assert!(CallBehavior::builder().timeout_secs(f64::NAN).build().is_err());
        assert!(CallBehavior::builder().timeout_secs(0.25).build().is_ok());
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        assert!(CallBehavior::builder().retry_jitter(1.5).build().is_err());
        assert!(CallBehavior::builder().retry_jitter(0.3).build().is_ok());
    }

    #[test]
    fn test_huge_retry_delay_rejected() {
        let err = CallBehavior::builder()
            .retry_delay(Duration::from_secs(u64::MAX / 2))
            .max_retries(1)
            .build()
            .unwrap_err();
        assert!(matches!(err, NetkitError::Config { .. }));

        assert!(
            CallBehavior::builder()
                .retry_delay(Duration::MAX)
                .retry_delay_policy(RetryDelayPolicy::LogarithmicBackoff)
                .build()
                .is_err()
        );
        assert!(
            CallBehavior::builder()
                .retry_delay(CallBehavior::MAX_RETRY_DELAY)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn test_priority_indices() {
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
        let high = CallBehavior::default().with_priority(Priority::High);
        assert_eq!(high.priority(), Priority::High);
    }
}
