use std::time::Duration;

use rand::RngExt;

use crate::behavior::{CallBehavior, RetryDelayPolicy};

/// Delay before the retry numbered `retry_count` (1 for the first retry).
///
/// `FixedInterval` always waits `base`. `LogarithmicBackoff` waits
/// `base * (1 + ln(retry_count))`, so the first retry waits `base` and later
/// retries grow slowly. A non-zero `jitter` blends in a random fraction of
/// the computed delay. The result never exceeds
/// [`CallBehavior::MAX_RETRY_DELAY`].
pub(crate) fn retry_delay(
    policy: RetryDelayPolicy,
    base: Duration,
    retry_count: u32,
    jitter: f64,
) -> Duration {
    let max = CallBehavior::MAX_RETRY_DELAY.as_secs_f64();
    let base = base.as_secs_f64();
    let delay = match policy {
        RetryDelayPolicy::FixedInterval => base,
        RetryDelayPolicy::LogarithmicBackoff => {
            let n = f64::from(retry_count.max(1));
            base * (1.0 + n.ln())
        }
    }
    .min(max);

    if jitter == 0.0 || delay == 0.0 {
        return clamp(delay);
    }

    let mut rng = rand::rng();
    let randomized = rng.random_range(0.0..=delay);
    let blended = delay * (1.0 - jitter) + randomized * jitter;
    clamp(blended)
}

fn clamp(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(CallBehavior::MAX_RETRY_DELAY)
        .min(CallBehavior::MAX_RETRY_DELAY)
}
