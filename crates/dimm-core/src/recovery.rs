// ── Fault recovery policy ──
//
// A faulted controller never reconnects by itself. Whoever owns it decides
// when to call `recover()`; this policy tells them how long to wait.

use std::time::Duration;

/// Exponential backoff between recovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    /// Delay before the first attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the delay before jitter. Default: 30s.
    pub max_delay: Duration,

    /// Attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl RecoveryPolicy {
    /// Delay before attempt number `attempt` (zero based), or `None` once
    /// the retry budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if self.max_retries.is_some_and(|max| attempt >= max) {
            return None;
        }
        Some(calculate_backoff(attempt, self))
    }
}

/// Per-attempt spread, in percent, cycled by attempt number. The first
/// attempt always waits exactly `initial_delay`.
const JITTER_PERCENT: [i8; 8] = [0, 20, -15, 10, -25, 5, -10, 25];

/// `initial * 2^attempt`, capped at `max_delay`, then spread by up to 25%
/// either way so monitors restarted together do not reconnect in lockstep.
fn calculate_backoff(attempt: u32, policy: &RecoveryPolicy) -> Duration {
    let delay = policy
        .initial_delay
        .saturating_mul(1 << attempt.min(31))
        .min(policy.max_delay);

    let slot = usize::try_from(attempt).unwrap_or_default() % JITTER_PERCENT.len();
    let percent = JITTER_PERCENT[slot];
    if percent == 0 {
        return delay;
    }
    let factor = 1.0 + f64::from(percent) / 100.0;
    // Out of range only when the capped delay is already near Duration::MAX
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}

// ── Tests ────────────────────────────────────────────────────────────
