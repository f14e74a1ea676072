//! Shared retry/backoff policy (spec §4.7, §9 "a single shared policy
//! object, not inlined at each call site").

use rand::Rng;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_millis(250);
const CAP_DELAY: Duration = Duration::from_secs(8);
pub const MAX_THROTTLE_ATTEMPTS: u32 = 5;

/// Exponential backoff with full jitter, base 250ms, cap 8s.
pub struct BackoffPolicy;

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(attempt: u32) -> Duration {
        let exp = BASE_DELAY.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
        let capped = exp.min(CAP_DELAY);
        let jittered_millis = rand::thread_rng().gen_range(0..=capped.as_millis().max(1) as u64);
        Duration::from_millis(jittered_millis)
    }

    pub async fn sleep_for_attempt(attempt: u32) {
        tokio::time::sleep(Self::delay_for_attempt(attempt)).await;
    }
}
