//! Backoff computation for work-item retries (§4.6 step 5).

use std::time::Duration;

use crate::model::step::BackoffType;

/// `fixed`=B, `linear`=B·n, `exponential`=min(B·2^(n−1), MaxBackoff), for
/// the n-th retry (1-indexed, `n = RetryCount + 1`).
pub fn backoff_for_attempt(
    backoff_type: BackoffType,
    base: Duration,
    max_backoff: Duration,
    attempt: u32,
) -> Duration {
    let attempt = attempt.max(1);
    match backoff_type {
        BackoffType::Fixed => base,
        BackoffType::Linear => base.saturating_mul(attempt),
        BackoffType::Exponential => {
            let shift = attempt.saturating_sub(1).min(32);
            let scaled = base.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
            scaled.min(max_backoff)
        }
    }
}
