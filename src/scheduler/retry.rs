//! Retry and backoff policy applied to failed jobs.

use crate::config::Settings;
use crate::store::Job;

/// Backoff delays are clamped to at most one day in the future.
pub const MAX_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Re-queue as `pending`, eligible at `run_after`.
    Retry { run_after: i64 },
    /// Retry budget exhausted, banish to the dead-letter queue.
    Dead,
}

/// Decide what happens to `job` after a failed attempt at time `now`.
///
/// The job's own `max_retries` wins over the configured default; a job
/// therefore undergoes at most `max_retries + 1` attempts before dying.
/// Returns the incremented attempt count together with the verdict.
pub fn on_failure(job: &Job, settings: &Settings, now: i64) -> (u32, RetryVerdict) {
    let new_attempts = job.attempts.saturating_add(1);
    let cap = job.max_retries.unwrap_or(settings.max_retries);
    if new_attempts > cap {
        (new_attempts, RetryVerdict::Dead)
    } else {
        let delay = backoff_delay_ms(settings.backoff_base, new_attempts, settings.backoff_factor_ms);
        (
            new_attempts,
            RetryVerdict::Retry {
                run_after: now.saturating_add(delay as i64),
            },
        )
    }
}

/// `base^attempts * factor_ms`, with checked integer arithmetic saturating
/// into the one-day clamp.
pub fn backoff_delay_ms(base: u32, attempts: u32, factor_ms: u64) -> u64 {
    (base as u64)
        .checked_pow(attempts)
        .and_then(|pow| pow.checked_mul(factor_ms))
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_MS)
}
