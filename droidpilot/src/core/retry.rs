//! Bounded retry with a fixed backoff.
//!
//! Shared by the screen-consistency loop (retry while the analysis reports an
//! inconsistency) and by transient capture failures (retry while the call errors).

use std::thread;
use std::time::Duration;

use tracing::debug;

/// Maximum extra attempts and the pause before each of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

/// Last attempt's result plus how many retries were spent reaching it.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub retries: u32,
    /// The retry predicate still held after the final attempt.
    pub exhausted: bool,
}

/// Run `attempt` until `should_retry` rejects its result or retries run out.
///
/// `attempt` receives the zero-based attempt number. At most
/// `policy.max_retries + 1` attempts are made; no state other than the counter
/// is carried between them.
pub fn retry_bounded<T, E, F, P>(
    policy: &RetryPolicy,
    mut attempt: F,
    mut should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: FnMut(&Result<T, E>) -> bool,
{
    let mut retries = 0u32;
    loop {
        let result = attempt(retries);
        if !should_retry(&result) {
            return RetryOutcome {
                result,
                retries,
                exhausted: false,
            };
        }
        if retries >= policy.max_retries {
            return RetryOutcome {
                result,
                retries,
                exhausted: true,
            };
        }
        retries += 1;
        debug!(
            retry = retries,
            max_retries = policy.max_retries,
            "retrying after backoff"
        );
        if !policy.backoff.is_zero() {
            thread::sleep(policy.backoff);
        }
    }
}
