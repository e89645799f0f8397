//! Bounded exponential-backoff polling for convergence waits.
//!
//! Provisioning in the control plane is not instantaneous, so activation and
//! deletion are observed by re-fetching with growing pauses in between. The
//! budget is a hard bound: once the steps run out the wait reports a timeout
//! instead of hanging. Dropping the returned future cancels the wait, which
//! is how caller deadlines abort it promptly.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub factor: f64,
    pub steps: u32,
}

#[derive(Debug)]
pub enum WaitError<E> {
    /// The step budget ran out before the condition held.
    Timeout,
    /// An attempt failed; polling stops immediately.
    Failed(E),
}

/// Polls `attempt` until it yields a value, fails, or the budget runs out.
///
/// The first attempt runs immediately; sleeps happen between attempts, each
/// one `factor` times longer than the previous.
pub async fn wait_for<T, E, F, Fut>(backoff: Backoff, mut attempt: F) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut delay = backoff.initial_delay;
    for step in 0..backoff.steps {
        match attempt().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) => return Err(WaitError::Failed(err)),
        }
        if step + 1 < backoff.steps {
            tokio::time::sleep(delay).await;
            delay = delay.mul_f64(backoff.factor);
        }
    }
    Err(WaitError::Timeout)
}
