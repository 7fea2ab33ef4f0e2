/*!
 * Three-state circuit breaker guarding the engine's stats endpoint.
 *
 * closed -> open after `failure_threshold` consecutive failures; open
 * rejects everything for `cooldown`, then half-open admits a bounded probe
 * window; `half_open_max_calls` consecutive successes close the circuit
 * again, any probe failure re-opens it. Cancellations and deadline misses
 * pass through without advancing the failure count.
 */

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug)]
enum BreakerState {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { attempts: u32, successes: u32 },
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    half_open_max_calls: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold,
            cooldown,
            half_open_max_calls,
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
        }
    }

    /// Run `op` under the breaker. Rejected calls return `CircuitOpen`
    /// without invoking `op` at all.
    pub async fn call<T, F, Fut>(&self, op: F) -> OrchestratorResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<T>>,
    {
        self.acquire()?;
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_cancellation() => {}
            Err(_) => self.record_failure(),
        }
        result
    }

    /// Admission check. The lock is held only for the in-memory transition.
    fn acquire(&self) -> OrchestratorResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.cooldown {
                    debug!("Circuit breaker cooldown elapsed, probing half-open");
                    *state = BreakerState::HalfOpen {
                        attempts: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(OrchestratorError::CircuitOpen)
                }
            }
            BreakerState::HalfOpen { attempts, .. } => {
                if *attempts >= self.half_open_max_calls {
                    Err(OrchestratorError::CircuitOpen)
                } else {
                    *attempts += 1;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            BreakerState::Closed { failures } => *failures = 0,
            BreakerState::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.half_open_max_calls {
                    debug!("Circuit breaker closing after successful probes");
                    *state = BreakerState::Closed { failures: 0 };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            BreakerState::Closed { failures } => {
                *failures += 1;
                if *failures >= self.failure_threshold {
                    warn!(
                        "Circuit breaker opening after {} consecutive failures",
                        failures
                    );
                    *state = BreakerState::Open {
                        since: Instant::now(),
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!("Circuit breaker re-opening after half-open probe failure");
                *state = BreakerState::Open {
                    since: Instant::now(),
                };
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn state_name(&self) -> &'static str {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen { .. } => "half-open",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_millis(50), 2)
    }

    async fn fail(b: &CircuitBreaker) -> OrchestratorResult<()> {
        b.call(|| async { Err(OrchestratorError::BackendUnavailable("down".into())) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> OrchestratorResult<()> {
        b.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn opens_after_exactly_threshold_failures() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state_name(), "open");

        // Rejected without invoking the wrapped function.
        let invoked = AtomicU32::new(0);
        let result = b
            .call(|| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(OrchestratorError::CircuitOpen)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_the_consecutive_count() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        let _ = succeed(&b).await;
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state_name(), "closed");
    }

    #[tokio::test]
    async fn cooldown_permits_probes_and_successes_close() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state_name(), "open");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state_name(), "half-open");
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.state_name(), "closed");
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = fail(&b).await;
        assert_eq!(b.state_name(), "open");
    }

    #[tokio::test]
    async fn cancellation_does_not_count_as_failure() {
        let b = breaker();
        for _ in 0..10 {
            let _ = b
                .call(|| async { Err::<(), _>(OrchestratorError::Cancelled("deadline".into())) })
                .await;
        }
        assert_eq!(b.state_name(), "closed");
    }
}
