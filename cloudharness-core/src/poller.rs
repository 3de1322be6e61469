//! Bounded "wait until" polling over remote state
//!
//! Every asynchronous wait in the harness goes through [`wait_until`]:
//! stabilization, job completion, drain and settle. A wait observes its
//! [`Probe`] immediately, then sleeps between attempts until the probe reports
//! [`Observation::Ready`] or the deadline passes. Sleeping is mandatory: the
//! interval never drops below [`MIN_POLL_INTERVAL`].

use crate::error::{HarnessError, HarnessResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Floor for any inter-attempt delay
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one probe attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Observation<T> {
    Ready(T),
    Pending,
}

/// Typed predicate over remote state.
///
/// `diagnostic` describes the most recent observation; it ends up in the
/// timeout error so a failed wait says what it last saw.
#[async_trait]
pub trait Probe: Send {
    type Output: Send;

    async fn observe(&mut self) -> HarnessResult<Observation<Self::Output>>;

    fn diagnostic(&self) -> String;
}

/// Delay schedule between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed,
    /// interval * multiplier^(attempt-1), capped at `max`
    Exponential { max: Duration, multiplier: f64 },
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        let delay = match self {
            Backoff::Fixed => base,
            Backoff::Exponential { max, multiplier } => {
                let factor = multiplier.powi(attempt.saturating_sub(1).min(64) as i32);
                let millis = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                Duration::from_millis(millis as u64).min(*max)
            }
        };
        delay.max(MIN_POLL_INTERVAL)
    }
}

/// Timeout and interval parameters for one wait
#[derive(Debug, Clone)]
pub struct PollSpec {
    pub operation: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub backoff: Backoff,
    /// Proportional jitter applied to each delay (0.0 disables)
    pub jitter: f64,
    /// Keep polling through probe errors instead of failing fast
    pub tolerate_errors: bool,
}

impl PollSpec {
    pub fn new(operation: impl Into<String>, timeout: Duration, interval: Duration) -> Self {
        Self {
            operation: operation.into(),
            timeout,
            interval,
            backoff: Backoff::Fixed,
            jitter: 0.0,
            tolerate_errors: false,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn exponential(self, max: Duration) -> Self {
        self.with_backoff(Backoff::Exponential {
            max,
            multiplier: 2.0,
        })
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn tolerate_errors(mut self, tolerate: bool) -> Self {
        self.tolerate_errors = tolerate;
        self
    }

    pub fn named(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(self.interval, attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        use rand::Rng;
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_millis((delay.as_millis() as f64 * factor) as u64).max(MIN_POLL_INTERVAL)
    }
}

/// Cooperative cancellation for long waits.
///
/// Cloning shares the same signal. Once fired it stays fired.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Fires a [`CancelSignal`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelSignal {
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that is never fired
    pub fn never() -> CancelSignal {
        let (_tx, rx) = watch::channel(false);
        CancelSignal { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without firing: never resolves
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        CancelSignal::never()
    }
}

/// Wait for `probe` to become ready, without cancellation
pub async fn wait_until<P: Probe>(probe: &mut P, spec: &PollSpec) -> HarnessResult<P::Output> {
    wait_until_cancellable(probe, spec, &CancelSignal::never()).await
}

/// Wait for `probe` to become ready or for `cancel` to fire.
///
/// The probe is observed once immediately. The sleep before the final attempt
/// is clamped to the deadline, so the last observation lands at the deadline.
pub async fn wait_until_cancellable<P: Probe>(
    probe: &mut P,
    spec: &PollSpec,
    cancel: &CancelSignal,
) -> HarnessResult<P::Output> {
    let start = Instant::now();
    let mut cancel = cancel.clone();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(HarnessError::Cancelled {
                operation: spec.operation.clone(),
            });
        }

        attempt += 1;
        let last_error = match probe.observe().await {
            Ok(Observation::Ready(value)) => {
                debug!(
                    operation = %spec.operation,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Wait satisfied"
                );
                return Ok(value);
            }
            Ok(Observation::Pending) => {
                trace!(operation = %spec.operation, attempt, observed = %probe.diagnostic(), "Still waiting");
                None
            }
            Err(e) if spec.tolerate_errors => {
                trace!(operation = %spec.operation, attempt, error = %e, "Probe failed, continuing");
                Some(e.to_string())
            }
            Err(e) => return Err(e),
        };

        let elapsed = start.elapsed();
        if elapsed >= spec.timeout {
            let mut last_observation = probe.diagnostic();
            if let Some(err) = last_error {
                last_observation = format!("{} (last error: {})", last_observation, err);
            }
            return Err(HarnessError::PollTimeout {
                operation: spec.operation.clone(),
                elapsed,
                last_observation,
            });
        }

        let remaining = spec.timeout - elapsed;
        let delay = spec.delay_for(attempt).min(remaining.max(MIN_POLL_INTERVAL));

        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(HarnessError::Cancelled {
                    operation: spec.operation.clone(),
                });
            }
        }
    }
}

/// Adapts an async closure into a [`Probe`].
///
/// The closure returns `Some(output)` when ready and `None` otherwise;
/// `describe` renders the diagnostic from the last `None`.
pub struct FnProbe<F> {
    check: F,
    last: String,
}

impl<F> FnProbe<F> {
    pub fn new(check: F) -> Self {
        Self {
            check,
            last: "not yet observed".to_string(),
        }
    }
}

#[async_trait]
impl<F, Fut, T> Probe for FnProbe<F>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = HarnessResult<Result<T, String>>> + Send,
    T: Send,
{
    type Output = T;

    async fn observe(&mut self) -> HarnessResult<Observation<T>> {
        match (self.check)().await? {
            Ok(value) => Ok(Observation::Ready(value)),
            Err(diagnostic) => {
                self.last = diagnostic;
                Ok(Observation::Pending)
            }
        }
    }

    fn diagnostic(&self) -> String {
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Ready once `ready_at` has elapsed since creation
    struct ClockProbe {
        created: Instant,
        ready_at: Duration,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Probe for ClockProbe {
        type Output = Duration;

        async fn observe(&mut self) -> HarnessResult<Observation<Duration>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let elapsed = self.created.elapsed();
            if elapsed >= self.ready_at {
                Ok(Observation::Ready(elapsed))
            } else {
                Ok(Observation::Pending)
            }
        }

        fn diagnostic(&self) -> String {
            format!("elapsed={:?}", self.created.elapsed())
        }
    }

    fn clock_probe(ready_at: Duration) -> (ClockProbe, Arc<AtomicU32>) {
        let attempts = Arc::new(AtomicU32::new(0));
        (
            ClockProbe {
                created: Instant::now(),
                ready_at,
                attempts: attempts.clone(),
            },
            attempts,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_immediately_observes_once() {
        let (mut probe, attempts) = clock_probe(Duration::ZERO);
        let spec = PollSpec::new("immediate", Duration::from_secs(5), Duration::from_secs(1));
        wait_until(&mut probe, &spec).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_becomes_ready_before_deadline() {
        let (mut probe, _) = clock_probe(Duration::from_secs(8));
        let spec = PollSpec::new("training", Duration::from_secs(10), Duration::from_millis(500));
        let seen = wait_until(&mut probe, &spec).await.unwrap();
        assert!(seen >= Duration::from_secs(8));
        assert!(seen < Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_last_diagnostic() {
        let (mut probe, _) = clock_probe(Duration::from_secs(60));
        let spec = PollSpec::new("never", Duration::from_secs(3), Duration::from_secs(1));
        let err = wait_until(&mut probe, &spec).await.unwrap_err();
        match err {
            HarnessError::PollTimeout {
                operation,
                elapsed,
                last_observation,
            } => {
                assert_eq!(operation, "never");
                assert!(elapsed >= Duration::from_secs(3));
                assert!(last_observation.starts_with("elapsed="));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_attempt_lands_on_deadline() {
        // Interval does not divide the timeout: the last sleep is clamped
        let (mut probe, _) = clock_probe(Duration::from_millis(2_500));
        let spec = PollSpec::new("clamped", Duration::from_millis(2_500), Duration::from_secs(2));
        let seen = wait_until(&mut probe, &spec).await.unwrap();
        assert!(seen >= Duration::from_millis(2_500));
        assert!(seen < Duration::from_millis(2_600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_sleeps() {
        let (mut probe, attempts) = clock_probe(Duration::from_secs(60));
        let spec = PollSpec::new("zero", Duration::from_millis(100), Duration::ZERO);
        assert!(wait_until(&mut probe, &spec).await.is_err());
        // 100ms window at a 10ms floor: bounded number of attempts
        assert!(attempts.load(Ordering::SeqCst) <= 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_propagates_unless_tolerated() {
        let calls = Arc::new(AtomicU32::new(0));
        let make_probe = |calls: Arc<AtomicU32>| {
            FnProbe::new(move || {
                let calls = calls.clone();
                async move {
                    let outcome: HarnessResult<Result<(), String>> =
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(HarnessError::Connection {
                                address: "127.0.0.1:1".to_string(),
                                details: "refused".to_string(),
                            })
                        } else {
                            Ok(Ok(()))
                        };
                    outcome
                }
            })
        };

        let spec = PollSpec::new("flaky", Duration::from_secs(5), Duration::from_millis(100));
        let err = wait_until(&mut make_probe(calls.clone()), &spec)
            .await
            .unwrap_err();
        assert!(err.is_connection());

        calls.store(0, Ordering::SeqCst);
        let tolerant = spec.tolerate_errors(true);
        wait_until(&mut make_probe(calls.clone()), &tolerant)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_sleep() {
        let (mut probe, _) = clock_probe(Duration::from_secs(600));
        let spec = PollSpec::new("cancelled", Duration::from_secs(600), Duration::from_secs(30));
        let (handle, signal) = CancelSignal::new();

        let waiter = tokio::spawn(async move {
            let started = Instant::now();
            let result = wait_until_cancellable(&mut probe, &spec, &signal).await;
            (result, started.elapsed())
        });

        sleep(Duration::from_secs(5)).await;
        handle.cancel();
        let (result, elapsed) = waiter.await.unwrap();
        assert!(matches!(result, Err(HarnessError::Cancelled { .. })));
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = Backoff::Exponential {
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let base = Duration::from_millis(100);
        assert_eq!(backoff.delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff.delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff.delay(base, 4), Duration::from_millis(800));
        assert_eq!(backoff.delay(base, 5), Duration::from_secs(1));
        assert_eq!(backoff.delay(base, 500), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn prop_delay_within_floor_and_cap(
            base_ms in 0u64..5_000,
            max_ms in 10u64..10_000,
            attempt in 1u32..200,
            jitter in 0.0f64..0.5,
        ) {
            let spec = PollSpec::new("prop", Duration::from_secs(1), Duration::from_millis(base_ms))
                .with_backoff(Backoff::Exponential {
                    max: Duration::from_millis(max_ms),
                    multiplier: 1.5,
                })
                .with_jitter(jitter);
            let delay = spec.delay_for(attempt);
            prop_assert!(delay >= MIN_POLL_INTERVAL);
            let ceiling = (max_ms as f64 * (1.0 + jitter)).ceil() as u64;
            prop_assert!(delay <= Duration::from_millis(ceiling.max(MIN_POLL_INTERVAL.as_millis() as u64)));
        }
    }
}
