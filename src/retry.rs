#![expect(
    clippy::module_name_repetitions,
    reason = "Retry types deliberately include the module name for clarity"
)]

//! Generic retry executor for failable asynchronous operations.
//!
//! [`execute`] wraps any operation returning `Result` and re-invokes it
//! according to a caller-supplied retry decision and delay policy. The
//! executor is used by the realtime transport to drive the connection
//! handshake, but is independent of it and can decorate arbitrary
//! operations.
//!
//! Executors can be stacked around one underlying operation. Layers that
//! share an [`AttemptCounter`] observe one continuous attempt sequence:
//! delay computation never restarts from 1 in an inner layer, and the
//! reported attempt total counts each invocation of the innermost
//! operation exactly once.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng as _;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Default cap on attempts. Practically the delay policy bounds execution
/// first by returning `None`.
pub const DEFAULT_MAX_ATTEMPTS: u32 = u32::MAX;

/// Default ceiling for the jittered exponential delay policy.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

const BASE_DELAY_MS: u64 = 100;
const JITTER_MS: u64 = 100;

/// Attempt counter shared between stacked retry layers.
///
/// Each layer keeps its own local attempt count and reconciles it against
/// the shared value after every attempt, so nested layers neither
/// double-count an attempt nor reset the sequence seen by `compute_delay`.
#[derive(Clone, Debug, Default)]
pub struct AttemptCounter(Arc<AtomicU32>);

impl AttemptCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total attempts recorded so far.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Reconcile a layer-local count after an attempt: adopt the shared
    /// value if an inner layer already advanced it, otherwise record one
    /// new attempt.
    fn bump(&self, local: u32) -> u32 {
        let shared = self.0.load(Ordering::SeqCst);
        if shared > local {
            shared
        } else {
            let next = local.saturating_add(1);
            self.0.fetch_max(next, Ordering::SeqCst);
            next
        }
    }
}

/// Options governing one [`execute`] call.
pub struct RetryOptions<T, E> {
    max_attempts: u32,
    retry_decider: Box<dyn Fn(Option<&T>, Option<&E>) -> bool + Send + Sync>,
    compute_delay: Box<dyn Fn(u32) -> Option<Duration> + Send + Sync>,
    cancel: CancellationToken,
    counter: AttemptCounter,
}

impl<T, E> RetryOptions<T, E> {
    /// Create options from a retry decision and a delay policy.
    ///
    /// `retry_decider` is called after every attempt with the attempt's
    /// value or error; returning `true` requests another attempt.
    /// `compute_delay` receives the number of completed attempts and
    /// returns the wait before the next one, or `None` to stop retrying.
    pub fn new<D, C>(retry_decider: D, compute_delay: C) -> Self
    where
        D: Fn(Option<&T>, Option<&E>) -> bool + Send + Sync + 'static,
        C: Fn(u32) -> Option<Duration> + Send + Sync + 'static,
    {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_decider: Box::new(retry_decider),
            compute_delay: Box::new(compute_delay),
            cancel: CancellationToken::new(),
            counter: AttemptCounter::new(),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Attach a cancellation signal. Checked before each attempt and
    /// during each inter-attempt wait.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Share an attempt sequence with other retry layers.
    #[must_use]
    pub fn with_counter(mut self, counter: AttemptCounter) -> Self {
        self.counter = counter;
        self
    }
}

/// Successful outcome of [`execute`], with the total attempts performed.
#[non_exhaustive]
#[derive(Debug)]
pub struct RetryResult<T> {
    pub value: T,
    pub attempts: u32,
}

/// Terminal outcome of a failed [`execute`] call.
#[non_exhaustive]
#[derive(Debug)]
pub enum RetryError<E> {
    /// The retry decider declined to retry; the operation's own error is
    /// re-raised verbatim.
    Operation(E),
    /// The decider wanted another attempt but none remained, or the delay
    /// policy stopped.
    AttemptsExhausted {
        /// Attempts performed before giving up
        attempts: u32,
    },
    /// The cancellation signal fired before an attempt or during a wait.
    Aborted,
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(e) => write!(f, "operation failed: {e}"),
            Self::AttemptsExhausted { attempts } => {
                write!(f, "retry attempts exhausted after {attempts} attempts")
            }
            Self::Aborted => write!(f, "request aborted"),
        }
    }
}

impl<E: StdError + 'static> StdError for RetryError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Run `operation`, retrying per `options`.
///
/// Attempt 1 runs immediately. After each attempt the decider is
/// consulted; when it declines, the attempt's own outcome is returned
/// (value with attempt metadata, or the error verbatim). When it wants a
/// retry, the executor checks the remaining attempts, asks the delay policy
/// for a wait, and suspends. The wait is abandoned early if the
/// cancellation signal fires.
pub async fn execute<T, E, Op, Fut>(
    mut operation: Op,
    options: &RetryOptions<T, E>,
) -> Result<RetryResult<T>, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = options.counter.count();
    loop {
        if options.cancel.is_cancelled() {
            return Err(RetryError::Aborted);
        }

        let outcome = operation().await;
        attempts = options.counter.bump(attempts);

        let should_retry = match &outcome {
            Ok(value) => (options.retry_decider)(Some(value), None),
            Err(error) => (options.retry_decider)(None, Some(error)),
        };

        if !should_retry {
            return match outcome {
                Ok(value) => Ok(RetryResult { value, attempts }),
                Err(error) => Err(RetryError::Operation(error)),
            };
        }

        if attempts >= options.max_attempts {
            return Err(RetryError::AttemptsExhausted { attempts });
        }

        let Some(delay) = (options.compute_delay)(attempts) else {
            return Err(RetryError::AttemptsExhausted { attempts });
        };

        tracing::trace!(attempts, ?delay, "retrying after delay");

        tokio::select! {
            () = options.cancel.cancelled() => return Err(RetryError::Aborted),
            () = sleep(delay) => {}
        }
    }
}

/// Jittered exponential delay policy: `100ms * 2^attempt` plus up to
/// 100ms of jitter, stopping once the base delay exceeds `max_delay`.
pub fn jittered_exponential_delay(
    max_delay: Duration,
) -> impl Fn(u32) -> Option<Duration> + Send + Sync {
    let max_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
    move |attempt| {
        let base = 1_u64.checked_shl(attempt)?.checked_mul(BASE_DELAY_MS)?;
        if base > max_ms {
            return None;
        }
        let jitter = rand::rng().random_range(0..JITTER_MS);
        Some(Duration::from_millis(base.saturating_add(jitter)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;

    fn counting_op(
        failures: u32,
    ) -> (Arc<AtomicU32>, impl FnMut() -> futures::future::Ready<Result<u32, String>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let op_calls = Arc::clone(&calls);
        let op = move || {
            let n = op_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                futures::future::ready(Err(format!("failure {n}")))
            } else {
                futures::future::ready(Ok(n))
            }
        };
        (calls, op)
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let (calls, op) = counting_op(u32::MAX);
        let options: RetryOptions<u32, String> =
            RetryOptions::new(|_, _| true, |_| Some(Duration::ZERO)).with_max_attempts(6);

        let result = execute(op, &options).await;

        assert_eq!(calls.load(Ordering::SeqCst), 6, "operation runs once per attempt");
        assert!(
            matches!(result, Err(RetryError::AttemptsExhausted { attempts: 6 })),
            "expected exhaustion after 6 attempts"
        );
    }

    #[tokio::test]
    async fn compute_delay_not_called_after_final_attempt() {
        let (_, op) = counting_op(u32::MAX);
        let delays = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&delays);
        let options: RetryOptions<u32, String> = RetryOptions::new(
            |_, _| true,
            move |attempt| {
                seen.lock().expect("lock").push(attempt);
                Some(Duration::ZERO)
            },
        )
        .with_max_attempts(6);

        let result = execute(op, &options).await;

        assert!(result.is_err(), "always-failing operation cannot succeed");
        assert_eq!(*delays.lock().expect("lock"), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn aborted_before_first_attempt_runs_nothing() {
        let (calls, op) = counting_op(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options: RetryOptions<u32, String> =
            RetryOptions::new(|_, _| true, |_| Some(Duration::ZERO)).with_cancellation(cancel);

        let result = execute(op, &options).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0, "operation must not run");
        assert!(matches!(result, Err(RetryError::Aborted)), "expected abort");
    }

    #[tokio::test]
    async fn abort_during_wait_exits_early() {
        let (_, op) = counting_op(u32::MAX);
        let cancel = CancellationToken::new();
        let aborter = cancel.clone();
        let options: RetryOptions<u32, String> =
            RetryOptions::new(|_, _| true, |_| Some(Duration::from_millis(500)))
                .with_cancellation(cancel);

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            aborter.cancel();
        });

        let started = Instant::now();
        let result = execute(op, &options).await;

        assert!(matches!(result, Err(RetryError::Aborted)), "expected abort");
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "wait must be abandoned early"
        );
    }

    #[tokio::test]
    async fn returns_value_with_attempt_metadata() {
        let (calls, op) = counting_op(2);
        let options: RetryOptions<u32, String> =
            RetryOptions::new(|_, error| error.is_some(), |_| Some(Duration::ZERO));

        let result = execute(op, &options).await.expect("third attempt succeeds");

        assert_eq!(calls.load(Ordering::SeqCst), 3, "two failures then success");
        assert_eq!(result.attempts, 3);
        assert_eq!(result.value, 3);
    }

    #[tokio::test]
    async fn reraises_operation_error_when_decider_declines() {
        let (calls, op) = counting_op(u32::MAX);
        let options: RetryOptions<u32, String> =
            RetryOptions::new(|_, _| false, |_| Some(Duration::ZERO));

        let result = execute(op, &options).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retries requested");
        match result {
            Err(RetryError::Operation(message)) => assert_eq!(message, "failure 1"),
            other => panic!("expected the operation error verbatim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stacked_layers_share_a_continuous_attempt_sequence() {
        // Innermost operation fails once then succeeds; a between-layers
        // step also fails once then succeeds. Both layers share one
        // counter, so delay computation sees attempts 1 and 2 and the
        // final metadata reports three attempts in total.
        let counter = AttemptCounter::new();
        let delays = Arc::new(Mutex::new(Vec::new()));

        let core_calls = Arc::new(AtomicU32::new(0));
        let between_calls = Arc::new(AtomicU32::new(0));

        let decider =
            |_: Option<&u32>, error: Option<&String>| error.is_some_and(|e| e.ends_with("retryable"));

        let inner_seen = Arc::clone(&delays);
        let inner_options: RetryOptions<u32, String> = RetryOptions::new(decider, move |attempt| {
            inner_seen.lock().expect("lock").push(attempt);
            Some(Duration::ZERO)
        })
        .with_counter(counter.clone());

        let outer_seen = Arc::clone(&delays);
        let outer_options: RetryOptions<RetryResult<u32>, String> =
            RetryOptions::new(
                |_: Option<&RetryResult<u32>>, error: Option<&String>| {
                    error.is_some_and(|e| e.ends_with("retryable"))
                },
                move |attempt| {
                    outer_seen.lock().expect("lock").push(attempt);
                    Some(Duration::ZERO)
                },
            )
            .with_counter(counter.clone());

        let result = execute(
            || {
                let between_calls = Arc::clone(&between_calls);
                let core_calls = Arc::clone(&core_calls);
                let inner_options = &inner_options;
                async move {
                    if between_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err("between step retryable".to_owned());
                    }
                    execute(
                        move || {
                            let n = core_calls.fetch_add(1, Ordering::SeqCst) + 1;
                            futures::future::ready(if n == 1 {
                                Err("core retryable".to_owned())
                            } else {
                                Ok(n)
                            })
                        },
                        inner_options,
                    )
                    .await
                    .map_err(|e| e.to_string())
                }
            },
            &outer_options,
        )
        .await
        .expect("stacked layers eventually succeed");

        assert_eq!(result.attempts, 3, "combined attempt total");
        assert_eq!(result.value.attempts, 3, "inner layer reports the shared total");
        assert_eq!(
            *delays.lock().expect("lock"),
            vec![1, 2],
            "delay indices continue across layers"
        );
    }

    #[test]
    fn jittered_delay_grows_then_stops() {
        let policy = jittered_exponential_delay(DEFAULT_MAX_DELAY);

        let first = policy(1).expect("first delay");
        assert!(first >= Duration::from_millis(200) && first < Duration::from_millis(300));

        let fifth = policy(5).expect("fifth delay");
        assert!(fifth >= Duration::from_millis(3200) && fifth < Duration::from_millis(3300));

        assert!(policy(6).is_none(), "base delay above the cap stops retrying");
    }
}
