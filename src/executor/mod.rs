//! The transactional retry loop.
//!
//! [`Executor::execute`] runs the caller's work inside a transaction and
//! retries the whole transaction when a phase fails transiently:
//!
//! ```text
//! Idle -> Beginning -> Running -> Committing -> Done
//!                         |            |
//!                         v            v (transient)
//!                    RollingBack -> Retrying -> (backoff) -> Beginning
//!                         |            |
//!                         v            v (permanent / exhausted / cancelled)
//!                                  Terminal
//! ```
//!
//! # Guarantees
//!
//! - At most `max_retries + 1` attempts; attempts never overlap.
//! - Every transaction that `begin` opens is handed to exactly one `commit` or
//!   `rollback` before the attempt is over, including when the work future
//!   panics (rollback runs, then the panic resumes).
//! - Begin, work and commit are all bounded by the attempt timeout and the
//!   caller's context. A commit cut off before the backend answered is
//!   reported as [`CommitOutcomeUnknown`] and never retried.
//! - A failed commit is not followed by a rollback.
//! - Once the caller's context is cancelled no new attempt starts, and a
//!   backoff wait in progress is cut short.
//!
//! # Retries re-run the work
//!
//! Each attempt calls the work closure again from scratch in a new
//! transaction. The work must be idempotent or touch nothing outside the
//! transaction.
//!
//! # Example
//!
//! ```rust
//! use txretry::testing::{transient_error, MockPool};
//! use txretry::{Executor, RetryConfig, TxContext};
//! use futures::FutureExt;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let pool = MockPool::new();
//! pool.fail_begin(transient_error());
//!
//! let executor = Executor::new().on_retry(|event| {
//!     println!("attempt {} failed in {}: {}", event.attempt, event.phase, event.error);
//! });
//! let config = RetryConfig::default().with_initial_backoff(Duration::from_millis(1));
//!
//! let id = executor
//!     .execute(&TxContext::new(), &pool, &config, |tx| {
//!         async move { Ok::<_, std::io::Error>(tx.id()) }.boxed()
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(id, 1);
//! assert_eq!(pool.stats().begins, 2);
//! # });
//! ```

mod state;

use std::any::type_name;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::Instrument;

use crate::adapter::ResourceAdapter;
use crate::classify::{Classify, DefaultClassifier};
use crate::clock::{Sleeper, TokioSleeper};
use crate::context::{CancelReason, TxContext};
use crate::error::{
    AttemptTimeout, BoxError, CommitOutcomeUnknown, Phase, RollbackError, TxError,
};
use crate::retry::{RetryConfig, RetryEvent};

use state::{AttemptError, AttemptState, Failure};

type RetryHook = Arc<dyn Fn(&RetryEvent<'_>) + Send + Sync>;

/// Runs work inside transactions, retrying transient failures.
///
/// The executor holds the collaborators that do not change between calls:
/// the [`Classify`] deciding what is transient, the [`Sleeper`] used for
/// backoff, and an optional retry hook. It holds no per-call state, so one
/// executor can serve any number of concurrent calls.
pub struct Executor<C = DefaultClassifier, S = TokioSleeper> {
    classifier: C,
    sleeper: S,
    on_retry: Option<RetryHook>,
}

impl<C, S> fmt::Debug for Executor<C, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("classifier", &type_name::<C>())
            .field("sleeper", &type_name::<S>())
            .field("on_retry", &self.on_retry.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

impl Executor {
    /// Default classifier, tokio timer, no hook.
    pub fn new() -> Self {
        Self {
            classifier: DefaultClassifier,
            sleeper: TokioSleeper,
            on_retry: None,
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl<C, S> Executor<C, S>
where
    C: Classify,
    S: Sleeper,
{
    /// Replace the classifier.
    pub fn with_classifier<C2: Classify>(self, classifier: C2) -> Executor<C2, S> {
        Executor {
            classifier,
            sleeper: self.sleeper,
            on_retry: self.on_retry,
        }
    }

    /// Replace the timer used for backoff waits.
    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> Executor<C, S2> {
        Executor {
            classifier: self.classifier,
            sleeper,
            on_retry: self.on_retry,
        }
    }

    /// Call `hook` whenever a transient failure is about to be retried.
    ///
    /// The hook runs before the backoff wait. It is synchronous and should
    /// not block; use it for logging or metrics.
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(&RetryEvent<'_>) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Run `work` in a transaction on `resource`, retrying per `config`.
    ///
    /// `work` receives the live transaction handle and returns a boxed
    /// future, the same shape sqlx uses for its transaction callbacks:
    ///
    /// ```rust,ignore
    /// executor.execute(&ctx, &pool, &config, |tx| {
    ///     async move {
    ///         sqlx::query("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
    ///             .execute(&mut **tx)
    ///             .await
    ///     }
    ///     .boxed()
    /// })
    /// ```
    ///
    /// Returns the work's value once the transaction commits, or exactly one
    /// [`TxError`] naming the phase that failed.
    pub async fn execute<A, T, E, F>(
        &self,
        ctx: &TxContext,
        resource: &A,
        config: &RetryConfig,
        mut work: F,
    ) -> Result<T, TxError>
    where
        A: ResourceAdapter,
        F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
        E: Into<BoxError>,
    {
        let config = config.clone();
        let span = tracing::debug_span!("tx_execute", max_retries = config.max_retries());
        self.retry_loop(ctx, resource, &config, &mut work)
            .instrument(span)
            .await
    }

    /// Run `work` in a single transaction without retrying.
    ///
    /// Failures map straight to their phase error whether or not they are
    /// transient. The per-attempt timeout from `config` still applies.
    pub async fn execute_once<A, T, E, F>(
        &self,
        ctx: &TxContext,
        resource: &A,
        config: &RetryConfig,
        mut work: F,
    ) -> Result<T, TxError>
    where
        A: ResourceAdapter,
        F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(reason) = ctx.err() {
            return Err(TxError::Cancelled {
                phase: Phase::Begin,
                reason,
                last_error: None,
            });
        }
        let span = tracing::debug_span!("tx_execute_once");
        match self
            .attempt(ctx, resource, config, &mut work)
            .instrument(span)
            .await
        {
            Ok(value) => Ok(value),
            Err(AttemptError::Failed(failure) | AttemptError::Final(failure)) => {
                Err(failure.into_error())
            }
            Err(AttemptError::Cancelled { phase, reason }) => Err(TxError::Cancelled {
                phase,
                reason,
                last_error: None,
            }),
        }
    }

    async fn retry_loop<A, T, E, F>(
        &self,
        ctx: &TxContext,
        resource: &A,
        config: &RetryConfig,
        work: &mut F,
    ) -> Result<T, TxError>
    where
        A: ResourceAdapter,
        F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
        E: Into<BoxError>,
    {
        let start = Instant::now();
        let mut state = AttemptState::new();

        loop {
            if let Some(delay) = state.take_delay() {
                if let Err(reason) = self.backoff(ctx, delay).await {
                    tracing::debug!(%reason, "backoff interrupted");
                    return Err(TxError::Cancelled {
                        phase: Phase::Backoff,
                        reason,
                        last_error: state.take_last_error(),
                    });
                }
            }
            if let Some(reason) = ctx.err() {
                return Err(TxError::Cancelled {
                    phase: Phase::Begin,
                    reason,
                    last_error: state.take_last_error(),
                });
            }

            let attempt = state.attempt() + 1;
            tracing::debug!(attempt, "starting transaction attempt");

            let failure = match self.attempt(ctx, resource, config, work).await {
                Ok(value) => {
                    tracing::debug!(attempt, "transaction committed");
                    return Ok(value);
                }
                Err(AttemptError::Cancelled { phase, reason }) => {
                    return Err(TxError::Cancelled {
                        phase,
                        reason,
                        last_error: state.take_last_error(),
                    });
                }
                Err(AttemptError::Final(failure)) => return Err(failure.into_error()),
                Err(AttemptError::Failed(failure)) => failure,
            };

            if !self.classifier.is_transient(failure.source()) {
                tracing::debug!(
                    attempt,
                    phase = %failure.phase(),
                    error = %failure.source(),
                    "permanent failure"
                );
                return Err(failure.into_error());
            }

            if state.attempt() >= config.max_retries() {
                return Err(TxError::RetryExhausted {
                    phase: failure.phase(),
                    attempts: attempt,
                    source: failure.into_source(),
                });
            }

            let delay = config.jittered_delay(attempt);
            tracing::warn!(
                attempt,
                phase = %failure.phase(),
                delay_ms = delay.as_millis() as u64,
                error = %failure.source(),
                "transient failure, retrying"
            );
            if let Some(hook) = &self.on_retry {
                hook(&RetryEvent {
                    attempt,
                    phase: failure.phase(),
                    error: failure.source(),
                    next_delay: delay,
                    elapsed: start.elapsed(),
                });
            }
            state.retry_after(failure.into_source(), delay);
        }
    }

    /// One begin / work / commit cycle.
    async fn attempt<A, T, E, F>(
        &self,
        ctx: &TxContext,
        resource: &A,
        config: &RetryConfig,
        work: &mut F,
    ) -> Result<T, AttemptError>
    where
        A: ResourceAdapter,
        F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
        E: Into<BoxError>,
    {
        let attempt_ctx = match config.attempt_timeout() {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        };

        let begun = tokio::select! {
            biased;
            reason = attempt_ctx.done() => {
                return Err(match interruption(ctx, config, Phase::Begin, reason) {
                    Ok(timeout) => AttemptError::Failed(Failure::Begin(Box::new(timeout))),
                    Err(reason) => AttemptError::Cancelled { phase: Phase::Begin, reason },
                });
            }
            res = resource.begin(&attempt_ctx) => res,
        };
        let mut tx = begun.map_err(|e| AttemptError::Failed(Failure::Begin(e.into())))?;

        let outcome = {
            let run = AssertUnwindSafe(async { work(&mut tx).await }).catch_unwind();
            tokio::select! {
                biased;
                reason = attempt_ctx.done() => WorkOutcome::Interrupted(reason),
                res = run => match res {
                    Ok(result) => WorkOutcome::Finished(result),
                    Err(payload) => WorkOutcome::Panicked(payload),
                },
            }
        };

        // work that beat the deadline still must not start a commit
        let outcome = match (outcome, attempt_ctx.err()) {
            (WorkOutcome::Finished(Ok(_)), Some(reason)) => WorkOutcome::Interrupted(reason),
            (outcome, _) => outcome,
        };

        match outcome {
            WorkOutcome::Finished(Ok(value)) => {
                let committed = tokio::select! {
                    biased;
                    reason = attempt_ctx.done() => Err(reason),
                    res = resource.commit(&attempt_ctx, tx) => Ok(res),
                };
                match committed {
                    Ok(Ok(())) => Ok(value),
                    Ok(Err(e)) => Err(AttemptError::Failed(Failure::Commit(e.into()))),
                    Err(reason) => {
                        let unknown = match interruption(ctx, config, Phase::Commit, reason) {
                            Ok(timeout) => CommitOutcomeUnknown {
                                reason: CancelReason::DeadlineExceeded,
                                attempt_timeout: Some(timeout.timeout),
                            },
                            Err(reason) => CommitOutcomeUnknown {
                                reason,
                                attempt_timeout: None,
                            },
                        };
                        tracing::error!(error = %unknown, "commit interrupted");
                        Err(AttemptError::Final(Failure::Commit(Box::new(unknown))))
                    }
                }
            }
            WorkOutcome::Finished(Err(e)) => {
                let source: BoxError = e.into();
                let rollback = self.rollback(resource, config, tx).await;
                Err(AttemptError::Failed(Failure::Work { source, rollback }))
            }
            WorkOutcome::Interrupted(reason) => {
                let rollback = self.rollback(resource, config, tx).await;
                Err(match interruption(ctx, config, Phase::Work, reason) {
                    Ok(timeout) => AttemptError::Failed(Failure::Work {
                        source: Box::new(timeout),
                        rollback,
                    }),
                    Err(reason) => AttemptError::Cancelled {
                        phase: Phase::Work,
                        reason,
                    },
                })
            }
            WorkOutcome::Panicked(payload) => {
                if let Some(err) = self.rollback(resource, config, tx).await {
                    tracing::error!(error = %err, "rollback failed after panic in transaction work");
                }
                std::panic::resume_unwind(payload)
            }
        }
    }

    /// Best-effort rollback. Failures are logged and handed back as secondary
    /// diagnostics, never as the primary error.
    ///
    /// Runs on a context detached from the caller's so that a cancelled
    /// caller still gets its transaction rolled back.
    async fn rollback<A: ResourceAdapter>(
        &self,
        resource: &A,
        config: &RetryConfig,
        tx: A::Tx,
    ) -> Option<RollbackError> {
        let result = match config.attempt_timeout() {
            Some(limit) => {
                let rb_ctx = TxContext::new().with_timeout(limit);
                match tokio::time::timeout(limit, resource.rollback(&rb_ctx, tx)).await {
                    Ok(res) => res.map_err(RollbackError::new),
                    Err(_) => Err(RollbackError::new(AttemptTimeout {
                        phase: Phase::Rollback,
                        timeout: limit,
                    })),
                }
            }
            None => resource
                .rollback(&TxContext::new(), tx)
                .await
                .map_err(RollbackError::new),
        };

        match result {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(error = %err.inner(), "transaction rollback failed");
                Some(err)
            }
        }
    }

    /// Wait `delay`, or stop early when the caller's context ends.
    async fn backoff(&self, ctx: &TxContext, delay: Duration) -> Result<(), CancelReason> {
        if let Some(reason) = ctx.err() {
            return Err(reason);
        }
        tokio::select! {
            biased;
            reason = ctx.done() => Err(reason),
            _ = self.sleeper.sleep(delay) => Ok(()),
        }
    }
}

enum WorkOutcome<T, E> {
    Finished(Result<T, E>),
    Interrupted(CancelReason),
    Panicked(Box<dyn std::any::Any + Send>),
}

/// Tell an attempt deadline (transient) from caller cancellation (terminal).
fn interruption(
    ctx: &TxContext,
    config: &RetryConfig,
    phase: Phase,
    reason: CancelReason,
) -> Result<AttemptTimeout, CancelReason> {
    if let Some(caller) = ctx.err() {
        return Err(caller);
    }
    match (reason, config.attempt_timeout()) {
        (CancelReason::DeadlineExceeded, Some(timeout)) => Ok(AttemptTimeout { phase, timeout }),
        _ => Err(reason),
    }
}

/// Run `work` in a transaction with the default [`Executor`].
///
/// See [`Executor::execute`].
pub async fn execute<A, T, E, F>(
    ctx: &TxContext,
    resource: &A,
    config: &RetryConfig,
    work: F,
) -> Result<T, TxError>
where
    A: ResourceAdapter,
    F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
    E: Into<BoxError>,
{
    Executor::new().execute(ctx, resource, config, work).await
}

/// Run `work` in a single transaction with the default [`Executor`].
///
/// See [`Executor::execute_once`].
pub async fn execute_once<A, T, E, F>(
    ctx: &TxContext,
    resource: &A,
    config: &RetryConfig,
    work: F,
) -> Result<T, TxError>
where
    A: ResourceAdapter,
    F: for<'t> FnMut(&'t mut A::Tx) -> BoxFuture<'t, Result<T, E>>,
    E: Into<BoxError>,
{
    Executor::new().execute_once(ctx, resource, config, work).await
}
