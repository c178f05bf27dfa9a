//! Error types returned by the executor.
//!
//! Every failed [`execute`](crate::execute) call yields exactly one
//! [`TxError`]. The variant says which phase failed and how; the original
//! cause is kept and reachable through [`std::error::Error::source`].

use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::context::CancelReason;

/// Boxed cause carried by every error variant.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Phase of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Waiting between attempts.
    Backoff,
    /// Opening the transaction.
    Begin,
    /// Running the caller's work.
    Work,
    /// Committing.
    Commit,
    /// Rolling back after a failed or interrupted work phase.
    Rollback,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Backoff => "backoff",
            Phase::Begin => "begin",
            Phase::Work => "work",
            Phase::Commit => "commit",
            Phase::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Error returned by [`execute`](crate::execute).
///
/// # Variants
///
/// - `Begin` - the transaction could not be opened (permanent cause)
/// - `Work` - the caller's work failed (permanent cause); rollback was attempted
/// - `Commit` - the commit failed (permanent cause) or was cut off before the
///   backend answered ([`CommitOutcomeUnknown`]); no rollback follows a commit
/// - `RetryExhausted` - the last failure was transient but no retries were left
/// - `Cancelled` - the caller's context was cancelled or hit its deadline
#[derive(Debug)]
pub enum TxError {
    /// The transaction could not be opened.
    Begin(BoxError),
    /// The caller's work failed.
    Work {
        /// The work error.
        source: BoxError,
        /// Set when the rollback that followed also failed.
        rollback: Option<RollbackError>,
    },
    /// The transaction could not be committed.
    Commit(BoxError),
    /// All retries were used up on transient failures.
    RetryExhausted {
        /// Phase of the final failure.
        phase: Phase,
        /// Total attempts made (initial + retries).
        attempts: u32,
        /// The final error.
        source: BoxError,
    },
    /// The caller's context stopped the execution.
    Cancelled {
        /// Phase that was interrupted.
        phase: Phase,
        /// Cancellation or deadline.
        reason: CancelReason,
        /// The transient error that led to the interrupted backoff, if any.
        last_error: Option<BoxError>,
    },
}

impl TxError {
    /// The phase this error describes.
    pub fn phase(&self) -> Phase {
        match self {
            TxError::Begin(_) => Phase::Begin,
            TxError::Work { .. } => Phase::Work,
            TxError::Commit(_) => Phase::Commit,
            TxError::RetryExhausted { phase, .. } | TxError::Cancelled { phase, .. } => *phase,
        }
    }

    /// Attempts made, when known.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            TxError::RetryExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Returns true for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TxError::Cancelled { .. })
    }

    /// Returns true for `RetryExhausted`.
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, TxError::RetryExhausted { .. })
    }

    /// Returns true when a commit was cut off and may or may not have applied.
    pub fn is_commit_outcome_unknown(&self) -> bool {
        match self {
            TxError::Commit(e) => e.downcast_ref::<CommitOutcomeUnknown>().is_some(),
            _ => false,
        }
    }

    /// The rollback failure attached to a `Work` error.
    pub fn rollback_error(&self) -> Option<&RollbackError> {
        match self {
            TxError::Work { rollback, .. } => rollback.as_ref(),
            _ => None,
        }
    }

    /// The underlying cause, for every variant.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            TxError::Begin(e) | TxError::Commit(e) => Some(e.as_ref()),
            TxError::Work { source, .. } | TxError::RetryExhausted { source, .. } => {
                Some(source.as_ref())
            }
            TxError::Cancelled { last_error, .. } => last_error.as_deref(),
        }
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::Begin(e) => write!(f, "begin transaction: {}", e),
            TxError::Work { source, rollback } => {
                write!(f, "transaction work: {}", source)?;
                if let Some(rb) = rollback {
                    write!(f, " ({})", rb)?;
                }
                Ok(())
            }
            TxError::Commit(e) => write!(f, "commit transaction: {}", e),
            TxError::RetryExhausted {
                phase,
                attempts,
                source,
            } => write!(
                f,
                "retry exhausted after {} attempts, last {} error: {}",
                attempts, phase, source
            ),
            TxError::Cancelled { phase, reason, .. } => {
                write!(f, "{} during {}", reason, phase)
            }
        }
    }
}

impl Error for TxError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TxError::Begin(e) | TxError::Commit(e) => Some(&**e),
            TxError::Work { source, .. } | TxError::RetryExhausted { source, .. } => {
                Some(&**source)
            }
            TxError::Cancelled { reason, .. } => Some(reason),
        }
    }
}

/// A rollback that failed.
///
/// Never the primary error: it is logged and attached to the [`TxError::Work`]
/// it followed so the real failure is not masked.
#[derive(Debug)]
pub struct RollbackError {
    source: BoxError,
}

impl RollbackError {
    /// Wrap a rollback failure.
    pub fn new(source: impl Into<BoxError>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The adapter's error.
    pub fn inner(&self) -> &(dyn Error + Send + Sync + 'static) {
        self.source.as_ref()
    }
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollback failed: {}", self.source)
    }
}

impl Error for RollbackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.source)
    }
}

/// The per-attempt deadline passed before the phase finished.
///
/// Classified as transient: the next attempt gets a fresh deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeout {
    /// Phase that was running.
    pub phase: Phase,
    /// The configured per-attempt timeout.
    pub timeout: Duration,
}

impl fmt::Display for AttemptTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempt timed out after {:?} during {}",
            self.timeout, self.phase
        )
    }
}

impl Error for AttemptTimeout {}

/// A commit was cut off by a deadline or cancellation before the backend
/// answered.
///
/// The transaction may or may not have been applied, so the executor never
/// retries it: running the work again could apply it twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcomeUnknown {
    /// What cut the commit off.
    pub reason: CancelReason,
    /// Set when the per-attempt timeout was the deadline that fired.
    pub attempt_timeout: Option<Duration>,
}

impl fmt::Display for CommitOutcomeUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.attempt_timeout {
            Some(timeout) => write!(
                f,
                "commit outcome unknown: attempt timed out after {:?}",
                timeout
            ),
            None => write!(f, "commit outcome unknown: {}", self.reason),
        }
    }
}

impl Error for CommitOutcomeUnknown {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(msg: &str) -> BoxError {
        msg.to_string().into()
    }

    #[test]
    fn test_begin_display_and_source() {
        let err = TxError::Begin(boxed("connection refused"));
        assert_eq!(err.to_string(), "begin transaction: connection refused");
        assert_eq!(err.phase(), Phase::Begin);
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("connection refused".to_string())
        );
    }

    #[test]
    fn test_work_display_mentions_rollback_failure() {
        let err = TxError::Work {
            source: boxed("unique violation"),
            rollback: Some(RollbackError::new("socket closed")),
        };
        let display = err.to_string();
        assert!(display.contains("unique violation"));
        assert!(display.contains("rollback failed: socket closed"));
        assert!(err.rollback_error().is_some());
    }

    #[test]
    fn test_retry_exhausted_display() {
        let err = TxError::RetryExhausted {
            phase: Phase::Commit,
            attempts: 4,
            source: boxed("deadlock detected"),
        };
        let display = err.to_string();
        assert!(display.contains("retry exhausted"));
        assert!(display.contains("4 attempts"));
        assert!(display.contains("commit"));
        assert!(display.contains("deadlock detected"));
        assert_eq!(err.attempts(), Some(4));
        assert!(err.is_retry_exhausted());
    }

    #[test]
    fn test_cancelled_source_is_reason() {
        let err = TxError::Cancelled {
            phase: Phase::Backoff,
            reason: CancelReason::Cancelled,
            last_error: Some(boxed("broken pipe")),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "context canceled during backoff");
        let source = err.source().unwrap();
        assert_eq!(
            source.downcast_ref::<CancelReason>(),
            Some(&CancelReason::Cancelled)
        );
        assert_eq!(err.cause().map(|c| c.to_string()), Some("broken pipe".into()));
    }

    #[test]
    fn test_commit_outcome_unknown() {
        let err = TxError::Commit(Box::new(CommitOutcomeUnknown {
            reason: CancelReason::DeadlineExceeded,
            attempt_timeout: Some(Duration::from_millis(50)),
        }));
        assert!(err.is_commit_outcome_unknown());
        assert_eq!(
            err.to_string(),
            "commit transaction: commit outcome unknown: attempt timed out after 50ms"
        );
        assert!(!TxError::Commit(boxed("serialization failure")).is_commit_outcome_unknown());
    }

    #[test]
    fn test_wrapped_error_can_be_downcast() {
        let err = TxError::Commit(Box::new(AttemptTimeout {
            phase: Phase::Commit,
            timeout: Duration::from_secs(1),
        }));
        let source = err.source().unwrap();
        assert!(source.downcast_ref::<AttemptTimeout>().is_some());
    }
}
