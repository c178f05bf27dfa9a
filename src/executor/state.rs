//! Per-call bookkeeping.

use std::time::Duration;

use crate::error::{BoxError, Phase, RollbackError, TxError};

/// Where one `execute` call stands. Lives only for that call.
#[derive(Debug, Default)]
pub(crate) struct AttemptState {
    attempt: u32,
    last_error: Option<BoxError>,
    pending_delay: Option<Duration>,
}

impl AttemptState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Zero-based index of the current attempt.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a transient failure and schedule the next attempt after `delay`.
    pub(crate) fn retry_after(&mut self, error: BoxError, delay: Duration) {
        self.attempt += 1;
        self.last_error = Some(error);
        self.pending_delay = Some(delay);
    }

    pub(crate) fn take_delay(&mut self) -> Option<Duration> {
        self.pending_delay.take()
    }

    pub(crate) fn take_last_error(&mut self) -> Option<BoxError> {
        self.last_error.take()
    }
}

/// A failed attempt, before classification decides what happens next.
#[derive(Debug)]
pub(crate) enum Failure {
    Begin(BoxError),
    Work {
        source: BoxError,
        rollback: Option<RollbackError>,
    },
    Commit(BoxError),
}

impl Failure {
    pub(crate) fn phase(&self) -> Phase {
        match self {
            Failure::Begin(_) => Phase::Begin,
            Failure::Work { .. } => Phase::Work,
            Failure::Commit(_) => Phase::Commit,
        }
    }

    pub(crate) fn source(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        match self {
            Failure::Begin(e) | Failure::Commit(e) | Failure::Work { source: e, .. } => e.as_ref(),
        }
    }

    /// The error returned when this failure is final.
    pub(crate) fn into_error(self) -> TxError {
        match self {
            Failure::Begin(e) => TxError::Begin(e),
            Failure::Work { source, rollback } => TxError::Work { source, rollback },
            Failure::Commit(e) => TxError::Commit(e),
        }
    }

    pub(crate) fn into_source(self) -> BoxError {
        match self {
            Failure::Begin(e) | Failure::Commit(e) | Failure::Work { source: e, .. } => e,
        }
    }
}

/// Why an attempt did not produce a value.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Goes to the classifier.
    Failed(Failure),
    /// Reported as is, whatever the classifier would say.
    Final(Failure),
    Cancelled {
        phase: Phase,
        reason: crate::context::CancelReason,
    },
}
