//! Caller context: cancellation and deadlines.
//!
//! A [`TxContext`] is what the caller hands to [`execute`](crate::execute) to
//! bound the whole operation. It combines a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) with an optional
//! deadline. Child contexts derived with [`TxContext::with_timeout`] observe
//! their parent's cancellation and keep the earliest deadline, but cancelling
//! a child never cancels the parent.
//!
//! # Examples
//!
//! ```
//! use txretry::{CancelReason, TxContext};
//!
//! let ctx = TxContext::new();
//! let child = ctx.with_timeout(std::time::Duration::from_secs(5));
//!
//! assert!(child.err().is_none());
//! ctx.cancel();
//! assert_eq!(child.err(), Some(CancelReason::Cancelled));
//! ```

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// The token was cancelled explicitly.
    Cancelled,
    /// The deadline passed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "context canceled"),
            CancelReason::DeadlineExceeded => write!(f, "context deadline exceeded"),
        }
    }
}

impl std::error::Error for CancelReason {}

/// Cancellation token plus optional deadline.
///
/// Cloning is cheap and clones share the same token.
#[derive(Debug, Clone, Default)]
pub struct TxContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TxContext {
    /// A context that never expires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. one driven by a shutdown signal.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child with the same deadline.
    ///
    /// Cancelling the child does not affect this context.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child that additionally expires after `timeout`.
    ///
    /// The child keeps whichever deadline comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that additionally expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// The effective deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline. `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-blocking check. Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<CancelReason> {
        if self.token.is_cancelled() {
            return Some(CancelReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> CancelReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => CancelReason::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                CancelReason::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_live() {
        let ctx = TxContext::new();
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let parent = TxContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));

        parent.cancel();

        assert_eq!(child.err(), Some(CancelReason::Cancelled));
        assert_eq!(child.done().await, CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_child_leaves_parent_alone() {
        let parent = TxContext::new();
        let child = parent.with_timeout(Duration::from_secs(60));

        child.cancel();

        assert!(parent.err().is_none());
        assert_eq!(child.err(), Some(CancelReason::Cancelled));
    }

    #[tokio::test]
    async fn test_earliest_deadline_wins() {
        let parent = TxContext::new().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert_eq!(child.deadline(), parent.deadline());
        assert_eq!(child.done().await, CancelReason::DeadlineExceeded);
        assert_eq!(child.err(), Some(CancelReason::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel_from_another_task() {
        let ctx = TxContext::new();
        let handle = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ctx.cancel();
            })
        };

        assert_eq!(ctx.done().await, CancelReason::Cancelled);
        handle.await.unwrap();
    }

    #[test]
    fn test_cancel_reason_display() {
        assert_eq!(CancelReason::Cancelled.to_string(), "context canceled");
        assert_eq!(
            CancelReason::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }
}
