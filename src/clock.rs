//! Timer abstraction for the wait between attempts.
//!
//! The executor never sleeps directly; it asks a [`Sleeper`]. Production code
//! uses [`TokioSleeper`]; tests can swap in
//! [`RecordingSleeper`](crate::testing::RecordingSleeper) to observe the
//! requested delays without waiting for them.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Something that can wait for a duration.
pub trait Sleeper: Send + Sync {
    /// A future that resolves after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

impl<S: Sleeper + ?Sized> Sleeper for std::sync::Arc<S> {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        (**self).sleep(duration)
    }
}
