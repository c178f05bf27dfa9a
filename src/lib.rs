//! # txretry
//!
//! Run a unit of work inside a database transaction and retry the whole
//! transaction when it fails for a transient reason: a serialization
//! conflict, a deadlock, a dropped connection, an attempt that ran out of
//! time.
//!
//! The crate is made of small pieces that compose:
//!
//! - [`RetryConfig`] is pure data describing bounded exponential backoff.
//! - [`is_transient`] (or any [`Classify`]) decides which errors deserve a retry.
//! - [`ResourceAdapter`] is the seam to a database: begin, commit, rollback.
//! - [`Executor`] drives the retry loop and guarantees every transaction it
//!   opens is ended exactly once.
//! - [`TxContext`] carries caller cancellation and deadlines.
//!
//! ## Quick Example
//!
//! ```rust
//! use txretry::testing::{transient_error, MockPool};
//! use txretry::{execute, RetryConfig, TxContext};
//! use futures::FutureExt;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let pool = MockPool::new();
//! // the first commit hits a serialization conflict
//! pool.fail_commit(transient_error());
//!
//! let config = RetryConfig::default().with_initial_backoff(Duration::from_millis(1));
//! let balance = execute(&TxContext::new(), &pool, &config, |tx| {
//!     async move {
//!         tx.write("UPDATE accounts SET balance = balance - 10 WHERE id = 1");
//!         Ok::<_, std::io::Error>(90)
//!     }
//!     .boxed()
//! })
//! .await
//! .unwrap();
//!
//! assert_eq!(balance, 90);
//! assert_eq!(pool.stats().begins, 2);
//! # });
//! ```
//!
//! With the `postgres` feature, [`sqlx::PgPool`](https://docs.rs/sqlx) is a
//! [`ResourceAdapter`] out of the box, and
//! [`adapter::postgres::SharedConnection`] runs transactions on one dedicated
//! connection.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod adapter;
pub mod classify;
pub mod clock;
pub mod context;
pub mod error;
pub mod executor;
pub mod retry;
pub mod testing;

// Re-exports
pub use adapter::ResourceAdapter;
pub use classify::{is_transient, Classify, DefaultClassifier, SqlStateError};
pub use clock::{Sleeper, TokioSleeper};
pub use context::{CancelReason, TxContext};
pub use error::{
    AttemptTimeout, BoxError, CommitOutcomeUnknown, Phase, RollbackError, TxError,
};
pub use executor::{execute, execute_once, Executor};
pub use retry::{default_retry_config, JitterStrategy, RetryConfig, RetryEvent};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapter::ResourceAdapter;
    pub use crate::classify::{is_transient, Classify};
    pub use crate::context::TxContext;
    pub use crate::error::{Phase, TxError};
    pub use crate::executor::{execute, execute_once, Executor};
    pub use crate::retry::RetryConfig;
}
