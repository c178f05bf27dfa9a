//! The begin/commit/rollback capability the executor runs against.
//!
//! A backend plugs into the executor by implementing [`ResourceAdapter`]. The
//! executor is written once against this trait and never looks at which
//! backend it drives. Two shapes are expected:
//!
//! - **pool-based**: each `begin` checks a connection out of a shared pool
//!   that outlives every transaction (`sqlx::PgPool` with the `postgres`
//!   feature, [`MockPool`](crate::testing::MockPool) in tests)
//! - **connection-based**: every transaction runs on the same long-lived
//!   connection ([`SharedConnection`](postgres::SharedConnection),
//!   [`MockConnection`](crate::testing::MockConnection))
//!
//! The resource itself belongs to the caller. Adapters open and end
//! transactions on it but never close it. Connection-shaped adapters keep
//! their connection in a [`ConnectionSlot`], which serializes transactions
//! and cleans up after one that was abandoned.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use crate::context::TxContext;

mod slot;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use slot::{ConnectionSlot, SlotGuard};

/// Transaction lifecycle for one backend.
///
/// Every method receives the per-attempt context; implementations should stop
/// blocking I/O when [`TxContext::done`] fires. The executor also races
/// `begin` and `commit` against that context and bounds `rollback` with the
/// attempt timeout, so an adapter that ignores it is still bounded.
///
/// # Contract
///
/// - `begin` opens a transaction. It must not retry internally; retrying is
///   the executor's job.
/// - `commit` and `rollback` consume the handle, so a handle can be ended
///   only once.
/// - The executor may drop a `begin` or `commit` future before it completes,
///   and a caller may drop the whole `execute` future at any point. A handle
///   dropped without being ended must not leave its transaction open for the
///   next user of the connection.
/// - `rollback` must tolerate a transaction the backend already ended (for
///   example because the connection dropped). Such "already closed" failures
///   should be returned as `Ok(())`, logged at most as a warning.
pub trait ResourceAdapter: Send + Sync {
    /// The live transaction handle handed to the caller's work.
    type Tx: Send;
    /// Backend error type.
    type Error: Error + Send + Sync + 'static;

    /// Open a transaction.
    fn begin(
        &self,
        ctx: &TxContext,
    ) -> impl Future<Output = Result<Self::Tx, Self::Error>> + Send;

    /// Commit a transaction.
    fn commit(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Roll a transaction back.
    fn rollback(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

impl<A: ResourceAdapter + ?Sized> ResourceAdapter for &A {
    type Tx = A::Tx;
    type Error = A::Error;

    fn begin(
        &self,
        ctx: &TxContext,
    ) -> impl Future<Output = Result<Self::Tx, Self::Error>> + Send {
        (**self).begin(ctx)
    }

    fn commit(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).commit(ctx, tx)
    }

    fn rollback(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).rollback(ctx, tx)
    }
}

impl<A: ResourceAdapter + ?Sized> ResourceAdapter for Arc<A> {
    type Tx = A::Tx;
    type Error = A::Error;

    fn begin(
        &self,
        ctx: &TxContext,
    ) -> impl Future<Output = Result<Self::Tx, Self::Error>> + Send {
        (**self).begin(ctx)
    }

    fn commit(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).commit(ctx, tx)
    }

    fn rollback(
        &self,
        ctx: &TxContext,
        tx: Self::Tx,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        (**self).rollback(ctx, tx)
    }
}

/// Turn an "already closed" rollback failure into success.
///
/// `is_closed` decides which errors mean the backend already ended the
/// transaction. Those are logged as a warning and dropped; everything else is
/// returned unchanged.
pub fn ignore_closed<E, F>(result: Result<(), E>, is_closed: F) -> Result<(), E>
where
    E: Error,
    F: FnOnce(&E) -> bool,
{
    match result {
        Err(e) if is_closed(&e) => {
            tracing::warn!(error = %e, "rollback on a transaction that was already closed");
            Ok(())
        }
        other => other,
    }
}
