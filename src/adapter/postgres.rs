//! Postgres adapters built on sqlx.
//!
//! - [`sqlx::PgPool`] implements [`ResourceAdapter`] directly: every attempt
//!   checks a connection out of the pool and gets a
//!   `sqlx::Transaction<'static, Postgres>`.
//! - [`SharedConnection`] drives transactions on one long-lived
//!   [`PgConnection`] with plain `BEGIN`/`COMMIT`/`ROLLBACK` statements. The
//!   connection is locked for the lifetime of each transaction, so concurrent
//!   callers queue rather than interleave statements. A transaction left open
//!   by a dropped handle is rolled back before the next `BEGIN`; sqlx's own
//!   `Transaction` does the same for the pool on drop.
//!
//! Connection establishment, pool sizing and health checks are the caller's
//! business; both adapters expect a resource that is already usable.

use std::fmt;
use std::ops::{Deref, DerefMut};

use sqlx::postgres::{PgConnection, PgPool, Postgres};

use crate::adapter::{ignore_closed, ConnectionSlot, ResourceAdapter, SlotGuard};
use crate::context::TxContext;

/// Whether a failed rollback means the backend already ended the transaction.
///
/// A dropped connection aborts its transaction server-side, so there is
/// nothing left to roll back.
fn already_closed(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
    )
}

impl ResourceAdapter for PgPool {
    type Tx = sqlx::Transaction<'static, Postgres>;
    type Error = sqlx::Error;

    async fn begin(&self, _ctx: &TxContext) -> Result<Self::Tx, Self::Error> {
        sqlx::Pool::begin(self).await
    }

    async fn commit(&self, _ctx: &TxContext, tx: Self::Tx) -> Result<(), Self::Error> {
        tx.commit().await
    }

    async fn rollback(&self, _ctx: &TxContext, tx: Self::Tx) -> Result<(), Self::Error> {
        ignore_closed(tx.rollback().await, already_closed)
    }
}

/// One Postgres connection shared by every transaction run on it.
///
/// Cloning shares the connection. A transaction whose handle was dropped
/// before it ended is rolled back by the next `begin`.
#[derive(Clone)]
pub struct SharedConnection {
    slot: ConnectionSlot<PgConnection>,
}

impl SharedConnection {
    /// Take ownership of an open connection.
    pub fn new(conn: PgConnection) -> Self {
        Self {
            slot: ConnectionSlot::new(conn),
        }
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("conn", &"<PgConnection>")
            .finish()
    }
}

/// An open transaction on a [`SharedConnection`].
///
/// Holds the connection until committed or rolled back. Derefs to the
/// connection so queries can run against it:
///
/// ```rust,ignore
/// sqlx::query("UPDATE accounts SET balance = balance - $1 WHERE id = $2")
///     .bind(amount)
///     .bind(id)
///     .execute(&mut **tx)
///     .await?;
/// ```
pub struct ConnectionTx {
    slot: SlotGuard<PgConnection>,
}

impl fmt::Debug for ConnectionTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTx").finish_non_exhaustive()
    }
}

impl Deref for ConnectionTx {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.slot
    }
}

impl DerefMut for ConnectionTx {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.slot
    }
}

async fn run(conn: &mut PgConnection, statement: &'static str) -> Result<(), sqlx::Error> {
    sqlx::query(statement).execute(conn).await.map(|_| ())
}

impl ResourceAdapter for SharedConnection {
    type Tx = ConnectionTx;
    type Error = sqlx::Error;

    async fn begin(&self, _ctx: &TxContext) -> Result<Self::Tx, Self::Error> {
        let mut slot = self.slot.acquire().await;
        if slot.is_open() {
            tracing::warn!("rolling back a transaction abandoned on the shared connection");
            run(&mut slot, "ROLLBACK").await?;
            slot.mark_closed();
        }
        slot.mark_open();
        match run(&mut slot, "BEGIN").await {
            Ok(()) => Ok(ConnectionTx { slot }),
            Err(e) => {
                slot.mark_closed();
                Err(e)
            }
        }
    }

    async fn commit(&self, _ctx: &TxContext, mut tx: Self::Tx) -> Result<(), Self::Error> {
        let result = run(&mut tx.slot, "COMMIT").await;
        tx.slot.mark_closed();
        result
    }

    async fn rollback(&self, _ctx: &TxContext, mut tx: Self::Tx) -> Result<(), Self::Error> {
        let result = run(&mut tx.slot, "ROLLBACK").await;
        tx.slot.mark_closed();
        ignore_closed(result, already_closed)
    }
}
