//! Test doubles for code built on the executor.
//!
//! - [`MockPool`] - pool-based in-memory backend; transactions are independent
//! - [`MockConnection`] - connection-based backend; one transaction at a time
//! - [`RecordingSleeper`] - a [`Sleeper`] that records delays and returns at once
//!
//! Both mock backends count every call, can be scripted to fail or hang, and
//! track transactions that were dropped without being committed or rolled
//! back. On [`MockConnection`] the writes of such a transaction stay on the
//! "server" until the next `begin` rolls them back, as they would on a real
//! connection.
//!
//! # Examples
//!
//! ```rust
//! use txretry::testing::{transient_error, MockPool};
//! use txretry::{execute, RetryConfig, TxContext};
//! use futures::FutureExt;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let pool = MockPool::new();
//! pool.fail_commit(transient_error());
//!
//! let config = RetryConfig::default().with_initial_backoff(Duration::from_millis(1));
//! let result = execute(&TxContext::new(), &pool, &config, |tx| {
//!     async move {
//!         tx.write("insert order 42");
//!         Ok::<_, std::io::Error>(())
//!     }
//!     .boxed()
//! })
//! .await;
//!
//! assert!(result.is_ok());
//! assert_eq!(pool.stats().begins, 2);
//! assert_eq!(pool.committed(), vec!["insert order 42".to_string()]);
//! # });
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::adapter::{ignore_closed, ConnectionSlot, ResourceAdapter, SlotGuard};
use crate::classify::SqlStateError;
use crate::clock::Sleeper;
use crate::context::TxContext;

/// SQLSTATE for "there is no transaction in progress".
const NO_ACTIVE_TRANSACTION: &str = "25P01";

/// A serialization failure, which the default classifier treats as transient.
pub fn transient_error() -> SqlStateError {
    SqlStateError::new(
        "40001",
        "could not serialize access due to concurrent update",
    )
}

/// A unique violation, which the default classifier treats as permanent.
pub fn permanent_error() -> SqlStateError {
    SqlStateError::new(
        "23505",
        "duplicate key value violates unique constraint",
    )
}

/// Call counters for a mock backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockStats {
    /// `begin` calls, including failed ones.
    pub begins: u32,
    /// Successful `begin` calls.
    pub opened: u32,
    /// `commit` calls, including failed ones.
    pub commits: u32,
    /// `rollback` calls, including failed ones.
    pub rollbacks: u32,
    /// Handles dropped without commit or rollback.
    pub abandoned: u32,
    /// Abandoned transactions rolled back by a later `begin`.
    pub recovered: u32,
}

#[derive(Debug, Default)]
struct Script {
    begin: VecDeque<SqlStateError>,
    commit: VecDeque<SqlStateError>,
    rollback: VecDeque<SqlStateError>,
    begin_always: Option<SqlStateError>,
    hang_commits: u32,
}

#[derive(Debug, Default)]
struct State {
    stats: MockStats,
    script: Script,
    committed: Vec<String>,
}

#[derive(Debug, Default)]
struct Backend {
    state: Mutex<State>,
    next_id: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

impl Backend {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }

    /// Never returns when a hang was scripted for this commit.
    async fn maybe_hang_commit(&self) {
        let hang = {
            let mut state = self.lock();
            let hang = state.script.hang_commits > 0;
            if hang {
                state.script.hang_commits -= 1;
            }
            hang
        };
        if hang {
            futures::future::pending::<()>().await;
        }
    }

    fn begin(
        self: &Arc<Self>,
        mut slot: Option<SlotGuard<Stranded>>,
    ) -> Result<MockTx, SqlStateError> {
        let mut state = self.lock();
        if let Some(slot) = slot.as_mut().filter(|slot| slot.is_open()) {
            tracing::warn!("rolling back a transaction abandoned on the mock connection");
            slot.clear();
            slot.mark_closed();
            state.stats.recovered += 1;
        }
        state.stats.begins += 1;
        if let Some(err) = state.script.begin.pop_front() {
            return Err(err);
        }
        if let Some(err) = &state.script.begin_always {
            return Err(err.clone());
        }
        state.stats.opened += 1;
        if let Some(slot) = slot.as_mut() {
            slot.mark_open();
        }
        Ok(MockTx {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            writes: Vec::new(),
            ended: false,
            backend: Arc::clone(self),
            slot,
        })
    }

    fn commit(&self, mut tx: MockTx) -> Result<(), SqlStateError> {
        tx.ended = true;
        // a commit applies everything the server holds for this session
        let mut writes = tx.end_on_server();
        writes.append(&mut tx.writes);
        let mut state = self.lock();
        state.stats.commits += 1;
        if let Some(err) = state.script.commit.pop_front() {
            return Err(err);
        }
        state.committed.append(&mut writes);
        Ok(())
    }

    fn rollback(&self, mut tx: MockTx) -> Result<(), SqlStateError> {
        tx.ended = true;
        tx.end_on_server();
        let mut state = self.lock();
        state.stats.rollbacks += 1;
        match state.script.rollback.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Uncommitted writes a connection-shaped "server" still holds.
type Stranded = Vec<String>;

/// A transaction on a mock backend.
///
/// Writes are buffered and become visible through `committed()` only after a
/// successful commit.
#[derive(Debug)]
pub struct MockTx {
    id: u64,
    writes: Vec<String>,
    ended: bool,
    backend: Arc<Backend>,
    slot: Option<SlotGuard<Stranded>>,
}

impl MockTx {
    /// Unique id within the backend, starting at 1.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Buffer a write.
    pub fn write(&mut self, entry: impl Into<String>) {
        self.writes.push(entry.into());
    }

    /// Writes buffered so far.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    fn end_on_server(&mut self) -> Stranded {
        match self.slot.as_mut() {
            Some(slot) => {
                slot.mark_closed();
                std::mem::take(&mut **slot)
            }
            None => Vec::new(),
        }
    }
}

impl Drop for MockTx {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        self.backend.lock().stats.abandoned += 1;
        // the server keeps an abandoned transaction open with its writes
        if let Some(slot) = self.slot.as_mut() {
            slot.append(&mut self.writes);
        }
    }
}

macro_rules! scripting_methods {
    () => {
        /// Fail the next `begin` call with `err`. Calls queue up.
        pub fn fail_begin(&self, err: SqlStateError) -> &Self {
            self.backend.lock().script.begin.push_back(err);
            self
        }

        /// Fail every `begin` call after the queued failures with `err`.
        pub fn fail_begin_always(&self, err: SqlStateError) -> &Self {
            self.backend.lock().script.begin_always = Some(err);
            self
        }

        /// Fail the next `commit` call with `err`. Calls queue up.
        pub fn fail_commit(&self, err: SqlStateError) -> &Self {
            self.backend.lock().script.commit.push_back(err);
            self
        }

        /// Make the next `commit` call never return. Calls queue up.
        pub fn hang_commit(&self) -> &Self {
            self.backend.lock().script.hang_commits += 1;
            self
        }

        /// Fail the next `rollback` call with `err`. Calls queue up.
        pub fn fail_rollback(&self, err: SqlStateError) -> &Self {
            self.backend.lock().script.rollback.push_back(err);
            self
        }

        /// Make every operation wait `latency` before running.
        pub fn with_latency(self, latency: Duration) -> Self {
            *self
                .backend
                .latency
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(latency);
            self
        }

        /// Snapshot of the call counters.
        pub fn stats(&self) -> MockStats {
            self.backend.lock().stats
        }

        /// Every write from every committed transaction, in commit order.
        pub fn committed(&self) -> Vec<String> {
            self.backend.lock().committed.clone()
        }

        /// Transactions opened and not yet ended.
        pub fn open_transactions(&self) -> u32 {
            let stats = self.stats();
            stats.opened - stats.commits - stats.rollbacks - stats.abandoned
        }
    };
}

/// Pool-based mock: transactions are independent and may overlap.
///
/// Clones share the same backend.
#[derive(Debug, Clone, Default)]
pub struct MockPool {
    backend: Arc<Backend>,
}

impl MockPool {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    scripting_methods!();
}

impl ResourceAdapter for MockPool {
    type Tx = MockTx;
    type Error = SqlStateError;

    async fn begin(&self, _ctx: &TxContext) -> Result<MockTx, SqlStateError> {
        self.backend.delay().await;
        self.backend.begin(None)
    }

    async fn commit(&self, _ctx: &TxContext, tx: MockTx) -> Result<(), SqlStateError> {
        self.backend.delay().await;
        self.backend.maybe_hang_commit().await;
        self.backend.commit(tx)
    }

    async fn rollback(&self, _ctx: &TxContext, tx: MockTx) -> Result<(), SqlStateError> {
        self.backend.delay().await;
        self.backend.rollback(tx)
    }
}

/// Connection-based mock: one connection, one transaction at a time.
///
/// `begin` waits until the previous transaction on the connection has ended,
/// and rolls back a transaction whose handle was dropped without ending it.
/// A rollback failing with "no transaction in progress" is treated as success.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    backend: Arc<Backend>,
    slot: ConnectionSlot<Stranded>,
}

impl MockConnection {
    /// An idle connection.
    pub fn new() -> Self {
        Self::default()
    }

    scripting_methods!();
}

impl ResourceAdapter for MockConnection {
    type Tx = MockTx;
    type Error = SqlStateError;

    async fn begin(&self, _ctx: &TxContext) -> Result<MockTx, SqlStateError> {
        let slot = self.slot.acquire().await;
        self.backend.delay().await;
        self.backend.begin(Some(slot))
    }

    async fn commit(&self, _ctx: &TxContext, tx: MockTx) -> Result<(), SqlStateError> {
        self.backend.delay().await;
        self.backend.maybe_hang_commit().await;
        self.backend.commit(tx)
    }

    async fn rollback(&self, _ctx: &TxContext, tx: MockTx) -> Result<(), SqlStateError> {
        self.backend.delay().await;
        ignore_closed(self.backend.rollback(tx), |e| {
            e.code() == NO_ACTIVE_TRANSACTION
        })
    }
}

/// A [`Sleeper`] that records every requested delay and returns immediately.
///
/// Clones share the recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    /// An empty recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        futures::future::ready(()).boxed()
    }
}
