//! A single connection shared by a connection-shaped adapter.
//!
//! The slot serializes transactions on the connection and remembers whether
//! the server may still have one open. A transaction handle dropped before
//! its commit or rollback finished (the caller dropped the `execute` future,
//! or a commit was cut off) leaves the slot marked open, and the next `begin`
//! must roll that transaction back before starting its own. Otherwise the
//! next `COMMIT` would also commit the abandoned writes.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

struct SlotState<C> {
    conn: C,
    open: bool,
}

/// One connection, one transaction at a time.
///
/// Cloning shares the connection.
pub struct ConnectionSlot<C> {
    state: Arc<Mutex<SlotState<C>>>,
}

impl<C> Clone for ConnectionSlot<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<C> fmt::Debug for ConnectionSlot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSlot").finish_non_exhaustive()
    }
}

impl<C: Default> Default for ConnectionSlot<C> {
    fn default() -> Self {
        Self::new(C::default())
    }
}

impl<C> ConnectionSlot<C> {
    /// Take ownership of an idle connection.
    pub fn new(conn: C) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlotState { conn, open: false })),
        }
    }

    /// Wait until no other transaction holds the connection.
    pub async fn acquire(&self) -> SlotGuard<C> {
        SlotGuard {
            guard: Arc::clone(&self.state).lock_owned().await,
        }
    }
}

/// Exclusive access to the connection. Derefs to it.
pub struct SlotGuard<C> {
    guard: OwnedMutexGuard<SlotState<C>>,
}

impl<C> fmt::Debug for SlotGuard<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotGuard")
            .field("open", &self.guard.open)
            .finish_non_exhaustive()
    }
}

impl<C> SlotGuard<C> {
    /// Whether the server may still have a transaction open.
    ///
    /// True right after [`acquire`](ConnectionSlot::acquire) means an earlier
    /// transaction was abandoned and must be rolled back first.
    pub fn is_open(&self) -> bool {
        self.guard.open
    }

    /// Call before sending `BEGIN`, so a `BEGIN` that is cut off still
    /// counts as possibly open.
    pub fn mark_open(&mut self) {
        self.guard.open = true;
    }

    /// Call once `COMMIT` or `ROLLBACK` has returned, whatever the result.
    pub fn mark_closed(&mut self) {
        self.guard.open = false;
    }
}

impl<C> Deref for SlotGuard<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.guard.conn
    }
}

impl<C> DerefMut for SlotGuard<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.guard.conn
    }
}
