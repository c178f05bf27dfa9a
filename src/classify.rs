//! Transient/permanent error classification.
//!
//! The executor retries an attempt only when its failure is transient. The
//! default rules, checked against the error and every error in its
//! [`source`](std::error::Error::source) chain, are:
//!
//! 1. A backend status code that signals a transient condition: lost or
//!    refused connections, timeouts, too many connections, lock not
//!    available, serialization failure, deadlock, admin or crash shutdown.
//! 2. Otherwise, a message containing one of [`TRANSIENT_MESSAGE_FRAGMENTS`],
//!    even when a status code was present but not transient.
//! 3. Otherwise permanent.
//!
//! A commit cut off before the backend answered never reaches the classifier.
//! The executor reports it as
//! [`CommitOutcomeUnknown`](crate::error::CommitOutcomeUnknown) without
//! retrying.
//!
//! Status codes are taken from [`SqlStateError`], [`std::io::Error`] kinds,
//! the executor's own [`AttemptTimeout`], and with the `postgres` feature
//! from `sqlx::Error`.
//!
//! This is a heuristic. A false negative fails the caller early; a false
//! positive wastes retries on something that will not recover.
//!
//! # Examples
//!
//! ```
//! use txretry::{is_transient, SqlStateError};
//!
//! let deadlock = SqlStateError::new("40P01", "deadlock detected");
//! assert!(is_transient(&deadlock));
//!
//! let unique = SqlStateError::new("23505", "duplicate key value");
//! assert!(!is_transient(&unique));
//! ```

use std::error::Error;
use std::fmt;
use std::io;

use crate::error::AttemptTimeout;

/// SQLSTATE codes treated as transient.
pub const TRANSIENT_SQLSTATES: &[&str] = &[
    // class 08: connection exception
    "08000", // connection_exception
    "08001", // sqlclient_unable_to_establish_sqlconnection
    "08003", // connection_does_not_exist
    "08004", // sqlserver_rejected_establishment_of_sqlconnection
    "08006", // connection_failure
    "53300", // too_many_connections
    "55P03", // lock_not_available
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "57014", // query_canceled (statement timeout)
    "57P01", // admin_shutdown
    "57P02", // crash_shutdown
    "57P03", // cannot_connect_now
];

/// Message fragments that indicate network-level transience.
///
/// Lowercase phrases match regardless of case ("Connection reset by peer").
/// Fragments containing uppercase letters match exactly, so `EOF` does not
/// match "geofence".
pub const TRANSIENT_MESSAGE_FRAGMENTS: &[&str] = &[
    "broken pipe",
    "EOF",
    "connection reset",
    "i/o timeout",
    "connection terminated",
];

/// Decides whether a failure is worth retrying.
///
/// Implemented for [`DefaultClassifier`] and for any
/// `Fn(&(dyn Error + 'static)) -> bool`.
pub trait Classify: Send + Sync {
    /// Returns true if the error is transient.
    fn is_transient(&self, err: &(dyn Error + 'static)) -> bool;
}

/// The rules described in the [module docs](self).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl Classify for DefaultClassifier {
    fn is_transient(&self, err: &(dyn Error + 'static)) -> bool {
        is_transient(err)
    }
}

impl<F> Classify for F
where
    F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync,
{
    fn is_transient(&self, err: &(dyn Error + 'static)) -> bool {
        self(err)
    }
}

/// Classify with the default rules.
pub fn is_transient(err: &(dyn Error + 'static)) -> bool {
    chain(err).any(status_is_transient)
        || chain(err).any(|e| message_is_transient(&e.to_string()))
}

/// Returns true if `code` is one of [`TRANSIENT_SQLSTATES`].
pub fn is_transient_sqlstate(code: &str) -> bool {
    TRANSIENT_SQLSTATES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(code))
}

/// Returns true if `message` contains one of [`TRANSIENT_MESSAGE_FRAGMENTS`].
pub fn message_is_transient(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    TRANSIENT_MESSAGE_FRAGMENTS.iter().any(|fragment| {
        if fragment.bytes().any(|b| b.is_ascii_uppercase()) {
            message.contains(fragment)
        } else {
            lowered.contains(fragment)
        }
    })
}

fn chain<'a>(err: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Whether this error (not its sources) carries a transient status.
fn status_is_transient(err: &(dyn Error + 'static)) -> bool {
    if err.downcast_ref::<AttemptTimeout>().is_some() {
        return true;
    }
    if let Some(e) = err.downcast_ref::<SqlStateError>() {
        return is_transient_sqlstate(e.code());
    }
    if let Some(e) = err.downcast_ref::<io::Error>() {
        return io_kind_is_transient(e.kind());
    }
    #[cfg(feature = "postgres")]
    if let Some(e) = err.downcast_ref::<sqlx::Error>() {
        return sqlx_is_transient(e);
    }
    false
}

fn io_kind_is_transient(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

#[cfg(feature = "postgres")]
fn sqlx_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().is_some_and(|code| is_transient_sqlstate(&code)),
        sqlx::Error::Io(e) => io_kind_is_transient(e.kind()),
        sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

/// An error tagged with a SQLSTATE code.
///
/// Lets adapters that are not built on sqlx feed status codes into the
/// default classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStateError {
    code: String,
    message: String,
}

impl SqlStateError {
    /// Create an error with a five-character SQLSTATE code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The server message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SqlStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (SQLSTATE {})", self.message, self.code)
    }
}

impl Error for SqlStateError {}
