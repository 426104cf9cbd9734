//! Canonical error type for the driver, worker, and client layers.
//!
//! Every fallible path in this crate returns `Result<T, DriverError>`. Most
//! variants auto-convert from the errors the dependency stack already
//! produces, so call sites can use `?` without a manual `.map_err`.

use thiserror::Error;

/// Canonical error type for all sqlworker operations.
#[derive(Error, Debug)]
pub enum DriverError {
    /// `setConfig` was never called, or the driver was used before it resolved.
    #[error("no configuration set; call set_config before any other operation")]
    NoConfiguration,

    /// The worker thread is not running (crashed, or not yet started).
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// An operation exceeded its per-operation-kind deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The driver (or client) was used after `destroy()`.
    #[error("driver has been destroyed")]
    Destroyed,

    /// SQLite itself rejected the operation.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The envelope or message shape did not match what the worker expected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A storage backend named in config has no implementation here.
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// I/O failure opening, copying, or renaming a database file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking worker reply did not arrive before the `tokio` timer fired.
    #[error("timed out waiting for worker reply")]
    Elapsed(#[from] tokio::time::error::Elapsed),

    /// A named lock (cross-process or in-process) could not be acquired.
    #[error("lock acquisition failed: {0}")]
    LockUnavailable(String),
}

impl DriverError {
    /// True for errors worth retrying with backoff (SQLite busy/locked).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
                if matches!(code.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroyed_error_display() {
        let err = DriverError::Destroyed;
        assert_eq!(format!("{}", err), "driver has been destroyed");
    }

    #[test]
    fn worker_unavailable_display_includes_reason() {
        let err = DriverError::WorkerUnavailable("thread panicked".to_string());
        assert_eq!(format!("{}", err), "worker unavailable: thread panicked");
    }

    #[test]
    fn retryable_detects_busy_sqlite_errors() {
        let err = DriverError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".to_string()),
        ));
        assert!(err.is_retryable());
        assert!(!DriverError::NoConfiguration.is_retryable());
    }
}
