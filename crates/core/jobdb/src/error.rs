//! Error types for job store operations.

/// Errors that can occur when interacting with the job database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish a connection to the job database.
    ///
    /// This error is considered retryable. See `is_connection_error()`.
    #[error("Error connecting to job db: {0}")]
    Connection(#[source] sqlx::Error),

    /// Failed to run database migrations.
    ///
    /// Migration failures are fatal and require manual intervention.
    #[error("Error running migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// The database schema version does not match the compiled-in version.
    ///
    /// Every connecting process verifies the `versions` table before use so
    /// that a fleet of daemons on different hosts never drives a schema it
    /// was not built for.
    #[error("Database schema version {found} does not match supported version {supported}")]
    SchemaVersion { found: i32, supported: i32 },

    /// Database query execution failed.
    ///
    /// Covers all query failures: lost connections (retryable), deadlocks
    /// and serialization failures (retryable), constraint violations, and
    /// programming errors. Use `is_retryable()` to decide whether to retry.
    #[error("Error executing database query: {0}")]
    Database(#[source] sqlx::Error),

    /// An update affected zero rows: another process mutated the job first,
    /// or the `from_state` guard did not hold.
    ///
    /// This is the optimistic-concurrency loss signal. Stage workers abort
    /// the current job without counting it as a job failure.
    #[error("Job {id} was modified concurrently (dv {dv} is stale)")]
    Conflict { id: crate::JobId, dv: i64 },

    /// A job row that was expected to exist is gone.
    #[error("Job {0} not found")]
    NotFound(crate::JobId),

    /// A live job already exists for the same `(dst_cell, volname)` pair.
    #[error("A sync job for volume {volname} to cell {dst_cell} already exists")]
    DuplicateJob { dst_cell: String, volname: String },
}

impl Error {
    /// Returns `true` if the error is likely a transient connection issue.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    /// Returns `true` if the error is retryable.
    ///
    /// Retryable errors are connection errors plus the transaction-class
    /// failures that concurrent row updates produce: serialization failures
    /// and detected deadlocks. These are transient and safe to retry from
    /// the beginning of the transaction. Conflicts from the dv guard are
    /// *not* retryable; they mean another worker won the row.
    pub fn is_retryable(&self) -> bool {
        if self.is_connection_error() {
            return true;
        }

        matches!(
            self,
            Error::Database(sqlx::Error::Database(err))
                if err.code().is_some_and(|code| matches!(
                    code.as_ref(),
                    pg_error_codes::SERIALIZATION_FAILURE | pg_error_codes::DEADLOCK_DETECTED
                ))
        )
    }

    /// Returns `true` if the error is a unique constraint violation.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(
            err,
            sqlx::Error::Database(db_err)
                if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation)
        )
    }
}

/// PostgreSQL error codes for transaction-related errors.
///
/// For reference: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
mod pg_error_codes {
    /// Serialization failure: two transactions conflicted and one must be
    /// retried.
    pub const SERIALIZATION_FAILURE: &str = "40001";

    /// Deadlock detected: one of the waiting transactions was aborted and
    /// should be retried.
    pub const DEADLOCK_DETECTED: &str = "40P01";
}
