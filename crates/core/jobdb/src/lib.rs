//! Shared job store for the sync pipeline.
//!
//! The job database is the only coordination point between the dump-server,
//! restore-server, and check-server daemons: there is no central scheduler
//! and no cross-host shared memory. Every worker drives the `jobs` table
//! through the optimistic-concurrency protocol implemented here, so many
//! independent processes on many hosts can claim and advance the same rows
//! without application-level locks.

use std::{sync::Arc, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing::instrument;

mod error;
mod job;
mod job_id;
mod sql;
mod state;

pub use self::{
    error::Error,
    job::{describe_dummy_jobs, Job, JobDescription, JobFilter, JobPatch, UpdateCtx},
    job_id::{JobId, JobIdConvError, JobIdFromStrError},
    state::{JobState, UnknownStateError},
};

/// Schema version this build of the job store supports.
///
/// Checked against the `versions` table on every connect.
pub const SCHEMA_VERSION: i32 = 1;

/// Default pool size for the job DB.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Connection pool to the job DB. Clones refer to the same pool.
#[derive(Clone, Debug)]
pub struct JobDb {
    pool: sqlx::PgPool,
    host_fqdn: Arc<str>,
}

impl JobDb {
    /// Sets up a connection pool to the job DB.
    ///
    /// Runs migrations and verifies the schema version before returning.
    #[instrument(skip_all, err)]
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(Error::Connection)?;
        Self::init(pool).await
    }

    /// Sets up a connection pool with retry logic for databases that are
    /// still starting up (temporary test databases in particular).
    #[instrument(skip_all, err)]
    pub async fn connect_with_retry(url: &str, pool_size: u32) -> Result<Self, Error> {
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_max_times(20);

        fn is_db_starting_up(err: &Error) -> bool {
            matches!(
                err,
                Error::Connection(sqlx::Error::Database(db_err))
                if db_err.code().is_some_and(|code| code == "57P03")
            )
        }

        let pool = (|| async {
            PgPoolOptions::new()
                .max_connections(pool_size)
                .acquire_timeout(Duration::from_secs(5))
                .connect(url)
                .await
                .map_err(Error::Connection)
        })
        .retry(retry_policy)
        .when(is_db_starting_up)
        .notify(|err, dur| {
            tracing::warn!(
                error = %err,
                "Database still starting up during connection. Retrying in {:.1}s",
                dur.as_secs_f32()
            );
        })
        .await?;

        Self::init(pool).await
    }

    async fn init(pool: sqlx::PgPool) -> Result<Self, Error> {
        static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();
        MIGRATOR.run(&pool).await.map_err(Error::Migration)?;

        // A missing version row and a mismatched version are the same
        // operational problem: this build must not drive this schema.
        let found = sql::schema_version(&pool).await?.unwrap_or(0);
        if found != SCHEMA_VERSION {
            return Err(Error::SchemaVersion {
                found,
                supported: SCHEMA_VERSION,
            });
        }

        let host_fqdn = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self {
            pool,
            host_fqdn: host_fqdn.into(),
        })
    }

    /// The FQDN recorded as `status_fqdn` on every mutation from this host.
    pub fn host_fqdn(&self) -> &str {
        &self.host_fqdn
    }

    pub fn default_pool_size() -> u32 {
        DEFAULT_POOL_SIZE
    }

    /// Create a new sync (or delete) job.
    ///
    /// At most one live job may exist per `(dst_cell, volname)`; a second
    /// request surfaces [`Error::DuplicateJob`].
    #[instrument(skip(self), err)]
    pub async fn create_job(
        &self,
        src_cell: &str,
        dst_cell: &str,
        volname: &str,
        qname: &str,
        state: JobState,
    ) -> Result<JobId, Error> {
        sql::insert(
            &self.pool,
            src_cell,
            dst_cell,
            volname,
            qname,
            state,
            &self.host_fqdn,
            "newly created",
        )
        .await
    }

    /// Get a single job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, Error> {
        sql::get_by_id(&self.pool, id).await
    }

    /// Fetch all jobs matching the filter, oldest mutation first.
    pub async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, Error> {
        sql::find(&self.pool, filter).await
    }

    /// Read-only job view with computed liveness fields.
    pub async fn describe_jobs(&self, filter: &JobFilter) -> Result<Vec<JobDescription>, Error> {
        let now = Utc::now();
        let jobs = sql::find(&self.pool, filter).await?;
        Ok(jobs
            .into_iter()
            .map(|job| JobDescription::describe(job, now))
            .collect())
    }

    /// Apply a [`JobPatch`] under the dv (and optional state) guard.
    ///
    /// `ctx.dv` is advanced to the new data version on success. A stale dv
    /// or failed state guard surfaces as [`Error::Conflict`]; the caller
    /// must abandon the job rather than retry.
    pub async fn update_job(
        &self,
        ctx: &mut UpdateCtx,
        from_state: Option<JobState>,
        patch: &JobPatch,
    ) -> Result<(), Error> {
        sql::update(&self.pool, ctx, &self.host_fqdn, from_state, patch).await
    }

    /// The standard stage-pickup primitive.
    ///
    /// In one transaction: fetch every job in state `from` matching
    /// `filter`, advance each to `to` with the supplied default `timeout`
    /// and `description`, then return every matching job now in state `to`
    /// (including rows other workers advanced for the same destination).
    /// Jobs lost to a concurrent worker are skipped silently.
    ///
    /// The transaction is retried on deadlock-class errors with randomized
    /// exponential backoff.
    #[instrument(skip(self, filter), err)]
    pub async fn find_and_advance(
        &self,
        from: JobState,
        to: JobState,
        filter: &JobFilter,
        timeout: Option<i64>,
        description: &str,
    ) -> Result<Vec<Job>, Error> {
        (|| self.find_and_advance_once(from, to, filter, timeout, description))
            .retry(deadlock_retry_policy())
            .when(Error::is_retryable)
            .notify(|err, dur| {
                tracing::warn!(
                    error = %err,
                    "Retryable error advancing jobs. Retrying in {:.3}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }

    async fn find_and_advance_once(
        &self,
        from: JobState,
        to: JobState,
        filter: &JobFilter,
        timeout: Option<i64>,
        description: &str,
    ) -> Result<Vec<Job>, Error> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let mut from_filter = filter.clone();
        from_filter.states = Some(vec![from]);
        let candidates = sql::find(&mut *tx, &from_filter).await?;

        let patch = JobPatch::to_state(to)
            .with_description(description)
            .with_timeout(timeout);
        for job in candidates {
            let mut ctx = job.update_ctx();
            match sql::update(&mut *tx, &mut ctx, &self.host_fqdn, Some(from), &patch).await {
                Ok(()) => {}
                Err(Error::Conflict { id, .. }) => {
                    tracing::debug!(job_id = %id, "job advanced by another worker; skipping");
                }
                Err(err) => return Err(err),
            }
        }

        let mut to_filter = filter.clone();
        to_filter.states = Some(vec![to]);
        let advanced = sql::find(&mut *tx, &to_filter).await?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(advanced)
    }

    /// Move a job to `ERROR`, best effort.
    ///
    /// Bumps `errors`, records `from_state` in `last_good_state`, and clears
    /// the deadline. This is invoked from error paths, so a database failure
    /// here is logged and swallowed: there is nothing useful a failing
    /// worker can do about it, and the check-server will notice the stuck
    /// job through its staleness policy.
    pub async fn job_error(&self, ctx: &mut UpdateCtx, from_state: JobState, description: &str) {
        match sql::mark_error(&self.pool, ctx, &self.host_fqdn, from_state, description).await {
            Ok(()) => {
                tracing::warn!(job_id = %ctx.id, state = %from_state, error = description, "job failed");
            }
            Err(Error::Conflict { id, dv }) => {
                tracing::warn!(
                    job_id = %id,
                    dv,
                    "lost job while reporting error; another process took it over"
                );
            }
            Err(err) => {
                tracing::error!(
                    job_id = %ctx.id,
                    error = %err,
                    "failed to record job error in the database"
                );
            }
        }
    }

    /// Reset a failed job so it retries its last good stage.
    ///
    /// Clears the error counter and the error-limit alert clock; this is the
    /// operator-driven recovery path behind `cellcc retry-job`.
    #[instrument(skip(self), err)]
    pub async fn job_reset(&self, id: JobId) -> Result<JobState, Error> {
        let job = self.get_job(id).await?.ok_or(Error::NotFound(id))?;
        if job.state != JobState::Error {
            return Err(Error::Conflict { id, dv: job.dv });
        }
        let retry_state = job
            .last_good_state
            .map(|state| state.retry_state())
            .unwrap_or(JobState::New);

        let mut ctx = job.update_ctx();
        let patch = JobPatch {
            state: Some(retry_state),
            last_good_state: Some(None),
            errors: Some(0),
            errorlimit_mtime: Some(None),
            timeout: Some(None),
            description: Some("reset by operator".to_string()),
            ..JobPatch::default()
        };
        self.update_job(&mut ctx, Some(JobState::Error), &patch)
            .await?;
        Ok(retry_state)
    }

    /// Archive a finished job: copy it to `jobshist`, then delete the live
    /// row, in one transaction under the dv guard.
    #[instrument(skip(self), err)]
    pub async fn archive_job(&self, ctx: UpdateCtx) -> Result<(), Error> {
        (|| self.archive_job_once(ctx))
            .retry(deadlock_retry_policy())
            .when(Error::is_retryable)
            .notify(|err, dur| {
                tracing::warn!(
                    error = %err,
                    "Retryable error archiving job. Retrying in {:.3}s",
                    dur.as_secs_f32()
                );
            })
            .await
    }

    async fn archive_job_once(&self, ctx: UpdateCtx) -> Result<(), Error> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        sql::insert_history(&mut *tx, ctx.id).await?;
        sql::delete_guarded(&mut *tx, ctx).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    /// Get an archived job from the history relation.
    pub async fn get_archived_job(&self, id: JobId) -> Result<Option<Job>, Error> {
        sql::get_history_by_id(&self.pool, id).await
    }

    /// Delete a job row outright, archived or not.
    ///
    /// Returns `true` if a row was deleted. This is the `kill-job` path; it
    /// does not consult the dv because the operator is overriding whatever
    /// the workers think they are doing.
    #[instrument(skip(self), err)]
    pub async fn kill_job(&self, id: JobId) -> Result<bool, Error> {
        sql::delete(&self.pool, id).await
    }

    /// Delete a finished job without archiving it.
    pub async fn delete_job(&self, ctx: UpdateCtx) -> Result<(), Error> {
        sql::delete_guarded(&self.pool, ctx).await
    }
}

/// Retry policy for deadlock-class transaction failures.
///
/// Up to four attempts with a doubling base delay (100 ms, 200 ms, 400 ms)
/// and randomized jitter.
fn deadlock_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_factor(2.0)
        .with_max_times(4)
        .with_jitter()
}

/// In-tree DB integration tests
#[cfg(test)]
mod tests {
    mod it_advance;
    mod it_lifecycle;
    mod it_update;
}
