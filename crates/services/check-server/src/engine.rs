//! The check policy engine.
//!
//! One sweep examines every live job and applies, in order, at most one of
//! the five policy rules: reset, done, expired, stale, old. The engine is
//! the pipeline's only retry authority; stage workers translate failures
//! into `ERROR` and stop, and everything that happens next is decided here.

use std::sync::Arc;

use cellcc_config::Config;
use chrono::{DateTime, Duration, Utc};
use jobdb::{
    Error as JobDbError, JobDb, JobDescription, JobFilter, JobPatch, JobState,
};

use crate::alerts::{Alert, AlertKind};

/// Errors that can fail a whole check sweep.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Job database error: {0}")]
    JobDb(#[from] jobdb::Error),
}

/// The check/alert policy engine.
pub struct CheckEngine {
    db: JobDb,
    config: Arc<Config>,
}

impl CheckEngine {
    pub fn new(db: JobDb, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    /// One full sweep over the job table.
    ///
    /// Returns the alerts to dispatch. Per-job races (another check-server
    /// beat us to a reset, a worker advanced the job mid-sweep) are skipped
    /// silently; only database-level failures abort the sweep.
    pub async fn sweep(&self) -> Result<Vec<Alert>, EngineError> {
        let jobs = self.db.describe_jobs(&JobFilter::default()).await?;
        let now = Utc::now();

        let mut alerts = Vec::new();
        for desc in jobs {
            if let Some(alert) = self.check_job(&desc, now).await? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }

    /// Apply the first matching rule to one job.
    async fn check_job(
        &self,
        desc: &JobDescription,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, EngineError> {
        let job = &desc.job;

        // Rule 1: failed jobs are either retried or held at the limit.
        if job.state == JobState::Error {
            return self.check_errored(desc, now).await;
        }

        // Rule 2: finished jobs leave the live table.
        if job.state.is_terminal() {
            self.finish_job(desc).await?;
            return Ok(None);
        }

        // Rule 3: a blown deadline is a failure; the job becomes ERROR and
        // rule 1 picks it up on the next sweep.
        if desc.expired {
            let mut ctx = job.update_ctx();
            self.db
                .job_error(&mut ctx, job.state, "job deadline expired")
                .await;
            return Ok(Some(Alert::new(
                AlertKind::Expired,
                job,
                format!("deadline expired in state {}", job.state),
            )));
        }

        // Rule 4: quiet for too long.
        if desc.stale_seconds > self.config.check.stale_seconds {
            return Ok(Some(Alert::new(
                AlertKind::Stale,
                job,
                format!(
                    "no progress for {}s (state {}): {}",
                    desc.stale_seconds, job.state, job.description
                ),
            )));
        }

        // Rule 5: alive for too long.
        if desc.age_seconds > self.config.check.old_seconds {
            return Ok(Some(Alert::new(
                AlertKind::Old,
                job,
                format!("job is {}s old and still not finished", desc.age_seconds),
            )));
        }

        Ok(None)
    }

    /// Rule 1: decide what happens to a job in `ERROR`.
    async fn check_errored(
        &self,
        desc: &JobDescription,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, EngineError> {
        let job = &desc.job;
        let check = &self.config.check;

        if job.errors < check.error_limit {
            let Some(last_good) = job.last_good_state else {
                tracing::warn!(
                    job_id = %job.id,
                    "job is in ERROR without a last_good_state; leaving it for an operator"
                );
                return Ok(None);
            };
            let retry_state = last_good.retry_state();

            let mut ctx = job.update_ctx();
            let patch = JobPatch {
                state: Some(retry_state),
                last_good_state: Some(None),
                timeout: Some(None),
                description: Some(format!(
                    "retrying after error ({} of {}): {}",
                    job.errors, check.error_limit, job.description
                )),
                ..JobPatch::default()
            };
            match self
                .db
                .update_job(&mut ctx, Some(JobState::Error), &patch)
                .await
            {
                Ok(()) => Ok(Some(Alert::new(
                    AlertKind::Retry,
                    job,
                    format!("reset to {retry_state} after failure: {}", job.description),
                ))),
                Err(JobDbError::Conflict { .. }) => Ok(None),
                Err(err) => Err(err.into()),
            }
        } else {
            // Over the limit: no reset. Alert, but only once per rate-limit
            // window, tracked through errorlimit_mtime.
            let window = Duration::seconds(check.errlimit_interval);
            if let Some(last_alert) = job.errorlimit_mtime {
                if now - last_alert < window {
                    return Ok(None);
                }
            }

            let mut ctx = job.update_ctx();
            let patch = JobPatch {
                errorlimit_mtime: Some(Some(now)),
                ..JobPatch::default()
            };
            match self
                .db
                .update_job(&mut ctx, Some(JobState::Error), &patch)
                .await
            {
                Ok(()) => Ok(Some(Alert::new(
                    AlertKind::ErrorLimit,
                    job,
                    format!(
                        "failed {} times (limit {}); giving up until an operator intervenes: {}",
                        job.errors, check.error_limit, job.description
                    ),
                ))),
                Err(JobDbError::Conflict { .. }) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }
    }

    /// Rule 2: archive (or just delete) a finished job.
    async fn finish_job(&self, desc: &JobDescription) -> Result<(), EngineError> {
        let job = &desc.job;
        let result = if self.config.check.archive_jobs {
            self.db.archive_job(job.update_ctx()).await
        } else {
            self.db.delete_job(job.update_ctx()).await
        };
        match result {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.id,
                    volname = %job.volname,
                    state = %job.state,
                    archived = self.config.check.archive_jobs,
                    "finished job removed from live table"
                );
                Ok(())
            }
            // Someone else archived it between our read and our write.
            Err(JobDbError::Conflict { .. }) | Err(JobDbError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
