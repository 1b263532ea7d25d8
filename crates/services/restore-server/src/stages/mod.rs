//! Destination-side stage workers.
//!
//! One [`QueueWorker`] drives a single job through whichever stage it was
//! claimed for. All four stages share the same skeleton: claim the job
//! (`START -> WORK` under the dv guard), do the work with the deadline kept
//! fresh by progress callbacks, and either publish `DONE` or translate the
//! failure into a state transition. Workers never retry anything; the
//! check-server is the only retry authority.

mod delete;
mod release;
mod restore;
mod transfer;

use std::sync::Arc;

use cellcc_config::Config;
use jobdb::{Error as JobDbError, Job, JobDb, JobPatch, JobState, UpdateCtx};
use remctl::RemctlClient;
use supervisor::Progress;
use tokio::sync::Mutex;
use volops::VolOps;

/// Deadline for a job claimed into a `*_START` state awaiting a worker.
pub const PICKUP_TIMEOUT: i64 = 3600;

/// Initial deadline once stage work begins; progress callbacks extend it.
pub(crate) const WORK_TIMEOUT: i64 = 120;

/// Seconds added beyond the next progress interval when extending the
/// deadline.
pub(crate) const TIMEOUT_SLACK: i64 = 60;

/// The four stages a restore-server runs, in per-tick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Transfer,
    Restore,
    Release,
    Delete,
}

impl RestoreStage {
    /// Every stage, in the order a tick runs them.
    pub const ALL: [RestoreStage; 4] = [
        RestoreStage::Transfer,
        RestoreStage::Restore,
        RestoreStage::Release,
        RestoreStage::Delete,
    ];

    /// The `(from, to)` states of this stage's pickup transition.
    pub fn pickup(&self) -> (JobState, JobState) {
        match self {
            Self::Transfer => (JobState::DumpDone, JobState::XferStart),
            Self::Restore => (JobState::XferDone, JobState::RestoreStart),
            Self::Release => (JobState::RestoreDone, JobState::ReleaseStart),
            Self::Delete => (JobState::DeleteNew, JobState::DeleteDestStart),
        }
    }

    pub fn pickup_description(&self) -> &'static str {
        match self {
            Self::Transfer => "waiting for transfer worker",
            Self::Restore => "waiting for restore worker",
            Self::Release => "waiting for release worker",
            Self::Delete => "waiting for delete worker",
        }
    }
}

/// How a stage attempt ended, beyond plain success.
pub(crate) enum StageFailure {
    /// The job was taken away from us; exit without touching its state.
    Lost,
    /// Put the job back where it was before `WORK`, without counting an
    /// error (used for scratch-space waits).
    Rollback { to: JobState, description: String },
    /// A real failure: transition the job to `ERROR`.
    Fatal(String),
}

/// Per-queue stage worker for one destination cell.
#[derive(Clone)]
pub struct QueueWorker {
    pub db: JobDb,
    pub volops: VolOps,
    pub remctl: RemctlClient,
    pub config: Arc<Config>,
    pub dst_cell: String,
    pub qname: String,
}

impl QueueWorker {
    /// Run one claimed job through the given stage.
    pub async fn run_stage(&self, stage: RestoreStage, job: Job) {
        match stage {
            RestoreStage::Transfer => self.run_transfer_job(job).await,
            RestoreStage::Restore => self.run_restore_job(job).await,
            RestoreStage::Release => self.run_release_job(job).await,
            RestoreStage::Delete => self.run_delete_job(job).await,
        }
    }

    /// Claim a job: `start -> work` under the dv and state guards.
    ///
    /// Returns `false` when another worker won the job.
    pub(crate) async fn claim(
        &self,
        job: &Job,
        ctx: &mut UpdateCtx,
        start: JobState,
        work: JobState,
        description: &str,
    ) -> bool {
        let patch = JobPatch::to_state(work)
            .with_description(description)
            .with_timeout(Some(WORK_TIMEOUT));
        match self.db.update_job(ctx, Some(start), &patch).await {
            Ok(()) => true,
            Err(JobDbError::Conflict { id, .. }) => {
                tracing::debug!(job_id = %id, "job claimed by another worker");
                false
            }
            Err(err) => {
                tracing::error!(
                    job_id = %job.id,
                    error = %err, error_source = logging::error_source(&err),
                    "failed to claim job"
                );
                false
            }
        }
    }

    /// Write a stage outcome back to the job table.
    pub(crate) async fn conclude(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
        work_state: JobState,
        result: Result<(), StageFailure>,
    ) {
        match result {
            Ok(()) => {}
            Err(StageFailure::Lost) => {
                tracing::info!(job_id = %job.id, "lost job to another process; exiting stage");
            }
            Err(StageFailure::Rollback { to, description }) => {
                let mut ctx = ctx.lock().await;
                let patch = JobPatch::to_state(to)
                    .with_description(description)
                    .with_timeout(None);
                if let Err(err) = self.db.update_job(&mut ctx, Some(work_state), &patch).await {
                    tracing::warn!(job_id = %job.id, error = %err, "failed to roll back job");
                }
            }
            Err(StageFailure::Fatal(message)) => {
                let mut ctx = ctx.lock().await;
                self.db.job_error(&mut ctx, work_state, &message).await;
            }
        }
    }

    /// Refresh a running job's description and deadline.
    ///
    /// A dv conflict means the job was reset or taken over mid-stage; the
    /// worker must stop its child rather than keep working a job it no
    /// longer owns. Any other database failure is logged and tolerated:
    /// losing one refresh is not worth killing a long transfer over.
    pub(crate) async fn refresh_progress(
        &self,
        ctx: &Arc<Mutex<UpdateCtx>>,
        work_state: JobState,
        description: String,
        next_interval: u64,
    ) -> Progress {
        let patch = JobPatch::default()
            .with_description(description)
            .with_timeout(Some(next_interval as i64 + TIMEOUT_SLACK));
        let mut ctx = ctx.lock().await;
        match self.db.update_job(&mut ctx, Some(work_state), &patch).await {
            Ok(()) => Progress::Continue,
            Err(JobDbError::Conflict { id, .. }) => {
                tracing::info!(job_id = %id, "job reset mid-stage; aborting child");
                Progress::Abort
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to refresh job progress; continuing");
                Progress::Continue
            }
        }
    }

    /// Publish a stage's completion: `work -> done` with a fresh
    /// description and no deadline.
    pub(crate) async fn publish(
        &self,
        ctx: &Arc<Mutex<UpdateCtx>>,
        work_state: JobState,
        mut patch: JobPatch,
    ) -> Result<(), StageFailure> {
        patch.timeout = Some(None);
        let mut ctx = ctx.lock().await;
        match self.db.update_job(&mut ctx, Some(work_state), &patch).await {
            Ok(()) => Ok(()),
            Err(JobDbError::Conflict { .. }) => Err(StageFailure::Lost),
            Err(err) => Err(StageFailure::Fatal(err.to_string())),
        }
    }

    /// Path of a scratch-local capture file for this job.
    pub(crate) fn capture_path(&self, job: &Job, suffix: &str) -> std::path::PathBuf {
        self.config
            .restore
            .scratch_dir
            .join(format!("{}.{}.{suffix}", job.volname, job.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_pickups_follow_the_state_machine() {
        //* Given / When / Then
        assert_eq!(
            RestoreStage::Transfer.pickup(),
            (JobState::DumpDone, JobState::XferStart)
        );
        assert_eq!(
            RestoreStage::Restore.pickup(),
            (JobState::XferDone, JobState::RestoreStart)
        );
        assert_eq!(
            RestoreStage::Release.pickup(),
            (JobState::RestoreDone, JobState::ReleaseStart)
        );
        assert_eq!(
            RestoreStage::Delete.pickup(),
            (JobState::DeleteNew, JobState::DeleteDestStart)
        );
    }

    #[test]
    fn every_pickup_target_has_a_work_state() {
        for stage in RestoreStage::ALL {
            let (_, start) = stage.pickup();
            assert!(
                start.work_state().is_some(),
                "{start} must lead to a WORK state"
            );
        }
    }
}
