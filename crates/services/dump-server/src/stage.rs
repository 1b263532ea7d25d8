//! The dump stage worker.
//!
//! Claims jobs in `DUMP_START`, produces a dump blob in the scratch
//! directory, and publishes it by advancing the job to `DUMP_DONE` with the
//! blob's name, size, checksum, and origin host recorded. Failure handling
//! follows the pipeline-wide contract: nothing is retried locally; every
//! failure becomes a state transition and the check-server decides what
//! happens next.

use std::{path::PathBuf, sync::Arc, time::Instant};

use cellcc_config::Config;
use jobdb::{Error as JobDbError, Job, JobDb, JobPatch, JobState, UpdateCtx};
use supervisor::{run_command, ChildError, IntervalSchedule, Progress};
use tokio::sync::Mutex;
use volops::{scratch, VolOps, VosError};

/// Deadline for a job sitting in `DUMP_START` waiting for a worker slot.
pub const PICKUP_TIMEOUT: i64 = 3600;

/// Initial deadline once dumping begins; progress callbacks extend it.
const WORK_TIMEOUT: i64 = 120;

/// Seconds added beyond the next progress interval when extending the
/// deadline.
const TIMEOUT_SLACK: i64 = 60;

/// How a dump attempt ended, beyond plain success.
enum DumpFailure {
    /// The job was taken away from us (dv conflict); exit without touching
    /// its state.
    Lost,
    /// Not enough scratch space; roll back to `DUMP_START` without
    /// counting an error.
    ScratchFull { needed: u64 },
    /// A real failure: transition the job to `ERROR`.
    Fatal(String),
}

/// One dump-server's per-job worker.
#[derive(Clone)]
pub struct DumpWorker {
    pub db: JobDb,
    pub volops: VolOps,
    pub config: Arc<Config>,
    /// FQDN recorded as the blob's origin host.
    pub dump_host: String,
}

impl DumpWorker {
    /// Run one claimed job to completion.
    ///
    /// Never returns an error: every outcome is written to the job table
    /// (or deliberately not, when the job was lost to another worker).
    pub async fn run_job(&self, job: Job) {
        let ctx = Arc::new(Mutex::new(job.update_ctx()));

        // Claim: DUMP_START -> DUMP_WORK under the dv and state guards.
        {
            let mut ctx = ctx.lock().await;
            let claim = JobPatch::to_state(JobState::DumpWork)
                .with_description("starting dump")
                .with_timeout(Some(WORK_TIMEOUT));
            match self
                .db
                .update_job(&mut ctx, Some(JobState::DumpStart), &claim)
                .await
            {
                Ok(()) => {}
                Err(JobDbError::Conflict { id, .. }) => {
                    tracing::debug!(job_id = %id, "job claimed by another dump worker");
                    return;
                }
                Err(err) => {
                    tracing::error!(
                        job_id = %job.id,
                        error = %err, error_source = logging::error_source(&err),
                        "failed to claim dump job"
                    );
                    return;
                }
            }
        }

        match self.dump_job(&job, &ctx).await {
            Ok(()) => {}
            Err(DumpFailure::Lost) => {
                tracing::info!(job_id = %job.id, "lost dump job to another process; exiting");
            }
            Err(DumpFailure::ScratchFull { needed }) => {
                // Roll back to the pre-WORK state with no deadline so the
                // check-server does not treat the wait as an expiry. No
                // error is counted; scratch pressure is not the job's
                // fault.
                let mut ctx = ctx.lock().await;
                let rollback = JobPatch::to_state(JobState::DumpStart)
                    .with_description(format!("waiting for {needed} free bytes of scratch"))
                    .with_timeout(None);
                if let Err(err) = self
                    .db
                    .update_job(&mut ctx, Some(JobState::DumpWork), &rollback)
                    .await
                {
                    tracing::warn!(
                        job_id = %job.id,
                        error = %err,
                        "failed to roll back scratch-starved job"
                    );
                }
            }
            Err(DumpFailure::Fatal(message)) => {
                let mut ctx = ctx.lock().await;
                self.db
                    .job_error(&mut ctx, JobState::DumpWork, &message)
                    .await;
            }
        }
    }

    async fn dump_job(&self, job: &Job, ctx: &Arc<Mutex<UpdateCtx>>) -> Result<(), DumpFailure> {
        let incremental = &self.config.dump.incremental;

        // Work out the incremental baseline, if any.
        let baseline = if incremental.enabled {
            match self.incremental_baseline(job).await? {
                Baseline::Full => 0,
                Baseline::Since(when) => when,
                Baseline::Unchanged => {
                    // The destination already has this volume's data; skip
                    // the whole pipeline and let the check-server archive
                    // the job.
                    let mut ctx = ctx.lock().await;
                    let patch = JobPatch::to_state(JobState::ReleaseDone)
                        .with_description("volume unchanged on destination; dump skipped")
                        .with_timeout(None);
                    return self
                        .db
                        .update_job(&mut ctx, Some(JobState::DumpWork), &patch)
                        .await
                        .map_err(|err| match err {
                            JobDbError::Conflict { .. } => DumpFailure::Lost,
                            other => DumpFailure::Fatal(other.to_string()),
                        });
                }
            }
        } else {
            0
        };

        // Make sure the blob will fit, with the configured slack on top.
        let dump_size = self
            .volops
            .dump_size(&job.src_cell, &job.volname, baseline)
            .await
            .map_err(|err| DumpFailure::Fatal(format!("failed to size dump: {err}")))?;
        let scratch_dir = &self.config.dump.scratch_dir;
        let needed = dump_size + self.config.dump.scratch_min_free;
        if let Some(free) = scratch::free_space(scratch_dir) {
            if free < needed {
                tracing::info!(
                    job_id = %job.id,
                    free,
                    needed,
                    "insufficient scratch space; deferring dump"
                );
                return Err(DumpFailure::ScratchFull { needed });
            }
        }

        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|err| DumpFailure::Fatal(format!("failed to create scratch dir: {err}")))?;

        let filename = scratch::dump_file_name(&job.volname, job.id);
        let path = scratch_dir.join(&filename);
        let stderr_path = path.with_extension("dump.stderr");

        let result = self
            .supervised_dump(job, ctx, baseline, &path, &stderr_path, dump_size)
            .await;
        let _ = tokio::fs::remove_file(&stderr_path).await;
        if let Err(failure) = result {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(failure);
        }

        // Publish the blob.
        let checksum = scratch::checksum_file(&path, self.config.dump.checksum)
            .await
            .map_err(|err| DumpFailure::Fatal(format!("failed to checksum dump: {err}")))?;
        let filesize = tokio::fs::metadata(&path)
            .await
            .map_err(|err| DumpFailure::Fatal(format!("failed to stat dump: {err}")))?
            .len() as i64;

        let patch = JobPatch {
            state: Some(JobState::DumpDone),
            vol_lastupdate: Some(baseline),
            dump_fqdn: Some(Some(self.dump_host.clone())),
            dump_method: Some(Some("remctl".to_string())),
            dump_port: Some(Some(i32::from(self.config.remctl.port))),
            dump_filename: Some(Some(filename)),
            dump_checksum: Some(Some(checksum)),
            dump_filesize: Some(Some(filesize)),
            timeout: Some(None),
            description: Some("dump complete; waiting for transfer".to_string()),
            ..JobPatch::default()
        };
        let mut ctx = ctx.lock().await;
        match self
            .db
            .update_job(&mut ctx, Some(JobState::DumpWork), &patch)
            .await
        {
            Ok(()) => {
                tracing::info!(job_id = %job.id, volname = %job.volname, filesize, "dump published");
                Ok(())
            }
            Err(JobDbError::Conflict { .. }) => {
                // The job is no longer ours; the blob belongs to no one.
                let _ = tokio::fs::remove_file(&path).await;
                Err(DumpFailure::Lost)
            }
            Err(other) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(DumpFailure::Fatal(other.to_string()))
            }
        }
    }

    /// Run the dump command under the child supervisor, reporting transfer
    /// progress into the job's description and extending its deadline.
    async fn supervised_dump(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
        baseline: i64,
        path: &PathBuf,
        stderr_path: &PathBuf,
        expected_size: u64,
    ) -> Result<(), DumpFailure> {
        let command = self
            .volops
            .dump_command(&job.src_cell, &job.volname, baseline, path);

        let db = self.db.clone();
        let job_id = job.id;
        let progress_ctx = Arc::clone(ctx);
        let progress_path = path.clone();
        let started = Instant::now();

        let result = run_command(
            command,
            None,
            stderr_path,
            &IntervalSchedule::default(),
            move |next_interval| {
                let db = db.clone();
                let ctx = Arc::clone(&progress_ctx);
                let path = progress_path.clone();
                async move {
                    let dumped = tokio::fs::metadata(&path)
                        .await
                        .map(|meta| meta.len())
                        .unwrap_or(0);
                    let elapsed = started.elapsed().as_secs().max(1);
                    let patch = JobPatch::default()
                        .with_description(format!(
                            "dumped {dumped} / {expected_size} bytes ({} bytes/sec)",
                            dumped / elapsed
                        ))
                        .with_timeout(Some(next_interval as i64 + TIMEOUT_SLACK));

                    let mut ctx = ctx.lock().await;
                    match db
                        .update_job(&mut ctx, Some(JobState::DumpWork), &patch)
                        .await
                    {
                        Ok(()) => Progress::Continue,
                        Err(JobDbError::Conflict { .. }) => {
                            // The check-server (or an operator) took the job
                            // away; the dump must not keep running.
                            tracing::info!(job_id = %job_id, "job reset mid-dump; aborting child");
                            Progress::Abort
                        }
                        Err(err) => {
                            tracing::warn!(
                                job_id = %job_id,
                                error = %err,
                                "failed to refresh dump progress; continuing"
                            );
                            Progress::Continue
                        }
                    }
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(ChildError::Aborted { .. }) => Err(DumpFailure::Lost),
            Err(err) => Err(DumpFailure::Fatal(err.to_string())),
        }
    }

    /// Decide between a full dump, an incremental baseline, and skipping.
    async fn incremental_baseline(&self, job: &Job) -> Result<Baseline, DumpFailure> {
        let incremental = &self.config.dump.incremental;

        let src_info = self
            .volops
            .examine(&job.src_cell, &job.volname)
            .await
            .map_err(|err| DumpFailure::Fatal(format!("failed to examine source volume: {err}")))?;

        let dst_info = match self.volops.examine(&job.dst_cell, &job.volname).await {
            Ok(info) => info,
            Err(VosError::NoSuchVolume { .. }) => {
                // First sync to this destination: full dump.
                return Ok(Baseline::Full);
            }
            Err(err) if incremental.fulldump_on_error => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %err, error_source = logging::error_source(&err),
                    "cannot examine destination volume; falling back to a full dump"
                );
                return Ok(Baseline::Full);
            }
            Err(err) => {
                return Err(DumpFailure::Fatal(format!(
                    "failed to examine destination volume: {err}"
                )))
            }
        };

        if dst_info.update_date > src_info.update_date {
            // The destination has data the source never produced. Syncing
            // over it would silently destroy whatever that is.
            return Err(DumpFailure::Fatal(format!(
                "destination volume is newer than source ({} > {})",
                dst_info.update_date, src_info.update_date
            )));
        }
        if dst_info.update_date == src_info.update_date && incremental.skip_unchanged {
            return Ok(Baseline::Unchanged);
        }
        Ok(Baseline::Since(dst_info.update_date))
    }
}

enum Baseline {
    /// Dump everything.
    Full,
    /// Incremental dump of changes since the given epoch.
    Since(i64),
    /// Destination is already current; skip the pipeline.
    Unchanged,
}
