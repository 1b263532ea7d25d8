//! The transfer stage: pull the dump blob from its origin host.

use std::{sync::Arc, time::Instant};

use jobdb::{Job, JobPatch, JobState, UpdateCtx};
use supervisor::{run_command, ChildError, IntervalSchedule};
use tokio::sync::Mutex;
use volops::scratch;

use super::{QueueWorker, StageFailure};

impl QueueWorker {
    pub(crate) async fn run_transfer_job(&self, job: Job) {
        let mut ctx = job.update_ctx();
        if !self
            .claim(
                &job,
                &mut ctx,
                JobState::XferStart,
                JobState::XferWork,
                "starting transfer",
            )
            .await
        {
            return;
        }
        let ctx = Arc::new(Mutex::new(ctx));
        let result = self.transfer_job(&job, &ctx).await;
        self.conclude(&job, &ctx, JobState::XferWork, result).await;
    }

    async fn transfer_job(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
    ) -> Result<(), StageFailure> {
        // A job cannot reach XFER_START without its dump metadata; missing
        // fields mean the table was mangled outside the pipeline.
        let dump_filename = require(&job.dump_filename, "dump_filename")?.clone();
        let dump_fqdn = require(&job.dump_fqdn, "dump_fqdn")?.clone();
        let dump_checksum = require(&job.dump_checksum, "dump_checksum")?.clone();
        let dump_filesize = *require(&job.dump_filesize, "dump_filesize")?;

        let scratch_dir = &self.config.restore.scratch_dir;
        let needed = dump_filesize as u64 + self.config.restore.scratch_min_free;
        if let Some(free) = scratch::free_space(scratch_dir) {
            if free < needed {
                tracing::info!(job_id = %job.id, free, needed, "insufficient scratch space; deferring transfer");
                return Err(StageFailure::Rollback {
                    to: JobState::XferStart,
                    description: format!("waiting for {needed} free bytes of scratch"),
                });
            }
        }
        tokio::fs::create_dir_all(scratch_dir)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to create scratch dir: {err}")))?;

        let local_name = scratch::dump_file_name(&job.volname, job.id);
        let local_path = scratch_dir.join(&local_name);
        let stderr_path = self.capture_path(job, "xfer.stderr");

        // Fetch the blob, keeping the deadline ahead of the transfer.
        let command = self.remctl.get_dump_command(&dump_fqdn, &dump_filename);
        let worker = self.clone();
        let progress_ctx = Arc::clone(ctx);
        let progress_path = local_path.clone();
        let started = Instant::now();
        let fetch = run_command(
            command,
            Some(local_path.as_path()),
            &stderr_path,
            &IntervalSchedule::default(),
            move |next_interval| {
                let worker = worker.clone();
                let ctx = Arc::clone(&progress_ctx);
                let path = progress_path.clone();
                async move {
                    let transferred = tokio::fs::metadata(&path)
                        .await
                        .map(|meta| meta.len())
                        .unwrap_or(0);
                    let elapsed = started.elapsed().as_secs().max(1);
                    let description = format!(
                        "transferred {transferred} / {dump_filesize} bytes ({} bytes/sec)",
                        transferred / elapsed
                    );
                    worker
                        .refresh_progress(&ctx, JobState::XferWork, description, next_interval)
                        .await
                }
            },
        )
        .await;
        let _ = tokio::fs::remove_file(&stderr_path).await;

        match fetch {
            Ok(()) => {}
            Err(ChildError::Aborted { .. }) => {
                let _ = tokio::fs::remove_file(&local_path).await;
                return Err(StageFailure::Lost);
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&local_path).await;
                return Err(StageFailure::Fatal(format!("dump fetch failed: {err}")));
            }
        }

        // Record where the local copy lives before trusting it.
        {
            let patch = JobPatch {
                restore_filename: Some(Some(local_name.clone())),
                ..JobPatch::default()
            };
            let mut ctx = ctx.lock().await;
            if let Err(err) = self
                .db
                .update_job(&mut ctx, Some(JobState::XferWork), &patch)
                .await
            {
                let _ = tokio::fs::remove_file(&local_path).await;
                return Err(match err {
                    jobdb::Error::Conflict { .. } => StageFailure::Lost,
                    other => StageFailure::Fatal(other.to_string()),
                });
            }
        }

        // Verify size, then checksum. A mismatch discards the local copy
        // and fails the job; the retry re-fetches from the origin.
        let actual_size = tokio::fs::metadata(&local_path)
            .await
            .map(|meta| meta.len() as i64)
            .map_err(|err| StageFailure::Fatal(format!("failed to stat fetched dump: {err}")))?;
        if actual_size != dump_filesize {
            return Err(self
                .discard_fetched(job, ctx, &local_path, format!(
                    "fetched dump is {actual_size} bytes, expected {dump_filesize}"
                ))
                .await);
        }
        if let Err(err) = scratch::verify_checksum(&local_path, &dump_checksum).await {
            return Err(self
                .discard_fetched(job, ctx, &local_path, format!("dump verification failed: {err}"))
                .await);
        }

        // The local copy is good: drop the origin's blob, and only then
        // forget where it was.
        self.remctl
            .remove_dump(&dump_fqdn, &dump_filename)
            .await
            .map_err(|err| {
                StageFailure::Fatal(format!("failed to remove origin dump: {err}"))
            })?;

        let patch = JobPatch {
            state: Some(JobState::XferDone),
            dump_filename: Some(None),
            description: Some("transfer complete; waiting for restore".to_string()),
            ..JobPatch::default()
        };
        self.publish(ctx, JobState::XferWork, patch).await?;
        tracing::info!(job_id = %job.id, volname = %job.volname, "transfer complete");
        Ok(())
    }

    /// Throw away a bad local copy and clear `restore_filename`.
    async fn discard_fetched(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
        local_path: &std::path::Path,
        message: String,
    ) -> StageFailure {
        let _ = tokio::fs::remove_file(local_path).await;
        let patch = JobPatch {
            restore_filename: Some(None),
            ..JobPatch::default()
        };
        let mut ctx = ctx.lock().await;
        if let Err(err) = self
            .db
            .update_job(&mut ctx, Some(JobState::XferWork), &patch)
            .await
        {
            tracing::warn!(job_id = %job.id, error = %err, "failed to clear restore_filename");
        }
        StageFailure::Fatal(message)
    }
}

fn require<'a, T>(field: &'a Option<T>, name: &str) -> Result<&'a T, StageFailure> {
    field
        .as_ref()
        .ok_or_else(|| StageFailure::Fatal(format!("job has no {name} recorded")))
}
