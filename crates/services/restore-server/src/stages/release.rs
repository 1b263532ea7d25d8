//! The release stage: publish the restored RW data to the RO replicas.

use std::{sync::Arc, time::Instant};

use jobdb::{Job, JobPatch, JobState, UpdateCtx};
use supervisor::{run_command, ChildError, IntervalSchedule};
use tokio::sync::Mutex;

use super::{QueueWorker, StageFailure};

impl QueueWorker {
    pub(crate) async fn run_release_job(&self, job: Job) {
        let mut ctx = job.update_ctx();
        if !self
            .claim(
                &job,
                &mut ctx,
                JobState::ReleaseStart,
                JobState::ReleaseWork,
                "starting release",
            )
            .await
        {
            return;
        }
        let ctx = Arc::new(Mutex::new(ctx));
        let result = self.release_job(&job, &ctx).await;
        self.conclude(&job, &ctx, JobState::ReleaseWork, result).await;
    }

    async fn release_job(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
    ) -> Result<(), StageFailure> {
        let flags = self.config.queue(&job.qname).release.flags;
        let command = self
            .volops
            .release_command(&self.dst_cell, &job.volname, &flags);
        tokio::fs::create_dir_all(&self.config.restore.scratch_dir)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to create scratch dir: {err}")))?;
        let stderr_path = self.capture_path(job, "release.stderr");

        let worker = self.clone();
        let progress_ctx = Arc::clone(ctx);
        let started = Instant::now();
        let result = run_command(
            command,
            None,
            &stderr_path,
            &IntervalSchedule::default(),
            move |next_interval| {
                let worker = worker.clone();
                let ctx = Arc::clone(&progress_ctx);
                async move {
                    let description =
                        format!("releasing ({}s elapsed)", started.elapsed().as_secs());
                    worker
                        .refresh_progress(&ctx, JobState::ReleaseWork, description, next_interval)
                        .await
                }
            },
        )
        .await;
        let _ = tokio::fs::remove_file(&stderr_path).await;

        match result {
            Ok(()) => {}
            Err(ChildError::Aborted { .. }) => return Err(StageFailure::Lost),
            Err(err) => return Err(StageFailure::Fatal(format!("release failed: {err}"))),
        }

        // A release that leaves stale replicas or a locked VLDB entry did
        // not actually publish anything; surface it as a failure so the
        // check-server can retry the release.
        let sites = self
            .volops
            .sites(&self.dst_cell, &job.volname)
            .await
            .map_err(|err| {
                StageFailure::Fatal(format!("failed to verify release: {err}"))
            })?;
        if sites.locked {
            return Err(StageFailure::Fatal(format!(
                "volume {} is locked after release",
                job.volname
            )));
        }
        if let Some(stale) = sites.sites.iter().find(|site| site.is_stale()) {
            return Err(StageFailure::Fatal(format!(
                "replica at {} {} is stale after release",
                stale.server, stale.partition
            )));
        }

        let patch = JobPatch {
            state: Some(JobState::ReleaseDone),
            description: Some("release complete".to_string()),
            ..JobPatch::default()
        };
        self.publish(ctx, JobState::ReleaseWork, patch).await?;
        tracing::info!(job_id = %job.id, volname = %job.volname, "release complete");
        Ok(())
    }
}
