//! The restore stage: materialize the volume from the fetched dump.

use std::{sync::Arc, time::Instant};

use jobdb::{Job, JobPatch, JobState, UpdateCtx};
use supervisor::{run_command, ChildError, IntervalSchedule};
use tokio::sync::Mutex;
use volops::hooks;

use super::{QueueWorker, StageFailure};

impl QueueWorker {
    pub(crate) async fn run_restore_job(&self, job: Job) {
        let mut ctx = job.update_ctx();
        if !self
            .claim(
                &job,
                &mut ctx,
                JobState::RestoreStart,
                JobState::RestoreWork,
                "starting restore",
            )
            .await
        {
            return;
        }
        let ctx = Arc::new(Mutex::new(ctx));
        let result = self.restore_job(&job, &ctx).await;
        self.conclude(&job, &ctx, JobState::RestoreWork, result).await;
    }

    async fn restore_job(
        &self,
        job: &Job,
        ctx: &Arc<Mutex<UpdateCtx>>,
    ) -> Result<(), StageFailure> {
        let restore_filename = job
            .restore_filename
            .as_ref()
            .ok_or_else(|| StageFailure::Fatal("job has no restore_filename recorded".to_string()))?
            .clone();
        let local_path = self.config.restore.scratch_dir.join(&restore_filename);

        // A volume that does not exist yet gets created where the site
        // picker says, then restored into.
        let exists = self
            .volops
            .volume_exists(&self.dst_cell, &job.volname)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to probe volume: {err}")))?;
        if !exists {
            self.create_volume(job).await?;
        }

        let sites = self
            .volops
            .sites(&self.dst_cell, &job.volname)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to list volume sites: {err}")))?;
        let rw_site = sites
            .rw_site()
            .ok_or_else(|| {
                StageFailure::Fatal(format!("volume {} has no RW site", job.volname))
            })?
            .clone();

        // Incremental restores apply on top of the destination's data; the
        // baseline travels with the job.
        let incremental = job.vol_lastupdate > 0;
        let command = self.volops.restore_command(
            &self.dst_cell,
            &rw_site.server,
            &rw_site.partition,
            &job.volname,
            &local_path,
            incremental,
        );
        tokio::fs::create_dir_all(&self.config.restore.scratch_dir)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to create scratch dir: {err}")))?;
        let stderr_path = self.capture_path(job, "restore.stderr");

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
                        format!("restoring ({}s elapsed)", started.elapsed().as_secs());
                    worker
                        .refresh_progress(&ctx, JobState::RestoreWork, description, next_interval)
                        .await
                }
            },
        )
        .await;
        let _ = tokio::fs::remove_file(&stderr_path).await;

        match result {
            Ok(()) => {}
            Err(ChildError::Aborted { .. }) => return Err(StageFailure::Lost),
            Err(err) => return Err(StageFailure::Fatal(format!("restore failed: {err}"))),
        }

        // The blob has served its purpose.
        if let Err(err) = tokio::fs::remove_file(&local_path).await {
            tracing::warn!(
                job_id = %job.id,
                path = %local_path.display(),
                error = %err,
                "failed to remove restored dump blob"
            );
        }

        let patch = JobPatch {
            state: Some(JobState::RestoreDone),
            restore_filename: Some(None),
            description: Some("restore complete; waiting for release".to_string()),
            ..JobPatch::default()
        };
        self.publish(ctx, JobState::RestoreWork, patch).await?;
        tracing::info!(job_id = %job.id, volname = %job.volname, incremental, "restore complete");
        Ok(())
    }

    /// Create the volume at the sites the site-picker hook chooses.
    ///
    /// The first picked site holds the RW volume and doubles as a replica
    /// site; every picked site gets a read-only replica. The volume is
    /// taken offline so nothing reads it before the restore lands.
    async fn create_volume(&self, job: &Job) -> Result<(), StageFailure> {
        let sites_command = self
            .config
            .pick
            .sites_command
            .as_ref()
            .ok_or_else(|| {
                StageFailure::Fatal(format!(
                    "volume {} does not exist and no pick/sites-command is configured",
                    job.volname
                ))
            })?;

        let picked =
            hooks::run_site_picker(sites_command, &job.volname, &job.src_cell, &self.dst_cell)
                .await
                .map_err(|err| StageFailure::Fatal(format!("site picker failed: {err}")))?;
        let rw = &picked[0];

        tracing::info!(
            job_id = %job.id,
            volname = %job.volname,
            server = %rw.server,
            partition = %rw.partition,
            replicas = picked.len(),
            "creating volume at picked sites"
        );

        self.volops
            .create(&self.dst_cell, &rw.server, &rw.partition, &job.volname)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to create volume: {err}")))?;
        for site in &picked {
            self.volops
                .addsite(&self.dst_cell, &site.server, &site.partition, &job.volname)
                .await
                .map_err(|err| StageFailure::Fatal(format!("failed to add replica site: {err}")))?;
        }
        self.volops
            .offline(&self.dst_cell, &rw.server, &rw.partition, &job.volname)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to offline volume: {err}")))?;
        Ok(())
    }
}
