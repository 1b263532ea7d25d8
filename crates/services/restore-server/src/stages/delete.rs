//! The delete stage: remove every copy of a volume from the destination.

use std::sync::Arc;

use jobdb::{Job, JobPatch, JobState, UpdateCtx};
use supervisor::{supervise, IntervalSchedule};
use tokio::sync::Mutex;
use volops::VosError;

use super::{QueueWorker, StageFailure};

impl QueueWorker {
    pub(crate) async fn run_delete_job(&self, job: Job) {
        let mut ctx = job.update_ctx();
        if !self
            .claim(
                &job,
                &mut ctx,
                JobState::DeleteDestStart,
                JobState::DeleteDestWork,
                "starting delete",
            )
            .await
        {
            return;
        }
        let ctx = Arc::new(Mutex::new(ctx));
        let result = self.delete_job(&job, &ctx).await;
        self.conclude(&job, &ctx, JobState::DeleteDestWork, result).await;
    }

    async fn delete_job(&self, job: &Job, ctx: &Arc<Mutex<UpdateCtx>>) -> Result<(), StageFailure> {
        let worker = self.clone();
        let progress_ctx = Arc::clone(ctx);

        // The site removals run under the in-process supervisor so a
        // mid-delete reset still cancels the remaining admin CLI calls.
        let removal = supervise(
            self.remove_all_sites(job),
            &IntervalSchedule::default(),
            move |next_interval| {
                let worker = worker.clone();
                let ctx = Arc::clone(&progress_ctx);
                async move {
                    worker
                        .refresh_progress(
                            &ctx,
                            JobState::DeleteDestWork,
                            "removing volume sites".to_string(),
                            next_interval,
                        )
                        .await
                }
            },
        )
        .await;

        let description = match removal {
            Ok(Ok(removed)) if removed => "volume removed".to_string(),
            Ok(Ok(_)) => "volume already absent".to_string(),
            Ok(Err(failure)) => return Err(failure),
            Err(_aborted) => return Err(StageFailure::Lost),
        };

        let patch = JobPatch {
            state: Some(JobState::DeleteDestDone),
            description: Some(description),
            ..JobPatch::default()
        };
        self.publish(ctx, JobState::DeleteDestWork, patch).await?;
        tracing::info!(job_id = %job.id, volname = %job.volname, "delete complete");
        Ok(())
    }

    /// Remove every copy of the volume, replicas before the authority:
    /// RO sites first, then the backup clone, then the RW volume itself.
    ///
    /// Returns `Ok(false)` when the volume does not exist at all; a missing
    /// volume is an answer, not an error.
    async fn remove_all_sites(&self, job: &Job) -> Result<bool, StageFailure> {
        let volname = &job.volname;

        let sites = match self.volops.sites(&self.dst_cell, volname).await {
            Ok(sites) => sites,
            Err(VosError::NoSuchVolume { .. }) => return Ok(false),
            Err(err) => {
                return Err(StageFailure::Fatal(format!(
                    "failed to list volume sites: {err}"
                )))
            }
        };
        let backup_id = match self.volops.examine(&self.dst_cell, volname).await {
            Ok(info) => info.backup_id,
            Err(VosError::NoSuchVolume { .. }) => None,
            Err(err) => {
                return Err(StageFailure::Fatal(format!(
                    "failed to examine volume: {err}"
                )))
            }
        };

        for site in sites.ro_sites() {
            self.volops
                .remove(
                    &self.dst_cell,
                    &site.server,
                    &site.partition,
                    &format!("{volname}.readonly"),
                )
                .await
                .map_err(|err| {
                    StageFailure::Fatal(format!(
                        "failed to remove RO site {} {}: {err}",
                        site.server, site.partition
                    ))
                })?;
        }

        let Some(rw_site) = sites.rw_site() else {
            // Replicas are gone and there is no RW copy left to remove.
            return Ok(true);
        };

        if backup_id.is_some() {
            self.volops
                .remove(
                    &self.dst_cell,
                    &rw_site.server,
                    &rw_site.partition,
                    &format!("{volname}.backup"),
                )
                .await
                .map_err(|err| {
                    StageFailure::Fatal(format!("failed to remove backup clone: {err}"))
                })?;
        }

        self.volops
            .remove(&self.dst_cell, &rw_site.server, &rw_site.partition, volname)
            .await
            .map_err(|err| StageFailure::Fatal(format!("failed to remove RW volume: {err}")))?;

        Ok(true)
    }
}
