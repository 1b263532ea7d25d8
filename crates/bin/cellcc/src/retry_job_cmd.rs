//! `cellcc retry-job`: operator-driven recovery of a failed job.

use cellcc_config::ConfigSource;
use jobdb::{JobDb, JobId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),
}

pub async fn run(source: ConfigSource, jobid: JobId) -> Result<(), Error> {
    let config = source.load().map_err(Error::Config)?;
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    let retry_state = db.job_reset(jobid).await.map_err(Error::JobDb)?;
    println!("job {jobid} reset to {retry_state}");
    Ok(())
}
