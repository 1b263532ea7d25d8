//! `cellcc migrate`: bring the job database schema up to date.

use cellcc_config::ConfigSource;
use jobdb::JobDb;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),
}

pub async fn run(source: ConfigSource) -> Result<(), Error> {
    let config = source.load().map_err(Error::Config)?;

    // Connecting runs migrations and verifies the schema version.
    JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    println!(
        "job database schema is up to date (version {})",
        jobdb::SCHEMA_VERSION
    );
    Ok(())
}
