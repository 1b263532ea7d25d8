//! `cellcc jobs`: the operator's view of the live job table.

use cellcc_config::ConfigSource;
use jobdb::{JobDb, JobFilter, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table.
    Txt,
    /// Machine-readable JSON array.
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Txt => f.write_str("txt"),
            Self::Json => f.write_str("json"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    #[error("Failed to encode jobs as JSON: {0}")]
    Encode(#[source] serde_json::Error),
}

pub async fn run(source: ConfigSource, format: OutputFormat, errors_only: bool) -> Result<(), Error> {
    let config = source.load().map_err(Error::Config)?;
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    let filter = JobFilter {
        states: errors_only.then(|| vec![JobState::Error]),
        ..JobFilter::default()
    };
    let jobs = db.describe_jobs(&filter).await.map_err(Error::JobDb)?;

    match format {
        OutputFormat::Json => {
            let rendered = serde_json::to_string_pretty(&jobs).map_err(Error::Encode)?;
            println!("{rendered}");
        }
        OutputFormat::Txt => {
            println!(
                "{:<6} {:<18} {:<24} {:<18} {:<18} {:<10} {:>4} {:>7}  {}",
                "ID", "STATE", "VOLUME", "SRC", "DST", "QUEUE", "ERR", "STALE", "DESCRIPTION"
            );
            for desc in &jobs {
                let job = &desc.job;
                println!(
                    "{:<6} {:<18} {:<24} {:<18} {:<18} {:<10} {:>4} {:>6}s  {}",
                    job.id.to_string(),
                    job.state.to_string(),
                    job.volname,
                    job.src_cell,
                    job.dst_cell,
                    job.qname,
                    job.errors,
                    desc.stale_seconds,
                    job.description,
                );
            }
        }
    }
    Ok(())
}
