//! `cellcc start-sync`: create one sync (or delete) job per destination.

use cellcc_config::ConfigSource;
use jobdb::{JobDb, JobState};
use volops::hooks::{self, FilterDecision, FilterOperation, FilterRequest};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    #[error("No destination cells configured for source cell {src_cell}")]
    NoDstCells { src_cell: String },

    #[error("Volume filter hook failed: {0}")]
    Filter(#[source] hooks::HookError),
}

pub async fn run(
    source: ConfigSource,
    queue: String,
    delete: bool,
    src_cell: String,
    volname: String,
) -> Result<(), Error> {
    let config = source.load().map_err(Error::Config)?;
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    let dst_cells = config
        .dst_cells(&src_cell)
        .filter(|cells| !cells.is_empty())
        .ok_or_else(|| Error::NoDstCells {
            src_cell: src_cell.clone(),
        })?
        .to_vec();

    let operation = if delete {
        FilterOperation::Delete
    } else {
        FilterOperation::Sync
    };
    let state = if delete {
        JobState::DeleteNew
    } else {
        JobState::New
    };

    for dst_cell in dst_cells {
        // Each destination is filtered independently; an excluded
        // destination is an answer, not an error.
        if let Some(filter_command) = &config.pick.filter_command {
            let request = FilterRequest {
                volume: &volname,
                src_cell: &src_cell,
                dst_cell: &dst_cell,
                qname: &queue,
                operation,
            };
            let decision = hooks::run_volume_filter(filter_command, &request)
                .await
                .map_err(Error::Filter)?;
            if decision == FilterDecision::Exclude {
                println!("skipped {volname} -> {dst_cell} (excluded by filter)");
                continue;
            }
        }

        let jobid = db
            .create_job(&src_cell, &dst_cell, &volname, &queue, state)
            .await
            .map_err(Error::JobDb)?;
        println!("created job {jobid}: {volname} -> {dst_cell} (queue {queue})");
    }

    Ok(())
}
