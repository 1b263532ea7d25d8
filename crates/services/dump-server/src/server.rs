//! The source-side daemon shell.
//!
//! One dump-server process runs per source host. Each tick claims the `NEW`
//! jobs for its `(source cell, destination cells)` routing and dispatches a
//! dump worker per job through a bounded pool. The tick owns its jobs to
//! completion, so shutdown between ticks never strands a child process.

use std::{sync::Arc, time::Duration};

use cellcc_config::{Config, ConfigSource};
use jobdb::{JobDb, JobFilter, JobState};
use supervisor::{signals, WorkerPool};
use volops::VolOps;

use crate::stage::{DumpWorker, PICKUP_TIMEOUT};

/// Command-line identity of one dump-server process.
#[derive(Debug, Clone)]
pub struct DumpServerArgs {
    /// FQDN restore hosts will fetch dump blobs from.
    pub dump_host: String,
    /// Cell whose volumes this server dumps.
    pub src_cell: String,
    /// Destination cells served; empty means "from configuration".
    pub dst_cells: Vec<String>,
}

/// Errors that can occur while running the dump-server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    /// No destination cells on the command line and none configured for
    /// the source cell.
    #[error("No destination cells configured for source cell {src_cell}")]
    NoDstCells { src_cell: String },

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Run the dump-server.
///
/// With `once` set, performs a single scan-and-dump tick and returns its
/// result; otherwise loops until interrupted, logging tick failures and
/// reloading configuration on SIGHUP.
pub async fn run(source: ConfigSource, args: DumpServerArgs, once: bool) -> Result<(), Error> {
    let config = Arc::new(source.load().map_err(Error::Config)?);
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    let dst_cells = resolve_dst_cells(&config, &args)?;
    tracing::info!(
        src_cell = %args.src_cell,
        ?dst_cells,
        host = %args.dump_host,
        "dump-server starting"
    );

    if once {
        return tick(&db, &config, &args, &dst_cells).await;
    }

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let mut reload = signals::reload_signal().map_err(Error::Signal)?;

    let mut config = config;
    let mut interval = tokio::time::interval(Duration::from_secs(config.dump.interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = tick(&db, &config, &args, &dst_cells).await {
                    tracing::error!(
                        error = %err, error_source = logging::error_source(&err),
                        "dump-server tick failed"
                    );
                }
            }
            _ = reload.recv() => {
                match source.load() {
                    Ok(new_config) => {
                        tracing::info!("configuration reloaded");
                        config = Arc::new(new_config);
                        interval = tokio::time::interval(Duration::from_secs(config.dump.interval));
                        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    }
                    Err(err) => {
                        tracing::error!(
                            error = %err, error_source = logging::error_source(&err),
                            "config reload failed; keeping previous configuration"
                        );
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("dump-server shutting down");
                return Ok(());
            }
        }
    }
}

/// One scan: claim `NEW` jobs, dump each, wait for every worker to finish.
async fn tick(
    db: &JobDb,
    config: &Arc<Config>,
    args: &DumpServerArgs,
    dst_cells: &[String],
) -> Result<(), Error> {
    let filter = JobFilter {
        src_cell: Some(args.src_cell.clone()),
        dst_cells: Some(dst_cells.to_vec()),
        ..JobFilter::default()
    };
    let jobs = db
        .find_and_advance(
            JobState::New,
            JobState::DumpStart,
            &filter,
            Some(PICKUP_TIMEOUT),
            "waiting for dump worker",
        )
        .await
        .map_err(Error::JobDb)?;

    if jobs.is_empty() {
        return Ok(());
    }
    tracing::debug!(count = jobs.len(), "dispatching dump jobs");

    let mut pool = WorkerPool::new(config.dump.max_parallel);
    for job in jobs {
        let worker = DumpWorker {
            db: db.clone(),
            volops: VolOps::new(&config.vos),
            config: Arc::clone(config),
            dump_host: args.dump_host.clone(),
        };
        pool.spawn(async move { worker.run_job(job).await }).await;
    }
    pool.join_all().await;
    Ok(())
}

fn resolve_dst_cells(config: &Config, args: &DumpServerArgs) -> Result<Vec<String>, Error> {
    if !args.dst_cells.is_empty() {
        return Ok(args.dst_cells.clone());
    }
    match config.dst_cells(&args.src_cell) {
        Some(cells) if !cells.is_empty() => Ok(cells.to_vec()),
        _ => Err(Error::NoDstCells {
            src_cell: args.src_cell.clone(),
        }),
    }
}
