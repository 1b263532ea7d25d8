//! The destination-side daemon shell.
//!
//! One restore-server process runs per destination cell. The process runs
//! one cooperative task per configured queue (a synthetic `default` queue
//! always exists); each queue task ticks through the transfer, restore,
//! release, and delete stages in order with its own bounded worker pool.
//! Config reloads fan out to every queue task through a watch channel, and
//! shutdown drains every queue before the process exits.

use std::{sync::Arc, time::Duration};

use cellcc_config::{Config, ConfigSource};
use jobdb::{JobDb, JobFilter};
use remctl::RemctlClient;
use supervisor::{signals, WorkerPool};
use tokio::{sync::watch, task::JoinSet};
use volops::VolOps;

use crate::stages::{QueueWorker, RestoreStage, PICKUP_TIMEOUT};

/// Command-line identity of one restore-server process.
#[derive(Debug, Clone)]
pub struct RestoreServerArgs {
    /// Cell this server restores volumes into.
    pub dst_cell: String,
}

/// Errors that can occur while running the restore-server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Run the restore-server.
///
/// With `once` set, runs a single tick of every queue in sequence and
/// returns the first failure; otherwise runs the per-queue loops until
/// interrupted.
pub async fn run(source: ConfigSource, args: RestoreServerArgs, once: bool) -> Result<(), Error> {
    let config = Arc::new(source.load().map_err(Error::Config)?);
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    let queues = config.queue_names();
    tracing::info!(dst_cell = %args.dst_cell, ?queues, "restore-server starting");

    if once {
        for qname in &queues {
            queue_tick(&db, &config, &args.dst_cell, qname).await?;
        }
        return Ok(());
    }

    let (config_tx, config_rx) = watch::channel(Arc::clone(&config));
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut queue_tasks = JoinSet::new();
    for qname in queues {
        let db = db.clone();
        let dst_cell = args.dst_cell.clone();
        let config_rx = config_rx.clone();
        let stop_rx = stop_rx.clone();
        queue_tasks.spawn(queue_loop(db, config_rx, stop_rx, dst_cell, qname));
    }

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let mut reload = signals::reload_signal().map_err(Error::Signal)?;

    loop {
        tokio::select! {
            _ = reload.recv() => {
                match source.load() {
                    Ok(new_config) => {
                        tracing::info!("configuration reloaded; notifying queue workers");
                        let _ = config_tx.send(Arc::new(new_config));
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
                tracing::info!("restore-server shutting down; draining queues");
                let _ = stop_tx.send(true);
                while queue_tasks.join_next().await.is_some() {}
                return Ok(());
            }
        }
    }
}

/// One queue's daemon loop: tick, sleep, repeat, until told to stop.
async fn queue_loop(
    db: JobDb,
    config_rx: watch::Receiver<Arc<Config>>,
    mut stop_rx: watch::Receiver<bool>,
    dst_cell: String,
    qname: String,
) {
    loop {
        let config = config_rx.borrow().clone();
        let interval = Duration::from_secs(config.restore.interval);

        if let Err(err) = queue_tick(&db, &config, &dst_cell, &qname).await {
            tracing::error!(
                queue = %qname,
                error = %err, error_source = logging::error_source(&err),
                "restore queue tick failed"
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    tracing::info!(queue = %qname, "queue worker stopping");
                    return;
                }
            }
        }
    }
}

/// One tick of one queue: each stage in order, fully drained before the
/// next stage runs.
async fn queue_tick(
    db: &JobDb,
    config: &Arc<Config>,
    dst_cell: &str,
    qname: &str,
) -> Result<(), Error> {
    let worker = QueueWorker {
        db: db.clone(),
        volops: VolOps::new(&config.vos),
        remctl: RemctlClient::new(&config.remctl),
        config: Arc::clone(config),
        dst_cell: dst_cell.to_string(),
        qname: qname.to_string(),
    };
    let filter = JobFilter {
        dst_cells: Some(vec![dst_cell.to_string()]),
        qname: Some(qname.to_string()),
        ..JobFilter::default()
    };
    let max_parallel = config.queue(qname).max_parallel;

    for stage in RestoreStage::ALL {
        let (from, to) = stage.pickup();
        let jobs = db
            .find_and_advance(from, to, &filter, Some(PICKUP_TIMEOUT), stage.pickup_description())
            .await
            .map_err(Error::JobDb)?;
        if jobs.is_empty() {
            continue;
        }
        tracing::debug!(queue = %qname, ?stage, count = jobs.len(), "dispatching jobs");

        let mut pool = WorkerPool::new(max_parallel);
        for job in jobs {
            let worker = worker.clone();
            pool.spawn(async move { worker.run_stage(stage, job).await })
                .await;
        }
        pool.join_all().await;
    }
    Ok(())
}
