//! The check-server daemon shell.
//!
//! A single process, runnable anywhere that can reach the job database.
//! Each tick runs one policy sweep and dispatches whatever alerts it
//! produced.

use std::{sync::Arc, time::Duration};

use cellcc_config::ConfigSource;
use jobdb::JobDb;
use supervisor::signals;

use crate::{alerts, engine::CheckEngine};

/// Errors that can occur while running the check-server.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    #[error("Check sweep failed: {0}")]
    Sweep(#[source] crate::engine::EngineError),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

/// Run the check-server.
///
/// With `once` set, performs a single sweep-and-dispatch and returns its
/// result; otherwise loops until interrupted, logging sweep failures and
/// reloading configuration on SIGHUP.
pub async fn run(source: ConfigSource, once: bool) -> Result<(), Error> {
    let config = Arc::new(source.load().map_err(Error::Config)?);
    let db = JobDb::connect(config.db_url(), config.db.pool_size)
        .await
        .map_err(Error::JobDb)?;

    tracing::info!(
        error_limit = config.check.error_limit,
        interval = config.check.interval,
        "check-server starting"
    );

    if once {
        return tick(&db, &config).await;
    }

    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    let mut reload = signals::reload_signal().map_err(Error::Signal)?;

    let mut config = config;
    let mut interval = tokio::time::interval(Duration::from_secs(config.check.interval));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = tick(&db, &config).await {
                    tracing::error!(
                        error = %err, error_source = logging::error_source(&err),
                        "check-server tick failed"
                    );
                }
            }
            _ = reload.recv() => {
                match source.load() {
                    Ok(new_config) => {
                        tracing::info!("configuration reloaded");
                        config = Arc::new(new_config);
                        interval = tokio::time::interval(Duration::from_secs(config.check.interval));
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
                tracing::info!("check-server shutting down");
                return Ok(());
            }
        }
    }
}

/// One sweep plus one alert dispatch.
async fn tick(db: &JobDb, config: &Arc<cellcc_config::Config>) -> Result<(), Error> {
    let engine = CheckEngine::new(db.clone(), Arc::clone(config));
    let alerts = engine.sweep().await.map_err(Error::Sweep)?;
    if !alerts.is_empty() {
        tracing::info!(count = alerts.len(), "dispatching alerts");
        alerts::dispatch(&config.alerts, &alerts).await;
    }
    Ok(())
}
