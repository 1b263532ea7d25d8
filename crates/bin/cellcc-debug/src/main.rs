//! Debugging and break-glass tooling that does not belong in the operator
//! CLI proper.

use std::path::PathBuf;

use cellcc_config::{ConfigOverride, ConfigSource};
use check_server::alerts::{self, Alert, AlertKind};
use jobdb::{JobDb, JobId};
use remctl::RemctlClient;

#[derive(Debug, clap::Parser)]
#[command(name = "cellcc-debug", version, about = "CellCC debugging tools")]
struct Args {
    /// The configuration file to use.
    #[arg(long, env = "CELLCC_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Override a config directive (KEY=VAL; use json:KEY=VAL for
    /// JSON-typed values).
    #[arg(short = 'x', value_name = "KEY=VAL", global = true)]
    set: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Subcommand)]
enum Command {
    /// Delete a job row outright, whatever state it is in
    KillJob {
        /// ID of the job to delete.
        jobid: JobId,
    },
    /// Send synthetic alerts through the configured alert channels
    TestAlert,
    /// Health-check the remote-command transport to a host
    PingRemctl {
        /// Host to ping.
        host: String,
    },
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = main_inner().await {
        eprintln!("Exiting with error: {}", logging::error_with_causes(&err));
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    let Args {
        config,
        set,
        command,
    } = clap::Parser::parse();

    let overrides = set
        .iter()
        .map(|arg| ConfigOverride::parse(arg))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::Config)?;
    let source = ConfigSource::new(config, overrides);
    let config = source.load().map_err(Error::Config)?;

    match command {
        Command::KillJob { jobid } => {
            let db = JobDb::connect(config.db_url(), config.db.pool_size)
                .await
                .map_err(Error::JobDb)?;
            if db.kill_job(jobid).await.map_err(Error::JobDb)? {
                println!("job {jobid} deleted");
                Ok(())
            } else {
                Err(Error::NoSuchJob { jobid })
            }
        }
        Command::TestAlert => {
            let alerts: Vec<Alert> = jobdb::describe_dummy_jobs(2)
                .iter()
                .map(|desc| {
                    Alert::new(
                        AlertKind::Stale,
                        &desc.job,
                        "test alert; this is not a real problem",
                    )
                })
                .collect();
            alerts::dispatch(&config.alerts, &alerts).await;
            println!("dispatched {} test alerts", alerts.len());
            Ok(())
        }
        Command::PingRemctl { host } => {
            let client = RemctlClient::new(&config.remctl);
            client.ping(&host).await.map_err(Error::Ping)?;
            println!("{host}: remote-command transport is healthy");
            Ok(())
        }
    }
}

/// Top-level error type for the `cellcc-debug` binary.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("Job database error: {0}")]
    JobDb(#[source] jobdb::Error),

    #[error("No such job: {jobid}")]
    NoSuchJob { jobid: JobId },

    #[error("Transport ping failed: {0}")]
    Ping(#[source] remctl::RemctlError),
}
