use std::path::PathBuf;

use cellcc_config::{ConfigOverride, ConfigSource};

mod config_cmd;
mod jobs_cmd;
mod migrate_cmd;
mod remctl_cmd;
mod retry_job_cmd;
mod start_sync_cmd;

#[derive(Debug, clap::Parser)]
#[command(name = "cellcc", version, about = "Synchronize volumes between cells")]
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
    /// Request a sync of one volume to every configured destination cell
    StartSync {
        /// Queue the jobs are routed through on the restore side.
        #[arg(long, default_value = cellcc_config::DEFAULT_QUEUE)]
        queue: String,
        /// Delete the volume from the destinations instead of syncing it.
        #[arg(long)]
        delete: bool,
        /// Cell the volume lives in.
        src_cell: String,
        /// Volume to synchronize.
        volname: String,
    },
    /// Run the source-side dump server
    DumpServer {
        /// Scan once, finish the claimed jobs, and exit.
        #[arg(long)]
        once: bool,
        /// FQDN restore hosts fetch dump blobs from (this host).
        server: String,
        /// Cell whose volumes this server dumps.
        src_cell: String,
        /// Destination cells served; defaults from configuration.
        dst_cells: Vec<String>,
    },
    /// Run the destination-side restore server
    RestoreServer {
        /// Run every queue's tick once and exit.
        #[arg(long)]
        once: bool,
        /// Cell this server restores volumes into.
        dst_cell: String,
    },
    /// Run the check/alert server
    CheckServer {
        /// Run one policy sweep and exit.
        #[arg(long)]
        once: bool,
    },
    /// Show the live jobs
    Jobs {
        /// Output format.
        #[arg(long, value_enum, default_value_t = jobs_cmd::OutputFormat::Txt)]
        format: jobs_cmd::OutputFormat,
        /// Show only jobs in the ERROR state.
        #[arg(long)]
        errors: bool,
    },
    /// Inspect or validate the configuration
    Config {
        /// Validate the configuration and exit.
        #[arg(long)]
        check: bool,
        /// Print the resolved configuration as JSON.
        #[arg(long)]
        dump: bool,
        /// Print the resolved configuration including defaulted directives.
        #[arg(long)]
        dump_all: bool,
        /// Print a single directive by /-separated path.
        key: Option<String>,
    },
    /// Reset a failed job so it retries its last good stage
    RetryJob {
        /// ID of the job to reset.
        jobid: jobdb::JobId,
    },
    /// Run job database migrations
    Migrate,
    /// Server-side remote-command handlers (invoked by the transport daemon)
    #[command(subcommand)]
    Remctl(remctl_cmd::RemctlCommand),
}

#[tokio::main]
async fn main() {
    logging::init();

    if let Err(err) = main_inner().await {
        // Manually print the error so we can control the format.
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

    match command {
        Command::StartSync {
            queue,
            delete,
            src_cell,
            volname,
        } => start_sync_cmd::run(source, queue, delete, src_cell, volname)
            .await
            .map_err(Error::StartSync),
        Command::DumpServer {
            once,
            server,
            src_cell,
            dst_cells,
        } => {
            let args = dump_server::DumpServerArgs {
                dump_host: server,
                src_cell,
                dst_cells,
            };
            dump_server::run(source, args, once)
                .await
                .map_err(Error::DumpServer)
        }
        Command::RestoreServer { once, dst_cell } => {
            let args = restore_server::RestoreServerArgs { dst_cell };
            restore_server::run(source, args, once)
                .await
                .map_err(Error::RestoreServer)
        }
        Command::CheckServer { once } => check_server::run(source, once)
            .await
            .map_err(Error::CheckServer),
        Command::Jobs { format, errors } => jobs_cmd::run(source, format, errors)
            .await
            .map_err(Error::Jobs),
        Command::Config {
            check,
            dump,
            dump_all,
            key,
        } => config_cmd::run(source, check, dump, dump_all, key).map_err(Error::ConfigCmd),
        Command::RetryJob { jobid } => retry_job_cmd::run(source, jobid)
            .await
            .map_err(Error::RetryJob),
        Command::Migrate => migrate_cmd::run(source).await.map_err(Error::Migrate),
        Command::Remctl(subcommand) => remctl_cmd::run(source, subcommand)
            .await
            .map_err(Error::Remctl),
    }
}

/// Top-level error type for the `cellcc` binary.
///
/// Each variant wraps a command-specific error, providing a unified error
/// type for the main entry point while preserving the full error chain.
#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("Invalid configuration: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error("start-sync failed: {0}")]
    StartSync(#[source] start_sync_cmd::Error),

    #[error("dump-server failed: {0}")]
    DumpServer(#[source] dump_server::Error),

    #[error("restore-server failed: {0}")]
    RestoreServer(#[source] restore_server::Error),

    #[error("check-server failed: {0}")]
    CheckServer(#[source] check_server::Error),

    #[error("jobs failed: {0}")]
    Jobs(#[source] jobs_cmd::Error),

    #[error("config failed: {0}")]
    ConfigCmd(#[source] config_cmd::Error),

    #[error("retry-job failed: {0}")]
    RetryJob(#[source] retry_job_cmd::Error),

    #[error("migrate failed: {0}")]
    Migrate(#[source] migrate_cmd::Error),

    #[error("remctl handler failed: {0}")]
    Remctl(#[source] remctl_cmd::Error),
}
