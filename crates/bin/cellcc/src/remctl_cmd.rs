//! `cellcc remctl`: the server-side remote-command handlers.
//!
//! These subcommands are not for operators; the remote-command daemon maps
//! the `cellcc` service's subcommands onto them and exports the
//! authenticated client principal in the environment.

use cellcc_config::ConfigSource;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum RemctlCommand {
    /// Health check; prints a fixed success string.
    Ping,
    /// Stream a dump blob from the scratch directory to stdout.
    GetDump {
        /// Bare blob name (no directory components).
        filename: String,
    },
    /// Unlink a dump blob from the scratch directory.
    RemoveDump {
        /// Bare blob name (no directory components).
        filename: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to load config: {0}")]
    Config(#[source] cellcc_config::ConfigError),

    #[error(transparent)]
    Serve(#[from] remctl::ServeError),
}

pub async fn run(source: ConfigSource, command: RemctlCommand) -> Result<(), Error> {
    match command {
        // ping is deliberately config-free and unauthenticated: it must
        // answer even when this host is half-configured.
        RemctlCommand::Ping => {
            println!("{}", remctl::serve_ping());
            Ok(())
        }
        RemctlCommand::GetDump { filename } => {
            let config = source.load().map_err(Error::Config)?;
            remctl::serve_get_dump(
                &config.dump.scratch_dir,
                config.remctl.principal.as_deref(),
                &filename,
            )
            .await?;
            Ok(())
        }
        RemctlCommand::RemoveDump { filename } => {
            let config = source.load().map_err(Error::Config)?;
            remctl::serve_remove_dump(
                &config.dump.scratch_dir,
                config.remctl.principal.as_deref(),
                &filename,
            )
            .await?;
            Ok(())
        }
    }
}
