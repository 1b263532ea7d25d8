//! Client side of the remote-command transport.

use std::process::Stdio;

use cellcc_config::RemctlConfig;
use tokio::process::Command;

use crate::RemctlError;

/// The remote service name our subcommands are registered under.
const SERVICE: &str = "cellcc";

/// Client handle for the remote-command transport.
#[derive(Debug, Clone)]
pub struct RemctlClient {
    command: String,
    port: u16,
}

impl RemctlClient {
    pub fn new(config: &RemctlConfig) -> Self {
        Self {
            command: config.command.clone(),
            port: config.port,
        }
    }

    /// Build a transport invocation for one subcommand.
    fn command(&self, host: &str, subcommand: &str, args: &[&str]) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg("-p")
            .arg(self.port.to_string())
            .arg(host)
            .arg(SERVICE)
            .arg(subcommand)
            .args(args)
            .kill_on_drop(true);
        command
    }

    /// Health-check the transport to a host.
    pub async fn ping(&self, host: &str) -> Result<(), RemctlError> {
        let output = self.run(host, "ping", &[]).await?;
        let response = output.trim();
        if response == crate::PING_RESPONSE {
            Ok(())
        } else {
            Err(RemctlError::BadPingResponse {
                host: host.to_string(),
                response: response.to_string(),
            })
        }
    }

    /// Prepared `get-dump` invocation streaming the blob to stdout.
    ///
    /// Handed to the child supervisor, which redirects stdout into the
    /// local scratch file and reports transfer progress.
    pub fn get_dump_command(&self, host: &str, filename: &str) -> Command {
        self.command(host, "get-dump", &[filename])
    }

    /// Ask the origin host to unlink a dump blob.
    pub async fn remove_dump(&self, host: &str, filename: &str) -> Result<(), RemctlError> {
        self.run(host, "remove-dump", &[filename]).await?;
        Ok(())
    }

    async fn run(&self, host: &str, subcommand: &str, args: &[&str]) -> Result<String, RemctlError> {
        let mut command = self.command(host, subcommand, args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = command.output().await.map_err(|source| RemctlError::Io {
            command: self.command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(RemctlError::CommandFailed {
                command: self.command.clone(),
                subcommand: subcommand.to_string(),
                host: host.to_string(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocations_carry_port_service_and_subcommand() {
        //* Given
        let client = RemctlClient {
            command: "remctl".to_string(),
            port: 4373,
        };

        //* When
        let command = client.get_dump_command("dump1.example.com", "u.alice.7.dump");

        //* Then
        let std = command.as_std();
        assert_eq!(std.get_program(), "remctl");
        let args: Vec<_> = std
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-p",
                "4373",
                "dump1.example.com",
                "cellcc",
                "get-dump",
                "u.alice.7.dump",
            ]
        );
    }
}
