//! Wrapper around the distributed filesystem's administrative CLI.
//!
//! The pipeline never reads or writes volume data itself; everything goes
//! through a `vos`-like external tool. This crate builds those invocations
//! (with the configured authentication appended), runs the short ones, and
//! hands the long-running ones (dump, restore) back to the caller as
//! prepared commands for the child supervisor.

use std::{collections::BTreeMap, path::Path, process::Stdio};

use cellcc_config::VosConfig;
use chrono::{TimeZone as _, Utc};
use tokio::process::Command;

mod error;
pub mod hooks;
mod parse;
pub mod scratch;

pub use self::{
    error::VosError,
    parse::{Site, SiteList, SiteType, VolumeInfo},
};

/// How the admin CLI authenticates to the cell servers.
#[derive(Debug, Clone)]
enum VosAuth {
    /// `-localauth`: use the server key on this host.
    LocalAuth,
    /// Run under `k5start` with credentials from a keytab.
    Keytab {
        keytab: String,
        principal: Option<String>,
    },
}

/// Handle for invoking the admin CLI.
#[derive(Debug, Clone)]
pub struct VolOps {
    command: String,
    auth: VosAuth,
}

impl VolOps {
    /// Build a handle from validated configuration.
    ///
    /// Assumes [`cellcc_config::Config::validate`] has run, which guarantees
    /// exactly one of `localauth`/`keytab` is set.
    pub fn new(config: &VosConfig) -> Self {
        let auth = match &config.keytab {
            Some(keytab) => VosAuth::Keytab {
                keytab: keytab.clone(),
                principal: config.principal.clone(),
            },
            None => VosAuth::LocalAuth,
        };
        Self {
            command: config.command.clone(),
            auth,
        }
    }

    /// Build an admin CLI invocation with auth flags applied.
    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = match &self.auth {
            VosAuth::LocalAuth => {
                let mut command = Command::new(&self.command);
                command.args(args);
                command.arg("-localauth");
                command
            }
            VosAuth::Keytab { keytab, principal } => {
                let mut command = Command::new("k5start");
                command.args(["-q", "-f", keytab]);
                match principal {
                    Some(principal) => {
                        command.args(["-u", principal]);
                    }
                    None => {
                        command.arg("-U");
                    }
                }
                command.arg("--");
                command.arg(&self.command);
                command.args(args);
                command
            }
        };
        command.kill_on_drop(true);
        command
    }

    /// Run a short admin CLI operation and capture its stdout.
    async fn run<I, S>(&self, args: I) -> Result<String, VosError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut command = self.command(args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = command.output().await.map_err(|source| VosError::Io {
            command: self.command.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(VosError::CommandFailed {
                command: self.command.clone(),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Examine a volume, returning its parsed details.
    pub async fn examine(&self, cell: &str, volname: &str) -> Result<VolumeInfo, VosError> {
        let output = self
            .run(["examine", "-id", volname, "-format", "-cell", cell])
            .await
            .map_err(|err| no_such_volume(err, cell, volname))?;
        parse::parse_examine(&output)
    }

    /// Whether the volume exists in the cell at all.
    pub async fn volume_exists(&self, cell: &str, volname: &str) -> Result<bool, VosError> {
        match self.examine(cell, volname).await {
            Ok(_) => Ok(true),
            Err(VosError::NoSuchVolume { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// List the volume's sites and lock state.
    pub async fn sites(&self, cell: &str, volname: &str) -> Result<SiteList, VosError> {
        let output = self
            .run(["listvldb", "-name", volname, "-cell", cell])
            .await
            .map_err(|err| no_such_volume(err, cell, volname))?;
        parse::parse_sites(&output)
    }

    /// Size of the dump the volume would produce, in bytes.
    ///
    /// `from_time` of 0 sizes a full dump; anything else an incremental one.
    pub async fn dump_size(
        &self,
        cell: &str,
        volname: &str,
        from_time: i64,
    ) -> Result<u64, VosError> {
        let time = format_time(from_time);
        let output = self
            .run([
                "size",
                "-id",
                volname,
                "-dump",
                "-time",
                time.as_str(),
                "-cell",
                cell,
            ])
            .await?;
        parse::parse_dump_size(&output)
    }

    /// Prepared dump invocation, for the child supervisor.
    pub fn dump_command(
        &self,
        cell: &str,
        volname: &str,
        from_time: i64,
        file: &Path,
    ) -> Command {
        let time = format_time(from_time);
        self.command([
            "dump".as_ref(),
            "-id".as_ref(),
            volname.as_ref(),
            "-time".as_ref(),
            time.as_ref(),
            "-file".as_ref(),
            file.as_os_str(),
            "-cell".as_ref(),
            cell.as_ref(),
        ])
    }

    /// Prepared restore invocation, for the child supervisor.
    pub fn restore_command(
        &self,
        cell: &str,
        server: &str,
        partition: &str,
        volname: &str,
        file: &Path,
        incremental: bool,
    ) -> Command {
        let overwrite = if incremental { "incremental" } else { "full" };
        self.command([
            "restore".as_ref(),
            "-server".as_ref(),
            server.as_ref(),
            "-partition".as_ref(),
            partition.as_ref(),
            "-name".as_ref(),
            volname.as_ref(),
            "-file".as_ref(),
            file.as_os_str(),
            "-overwrite".as_ref(),
            overwrite.as_ref(),
            "-cell".as_ref(),
            cell.as_ref(),
        ])
    }

    /// Prepared release invocation with per-queue flags appended.
    ///
    /// A flag with an empty value is passed bare; otherwise the value
    /// follows the flag as its argument.
    pub fn release_command(
        &self,
        cell: &str,
        volname: &str,
        flags: &BTreeMap<String, String>,
    ) -> Command {
        let mut args: Vec<String> = vec![
            "release".to_string(),
            "-id".to_string(),
            volname.to_string(),
            "-cell".to_string(),
            cell.to_string(),
        ];
        for (flag, value) in flags {
            args.push(flag.clone());
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        self.command(args)
    }

    /// Create an RW volume with a minimal quota.
    pub async fn create(
        &self,
        cell: &str,
        server: &str,
        partition: &str,
        volname: &str,
    ) -> Result<(), VosError> {
        self.run([
            "create", "-server", server, "-partition", partition, "-name", volname, "-maxquota",
            "1", "-cell", cell,
        ])
        .await?;
        Ok(())
    }

    /// Add a read-only replica site.
    pub async fn addsite(
        &self,
        cell: &str,
        server: &str,
        partition: &str,
        volname: &str,
    ) -> Result<(), VosError> {
        self.run([
            "addsite", "-server", server, "-partition", partition, "-id", volname, "-cell", cell,
        ])
        .await?;
        Ok(())
    }

    /// Take a volume offline.
    pub async fn offline(
        &self,
        cell: &str,
        server: &str,
        partition: &str,
        volname: &str,
    ) -> Result<(), VosError> {
        self.run([
            "offline", "-server", server, "-partition", partition, "-id", volname, "-cell", cell,
        ])
        .await?;
        Ok(())
    }

    /// Remove one copy of a volume.
    ///
    /// `volname` may carry a `.readonly`/`.backup` suffix to name a clone.
    pub async fn remove(
        &self,
        cell: &str,
        server: &str,
        partition: &str,
        volname: &str,
    ) -> Result<(), VosError> {
        self.run([
            "remove", "-server", server, "-partition", partition, "-id", volname, "-cell", cell,
        ])
        .await?;
        Ok(())
    }
}

/// Map a "no such entry" failure to [`VosError::NoSuchVolume`].
fn no_such_volume(err: VosError, cell: &str, volname: &str) -> VosError {
    match err {
        VosError::CommandFailed { ref stderr, .. }
            if stderr.contains("no such entry") || stderr.contains("does not exist") =>
        {
            VosError::NoSuchVolume {
                volname: volname.to_string(),
                cell: cell.to_string(),
            }
        }
        other => other,
    }
}

/// Render an epoch baseline the way the admin CLI's `-time` flag wants it.
///
/// 0 stays `0` (full dump); anything else becomes a UTC `mm/dd/yyyy hh:mm`
/// stamp.
fn format_time(from_time: i64) -> String {
    if from_time == 0 {
        return "0".to_string();
    }
    match Utc.timestamp_opt(from_time, 0) {
        chrono::LocalResult::Single(when) => when.format("%m/%d/%Y %H:%M").to_string(),
        _ => "0".to_string(),
    }
}
