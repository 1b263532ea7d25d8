//! Site-local hook commands.
//!
//! Two decisions are delegated to operator-supplied shell commands: whether
//! a volume is synchronized at all (the volume filter), and where a newly
//! created volume's sites go (the site picker). Both speak a line-oriented
//! stdout protocol where blank lines and `#` comments are ignored, and both
//! receive their inputs through environment variables.

use std::process::Stdio;

use tokio::process::Command;

/// The volume filter's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Include,
    Exclude,
}

/// Operation the filter is consulted about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperation {
    Sync,
    Delete,
}

impl FilterOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Delete => "delete",
        }
    }
}

/// Inputs passed to the volume filter through its environment.
#[derive(Debug, Clone)]
pub struct FilterRequest<'a> {
    pub volume: &'a str,
    pub src_cell: &'a str,
    pub dst_cell: &'a str,
    pub qname: &'a str,
    pub operation: FilterOperation,
}

/// A `server partition` pair emitted by the site picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitePair {
    pub server: String,
    pub partition: String,
}

/// Errors from running or interpreting a hook command.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to run hook command {command:?}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Hook command {command:?} exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The hook printed something outside its protocol.
    #[error("Unexpected hook output: {reason}")]
    BadOutput { reason: String },
}

/// Run the volume filter hook.
///
/// The command must emit exactly one non-comment, non-blank line containing
/// `include` or `exclude`; anything else is fatal.
pub async fn run_volume_filter(
    command: &str,
    request: &FilterRequest<'_>,
) -> Result<FilterDecision, HookError> {
    let output = run_hook(command, |cmd| {
        cmd.env("CELLCC_FILTER_VOLUME", request.volume)
            .env("CELLCC_FILTER_SRC_CELL", request.src_cell)
            .env("CELLCC_FILTER_DST_CELL", request.dst_cell)
            .env("CELLCC_FILTER_QNAME", request.qname)
            .env("CELLCC_FILTER_OPERATION", request.operation.as_str());
    })
    .await?;
    parse_filter_output(&output)
}

/// Parse the volume filter's stdout.
pub fn parse_filter_output(output: &str) -> Result<FilterDecision, HookError> {
    let mut decision = None;
    for line in protocol_lines(output) {
        let parsed = match line {
            "include" => FilterDecision::Include,
            "exclude" => FilterDecision::Exclude,
            other => {
                return Err(HookError::BadOutput {
                    reason: format!("filter printed {other:?}, expected include or exclude"),
                })
            }
        };
        if decision.is_some() {
            return Err(HookError::BadOutput {
                reason: "filter printed more than one decision".to_string(),
            });
        }
        decision = Some(parsed);
    }
    decision.ok_or_else(|| HookError::BadOutput {
        reason: "filter printed no decision".to_string(),
    })
}

/// Run the site picker hook.
///
/// Returns one [`SitePair`] per output line. The first pair is the RW site
/// (and also serves as a replica site); there must be at least one.
pub async fn run_site_picker(
    command: &str,
    volume: &str,
    src_cell: &str,
    dst_cell: &str,
) -> Result<Vec<SitePair>, HookError> {
    let output = run_hook(command, |cmd| {
        cmd.env("CELLCC_PS_VOLUME", volume)
            .env("CELLCC_PS_SRC_CELL", src_cell)
            .env("CELLCC_PS_DST_CELL", dst_cell)
            .env("CELLCC_PS_CELL", dst_cell);
    })
    .await?;
    parse_sites_output(&output)
}

/// Parse the site picker's stdout.
pub fn parse_sites_output(output: &str) -> Result<Vec<SitePair>, HookError> {
    let mut sites = Vec::new();
    for line in protocol_lines(output) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [server, partition] = tokens.as_slice() else {
            return Err(HookError::BadOutput {
                reason: format!("site picker printed {line:?}, expected \"server partition\""),
            });
        };
        sites.push(SitePair {
            server: server.to_string(),
            partition: partition.to_string(),
        });
    }
    if sites.is_empty() {
        return Err(HookError::BadOutput {
            reason: "site picker printed no sites".to_string(),
        });
    }
    Ok(sites)
}

/// Non-blank, non-comment lines of a hook's stdout.
fn protocol_lines(output: &str) -> impl Iterator<Item = &str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

async fn run_hook<F>(command: &str, configure: F) -> Result<String, HookError>
where
    F: FnOnce(&mut Command),
{
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    configure(&mut cmd);

    let output = cmd.output().await.map_err(|source| HookError::Io {
        command: command.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(HookError::CommandFailed {
            command: command.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
