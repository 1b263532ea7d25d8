//! Error types for admin CLI operations.

/// Errors from invoking or interpreting the `vos`-like admin CLI.
#[derive(Debug, thiserror::Error)]
pub enum VosError {
    /// The admin CLI could not be spawned or awaited.
    #[error("Failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The admin CLI exited non-zero.
    #[error("{command} exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The requested volume does not exist in the cell.
    ///
    /// Distinguished from [`VosError::CommandFailed`] because several
    /// operations treat a missing volume as an answer, not a failure.
    #[error("Volume {volname} does not exist in cell {cell}")]
    NoSuchVolume { volname: String, cell: String },

    /// The admin CLI printed output we cannot interpret.
    #[error("Failed to parse admin CLI output ({what}): {snippet:?}")]
    Parse { what: String, snippet: String },
}
