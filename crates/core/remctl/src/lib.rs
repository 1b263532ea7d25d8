//! Remote-command transport between dump and restore hosts.
//!
//! Dump blobs move between hosts over a kerberized request/response channel
//! carrying three subcommands: `ping`, `get-dump`, and `remove-dump`. The
//! restore host is always the client. This crate wraps both directions: the
//! client side spawns the configured transport binary, and the server side
//! implements the subcommand handlers that the transport daemon dispatches
//! into our CLI.

mod client;
mod server;

pub use self::{
    client::RemctlClient,
    server::{dump_path, serve_get_dump, serve_ping, serve_remove_dump, ServeError, PING_RESPONSE},
};

/// Errors from client-side transport invocations.
#[derive(Debug, thiserror::Error)]
pub enum RemctlError {
    #[error("Failed to run {command}: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} {subcommand} against {host} exited with status {code}: {stderr}")]
    CommandFailed {
        command: String,
        subcommand: String,
        host: String,
        code: i32,
        stderr: String,
    },

    /// `ping` succeeded but returned something other than the fixed
    /// success string.
    #[error("Unexpected ping response from {host}: {response:?}")]
    BadPingResponse { host: String, response: String },
}
