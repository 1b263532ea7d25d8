//! Server side of the remote-command transport.
//!
//! The transport daemon authenticates the client, exports the client
//! principal in `REMOTE_USER`, and dispatches each subcommand into our CLI.
//! These handlers validate the principal (except for `ping`), resolve the
//! requested blob name against the dump scratch directory, and do the
//! actual I/O.

use std::{
    io::IsTerminal as _,
    path::{Path, PathBuf},
};

/// Fixed success string returned by `ping`.
pub const PING_RESPONSE: &str = "cellcc remctl: ok";

/// Environment variable the transport daemon exports the authenticated
/// client principal in.
const REMOTE_USER_VAR: &str = "REMOTE_USER";

/// Errors from the server-side subcommand handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// The caller's principal does not match the configured one.
    #[error("Access denied for principal {principal:?}")]
    AccessDenied { principal: String },

    /// No allowed principal is configured; the handlers refuse to serve.
    #[error("No remctl/principal is configured; refusing to serve")]
    NoPrincipalConfigured,

    /// The requested name is not a bare file name.
    #[error("Invalid dump file name {filename:?}")]
    BadFilename { filename: String },

    /// `get-dump` is a raw blob stream; a terminal stdout is always a
    /// mistake.
    #[error("Refusing to write dump data to a terminal")]
    StdoutIsTerminal,

    #[error("Failed to access dump file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolve a bare blob name against the scratch directory.
///
/// Names with directory components (or the directory pseudo-names) are
/// rejected so a client can never escape the scratch directory.
pub fn dump_path(scratch_dir: &Path, filename: &str) -> Result<PathBuf, ServeError> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(ServeError::BadFilename {
            filename: filename.to_string(),
        });
    }
    Ok(scratch_dir.join(filename))
}

/// `ping`: unauthenticated health check.
pub fn serve_ping() -> &'static str {
    PING_RESPONSE
}

/// `get-dump`: stream a blob to stdout.
pub async fn serve_get_dump(
    scratch_dir: &Path,
    allowed_principal: Option<&str>,
    filename: &str,
) -> Result<(), ServeError> {
    check_principal(client_principal().as_deref(), allowed_principal)?;
    if std::io::stdout().is_terminal() {
        return Err(ServeError::StdoutIsTerminal);
    }

    let path = dump_path(scratch_dir, filename)?;
    let io_err = |source| ServeError::Io {
        path: path.display().to_string(),
        source,
    };

    let mut file = tokio::fs::File::open(&path).await.map_err(io_err)?;
    let mut stdout = tokio::io::stdout();
    tokio::io::copy(&mut file, &mut stdout).await.map_err(io_err)?;
    tokio::io::AsyncWriteExt::flush(&mut stdout)
        .await
        .map_err(io_err)?;
    Ok(())
}

/// `remove-dump`: unlink a blob.
pub async fn serve_remove_dump(
    scratch_dir: &Path,
    allowed_principal: Option<&str>,
    filename: &str,
) -> Result<(), ServeError> {
    check_principal(client_principal().as_deref(), allowed_principal)?;

    let path = dump_path(scratch_dir, filename)?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|source| ServeError::Io {
            path: path.display().to_string(),
            source,
        })?;
    tracing::info!(path = %path.display(), "removed dump blob");
    Ok(())
}

/// The authenticated client principal, as exported by the transport daemon.
fn client_principal() -> Option<String> {
    std::env::var(REMOTE_USER_VAR).ok()
}

/// Require the client principal to match the configured one.
fn check_principal(client: Option<&str>, allowed: Option<&str>) -> Result<(), ServeError> {
    let Some(allowed) = allowed else {
        return Err(ServeError::NoPrincipalConfigured);
    };
    match client {
        Some(principal) if principal == allowed => Ok(()),
        Some(principal) => Err(ServeError::AccessDenied {
            principal: principal.to_string(),
        }),
        None => Err(ServeError::AccessDenied {
            principal: "<unauthenticated>".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_path_accepts_bare_names() {
        let path = dump_path(Path::new("/var/tmp/cellcc"), "u.alice.7.dump")
            .expect("bare name resolves");
        assert_eq!(path, PathBuf::from("/var/tmp/cellcc/u.alice.7.dump"));
    }

    #[test]
    fn dump_path_rejects_directory_components() {
        for bad in ["", ".", "..", "a/b", "/etc/passwd", "..\\x", "x\0y"] {
            let result = dump_path(Path::new("/var/tmp/cellcc"), bad);
            assert!(
                matches!(result, Err(ServeError::BadFilename { .. })),
                "{bad:?} must be rejected"
            );
        }
    }

    #[test]
    fn principal_must_match_exactly() {
        //* Given
        let allowed = Some("host/restore1.example.com@EXAMPLE.COM");

        //* When / Then
        check_principal(Some("host/restore1.example.com@EXAMPLE.COM"), allowed)
            .expect("matching principal is allowed");

        assert!(matches!(
            check_principal(Some("host/evil.example.com@EXAMPLE.COM"), allowed),
            Err(ServeError::AccessDenied { .. })
        ));
        assert!(matches!(
            check_principal(None, allowed),
            Err(ServeError::AccessDenied { .. })
        ));
        assert!(matches!(
            check_principal(Some("anyone"), None),
            Err(ServeError::NoPrincipalConfigured)
        ));
    }
}
