//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{io::IsTerminal, sync::Once};

use tracing_subscriber::{filter::LevelFilter, EnvFilter};

static CELLCC_LOG_ENV_VAR: &str = "CELLCC_LOG";

/// List of crates in the workspace.
const CELLCC_CRATES: &[&str] = &[
    "cellcc",
    "cellcc_config",
    "cellcc_debug",
    "check_server",
    "dump_server",
    "jobdb",
    "logging",
    "remctl",
    "restore_server",
    "supervisor",
    "volops",
];

/// Initializes a tracing subscriber for logging.
///
/// Logs go to stderr so that command output (`cellcc jobs --format json`,
/// `remctl get-dump`) stays clean on stdout.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter = env_filter();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();
    });
}

fn env_filter() -> EnvFilter {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level = std::env::var(CELLCC_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in CELLCC_CRATES {
        // Add directives for each workspace crate, if not overridden by RUST_LOG
        if !directive_string.contains(&format!("{crate_name}=")) {
            if let Ok(directive) = format!("{crate_name}={log_level}").parse() {
                env_filter = env_filter.add_directive(directive);
            }
        }
    }

    env_filter
}

/// Collect the error source chain as a vector of strings for tracing.
///
/// Walks the `.source()` chain of the provided error and collects each source's
/// Display representation into a vector. Returns a `DebugValue<Vec<String>>`
/// that can be used directly in tracing macros. Returns an empty vector if the
/// error has no source chain.
pub fn error_source(err: &dyn std::error::Error) -> tracing::field::DebugValue<Vec<String>> {
    let mut sources = Vec::new();
    let mut current = err.source();

    while let Some(curr) = current {
        sources.push(curr.to_string());
        current = curr.source();
    }

    tracing::field::debug(sources)
}

/// Builds an error chain string from an error and its sources.
///
/// Used by the binaries to print a full `Caused by:` chain on exit.
pub fn error_with_causes(err: &dyn std::error::Error) -> String {
    let mut error_chain = Vec::new();
    let mut current = err;
    while let Some(source) = current.source() {
        error_chain.push(source.to_string());
        current = source;
    }

    if error_chain.is_empty() {
        err.to_string()
    } else {
        format!("{} | Caused by: {}", err, error_chain.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_source_with_three_level_chain_returns_two_sources() {
        //* Given
        /// Root error representing database connection failure
        #[derive(Debug, thiserror::Error)]
        #[error("database connection refused")]
        struct DatabaseConnectionError;

        /// Error that occurs when a database query fails
        #[derive(Debug, thiserror::Error)]
        #[error("failed to execute query")]
        struct QueryExecutionError(#[source] DatabaseConnectionError);

        /// Error that occurs when a job update fails
        #[derive(Debug, thiserror::Error)]
        #[error("failed to update job")]
        struct UpdateJobError(#[source] QueryExecutionError);

        let error = UpdateJobError(QueryExecutionError(DatabaseConnectionError));

        //* When
        let result = error_source(&error);

        //* Then
        let error_source_str = format!("{:?}", result);
        assert_eq!(
            error_source_str, r#"["failed to execute query", "database connection refused"]"#,
            "error source chain should contain both sources in order"
        );
    }

    #[test]
    fn error_source_with_no_source_returns_empty_vec() {
        //* Given
        /// Simple error with no underlying cause
        #[derive(Debug, thiserror::Error)]
        #[error("something went wrong")]
        struct SimpleError;

        let error = SimpleError;

        //* When
        let result = error_source(&error);

        //* Then
        let error_source_str = format!("{:?}", result);
        assert_eq!(error_source_str, "[]");
    }

    #[test]
    fn error_with_causes_joins_the_chain() {
        //* Given
        #[derive(Debug, thiserror::Error)]
        #[error("inner failure")]
        struct Inner;

        #[derive(Debug, thiserror::Error)]
        #[error("outer failure")]
        struct Outer(#[source] Inner);

        //* When
        let rendered = error_with_causes(&Outer(Inner));

        //* Then
        assert_eq!(rendered, "outer failure | Caused by: inner failure");
    }
}
