//! Child process supervision.
//!
//! Spawns an external command with its output captured to files, waits for
//! it while firing progress callbacks on an interval schedule, and on
//! failure aggregates the stderr capture into the log. The child never
//! outlives its supervisor: commands are spawned with `kill_on_drop`, and an
//! aborting progress callback kills the child before the error propagates.

use std::{future::Future, path::Path, process::Stdio, time::Duration};

use tokio::process::Command;

use crate::schedule::IntervalSchedule;

/// Outcome of a progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep monitoring the child.
    Continue,
    /// Terminate the child and fail with [`ChildError::Aborted`].
    ///
    /// Stage workers return this when their job was taken away mid-stage
    /// (the database refused the timeout refresh), so the external command
    /// must not keep running on a job the worker no longer owns.
    Abort,
}

/// Errors from running a supervised child.
#[derive(Debug, thiserror::Error)]
pub enum ChildError {
    #[error("Failed to create capture file for {command}: {source}")]
    Capture {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The child exited with a non-zero status.
    #[error("{command} exited with status {code}")]
    Exited { command: String, code: i32 },

    /// The child was terminated by a signal.
    #[error("{command} was killed by signal {signal}")]
    Signaled { command: String, signal: i32 },

    /// The supervisor terminated the child on request of its progress
    /// callback.
    #[error("{command} was terminated by its supervisor")]
    Aborted { command: String },
}

/// Run a command under supervision.
///
/// `stdout_path`, when given, receives the child's stdout; stderr is always
/// captured to `stderr_path` so a failing child's complaints end up in the
/// log. The progress callback fires per the schedule and receives the next
/// interval in seconds.
pub async fn run_command<F, Fut>(
    mut command: Command,
    stdout_path: Option<&Path>,
    stderr_path: &Path,
    schedule: &IntervalSchedule,
    mut on_progress: F,
) -> Result<(), ChildError>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Progress>,
{
    let name = command_name(&command);

    let stdout = match stdout_path {
        Some(path) => capture_file(&name, path)?,
        None => Stdio::null(),
    };
    let stderr = capture_file(&name, stderr_path)?;

    command
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true);

    tracing::debug!(command = %name, "spawning child");
    let mut child = command.spawn().map_err(|source| ChildError::Spawn {
        command: name.clone(),
        source,
    })?;

    let mut intervals = schedule.iter();
    let mut wait_secs = intervals.next().unwrap_or(1);
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|source| ChildError::Wait {
                    command: name.clone(),
                    source,
                })?;
                if status.success() {
                    return Ok(());
                }
                report_stderr(&name, stderr_path).await;
                return Err(exit_error(&name, status));
            }
            _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => {
                let next = intervals.next().unwrap_or(wait_secs);
                match on_progress(next).await {
                    Progress::Continue => wait_secs = next,
                    Progress::Abort => {
                        let _ = child.kill().await;
                        return Err(ChildError::Aborted { command: name });
                    }
                }
            }
        }
    }
}

/// Run an in-process task under the same progress schedule.
///
/// The cancellation contract matches [`run_command`]: when the callback
/// aborts, the task future is dropped before this function returns, which
/// kills any `kill_on_drop` children it holds.
pub async fn supervise<T, F, P, PFut>(
    task: F,
    schedule: &IntervalSchedule,
    mut on_progress: P,
) -> Result<T, SuperviseAborted>
where
    F: Future<Output = T>,
    P: FnMut(u64) -> PFut,
    PFut: Future<Output = Progress>,
{
    tokio::pin!(task);

    let mut intervals = schedule.iter();
    let mut wait_secs = intervals.next().unwrap_or(1);
    loop {
        tokio::select! {
            result = &mut task => return Ok(result),
            _ = tokio::time::sleep(Duration::from_secs(wait_secs)) => {
                let next = intervals.next().unwrap_or(wait_secs);
                match on_progress(next).await {
                    Progress::Continue => wait_secs = next,
                    Progress::Abort => return Err(SuperviseAborted),
                }
            }
        }
    }
}

/// The supervised task was cancelled by its progress callback.
#[derive(Debug, thiserror::Error)]
#[error("task was terminated by its supervisor")]
pub struct SuperviseAborted;

fn command_name(command: &Command) -> String {
    command.as_std().get_program().to_string_lossy().into_owned()
}

fn capture_file(name: &str, path: &Path) -> Result<Stdio, ChildError> {
    let file = std::fs::File::create(path).map_err(|source| ChildError::Capture {
        command: name.to_string(),
        source,
    })?;
    Ok(Stdio::from(file))
}

/// Log each non-blank stderr line of a failed child.
async fn report_stderr(name: &str, stderr_path: &Path) {
    let stderr = tokio::fs::read_to_string(stderr_path)
        .await
        .unwrap_or_default();
    for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
        tracing::warn!(command = %name, "child stderr: {line}");
    }
}

fn exit_error(name: &str, status: std::process::ExitStatus) -> ChildError {
    use std::os::unix::process::ExitStatusExt as _;

    match status.code() {
        Some(code) => ChildError::Exited {
            command: name.to_string(),
            code,
        },
        None => ChildError::Signaled {
            command: name.to_string(),
            signal: status.signal().unwrap_or(0),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use super::*;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn successful_child_captures_stdout() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let stdout_path = dir.path().join("out");
        let stderr_path = dir.path().join("err");

        //* When
        let result = run_command(
            sh("echo hello"),
            Some(stdout_path.as_path()),
            &stderr_path,
            &IntervalSchedule::default(),
            |_| async { Progress::Continue },
        )
        .await;

        //* Then
        result.expect("child should succeed");
        let captured = std::fs::read_to_string(&stdout_path).expect("read capture");
        assert_eq!(captured, "hello\n");
    }

    #[tokio::test]
    async fn failing_child_reports_exit_code() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let stderr_path = dir.path().join("err");

        //* When
        let result = run_command(
            sh("echo oops >&2; exit 3"),
            None,
            &stderr_path,
            &IntervalSchedule::default(),
            |_| async { Progress::Continue },
        )
        .await;

        //* Then
        match result {
            Err(ChildError::Exited { code, .. }) => assert_eq!(code, 3),
            other => panic!("expected Exited error, got {other:?}"),
        }
        let captured = std::fs::read_to_string(&stderr_path).expect("read capture");
        assert_eq!(captured, "oops\n");
    }

    #[tokio::test]
    async fn progress_callback_receives_next_interval() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let stderr_path = dir.path().join("err");
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_callback = Arc::clone(&seen);

        //* When
        let result = run_command(
            sh("sleep 2"),
            None,
            &stderr_path,
            &IntervalSchedule::new(vec![1, 7]),
            move |next| {
                let seen = Arc::clone(&seen_in_callback);
                async move {
                    seen.store(next, Ordering::SeqCst);
                    Progress::Continue
                }
            },
        )
        .await;

        //* Then
        result.expect("child should succeed");
        assert_eq!(
            seen.load(Ordering::SeqCst),
            7,
            "callback fires with the interval that comes after the elapsed one"
        );
    }

    #[tokio::test]
    async fn aborting_callback_kills_the_child() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let stderr_path = dir.path().join("err");

        //* When
        let started = std::time::Instant::now();
        let result = run_command(
            sh("sleep 30"),
            None,
            &stderr_path,
            &IntervalSchedule::new(vec![1]),
            |_| async { Progress::Abort },
        )
        .await;

        //* Then
        assert!(matches!(result, Err(ChildError::Aborted { .. })));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "the sleeping child must not be awaited to completion"
        );
    }

    #[tokio::test]
    async fn supervise_passes_the_task_result_through() {
        //* Given / When
        let result = supervise(
            async { 42u32 },
            &IntervalSchedule::default(),
            |_| async { Progress::Continue },
        )
        .await;

        //* Then
        assert_eq!(result.expect("task completes"), 42);
    }
}
