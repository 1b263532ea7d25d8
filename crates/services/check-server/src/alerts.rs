//! Alert types and dispatch.
//!
//! Alerts accumulated over one check sweep are dispatched in a single
//! batch: a text rendering piped to the configured text-alert command, a
//! JSON array piped to the JSON-alert command, and warn-level log lines.
//! The three channels are switched independently, and a failing alert
//! command is itself only a logged warning; alerting must never take the
//! check-server down.

use std::process::Stdio;

use cellcc_config::AlertsConfig;
use jobdb::{Job, JobId, JobState};
use tokio::{io::AsyncWriteExt as _, process::Command};

/// What kind of attention a job needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AlertKind {
    /// A failed job was reset for another attempt.
    #[serde(rename = "ALERT_RETRY")]
    Retry,
    /// A job hit the error limit and will not be retried.
    #[serde(rename = "ALERT_ERRORLIMIT")]
    ErrorLimit,
    /// A job blew past its deadline.
    #[serde(rename = "ALERT_EXPIRED")]
    Expired,
    /// A job has not been touched for too long.
    #[serde(rename = "ALERT_STALE")]
    Stale,
    /// A job has existed for too long.
    #[serde(rename = "ALERT_OLD")]
    Old,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "ALERT_RETRY",
            Self::ErrorLimit => "ALERT_ERRORLIMIT",
            Self::Expired => "ALERT_EXPIRED",
            Self::Stale => "ALERT_STALE",
            Self::Old => "ALERT_OLD",
        }
    }
}

/// One alert about one job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Alert {
    #[serde(rename = "alert")]
    pub kind: AlertKind,
    pub jobid: JobId,
    pub src_cell: String,
    pub dst_cell: String,
    pub volname: String,
    pub qname: String,
    pub state: JobState,
    pub errors: i32,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, job: &Job, message: impl Into<String>) -> Self {
        Self {
            kind,
            jobid: job.id,
            src_cell: job.src_cell.clone(),
            dst_cell: job.dst_cell.clone(),
            volname: job.volname.clone(),
            qname: job.qname.clone(),
            state: job.state,
            errors: job.errors,
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        format!(
            "{} job {} ({} -> {}, volume {}, queue {}, errors {}): {}",
            self.kind.as_str(),
            self.jobid,
            self.src_cell,
            self.dst_cell,
            self.volname,
            self.qname,
            self.errors,
            self.message,
        )
    }
}

/// Render a batch of alerts as the text-command payload.
pub fn render_text(alerts: &[Alert]) -> String {
    let mut text = String::new();
    for alert in alerts {
        text.push_str(&alert.render());
        text.push('\n');
    }
    text
}

/// Dispatch one sweep's alerts to every enabled channel.
pub async fn dispatch(config: &AlertsConfig, alerts: &[Alert]) {
    if alerts.is_empty() {
        return;
    }

    if let Some(command) = &config.text_command {
        pipe_to_command(command, render_text(alerts).as_bytes()).await;
    }

    if let Some(command) = &config.json_command {
        match serde_json::to_vec(alerts) {
            Ok(payload) => pipe_to_command(command, &payload).await,
            Err(err) => tracing::warn!(error = %err, "failed to encode alerts as JSON"),
        }
    }

    if config.log {
        for alert in alerts {
            tracing::warn!(
                alert = alert.kind.as_str(),
                jobid = %alert.jobid,
                volname = %alert.volname,
                dst_cell = %alert.dst_cell,
                "{}",
                alert.message
            );
        }
    }
}

/// Feed a payload to an alert command's stdin, tolerating every failure.
async fn pipe_to_command(command: &str, payload: &[u8]) {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            tracing::warn!(command, error = %err, "failed to spawn alert command");
            return;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(err) = stdin.write_all(payload).await {
            tracing::warn!(command, error = %err, "failed to write to alert command");
        }
        // Closing stdin lets the command see EOF and finish.
        drop(stdin);
    }

    match child.wait_with_output().await {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            tracing::warn!(
                command,
                code = output.status.code().unwrap_or(-1),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "alert command failed"
            );
        }
        Err(err) => {
            tracing::warn!(command, error = %err, "failed waiting for alert command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert(kind: AlertKind) -> Alert {
        let dummies = jobdb::describe_dummy_jobs(1);
        Alert::new(kind, &dummies[0].job, "something needs attention")
    }

    #[test]
    fn text_rendering_is_one_line_per_alert() {
        //* Given
        let alerts = vec![
            sample_alert(AlertKind::Retry),
            sample_alert(AlertKind::Stale),
        ];

        //* When
        let text = render_text(&alerts);

        //* Then
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ALERT_RETRY job 1"));
        assert!(lines[1].starts_with("ALERT_STALE job 1"));
        assert!(lines[0].contains("volume test.vol.1"));
    }

    #[test]
    fn json_encoding_uses_wire_names() {
        //* Given
        let alert = sample_alert(AlertKind::ErrorLimit);

        //* When
        let value = serde_json::to_value([&alert]).expect("alerts encode");

        //* Then
        assert_eq!(value[0]["alert"], "ALERT_ERRORLIMIT");
        assert_eq!(value[0]["state"], "NEW");
        assert_eq!(value[0]["jobid"], 1);
    }

    #[tokio::test]
    async fn alert_command_receives_the_text_payload() {
        //* Given
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = dir.path().join("alerts.txt");
        let config = AlertsConfig {
            text_command: Some(format!("cat > {}", sink.display())),
            json_command: None,
            log: false,
        };
        let alerts = vec![sample_alert(AlertKind::Old)];

        //* When
        dispatch(&config, &alerts).await;

        //* Then
        let captured = std::fs::read_to_string(&sink).expect("alert sink exists");
        assert!(captured.starts_with("ALERT_OLD job 1"));
    }

    #[tokio::test]
    async fn failing_alert_command_is_tolerated() {
        let config = AlertsConfig {
            text_command: Some("exit 9".to_string()),
            json_command: None,
            log: false,
        };
        // Must not panic or error.
        dispatch(&config, &[sample_alert(AlertKind::Stale)]).await;
    }
}
