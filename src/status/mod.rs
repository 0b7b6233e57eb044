use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::jobs::{JobOutcome, JobReport};

pub mod error;

pub use error::StatusError;

/// Served when there is no snapshot and the generator could not produce one.
pub const FALLBACK_STATUS: &str = r#"{"state": "error"}"#;

/// Flag asking the sync script to print a status document on stdout.
const STATUS_FLAG: &str = "--ha-status";
/// Flag asking the sync script to publish its status (and rewrite the snapshot).
const PUBLISH_FLAG: &str = "--send-ha-status";

/// Serves the status document: the persisted snapshot when present,
/// otherwise whatever the sync script generates within `timeout`.
///
/// The snapshot is returned as-is with no staleness check. It lags real
/// job state until something rewrites it.
#[derive(Debug, Clone)]
pub struct StatusProvider {
    snapshot_path: PathBuf,
    command: Vec<String>,
    timeout: Duration,
}

impl StatusProvider {
    pub fn new<P: Into<PathBuf>>(snapshot_path: P, command: Vec<String>, timeout: Duration) -> Self {
        Self {
            snapshot_path: snapshot_path.into(),
            command,
            timeout,
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub async fn get_status(&self) -> Result<String, StatusError> {
        match tokio::fs::read_to_string(&self.snapshot_path).await {
            Ok(body) => return Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StatusError::SnapshotRead {
                    path: self.snapshot_path.clone(),
                    source,
                })
            }
        }

        match self.generate().await {
            Ok(body) => Ok(body),
            Err(e) => {
                log::warn!("Status generation failed, serving fallback: {e}");
                Ok(FALLBACK_STATUS.to_string())
            }
        }
    }

    /// Runs the generator and returns its stdout on a zero exit.
    pub async fn generate(&self) -> Result<String, StatusError> {
        let output = self.run_script(STATUS_FLAG).await?;
        if !output.status.success() {
            return Err(StatusError::CommandFailed(format!(
                "exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Asks the sync script to publish fresh status. Errors are only logged.
    pub async fn refresh(&self) {
        match self.run_script(PUBLISH_FLAG).await {
            Ok(output) if output.status.success() => log::info!("Published refreshed status"),
            Ok(output) => log::warn!("Status refresh exited with {}", output.status),
            Err(e) => log::warn!("Status refresh failed: {e}"),
        }
    }

    /// Writes a failed, timed-out or stopped job into the snapshot.
    /// Successful runs are left to the script, which publishes its own
    /// status. Returns whether the snapshot was rewritten.
    pub async fn record(&self, report: &JobReport) -> Result<bool, StatusError> {
        if report.outcome == JobOutcome::Succeeded {
            return Ok(false);
        }

        let doc = json!({
            "state": report.outcome.state(),
            "job": report.kind.as_str(),
            "message": report.message(),
            "started_at_ms": report.started_at_ms,
            "finished_at_ms": report.finished_at_ms,
        });
        let body = serde_json::to_vec_pretty(&doc)?;

        // Readers must never see a half-written document.
        let tmp = self.snapshot_path.with_extension("tmp");
        let written = match tokio::fs::write(&tmp, &body).await {
            Ok(()) => tokio::fs::rename(&tmp, &self.snapshot_path).await,
            Err(e) => Err(e),
        };
        written.map_err(|source| StatusError::SnapshotWrite {
            path: self.snapshot_path.clone(),
            source,
        })?;
        Ok(true)
    }

    async fn run_script(&self, flag: &str) -> Result<std::process::Output, StatusError> {
        let (program, prefix) = self
            .command
            .split_first()
            .ok_or_else(|| StatusError::CommandFailed("empty status command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .arg(flag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(res) => res.map_err(|e| StatusError::CommandFailed(e.to_string())),
            Err(_) => Err(StatusError::Timeout(self.timeout)),
        }
    }
}

/// Drains job reports from finished job units into the status snapshot.
///
/// A stopped job is followed by a status publish, which therefore always
/// runs after the "stopped" document is on disk.
pub async fn run_status_recorder(mut rx: UnboundedReceiver<JobReport>, status: StatusProvider) {
    while let Some(report) = rx.recv().await {
        match status.record(&report).await {
            Ok(true) => log::info!(
                "Recorded {} outcome '{}' in {}",
                report.kind.as_str(),
                report.outcome.state(),
                status.snapshot_path().display()
            ),
            Ok(false) => {}
            Err(e) => log::error!("Status recorder: {e}"),
        }
        if report.outcome == JobOutcome::Cancelled {
            status.refresh().await;
        }
    }
}
