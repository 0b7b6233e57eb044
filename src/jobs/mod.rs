use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod error;
pub mod lock;
pub mod runner;

pub use error::JobError;
pub use lock::{LockManager, LockOwner, LockToken, StepOutcome, StopReport, StopStep, StopTargets};
pub use runner::{JobRunner, JobTicket};

/// The two maintenance jobs the sync script knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Sync,
    Cleanup,
}

impl JobKind {
    /// Flag selecting the mode of the sync script.
    pub fn mode_flag(self) -> &'static str {
        match self {
            JobKind::Sync => "-s",
            JobKind::Cleanup => "-c",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Cleanup => "cleanup",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            JobKind::Sync => "Sync",
            JobKind::Cleanup => "Cleanup",
        }
    }

    /// Syncing is pointless unless the car is plugged in; cleanup is local.
    pub fn requires_target(self) -> bool {
        matches!(self, JobKind::Sync)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    None,
    Reboot,
}

/// Runtime knobs for job execution, derived from `Config`.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub command: Vec<String>,
    pub sync_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub reboot_delay: Duration,
    pub reboot_after_sync: bool,
    pub reboot_after_cleanup: bool,
}

impl JobSettings {
    pub fn timeout(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Sync => self.sync_timeout,
            JobKind::Cleanup => self.cleanup_timeout,
        }
    }

    pub fn post_action(&self, kind: JobKind) -> PostAction {
        let reboot = match kind {
            JobKind::Sync => self.reboot_after_sync,
            JobKind::Cleanup => self.reboot_after_cleanup,
        };
        if reboot {
            PostAction::Reboot
        } else {
            PostAction::None
        }
    }
}

/// How a detached job unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

impl JobOutcome {
    /// Value of the `state` field in a recorded status snapshot.
    pub fn state(&self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "success",
            JobOutcome::Failed(_) => "error",
            JobOutcome::TimedOut(_) => "timeout",
            JobOutcome::Cancelled => "stopped",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded)
    }

    pub fn into_error(self, kind: JobKind) -> Option<JobError> {
        match self {
            JobOutcome::Succeeded | JobOutcome::Cancelled => None,
            JobOutcome::Failed(msg) => Some(JobError::ExternalOperationFailed(format!(
                "{}: {msg}",
                kind.label()
            ))),
            JobOutcome::TimedOut(after) => Some(JobError::ExternalOperationTimedOut(after)),
        }
    }
}

/// Sent by a finished job unit to the status recorder.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub kind: JobKind,
    pub outcome: JobOutcome,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl JobReport {
    pub fn message(&self) -> String {
        match &self.outcome {
            JobOutcome::Succeeded => format!("{} completed", self.kind.label()),
            JobOutcome::Cancelled => format!("{} stopped", self.kind.label()),
            other => other
                .clone()
                .into_error(self.kind)
                .map(|e| e.to_string())
                .unwrap_or_default(),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
