use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::jobs::{now_ms, JobKind};
use crate::system::SystemControl;

/// Proof of ownership of the lock marker, handed to the job that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(u64);

/// Contents of the lock marker file.
///
/// The sync script may also create or remove the marker, so a marker that
/// does not parse as a `LockOwner` is still treated as held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub token: LockToken,
    pub kind: JobKind,
    pub pid: u32,
    pub started_at_ms: u64,
}

/// Process names/patterns touched by the liveness check and the stop path.
#[derive(Debug, Clone)]
pub struct StopTargets {
    /// Exact process name of the transfer tool.
    pub transfer_process: String,
    /// Command-line pattern that means "a job is still moving files".
    pub liveness_pattern: String,
    /// Command-line pattern of the job script itself.
    pub job_script_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Stopped,
    NothingToDo,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopStep {
    pub name: &'static str,
    pub outcome: StepOutcome,
}

/// Result of a best-effort stop: one entry per independent step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub steps: Vec<StopStep>,
}

impl StopReport {
    pub fn push(&mut self, name: &'static str, outcome: StepOutcome) {
        self.steps.push(StopStep { name, outcome });
    }

    /// True if any step actually stopped something.
    pub fn stopped(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s.outcome, StepOutcome::Stopped))
    }
}

/// File-backed "one job at a time" lock.
///
/// The marker lives on persistent storage so it is visible to the job script
/// and survives a restart of the daemon.
#[derive(Clone)]
pub struct LockManager {
    path: PathBuf,
    system: Arc<dyn SystemControl>,
    targets: StopTargets,
}

impl LockManager {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        system: Arc<dyn SystemControl>,
        targets: StopTargets,
    ) -> Self {
        Self {
            path: path.into(),
            system,
            targets,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically creates the marker. `Ok(None)` means someone else holds it.
    pub fn try_acquire(&self, kind: JobKind) -> io::Result<Option<LockToken>> {
        let owner = LockOwner {
            token: LockToken(rand::random()),
            kind,
            pid: std::process::id(),
            started_at_ms: now_ms(),
        };
        let body = serde_json::to_vec(&owner)?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e),
        };

        if let Err(e) = file.write_all(&body).and_then(|_| file.sync_all()) {
            drop(file);
            let _ = fs::remove_file(&self.path);
            return Err(e);
        }

        log::info!(
            "Acquired job lock {} for {}",
            self.path.display(),
            kind.as_str()
        );
        Ok(Some(owner.token))
    }

    /// Marker present, or something matching the liveness pattern is running.
    pub async fn is_held(&self) -> bool {
        if self.path.exists() {
            return true;
        }

        match self.system.is_running(&self.targets.liveness_pattern).await {
            Ok(running) => running,
            Err(e) => {
                log::warn!("Liveness check failed, assuming idle: {e}");
                false
            }
        }
    }

    /// Recorded owner, if the marker exists and was written by this daemon.
    pub fn owner(&self) -> Option<LockOwner> {
        let raw = fs::read(&self.path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Removes the marker. Returns whether it existed; never fails.
    pub fn release(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Removed job lock {}", self.path.display());
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                log::error!("Failed to remove job lock {}: {e}", self.path.display());
                false
            }
        }
    }

    /// Removes the marker only while it still belongs to `token`.
    pub fn release_owned(&self, token: LockToken) -> bool {
        match self.owner() {
            Some(owner) if owner.token == token => self.release(),
            Some(_) => {
                log::warn!(
                    "Job lock {} now belongs to another job, leaving it in place",
                    self.path.display()
                );
                false
            }
            None => false,
        }
    }

    /// Stop path: signal the transfer tool, drop the marker, signal the job
    /// script. Steps run independently; failures are recorded, not raised.
    pub async fn force_release(&self) -> StopReport {
        let mut report = StopReport::default();

        let transfer = signal_outcome(
            self.system
                .signal_by_name(&self.targets.transfer_process)
                .await,
        );
        if transfer == StepOutcome::Stopped {
            log::info!("Stopped {} processes", self.targets.transfer_process);
        }
        report.push("transfer", transfer);

        let marker = if self.release() {
            StepOutcome::Stopped
        } else {
            StepOutcome::NothingToDo
        };
        report.push("lock", marker);

        let script = signal_outcome(
            self.system
                .signal_by_pattern(&self.targets.job_script_pattern)
                .await,
        );
        if script == StepOutcome::Stopped {
            log::info!("Stopped job script ({})", self.targets.job_script_pattern);
        }
        report.push("job_script", script);

        report
    }
}

fn signal_outcome(res: io::Result<bool>) -> StepOutcome {
    match res {
        Ok(true) => StepOutcome::Stopped,
        Ok(false) => StepOutcome::NothingToDo,
        Err(e) => {
            log::warn!("Stop step failed: {e}");
            StepOutcome::Failed(e.to_string())
        }
    }
}
