use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;

use crate::jobs::lock::{LockManager, LockToken, StepOutcome, StopReport};
use crate::jobs::{now_ms, JobError, JobKind, JobOutcome, JobReport, JobSettings, PostAction};
use crate::network::ConnectivityProbe;
use crate::status::StatusProvider;
use crate::system::SystemControl;

/// Handed back to the caller of an accepted `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTicket {
    pub kind: JobKind,
    pub token: LockToken,
    pub started_at_ms: u64,
    pub timeout: Duration,
}

struct ActiveJob {
    ticket: JobTicket,
    cancel: oneshot::Sender<()>,
    /// Set by `stop` before any signal goes out; the unit then reports
    /// `Cancelled` however the child happened to exit.
    stop_requested: Arc<AtomicBool>,
}

struct RunnerInner {
    settings: JobSettings,
    lock: LockManager,
    probe: ConnectivityProbe,
    status: StatusProvider,
    system: Arc<dyn SystemControl>,
    reports: UnboundedSender<JobReport>,
    active: Mutex<Option<ActiveJob>>,
    /// Held for the whole of `start` and `stop`. A stop only touches jobs
    /// accepted before it began.
    control: Mutex<()>,
}

/// Starts sync/cleanup jobs as detached tasks and stops them on request.
///
/// Only the lock gate in `start` keeps jobs exclusive; the runner itself
/// just remembers the job it spawned last so `stop` can cancel it.
#[derive(Clone)]
pub struct JobRunner {
    inner: Arc<RunnerInner>,
}

impl JobRunner {
    pub fn new(
        settings: JobSettings,
        lock: LockManager,
        probe: ConnectivityProbe,
        status: StatusProvider,
        system: Arc<dyn SystemControl>,
        reports: UnboundedSender<JobReport>,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                settings,
                lock,
                probe,
                status,
                system,
                reports,
                active: Mutex::new(None),
                control: Mutex::new(()),
            }),
        }
    }

    pub fn lock(&self) -> &LockManager {
        &self.inner.lock
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock.is_held().await
    }

    /// The job this daemon spawned and has not seen finish yet.
    pub async fn active(&self) -> Option<JobTicket> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|job| job.ticket.clone())
    }

    /// Gate and spawn. Returns as soon as the job task exists.
    pub async fn start(&self, kind: JobKind) -> Result<JobTicket, JobError> {
        let _control = self.inner.control.lock().await;

        if self.inner.lock.is_held().await {
            return Err(JobError::AlreadyRunning);
        }

        if kind.requires_target() && !self.inner.probe.is_target_connected() {
            log::info!("Refusing {}: target not connected", kind.as_str());
            return Err(JobError::TargetNotConnected);
        }

        // create_new + fsync on the marker; keep it off the reactor.
        let lock = self.inner.lock.clone();
        let acquired = tokio::task::spawn_blocking(move || lock.try_acquire(kind))
            .await
            .map_err(|e| JobError::Internal(format!("lock task failed: {e}")))?;
        let token = match acquired {
            Ok(Some(token)) => token,
            Ok(None) => return Err(JobError::AlreadyRunning),
            Err(e) => {
                return Err(JobError::Internal(format!(
                    "failed to create lock {}: {e}",
                    self.inner.lock.path().display()
                )))
            }
        };

        let ticket = JobTicket {
            kind,
            token,
            started_at_ms: now_ms(),
            timeout: self.inner.settings.timeout(kind),
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.inner.active.lock().await;
            *active = Some(ActiveJob {
                ticket: ticket.clone(),
                cancel: cancel_tx,
                stop_requested: Arc::clone(&stop_requested),
            });
        }

        log::info!(
            "{} started (timeout {}s)",
            kind.label(),
            ticket.timeout.as_secs()
        );
        tokio::spawn(self.clone().run_job(ticket.clone(), cancel_rx, stop_requested));

        Ok(ticket)
    }

    /// Best-effort stop. Never fails; see `StopReport::stopped`.
    ///
    /// The in-process job is claimed before the signal steps run, so a
    /// SIGTERM from `pkill` still ends it as `Cancelled`.
    pub async fn stop(&self) -> StopReport {
        let _control = self.inner.control.lock().await;

        let claimed = self.inner.active.lock().await.take();
        if let Some(job) = &claimed {
            job.stop_requested.store(true, Ordering::SeqCst);
        }

        let mut report = self.inner.lock.force_release().await;

        match claimed {
            Some(job) => {
                // The unit may already be gone after the signal steps; the
                // flag covers that.
                let _ = job.cancel.send(());
                report.push("job_unit", StepOutcome::Stopped);
            }
            None => {
                report.push("job_unit", StepOutcome::NothingToDo);
                // No unit will report in, so publish from here. Otherwise the
                // status recorder refreshes after writing the stopped outcome.
                if report.stopped() {
                    self.inner.status.refresh().await;
                }
            }
        }
        report
    }

    async fn run_job(
        self,
        ticket: JobTicket,
        cancel: oneshot::Receiver<()>,
        stop_requested: Arc<AtomicBool>,
    ) {
        let kind = ticket.kind;
        let exited = execute(&self.inner.settings.command, kind, ticket.timeout, cancel).await;
        let outcome = if stop_requested.load(Ordering::SeqCst) {
            JobOutcome::Cancelled
        } else {
            exited
        };

        match &outcome {
            JobOutcome::Succeeded => log::info!("{} finished", kind.label()),
            JobOutcome::Failed(msg) => log::error!("{} error: {msg}", kind.label()),
            JobOutcome::TimedOut(after) => {
                log::error!("{} timeout after {}s", kind.label(), after.as_secs())
            }
            JobOutcome::Cancelled => log::info!("{} cancelled by stop request", kind.label()),
        }

        {
            let mut active = self.inner.active.lock().await;
            if active.as_ref().map(|job| job.ticket.token) == Some(ticket.token) {
                *active = None;
            }
        }
        self.inner.lock.release_owned(ticket.token);

        let reboot = outcome.is_success()
            && self.inner.settings.post_action(kind) == PostAction::Reboot;

        let report = JobReport {
            kind,
            outcome,
            started_at_ms: ticket.started_at_ms,
            finished_at_ms: now_ms(),
        };
        if self.inner.reports.send(report).is_err() {
            log::warn!("Status recorder is gone, dropping {} report", kind.as_str());
        }

        if reboot {
            sleep(self.inner.settings.reboot_delay).await;
            log::info!("Rebooting after {}", kind.as_str());
            if let Err(e) = self.inner.system.reboot().await {
                log::error!("Reboot after {} failed: {e}", kind.as_str());
            }
        }
    }
}

/// Runs one job to completion, timeout or cancellation.
///
/// On timeout or cancel the child is sent SIGKILL but not waited for.
pub(crate) async fn execute(
    command: &[String],
    kind: JobKind,
    timeout: Duration,
    mut cancel: oneshot::Receiver<()>,
) -> JobOutcome {
    let Some((program, prefix)) = command.split_first() else {
        return JobOutcome::Failed("empty job command".to_string());
    };

    let mut cmd = Command::new(program);
    cmd.args(prefix)
        .arg(kind.mode_flag())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return JobOutcome::Failed(format!("failed to spawn {program}: {e}")),
    };

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => JobOutcome::Succeeded,
            Ok(status) => JobOutcome::Failed(format!("{program} exited with {status}")),
            Err(e) => JobOutcome::Failed(e.to_string()),
        },
        _ = sleep(timeout) => {
            let _ = child.start_kill();
            JobOutcome::TimedOut(timeout)
        }
        // A dropped sender is not a cancel request.
        Ok(()) = &mut cancel => {
            let _ = child.start_kill();
            JobOutcome::Cancelled
        }
    }
}
