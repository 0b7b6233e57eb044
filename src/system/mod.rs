//! Host primitives the daemon delegates to: process signalling, liveness
//! probing and reboot.
//!
//! All of them shell out to the usual procps/systemd tools. Each call is
//! independently fallible and bounded by a timeout so a wedged tool can
//! never hang a request handler.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait SystemControl: Send + Sync {
    /// SIGTERM every process whose name is exactly `name`.
    /// Returns true if at least one process was signalled.
    async fn signal_by_name(&self, name: &str) -> io::Result<bool>;

    /// SIGTERM every process whose full command line matches `pattern`.
    async fn signal_by_pattern(&self, pattern: &str) -> io::Result<bool>;

    /// True if any process command line matches `pattern`.
    async fn is_running(&self, pattern: &str) -> io::Result<bool>;

    /// Irreversible. Implementations may return before the host goes down.
    async fn reboot(&self) -> io::Result<()>;
}

/// `SystemControl` backed by `pkill`, `pgrep` and the configured reboot
/// command.
#[derive(Debug, Clone)]
pub struct HostSystem {
    command_timeout: Duration,
    reboot_command: Vec<String>,
}

impl HostSystem {
    pub fn new(command_timeout: Duration, reboot_command: Vec<String>) -> Self {
        Self {
            command_timeout,
            reboot_command,
        }
    }

    async fn run_status(&self, program: &str, args: &[&str]) -> io::Result<bool> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.command_timeout, cmd.status()).await {
            Ok(status) => Ok(status?.success()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{program} did not finish within {:?}", self.command_timeout),
            )),
        }
    }
}

#[async_trait]
impl SystemControl for HostSystem {
    async fn signal_by_name(&self, name: &str) -> io::Result<bool> {
        self.run_status("pkill", &["-TERM", name]).await
    }

    async fn signal_by_pattern(&self, pattern: &str) -> io::Result<bool> {
        self.run_status("pkill", &["-TERM", "-f", pattern]).await
    }

    async fn is_running(&self, pattern: &str) -> io::Result<bool> {
        self.run_status("pgrep", &["-f", pattern]).await
    }

    async fn reboot(&self) -> io::Result<()> {
        let (program, args) = self
            .reboot_command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty reboot command"))?;
        let status = Command::new(program).args(args).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("reboot command exited with {status}"),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records calls and answers from preset flags.
    #[derive(Default)]
    pub(crate) struct FakeSystem {
        pub running: AtomicBool,
        pub signal_hits: AtomicBool,
        pub fail_signals: AtomicBool,
        pub signals: AtomicUsize,
        pub reboots: AtomicUsize,
    }

    #[async_trait]
    impl SystemControl for FakeSystem {
        async fn signal_by_name(&self, _name: &str) -> io::Result<bool> {
            self.signal()
        }

        async fn signal_by_pattern(&self, _pattern: &str) -> io::Result<bool> {
            self.signal()
        }

        async fn is_running(&self, _pattern: &str) -> io::Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }

        async fn reboot(&self) -> io::Result<()> {
            self.reboots.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl FakeSystem {
        fn signal(&self) -> io::Result<bool> {
            self.signals.fetch_add(1, Ordering::SeqCst);
            if self.fail_signals.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "pkill: not found"));
            }
            Ok(self.signal_hits.load(Ordering::SeqCst))
        }
    }
}
