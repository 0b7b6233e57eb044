use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::JobSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind: String,
    pub log_file: Option<String>,
    pub paths: PathsConfig,
    pub job: JobConfig,
    pub processes: ProcessConfig,
}

/// Filesystem locations shared with the rest of the appliance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub lock_file: PathBuf,
    pub status_file: PathBuf,
    /// Gadget attribute naming the bound UDC, empty or "none" when unbound.
    pub udc_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// argv prefix of the sync script; mode flags are appended.
    pub command: Vec<String>,
    pub sync_timeout_secs: u64,
    pub cleanup_timeout_secs: u64,
    pub status_timeout_secs: u64,
    pub reboot_delay_secs: u64,
    pub reboot_after_sync: bool,
    pub reboot_after_cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub transfer_process: String,
    pub liveness_pattern: String,
    pub job_script_pattern: String,
    pub command_timeout_secs: u64,
    pub reboot_command: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("/mutable/music_sync.lock"),
            status_file: PathBuf::from("/mutable/teslausb_status.json"),
            udc_file: PathBuf::from("/sys/kernel/config/usb_gadget/teslausb/UDC"),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            command: vec!["/root/bin/sync-music.sh".to_string()],
            sync_timeout_secs: 2 * 60 * 60,
            cleanup_timeout_secs: 10 * 60,
            status_timeout_secs: 10,
            reboot_delay_secs: 2,
            reboot_after_sync: true,
            reboot_after_cleanup: true,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            transfer_process: "rsync".to_string(),
            liveness_pattern: "rsync.*".to_string(),
            job_script_pattern: "sync-music.sh".to_string(),
            command_timeout_secs: 5,
            reboot_command: vec!["reboot".to_string()],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9999".to_string(),
            log_file: Some("/mutable/teslausb_api.log".to_string()),
            paths: PathsConfig::default(),
            job: JobConfig::default(),
            processes: ProcessConfig::default(),
        }
    }
}

impl Config {
    /// Reads a JSON config file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: Config = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.job.command.is_empty() {
            anyhow::bail!("job.command must name at least the program to run");
        }
        if self.processes.reboot_command.is_empty() {
            anyhow::bail!("processes.reboot_command must not be empty");
        }
        Ok(())
    }

    pub fn job_settings(&self) -> JobSettings {
        JobSettings {
            command: self.job.command.clone(),
            sync_timeout: Duration::from_secs(self.job.sync_timeout_secs),
            cleanup_timeout: Duration::from_secs(self.job.cleanup_timeout_secs),
            reboot_delay: Duration::from_secs(self.job.reboot_delay_secs),
            reboot_after_sync: self.job.reboot_after_sync,
            reboot_after_cleanup: self.job.reboot_after_cleanup,
        }
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.job.status_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.processes.command_timeout_secs)
    }
}
