use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing_log::LogTracer;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Size cap and number of rolled-over generations kept next to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 3,
        }
    }
}

impl RotationPolicy {
    /// `TESLAUSB_LOG_MAX_SIZE_MB` / `TESLAUSB_LOG_MAX_FILES`, falling back
    /// to the defaults when unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_bytes = std::env::var("TESLAUSB_LOG_MAX_SIZE_MB")
            .ok()
            .and_then(|mb| mb.parse::<u64>().ok())
            .map_or(defaults.max_bytes, |mb| mb.saturating_mul(1024 * 1024));
        let keep = std::env::var("TESLAUSB_LOG_MAX_FILES")
            .ok()
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(defaults.keep);
        Self { max_bytes, keep }
    }
}

/// The daemon log on the mutable partition. Once a write would push it past
/// `max_bytes` it becomes `<log>.1`, older generations shift up and the
/// oldest beyond `keep` is overwritten.
pub struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    file: File,
    written: u64,
}

impl RotatingFile {
    pub fn open<P: Into<PathBuf>>(path: P, policy: RotationPolicy) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            policy,
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn generation(&self, n: u32) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn roll_over(&mut self) -> io::Result<()> {
        if self.policy.keep > 0 {
            for n in (1..self.policy.keep).rev() {
                // Gaps in the chain are fine.
                let _ = fs::rename(self.generation(n), self.generation(n + 1));
            }
            fs::rename(&self.path, self.generation(1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A single oversized record still lands in an empty file.
        let over = self.written + buf.len() as u64 > self.policy.max_bytes;
        if over && self.written > 0 {
            self.roll_over()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Installs the process-wide log sink. Call once, before anything logs.
///
/// With a log file every handler appends timestamped lines to it through
/// `env_logger`. Without one, `log` records are bridged into a tracing
/// fmt layer on stderr.
pub fn init_logging(log_file: Option<&str>) {
    if let Some(path) = log_file {
        match RotatingFile::open(path, RotationPolicy::from_env()) {
            Ok(rot) => {
                let mut builder = env_logger::Builder::from_env(
                    env_logger::Env::default().default_filter_or("info"),
                );
                builder.target(env_logger::Target::Pipe(Box::new(rot)));
                if builder.try_init().is_ok() {
                    return;
                }
            }
            Err(e) => eprintln!("cannot open log file {path}: {e}; logging to stderr"),
        }
    }

    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
