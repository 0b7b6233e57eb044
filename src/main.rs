use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::mpsc;

use teslausb::jobs::{JobReport, StopTargets};
use teslausb::logging::init_logging;
use teslausb::network::run_http_api;
use teslausb::status::run_status_recorder;
use teslausb::{
    ApiContext, Config, ConnectivityProbe, HostSystem, JobRunner, LockManager, StatusProvider,
    SystemControl,
};

#[derive(Subcommand)]
enum AdminCmd {
    /// Print the status document
    Status {
        /// Daemon HTTP address, e.g. 127.0.0.1:9999
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
    /// Print the service descriptor
    Info {
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
    /// Start a music sync
    Sync {
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
    /// Start a cleanup
    Cleanup {
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
    /// Stop whatever job is running
    Stop {
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
    /// Reboot the device
    Reboot {
        #[arg(short = 'H', long, default_value = "127.0.0.1:9999")]
        http: String,
    },
}

fn http_request(
    host_port: &str,
    method: &str,
    path: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    let mut stream = TcpStream::connect(host_port)?;
    let req = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path, host_port
    );
    stream.write_all(req.as_bytes())?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf)?;
    let resp = String::from_utf8_lossy(&buf);
    if let Some(pos) = resp.find("\r\n\r\n") {
        Ok(resp[pos + 4..].to_string())
    } else {
        Ok(resp.to_string())
    }
}

#[derive(Parser)]
#[command(name = "teslausb-api")]
#[command(about = "Control daemon for TeslaUSB sync, cleanup and reboot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control daemon
    Serve {
        /// JSON config file; built-in defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Log file (overrides the config file and TESLAUSB_LOG_FILE)
        #[arg(long)]
        log_file: Option<String>,

        /// Log to stderr instead of a file
        #[arg(long)]
        no_log_file: bool,
    },

    /// Talk to a running daemon
    Admin {
        #[command(subcommand)]
        cmd: AdminCmd,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            bind,
            log_file,
            no_log_file,
        } => {
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            if let Ok(path) = std::env::var("TESLAUSB_LOG_FILE") {
                cfg.log_file = Some(path);
            }
            if let Some(path) = log_file {
                cfg.log_file = Some(path);
            }
            if no_log_file {
                cfg.log_file = None;
            }

            init_logging(cfg.log_file.as_deref());
            serve(cfg).await?;
        }
        Command::Admin { cmd } => {
            let (http, method, path) = match cmd {
                AdminCmd::Status { http } => (http, "GET", "/status"),
                AdminCmd::Info { http } => (http, "GET", "/"),
                AdminCmd::Sync { http } => (http, "POST", "/sync"),
                AdminCmd::Cleanup { http } => (http, "POST", "/cleanup"),
                AdminCmd::Stop { http } => (http, "POST", "/stop"),
                AdminCmd::Reboot { http } => (http, "POST", "/reboot"),
            };
            let body = http_request(&http, method, path)?;
            println!("{}", body);
        }
    }

    Ok(())
}

async fn serve(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = cfg.bind.parse()?;

    let system: Arc<dyn SystemControl> = Arc::new(HostSystem::new(
        cfg.command_timeout(),
        cfg.processes.reboot_command.clone(),
    ));

    let lock = LockManager::new(
        cfg.paths.lock_file.clone(),
        Arc::clone(&system),
        StopTargets {
            transfer_process: cfg.processes.transfer_process.clone(),
            liveness_pattern: cfg.processes.liveness_pattern.clone(),
            job_script_pattern: cfg.processes.job_script_pattern.clone(),
        },
    );
    if lock.path().exists() {
        // Could be a live job script or a leftover from a crash; stop clears it.
        match lock.owner() {
            Some(owner) => warn!(
                "Job lock {} present at startup ({} started by pid {} at {} ms)",
                lock.path().display(),
                owner.kind.as_str(),
                owner.pid,
                owner.started_at_ms
            ),
            None => warn!("Job lock {} present at startup", lock.path().display()),
        }
    }

    let status = StatusProvider::new(
        cfg.paths.status_file.clone(),
        cfg.job.command.clone(),
        cfg.status_timeout(),
    );

    let (report_tx, report_rx) = mpsc::unbounded_channel::<JobReport>();
    tokio::spawn(run_status_recorder(report_rx, status.clone()));

    let runner = JobRunner::new(
        cfg.job_settings(),
        lock,
        ConnectivityProbe::new(cfg.paths.udc_file.clone()),
        status.clone(),
        Arc::clone(&system),
        report_tx,
    );

    let ctx = Arc::new(ApiContext {
        runner,
        status,
        system,
        reboot_delay: cfg.job_settings().reboot_delay,
    });

    info!("TeslaUSB API Server starting on {addr}");
    info!("Endpoints:");
    info!("  GET  /status  - Get current status");
    info!("  POST /sync    - Start music sync");
    info!("  POST /cleanup - Run cleanup only");
    info!("  POST /stop    - Stop running sync");
    info!("  POST /reboot  - Reboot system");

    run_http_api(addr, ctx, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down server...");
    })
    .await?;

    Ok(())
}
