// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// forgelink: find FlashForge printers on the LAN, read their status, check
// the camera, and send sliced jobs.
//
// Settings come from `FORGELINK_*` environment variables; `--ip` overrides
// the configured printer address for one invocation.  Logs go to stderr so
// `--json` output on stdout stays machine-readable.

mod render;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use forgelink_client::dashboard::resolve_target;
use forgelink_client::{
    CameraChecker, ControlSession, Dashboard, JobUploader, PrinterDiscovery, TcpSessionOpener,
};
use forgelink_core::config::{LinkConfig, parse_printer_addr};
use forgelink_core::error::{ForgeError, Result};
use forgelink_core::human_errors::{Severity, humanize_error};
use forgelink_core::types::{PrinterDescriptor, UploadJob};

use crate::render::Renderer;

#[derive(Parser)]
#[command(name = "forgelink")]
#[command(version, about = "LAN client for FlashForge 3D printers", long_about = None)]
struct Cli {
    /// Printer address (`ip` or `ip:port`); skips discovery
    #[arg(long, global = true)]
    ip: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover printers on the local network
    List {
        /// How long to listen for replies, in seconds
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// Show model, firmware, and serial number
    Info,

    /// Show machine state, temperatures, and job progress
    Status,

    /// Upload a sliced file to the printer
    Send {
        /// Local .gx or .gcode file
        file: PathBuf,

        /// Name to store the file under (defaults to the local file name)
        #[arg(short, long)]
        name: Option<String>,

        /// Start printing once the printer has the file
        #[arg(short, long)]
        print: bool,
    },

    /// Check whether the camera stream is serving
    Camera,

    /// Status and camera in one view
    Watch,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!(kind = err.kind(), error = %err, "command failed");
            let human = humanize_error(&err);
            eprintln!("error: {}", human.message);
            eprintln!("hint:  {}", human.suggestion);
            exit_code(human.severity)
        }
    }
}

/// 75 is `EX_TEMPFAIL`: worth running again.
fn exit_code(severity: Severity) -> ExitCode {
    match severity {
        Severity::Transient => ExitCode::from(75),
        Severity::ActionRequired => ExitCode::from(2),
        Severity::Permanent => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = LinkConfig::from_env()?;
    if let Some(ip) = cli.ip {
        parse_printer_addr(&ip)?;
        config.printer_addr = Some(ip);
    }
    let out = Renderer::new(cli.json);

    match cli.command {
        Commands::List { timeout } => {
            let timeout = match timeout {
                Some(secs) => Duration::try_from_secs_f64(secs)
                    .map_err(|e| ForgeError::Config(format!("--timeout {secs}: {e}")))?,
                None => config.discovery.timeout,
            };
            let printers = PrinterDiscovery::new(config.discovery.clone())
                .discover(timeout)
                .await?;
            println!("{}", out.printers(&printers)?);
        }
        Commands::Info => {
            let mut session = open_session(&config).await?;
            let result = session.info().await;
            session.close().await;
            let info = result?;
            let printer = session.descriptor().with_info(&info);
            println!("{}", out.info(&printer, &info)?);
        }
        Commands::Status => {
            let mut session = open_session(&config).await?;
            let result = session.status().await;
            session.close().await;
            println!("{}", out.status(session.descriptor(), &result?)?);
        }
        Commands::Send { file, name, print } => {
            let uploader = JobUploader::new(config.upload_chunk_size);
            let job = uploader.prepare(&file, name.as_deref(), print).await?;
            let mut session = open_session(&config).await?;
            let result = send(&uploader, &mut session, job, out).await;
            session.close().await;
            result?;
        }
        Commands::Camera => {
            let printer = target(&config).await?;
            let camera = CameraChecker::http(config.camera.clone())?
                .probe_default(&printer)
                .await;
            println!("{}", out.camera(&printer, &camera)?);
        }
        Commands::Watch => {
            let dashboard = Dashboard::new(
                PrinterDiscovery::new(config.discovery.clone()),
                TcpSessionOpener {
                    timeouts: config.session,
                },
                CameraChecker::http(config.camera.clone())?,
                config.discovery.watch_timeout,
            );
            let view = dashboard.watch(config.printer_override()?).await?;
            println!("{}", out.dashboard(&view)?);
        }
    }
    Ok(())
}

/// The configured printer, or the only one discovery finds.
async fn target(config: &LinkConfig) -> Result<PrinterDescriptor> {
    let discovery = PrinterDiscovery::new(config.discovery.clone());
    resolve_target(
        &discovery,
        config.printer_override()?,
        config.discovery.watch_timeout,
    )
    .await
}

async fn open_session(config: &LinkConfig) -> Result<ControlSession> {
    let printer = target(config).await?;
    ControlSession::connect(printer, config.session).await
}

async fn send(
    uploader: &JobUploader,
    session: &mut ControlSession,
    job: UploadJob,
    out: Renderer,
) -> Result<()> {
    let remote = job.remote_path();
    info!(file = %job.local_path.display(), remote = %remote, bytes = job.bytes_total, "sending");

    let mut upload = uploader.upload(session, job).await?;
    let mut last_tenth = 0;
    while let Some(update) = upload.next().await {
        let update = update?;
        if let Some(line) = out.upload_progress(&update, &remote)? {
            println!("{line}");
        } else if !out.is_json() && update.bytes_total > 0 {
            let tenth = update.bytes_sent * 10 / update.bytes_total;
            if tenth > last_tenth {
                last_tenth = tenth;
                eprintln!("  {}%", tenth * 10);
            }
        }
    }
    Ok(())
}
