use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use swu_upgrader::config::{self, ClientConfig};
use swu_upgrader::models::UpgradeSession;
use swu_upgrader::upgrade::{StatusKind, UpgradeMonitor, Upgrader};
use swu_upgrader::utils::{format_bytes, format_speed};

/// CLI client driving a firmware upgrade on a remote device
#[derive(Parser, Debug)]
#[clap(name = "swu-upgrader", about = "Upload and install a firmware image on a remote device")]
struct Args {
    /// Path to the firmware image (.swu)
    file: PathBuf,

    /// Base URL of the device web interface (e.g. http://192.168.1.1)
    #[clap(short, long)]
    url: Option<String>,

    /// Session credential for the device RPC bus
    #[clap(short, long)]
    session_id: Option<String>,

    /// Completely erase user data (including the device configuration)
    #[clap(long)]
    clear_data: bool,

    /// Simulate the installation without flashing
    #[clap(long)]
    dry_run: bool,

    /// Persist the resolved URL and session credential for later runs
    #[clap(long)]
    save_config: bool,

    /// Enable debug logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = init_tracing(args.verbose)?;

    let config_path = ClientConfig::default_path()?;
    let mut config = ClientConfig::load(&config_path)?;
    if let Some(url) = args.url {
        config.base_url = url;
    }
    if let Some(session_id) = args.session_id {
        config.session_id = session_id;
    }
    if args.save_config {
        config.save(&config_path)?;
    }

    let session = UpgradeSession::from_file(&args.file, args.clear_data, args.dry_run)
        .await
        .context("failed to read firmware file")?;

    println!("Firmware Upgrade");
    println!("================");
    println!();
    println!("File: {}", session.file_name);
    println!(
        "Size: {} ({} bytes)",
        format_bytes(session.file_size as f64),
        session.file_size
    );
    if !session.software_set.is_empty() {
        println!("Software set: {}", session.software_set);
        println!("Running mode: {}", session.running_mode);
    }
    println!(
        "Erase user data: {}",
        if session.clear_data { "yes" } else { "no" }
    );
    if session.dry_run {
        println!("Dry run: yes");
    }
    println!("Device: {}", config.base_url);
    println!();

    info!("upgrading {} on {}", session.file_name, config.base_url);

    let (mut upgrader, monitor) = Upgrader::new(config);

    let cancel = upgrader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling upgrade...");
            cancel.cancel();
        }
    });

    render_progress(monitor);

    match upgrader.run(&session).await {
        Ok(report) => {
            println!();
            if let Some(version) = &report.version {
                println!("Firmware version: {version}");
            }
            if let Some(items) = report.items_installed {
                println!("Items installed: {items}");
            }
            if report.rebooted {
                println!("Device rebooted and is reachable again");
            }
            println!("Upgrade successfully completed");
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("Upgrade failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Print progress and status updates as the session advances.
fn render_progress(monitor: UpgradeMonitor) {
    let UpgradeMonitor {
        mut status,
        mut upload,
        mut install,
    } = monitor;

    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let line = status.borrow_and_update().clone();
            let label = match line.kind {
                StatusKind::Ready => "ready",
                StatusKind::Working => "busy",
                StatusKind::Success => "ok",
                StatusKind::Error => "error",
            };
            println!("[{label}] {}", line.message);
        }
    });

    tokio::spawn(async move {
        let mut last_percent = -1i64;
        let mut speed_was_known = false;
        while let Some(p) = upload.recv().await {
            let percent = p.percent as i64;
            let decayed = speed_was_known && p.current_speed.is_none();
            if percent == last_percent && !decayed {
                continue;
            }
            last_percent = percent;
            speed_was_known = p.current_speed.is_some();

            println!(
                "Uploading: {:6.2}%  {} of {}  current {}  average {}",
                p.percent,
                format_bytes(p.bytes_uploaded as f64),
                format_bytes(p.total_bytes as f64),
                speed(p.current_speed),
                speed(p.average_speed),
            );
        }
    });

    tokio::spawn(async move {
        while install.changed().await.is_ok() {
            let p = install.borrow_and_update().clone();
            if p.step > 0 {
                println!(
                    "Installing: {:6.2}%  step {} of {}",
                    p.percent, p.step, p.nsteps
                );
            }
        }
    });
}

fn speed(value: Option<f64>) -> String {
    match value {
        Some(v) => format_speed(v),
        None => "-".to_string(),
    }
}

/// Log to stderr and to a daily file under the user data directory.
fn init_tracing(verbose: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    let log_dir = config::project_dirs()?.data_dir().join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "swu-upgrader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}
