// Command handlers

use crate::cli::{Cli, Command};
use crate::config::Settings;
use crate::hidden_service::HiddenServiceManager;
use crate::process::READY_LINE;
use crate::server::FileServer;
use crate::share::SharedFile;
use crate::tor::{ControllerOptions, TorController};
use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Run the parsed command line
pub async fn execute_command(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;

    match cli.command {
        Command::Share { file } => share(settings, &file).await,
        Command::Check => check(settings).await,
        Command::Serve { file, host } => serve(settings, &file, host).await,
    }
}

async fn share(settings: Settings, file: &Path) -> Result<()> {
    if !file.is_file() {
        warn!("{:?} is not a readable regular file; downloads will fail", file);
    }

    let mut manager = HiddenServiceManager::with_current_exe(settings.clone())?;

    if !manager.connect().await {
        bail!(
            "Could not reach a Tor control port on {} (tried {:?}). Is Tor running with ControlPort enabled?",
            settings.control_host,
            settings.control_ports
        );
    }
    manager.authenticate().await?;

    let hostname = manager.create_service(file).await?;

    println!("http://{}", hostname);
    info!("Sharing {:?}. Press Ctrl+C to stop.", file);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    let report = manager.stop_service().await;
    if report.is_clean() {
        info!("Stopped: {}", report);
    } else {
        warn!("Stopped with errors: {}", report);
    }
    Ok(())
}

async fn check(settings: Settings) -> Result<()> {
    let options = ControllerOptions {
        password: settings.control_password.clone(),
        cookie_file: settings.cookie_file.clone(),
        command_timeout: settings.command_timeout(),
        publish_timeout: settings.publish_timeout(),
    };

    for port in &settings.control_ports {
        let mut controller =
            match TorController::connect(&settings.control_host, *port, options.clone()).await {
                Ok(controller) => controller,
                Err(e) => {
                    warn!("Control port {} unavailable: {}", port, e);
                    continue;
                }
            };

        controller
            .authenticate()
            .await
            .with_context(|| format!("Authentication on control port {} failed", port))?;
        let version = controller.get_info("version").await?;

        println!("Control port: {}:{}", settings.control_host, port);
        println!("Tor version:  {}", version);
        return Ok(());
    }

    bail!(
        "No Tor control port reachable on {} (tried {:?})",
        settings.control_host,
        settings.control_ports
    )
}

async fn serve(settings: Settings, file: &Path, host: Option<IpAddr>) -> Result<()> {
    let host = host.unwrap_or(settings.listen_host);
    if !host.is_loopback() {
        bail!("The file server only binds to loopback addresses, got {}", host);
    }
    let addr = SocketAddr::new(host, settings.listen_port);

    let server = FileServer::new(addr, SharedFile::from_path(file));
    server.run_until(shutdown_signal(), announce_ready).await
}

/// Tell the parent the listener is bound
fn announce_ready(addr: SocketAddr) {
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{} {}", READY_LINE, addr).and_then(|()| stdout.flush()) {
        warn!("Failed to report readiness: {}", e);
    }
}

/// Resolves when the parent closes our stdin or on Ctrl+C
async fn shutdown_signal() {
    let stdin_closed = stdin_closed();
    tokio::select! {
        _ = stdin_closed => info!("Parent closed stdin, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
}

fn stdin_closed() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    // A plain thread so a blocked read never holds up runtime shutdown
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = tx.send(());
    });
    rx
}
