// Command-line interface

use crate::config::Settings;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// torshare - share a file as a Tor onion service
///
/// Requires a running Tor with its control port open (9051 or 9151 by default).
#[derive(Debug, Parser)]
#[command(name = "torshare", author, version, about, long_about = None)]
pub struct Cli {
    /// JSON settings file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Control port to try (repeat to try several, in order)
    #[arg(long = "control-port", global = true)]
    pub control_ports: Vec<u16>,

    /// Password for Tor's HashedControlPassword
    #[arg(long, global = true)]
    pub control_password: Option<String>,

    /// Control auth cookie to use instead of the one Tor advertises
    #[arg(long, global = true)]
    pub cookie_file: Option<PathBuf>,

    /// Local port for the file server
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Publish a file and serve it until interrupted
    Share {
        /// File to share
        file: PathBuf,
    },

    /// Check that Tor's control port is reachable and accepts our credentials
    Check,

    /// Run the file server (started by `share`)
    #[command(hide = true)]
    Serve {
        #[arg(long)]
        file: PathBuf,

        /// Loopback address to bind; the port comes from `--port`
        #[arg(long)]
        host: Option<IpAddr>,
    },
}

impl Cli {
    /// Settings from `--config` (or defaults) with command-line overrides applied
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if !self.control_ports.is_empty() {
            settings.control_ports = self.control_ports.clone();
        }
        if let Some(password) = &self.control_password {
            settings.control_password = Some(password.clone());
        }
        if let Some(cookie) = &self.cookie_file {
            settings.cookie_file = Some(cookie.clone());
        }
        if let Some(port) = self.port {
            settings.listen_port = port;
        }

        settings.validate()?;
        Ok(settings)
    }
}
