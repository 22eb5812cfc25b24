//! torshare - share one file over a Tor onion service
//!
//! 1. Connect to the local Tor control port (9051, then 9151)
//! 2. Start the file server as a child process on 127.0.0.1:5000
//! 3. Publish an onion service mapping port 80 to it, ephemeral first,
//!    file-based if Tor refuses
//! 4. On Ctrl+C, remove the service and stop the child

use clap::Parser;
use torshare::cli::Cli;
use torshare::commands::execute_command;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    torshare::logging::init();

    let cli = Cli::parse();

    if let Err(e) = execute_command(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
