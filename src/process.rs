//! File server child process management
//!
//! The file server runs as a separate OS process: the current executable
//! re-invoked with the hidden `serve` subcommand. It prints [`READY_LINE`] on
//! stdout once its listener is bound. Closing the child's stdin asks it to
//! shut down; a hard kill follows if it does not exit in time.

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Printed by the file server once it owns its listening socket
pub const READY_LINE: &str = "torshare-ready";

/// How to launch the file server child
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments to pass to it
    pub args: Vec<OsString>,

    /// Address the child listens on once ready
    pub listen_addr: SocketAddr,
}

impl ProcessConfig {
    /// Re-invoke `program` as a file server for `file` on `listen_addr`
    pub fn file_server(program: PathBuf, file: &Path, listen_addr: SocketAddr) -> Self {
        Self {
            program,
            args: vec![
                "serve".into(),
                "--file".into(),
                file.as_os_str().to_os_string(),
                "--host".into(),
                listen_addr.ip().to_string().into(),
                "--port".into(),
                listen_addr.port().to_string().into(),
            ],
            listen_addr,
        }
    }
}

/// How a child ended when asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// It had already exited
    AlreadyExited,
    /// It exited after its stdin was closed
    Graceful,
    /// It ignored the request and was killed
    Killed,
}

/// A running file server child
pub struct ServerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    listen_addr: SocketAddr,
}

impl ServerProcess {
    /// Spawn the child. Must be called inside a tokio runtime.
    pub fn spawn(config: &ProcessConfig) -> Result<Self> {
        info!("Spawning file server process...");
        debug!("  Command: {:?}", config.program);
        debug!("  Args: {:?}", config.args);

        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", config.program))?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

        info!("File server spawned with PID: {:?}", child.id());

        Ok(Self {
            child,
            stdin,
            stdout,
            listen_addr: config.listen_addr,
        })
    }

    /// Process ID, or `None` once the child has been reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the child is still alive
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait until the child reports that it has bound its listen address.
    ///
    /// A connection test would also succeed against some other process
    /// already holding the port, so only the child's own report counts.
    pub async fn wait_for_ready(&mut self, timeout: Duration) -> Result<()> {
        info!("Waiting for file server on {}...", self.listen_addr);

        let Some(lines) = self.stdout.as_mut() else {
            bail!("File server output is not captured");
        };

        let waited = tokio::time::timeout(timeout, async {
            while let Some(line) = lines.next_line().await? {
                if line.starts_with(READY_LINE) {
                    return Ok(true);
                }
                debug!("File server: {}", line);
            }
            Ok::<_, std::io::Error>(false)
        })
        .await;

        match waited {
            Ok(Ok(true)) => {
                info!("File server is listening on {}", self.listen_addr);
                Ok(())
            }
            Ok(Ok(false)) => match self.child.try_wait()? {
                Some(status) => bail!("File server exited before becoming ready ({})", status),
                None => bail!("File server closed its output before becoming ready"),
            },
            Ok(Err(e)) => Err(e).context("Failed to read file server output"),
            Err(_) => bail!("File server not ready after {:?}", timeout),
        }
    }

    /// Ask the child to exit, wait up to `timeout`, then kill it
    pub async fn stop(mut self, timeout: Duration) -> Result<StopOutcome> {
        if self.child.try_wait()?.is_some() {
            debug!("File server had already exited");
            return Ok(StopOutcome::AlreadyExited);
        }

        info!("Stopping file server (PID: {:?})...", self.pid());

        // EOF on stdin is the child's shutdown signal
        drop(self.stdin.take());

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("Failed to wait for file server")?;
                info!("File server exited ({})", status);
                Ok(StopOutcome::Graceful)
            }
            Err(_) => {
                warn!(
                    "File server did not exit within {:?}, killing it",
                    timeout
                );
                self.child
                    .kill()
                    .await
                    .context("Failed to kill file server")?;
                Ok(StopOutcome::Killed)
            }
        }
    }
}
