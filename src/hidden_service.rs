//! Hidden service lifecycle
//!
//! [`HiddenServiceManager`] owns the control session, the file server child
//! and the published service. It prefers an ephemeral service and falls back
//! to a file-based one under Tor's DataDirectory.
//!
//! Methods take `&mut self`, so callers are serialized by the borrow checker.
//! Share a manager between tasks by wrapping it in a `tokio::sync::Mutex`.

use crate::config::Settings;
use crate::process::{ProcessConfig, ServerProcess};
use crate::share::SharedFile;
use crate::tor::{
    ControlError, ControllerOptions, PortMapping, TorControl, TorController, ONION_SUFFIX,
};
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// The published service, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceHandle {
    /// Created with `ADD_ONION`; lives only as long as Tor keeps it
    Ephemeral { service_id: String },
    /// Configured through `HiddenServiceDir`; keys live in `directory`
    FileBased { directory: PathBuf },
}

/// One teardown step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    RemoveEphemeralService,
    RemoveFileBasedService,
    RemoveDescriptorDirectory,
    StopFileServer,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStep::RemoveEphemeralService => "remove ephemeral service",
            CleanupStep::RemoveFileBasedService => "remove file-based service",
            CleanupStep::RemoveDescriptorDirectory => "remove descriptor directory",
            CleanupStep::StopFileServer => "stop file server",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub step: CleanupStep,
    /// Error message when the step failed
    pub error: Option<String>,
}

/// What `stop_service` did. Steps run independently; failures do not stop
/// later steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub outcomes: Vec<CleanupOutcome>,
}

impl CleanupReport {
    fn record(&mut self, step: CleanupStep, result: Result<()>) {
        let error = match result {
            Ok(()) => {
                debug!("Cleanup: {} ok", step);
                None
            }
            Err(e) => {
                warn!("Cleanup: {} failed: {:#}", step, e);
                Some(format!("{:#}", e))
            }
        };
        self.outcomes.push(CleanupOutcome { step, error });
    }

    /// Nothing needed cleaning up
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Every step succeeded
    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupOutcome> {
        self.outcomes.iter().filter(|o| o.error.is_some())
    }

    pub fn ran(&self, step: CleanupStep) -> bool {
        self.outcomes.iter().any(|o| o.step == step)
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.outcomes.is_empty() {
            return f.write_str("nothing to clean up");
        }
        let parts: Vec<String> = self
            .outcomes
            .iter()
            .map(|o| match &o.error {
                None => format!("{}: ok", o.step),
                Some(e) => format!("{}: {}", o.step, e),
            })
            .collect();
        f.write_str(&parts.join("; "))
    }
}

/// Publishes one file at a time as an onion service
pub struct HiddenServiceManager<C> {
    settings: Settings,
    server_program: PathBuf,
    controller: Option<C>,
    authenticated: bool,
    handle: Option<ServiceHandle>,
    hostname: Option<String>,
    server: Option<ServerProcess>,
    shared_file: Option<SharedFile>,
}

impl<C: TorControl> HiddenServiceManager<C> {
    /// `server_program` is the executable re-invoked as the file server
    pub fn new(settings: Settings, server_program: PathBuf) -> Self {
        Self {
            settings,
            server_program,
            controller: None,
            authenticated: false,
            handle: None,
            hostname: None,
            server: None,
            shared_file: None,
        }
    }

    /// Try each configured control port in order and keep the first session.
    ///
    /// Failures are logged; returns whether a session was obtained.
    pub async fn connect_with<F, Fut>(&mut self, mut connector: F) -> bool
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = crate::tor::Result<C>>,
    {
        for port in self.settings.control_ports.clone() {
            match connector(port).await {
                Ok(controller) => {
                    info!("Connected to Tor control port {}", port);
                    self.controller = Some(controller);
                    self.authenticated = false;
                    return true;
                }
                Err(e) => warn!("Tor control port {} unavailable: {}", port, e),
            }
        }

        warn!(
            "No Tor control port reachable (tried {:?})",
            self.settings.control_ports
        );
        false
    }

    /// Authenticate the control session. Errors are returned, not suppressed.
    pub async fn authenticate(&mut self) -> Result<()> {
        let controller = self
            .controller
            .as_mut()
            .ok_or(ControlError::NotConnected)?;
        controller
            .authenticate()
            .await
            .context("Tor control port authentication failed")?;
        self.authenticated = true;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Hostname of the published service
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn handle(&self) -> Option<&ServiceHandle> {
        self.handle.as_ref()
    }

    /// The file currently being served
    pub fn shared_file(&self) -> Option<&SharedFile> {
        self.shared_file.as_ref()
    }

    /// PID of the file server child, if one is running
    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().and_then(ServerProcess::pid)
    }

    fn mapping(&self) -> PortMapping {
        PortMapping {
            public_port: self.settings.public_port,
            target: self.settings.listen_addr(),
        }
    }

    /// Serve `filepath` and publish it. Returns the onion hostname.
    ///
    /// Any active service is torn down first.
    pub async fn create_service(&mut self, filepath: &Path) -> Result<String> {
        if self.controller.is_none() {
            return Err(ControlError::NotConnected.into());
        }
        if !self.authenticated {
            bail!("Tor control session is not authenticated");
        }

        if self.handle.is_some() || self.server.is_some() {
            info!("A service is already active, stopping it first");
            let report = self.stop_service().await;
            if !report.is_clean() {
                warn!("Previous service did not stop cleanly: {}", report);
            }
        }

        self.start_server(filepath).await?;

        let mapping = self.mapping();
        let ephemeral = match self.controller.as_mut() {
            Some(controller) => controller
                .create_ephemeral_hidden_service(mapping, true)
                .await
                .map_err(anyhow::Error::from),
            None => Err(ControlError::NotConnected.into()),
        };

        match ephemeral {
            Ok(service_id) => {
                let hostname = format!("{}{}", service_id, ONION_SUFFIX);
                info!("Ephemeral onion service published: {}", hostname);
                self.handle = Some(ServiceHandle::Ephemeral { service_id });
                self.hostname = Some(hostname.clone());
                return Ok(hostname);
            }
            Err(e) => warn!(
                "Ephemeral onion service failed ({:#}), falling back to a file-based service",
                e
            ),
        }

        match self.publish_file_based(mapping).await {
            Ok(hostname) => {
                info!("File-based onion service published: {}", hostname);
                self.hostname = Some(hostname.clone());
                Ok(hostname)
            }
            Err(e) => {
                let report = self.stop_service().await;
                debug!("Cleanup after failed publication: {}", report);
                Err(e.context("Failed to publish onion service"))
            }
        }
    }

    async fn start_server(&mut self, filepath: &Path) -> Result<()> {
        let share = SharedFile::from_path(filepath);
        let config = ProcessConfig::file_server(
            self.server_program.clone(),
            filepath,
            self.settings.listen_addr(),
        );

        let mut server = ServerProcess::spawn(&config)?;
        if let Err(e) = server.wait_for_ready(self.settings.ready_timeout()).await {
            if let Err(stop_err) = server.stop(self.settings.stop_timeout()).await {
                warn!("Failed to stop file server: {:#}", stop_err);
            }
            return Err(e.context("File server failed to start"));
        }

        info!(
            "Serving {:?} ({}) on {}",
            share.name,
            share
                .size
                .map(|s| format!("{} bytes", s))
                .unwrap_or_else(|| "unknown size".to_string()),
            self.settings.listen_addr()
        );
        self.server = Some(server);
        self.shared_file = Some(share);
        Ok(())
    }

    async fn publish_file_based(&mut self, mapping: PortMapping) -> Result<String> {
        let controller = self
            .controller
            .as_mut()
            .ok_or(ControlError::NotConnected)?;

        let data_dir = controller
            .get_conf("DataDirectory")
            .await
            .context("Failed to read Tor's DataDirectory")?
            .map(PathBuf::from)
            .unwrap_or_else(|| self.settings.fallback_data_dir.clone());
        let directory = data_dir.join(&self.settings.descriptor_dir_name);

        // Recorded before the attempt so a partial configuration is torn down too
        self.handle = Some(ServiceHandle::FileBased {
            directory: directory.clone(),
        });

        controller
            .create_hidden_service(&directory, mapping)
            .await
            .with_context(|| format!("Failed to create hidden service in {:?}", directory))
    }

    /// Tear down whatever is active. Always completes and always clears the
    /// hostname; individual failures are reported, not returned.
    pub async fn stop_service(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.handle.take() {
            Some(ServiceHandle::Ephemeral { service_id }) => {
                let result = match self.controller.as_mut() {
                    Some(controller) => controller
                        .remove_ephemeral_hidden_service(&service_id)
                        .await
                        .map_err(anyhow::Error::from),
                    None => Err(ControlError::NotConnected.into()),
                };
                report.record(CleanupStep::RemoveEphemeralService, result);
            }
            Some(ServiceHandle::FileBased { directory }) => {
                let result = match self.controller.as_mut() {
                    Some(controller) => controller
                        .remove_hidden_service(&directory)
                        .await
                        .map_err(anyhow::Error::from),
                    None => Err(ControlError::NotConnected.into()),
                };
                report.record(CleanupStep::RemoveFileBasedService, result);

                let result = match tokio::fs::remove_dir_all(&directory).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(anyhow!(e).context(format!("removing {:?}", directory))),
                };
                report.record(CleanupStep::RemoveDescriptorDirectory, result);
            }
            None => {}
        }

        if let Some(server) = self.server.take() {
            let result = server
                .stop(self.settings.stop_timeout())
                .await
                .map(|outcome| debug!("File server stop: {:?}", outcome));
            report.record(CleanupStep::StopFileServer, result);
        }

        self.shared_file = None;
        self.hostname = None;
        report
    }
}

impl HiddenServiceManager<TorController> {
    /// Manager that re-invokes the running executable as its file server
    pub fn with_current_exe(settings: Settings) -> Result<Self> {
        let program = std::env::current_exe().context("Cannot locate the torshare executable")?;
        Ok(Self::new(settings, program))
    }

    /// Connect to the local Tor daemon's control port
    pub async fn connect(&mut self) -> bool {
        let host = self.settings.control_host.clone();
        let options = ControllerOptions {
            password: self.settings.control_password.clone(),
            cookie_file: self.settings.cookie_file.clone(),
            command_timeout: self.settings.command_timeout(),
            publish_timeout: self.settings.publish_timeout(),
        };

        let host = &host;
        self.connect_with(move |port| TorController::connect(host, port, options.clone()))
            .await
    }
}
