//! Tor control port access
//!
//! [`TorController`] speaks the control protocol; [`TorControl`] is the
//! subset of it the hidden service manager relies on.

pub mod control;
pub mod error;
pub mod protocol;

pub use control::{ControllerOptions, TorController};
pub use error::{ControlError, Result};

use std::net::SocketAddr;
use std::path::Path;

/// Suffix appended to service IDs to form hostnames
pub const ONION_SUFFIX: &str = ".onion";

/// Onion virtual port and the local address it forwards to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub public_port: u16,
    pub target: SocketAddr,
}

/// Hidden service operations on an open control session
#[allow(async_fn_in_trait)]
pub trait TorControl {
    /// Authenticate the session
    async fn authenticate(&mut self) -> Result<()>;

    /// Publish an in-memory service; returns its service ID (no suffix)
    async fn create_ephemeral_hidden_service(
        &mut self,
        mapping: PortMapping,
        await_publication: bool,
    ) -> Result<String>;

    async fn remove_ephemeral_hidden_service(&mut self, service_id: &str) -> Result<()>;

    /// Publish a service whose keys live in `directory`; returns its hostname
    async fn create_hidden_service(&mut self, directory: &Path, mapping: PortMapping)
        -> Result<String>;

    async fn remove_hidden_service(&mut self, directory: &Path) -> Result<()>;

    /// Value of a Tor configuration option, `None` when unset
    async fn get_conf(&mut self, key: &str) -> Result<Option<String>>;
}

impl TorControl for TorController {
    async fn authenticate(&mut self) -> Result<()> {
        TorController::authenticate(self).await
    }

    async fn create_ephemeral_hidden_service(
        &mut self,
        mapping: PortMapping,
        await_publication: bool,
    ) -> Result<String> {
        self.add_onion(mapping, await_publication).await
    }

    async fn remove_ephemeral_hidden_service(&mut self, service_id: &str) -> Result<()> {
        self.del_onion(service_id).await
    }

    async fn create_hidden_service(
        &mut self,
        directory: &Path,
        mapping: PortMapping,
    ) -> Result<String> {
        TorController::create_hidden_service(self, directory, mapping).await
    }

    async fn remove_hidden_service(&mut self, directory: &Path) -> Result<()> {
        TorController::remove_hidden_service(self, directory).await
    }

    async fn get_conf(&mut self, key: &str) -> Result<Option<String>> {
        TorController::get_conf(self, key).await
    }
}
