//! torshare - share a single file as a Tor onion service
//!
//! A loopback HTTP file server runs in a child process and is published
//! through the local Tor daemon's control port.

pub mod cli;
pub mod commands;
pub mod config;
pub mod hidden_service;
pub mod logging;
pub mod process;
pub mod server;
pub mod share;
pub mod tor;

pub use config::Settings;
pub use hidden_service::{CleanupReport, CleanupStep, HiddenServiceManager, ServiceHandle};
pub use process::{ProcessConfig, ServerProcess};
pub use server::FileServer;
pub use share::SharedFile;
