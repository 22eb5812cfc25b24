//! Runtime settings
//!
//! A single `Settings` value drives both the file server bind address and the
//! onion port mapping, so the two always agree.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control ports tried in order: system Tor first, then Tor Browser.
pub const DEFAULT_CONTROL_PORTS: &[u16] = &[9051, 9151];

/// Settings for torshare
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Host running the Tor control port
    pub control_host: String,

    /// Candidate control ports, in preference order
    pub control_ports: Vec<u16>,

    /// Password for `HashedControlPassword` authentication
    pub control_password: Option<String>,

    /// Cookie file to use instead of the one Tor advertises
    pub cookie_file: Option<PathBuf>,

    /// Address the file server binds to (must be loopback)
    pub listen_host: IpAddr,

    /// Port the file server binds to; also the onion mapping target
    pub listen_port: u16,

    /// Port clients use on the onion address
    pub public_port: u16,

    /// Subdirectory of Tor's DataDirectory used by the file-based fallback
    pub descriptor_dir_name: String,

    /// Used when Tor does not report a DataDirectory
    pub fallback_data_dir: PathBuf,

    pub stop_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub publish_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_host: "127.0.0.1".to_string(),
            control_ports: DEFAULT_CONTROL_PORTS.to_vec(),
            control_password: None,
            cookie_file: None,
            listen_host: IpAddr::from([127, 0, 0, 1]),
            listen_port: 5000,
            public_port: 80,
            descriptor_dir_name: "torshare".to_string(),
            fallback_data_dir: PathBuf::from("/tmp"),
            stop_timeout_secs: 2,
            ready_timeout_secs: 10,
            publish_timeout_secs: 120,
            command_timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        Ok(settings)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if !self.listen_host.is_loopback() {
            bail!(
                "listen_host must be a loopback address, got {}",
                self.listen_host
            );
        }
        if self.control_ports.is_empty() {
            bail!("control_ports must list at least one port");
        }
        if self.listen_port == 0 || self.public_port == 0 {
            bail!("listen_port and public_port must be non-zero");
        }
        if self.descriptor_dir_name.is_empty() || self.descriptor_dir_name.contains('/') {
            bail!(
                "descriptor_dir_name must be a single path component, got {:?}",
                self.descriptor_dir_name
            );
        }
        for (name, secs) in [
            ("stop_timeout_secs", self.stop_timeout_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("publish_timeout_secs", self.publish_timeout_secs),
            ("command_timeout_secs", self.command_timeout_secs),
        ] {
            if secs == 0 {
                bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    /// Socket address of the file server
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.control_ports, vec![9051, 9151]);
        assert_eq!(settings.listen_addr(), "127.0.0.1:5000".parse().unwrap());
        assert_eq!(settings.public_port, 80);
        assert_eq!(settings.descriptor_dir_name, "torshare");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "listen_port": 5050, "control_ports": [9151] }}"#).unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.listen_port, 5050);
        assert_eq!(settings.control_ports, vec![9151]);
        // Untouched fields keep their defaults
        assert_eq!(settings.public_port, 80);
        assert_eq!(settings.stop_timeout_secs, 2);
    }

    #[test]
    fn test_load_invalid_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_rejects_non_loopback() {
        let settings = Settings {
            listen_host: IpAddr::from([0, 0, 0, 0]),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_ports_and_zero_timeouts() {
        let settings = Settings {
            control_ports: vec![],
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        let settings = Settings {
            stop_timeout_secs: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_nested_descriptor_dir() {
        let settings = Settings {
            descriptor_dir_name: "a/b".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
