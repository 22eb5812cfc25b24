//! Test utilities and fixtures for torshare
//!
//! Shared helpers: raw HTTP requests, a scripted Tor control port and an
//! in-memory `TorControl` fake.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use torshare::tor::{ControlError, PortMapping, TorControl};
use torshare::Settings;

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Write `contents` to `name` inside `dir`
pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("Failed to write test file");
    path
}

/// The torshare binary built for this test run
pub fn torshare_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_torshare"))
}

/// Settings with the file server on `port` and short timeouts
pub fn test_settings(port: u16, fallback_data_dir: &Path) -> Settings {
    Settings {
        listen_port: port,
        fallback_data_dir: fallback_data_dir.to_path_buf(),
        stop_timeout_secs: 2,
        ready_timeout_secs: 10,
        publish_timeout_secs: 5,
        command_timeout_secs: 5,
        ..Settings::default()
    }
}

/// A parsed HTTP/1.1 response
pub struct HttpResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Send `GET path` and read the whole response
pub async fn http_get(addr: SocketAddr, path: &str) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("Should connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream
        .write_all(request.as_bytes())
        .await
        .expect("Should write request");

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .expect("Should read response");

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("Response should have a header block");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let body = raw[split + 4..].to_vec();
    let status = head
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("Response should have a status code");

    HttpResponse { status, head, body }
}

/// Serve a scripted Tor control port for one connection.
///
/// Each step is `(expected command prefix, raw reply)`. The handle yields the
/// commands received.
pub async fn fake_control_port(
    script: Vec<(&'static str, String)>,
) -> (u16, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Should bind fake control port");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("Should accept");
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();

        for (expected, reply) in script {
            let line = lines
                .next_line()
                .await
                .expect("Should read command")
                .expect("Controller closed the connection early");
            assert!(
                line.starts_with(expected),
                "expected command starting with {:?}, got {:?}",
                expected,
                line
            );
            received.push(line);
            write_half
                .write_all(reply.as_bytes())
                .await
                .expect("Should write reply");
        }

        received
    });

    (port, handle)
}

/// What the fake Tor has been asked to do
#[derive(Debug, Default)]
pub struct FakeTorState {
    pub fail_auth: bool,
    pub fail_ephemeral: bool,
    pub fail_file_based: bool,
    pub fail_removal: bool,
    pub data_directory: Option<String>,
    pub next_id: u32,
    pub authenticated: bool,
    pub mappings: Vec<PortMapping>,
    pub ephemeral_created: Vec<String>,
    pub ephemeral_removed: Vec<String>,
    pub dirs_created: Vec<PathBuf>,
    pub dirs_removed: Vec<PathBuf>,
}

/// In-memory stand-in for a Tor control session
#[derive(Debug, Clone, Default)]
pub struct FakeTor {
    pub state: Arc<Mutex<FakeTorState>>,
}

impl FakeTor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F: FnOnce(&mut FakeTorState)>(self, f: F) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, FakeTorState> {
        self.state.lock().unwrap()
    }

    fn rejected(message: &str) -> ControlError {
        ControlError::Reply {
            status: 552,
            message: message.to_string(),
        }
    }
}

/// A 56 character v3 service ID derived from `n`
pub fn fake_service_id(n: u32) -> String {
    format!("{:a>56}", format!("fake{}", n))
}

impl TorControl for FakeTor {
    async fn authenticate(&mut self) -> torshare::tor::Result<()> {
        let mut state = self.state();
        if state.fail_auth {
            return Err(ControlError::Reply {
                status: 515,
                message: "Authentication failed".to_string(),
            });
        }
        state.authenticated = true;
        Ok(())
    }

    async fn create_ephemeral_hidden_service(
        &mut self,
        mapping: PortMapping,
        _await_publication: bool,
    ) -> torshare::tor::Result<String> {
        let mut state = self.state();
        if state.fail_ephemeral {
            return Err(Self::rejected("Unrecognized command \"ADD_ONION\""));
        }
        state.next_id += 1;
        let id = fake_service_id(state.next_id);
        state.mappings.push(mapping);
        state.ephemeral_created.push(id.clone());
        Ok(id)
    }

    async fn remove_ephemeral_hidden_service(
        &mut self,
        service_id: &str,
    ) -> torshare::tor::Result<()> {
        let mut state = self.state();
        state.ephemeral_removed.push(service_id.to_string());
        if state.fail_removal {
            return Err(Self::rejected("Unknown onion service"));
        }
        Ok(())
    }

    async fn create_hidden_service(
        &mut self,
        directory: &Path,
        mapping: PortMapping,
    ) -> torshare::tor::Result<String> {
        let mut state = self.state();
        if state.fail_file_based {
            return Err(Self::rejected("Failed to configure hidden service"));
        }
        state.next_id += 1;
        let hostname = format!("{}.onion", fake_service_id(state.next_id));

        // Tor writes the keys and hostname into the directory
        std::fs::create_dir_all(directory)?;
        std::fs::write(directory.join("hostname"), format!("{}\n", hostname))?;

        state.mappings.push(mapping);
        state.dirs_created.push(directory.to_path_buf());
        Ok(hostname)
    }

    async fn remove_hidden_service(&mut self, directory: &Path) -> torshare::tor::Result<()> {
        let mut state = self.state();
        state.dirs_removed.push(directory.to_path_buf());
        if state.fail_removal {
            return Err(Self::rejected("Unknown hidden service directory"));
        }
        Ok(())
    }

    async fn get_conf(&mut self, key: &str) -> torshare::tor::Result<Option<String>> {
        let state = self.state();
        match key {
            "DataDirectory" => Ok(state.data_directory.clone()),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_fake_service_id_length() {
        assert_eq!(fake_service_id(1).len(), 56);
        assert_ne!(fake_service_id(1), fake_service_id(2));
    }
}
