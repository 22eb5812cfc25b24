//! Tor Control Port client
//!
//! Talks to a locally running Tor daemon over its control protocol.

use super::error::{ControlError, Result};
use super::protocol::{
    parse_hs_desc_event, quote, HiddenServiceConf, ProtocolInfo, Reply, ReplyParser,
};
use super::PortMapping;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cookie locations tried when Tor does not advertise one
const COOKIE_PATHS: &[&str] = &[
    "/run/tor/control.authcookie",
    "/var/run/tor/control.authcookie",
    "/var/lib/tor/control_auth_cookie",
];

/// Length of Tor's authentication cookie
const COOKIE_LEN: usize = 32;

/// Authentication and timing options for a control session
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub password: Option<String>,
    pub cookie_file: Option<PathBuf>,
    /// Limit on each reply line
    pub command_timeout: Duration,
    /// Limit on descriptor upload or hostname file creation
    pub publish_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            password: None,
            cookie_file: None,
            command_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(120),
        }
    }
}

/// Connection to a Tor control port
pub struct TorController {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line_buf: Vec<u8>,
    parser: ReplyParser,
    /// Events that arrived while waiting for a command reply
    events: VecDeque<Reply>,
    options: ControllerOptions,
    port: u16,
    authenticated: bool,
    /// A reply was cut short; later reads would return stale data
    desynced: bool,
}

impl TorController {
    /// Open a control session to `host:port`. Does not authenticate.
    pub async fn connect(host: &str, port: u16, options: ControllerOptions) -> Result<Self> {
        debug!("Connecting to Tor control port {}:{}", host, port);

        let stream = tokio::time::timeout(options.command_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ControlError::timeout(format!("connection to {}:{}", host, port)))??;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            line_buf: Vec::new(),
            parser: ReplyParser::new(),
            events: VecDeque::new(),
            options,
            port,
            authenticated: false,
            desynced: false,
        })
    }

    /// Control port this session is connected to
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn read_line(&mut self, limit: Duration, waiting_for: &str) -> Result<String> {
        let read = self.reader.read_until(b'\n', &mut self.line_buf);
        let bytes_read = tokio::time::timeout(limit, read)
            .await
            .map_err(|_| ControlError::timeout(waiting_for))??;

        if bytes_read == 0 {
            return Err(ControlError::Closed);
        }

        let line = String::from_utf8_lossy(&self.line_buf).into_owned();
        self.line_buf.clear();
        Ok(line)
    }

    /// Next complete reply, command or event
    async fn read_reply(&mut self, limit: Duration, waiting_for: &str) -> Result<Reply> {
        loop {
            let line = self.read_line(limit, waiting_for).await?;
            if let Some(reply) = self.parser.push(&line)? {
                return Ok(reply);
            }
        }
    }

    /// Send a command and read its reply, queueing any events seen first
    async fn send_command(&mut self, cmd: &str) -> Result<Reply> {
        if self.desynced {
            return Err(ControlError::Desynced);
        }
        match self.exchange(cmd).await {
            Ok(reply) => reply.into_result(),
            Err(e) => {
                // The reply may still arrive and would be taken for the next one
                warn!("Tor control session unusable after {:?}: {}", command_name(cmd), e);
                self.desynced = true;
                Err(e)
            }
        }
    }

    async fn exchange(&mut self, cmd: &str) -> Result<Reply> {
        if cmd.starts_with("AUTHENTICATE ") {
            debug!("Sending Tor command: AUTHENTICATE <redacted>");
        } else {
            debug!("Sending Tor command: {}", cmd);
        }

        self.writer.write_all(cmd.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;

        loop {
            let reply = self
                .read_reply(self.options.command_timeout, "Tor control reply")
                .await?;
            if reply.is_event() {
                self.events.push_back(reply);
                continue;
            }
            debug!("Tor replied {} ({} lines)", reply.status, reply.lines.len());
            return Ok(reply);
        }
    }

    /// Next asynchronous event, waiting until `deadline`
    async fn next_event(&mut self, deadline: Instant) -> Result<Reply> {
        if self.desynced {
            return Err(ControlError::Desynced);
        }
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ControlError::timeout("Tor event"));
            }
            let reply = match self.read_reply(remaining, "Tor event").await {
                Ok(reply) => reply,
                Err(e) => {
                    let clean_timeout = matches!(e, ControlError::Timeout(_))
                        && self.line_buf.is_empty()
                        && self.parser.is_idle();
                    if !clean_timeout {
                        self.desynced = true;
                    }
                    return Err(e);
                }
            };
            if reply.is_event() {
                return Ok(reply);
            }
            warn!("Ignoring unsolicited reply from Tor: {:?}", reply);
        }
    }

    /// Ask Tor which authentication methods it accepts
    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.send_command("PROTOCOLINFO 1").await?;
        Ok(ProtocolInfo::parse(&reply))
    }

    /// Authenticate with the first method both sides support
    pub async fn authenticate(&mut self) -> Result<()> {
        let info = self.protocol_info().await?;
        debug!(
            "Tor {} offers auth methods {:?}",
            info.tor_version.as_deref().unwrap_or("(unknown version)"),
            info.auth_methods
        );

        if info.supports("NULL") {
            self.send_command("AUTHENTICATE").await?;
        } else if let (Some(password), true) =
            (self.options.password.clone(), info.supports("HASHEDPASSWORD"))
        {
            self.send_command(&format!("AUTHENTICATE {}", quote(&password)))
                .await?;
        } else if info.supports("COOKIE") {
            let cookie = self.read_cookie(&info).await?;
            self.send_command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
                .await?;
        } else {
            return Err(ControlError::NoAuthMethod(info.auth_methods.join(",")));
        }

        self.authenticated = true;
        info!("Authenticated to Tor control port {}", self.port);
        Ok(())
    }

    async fn read_cookie(&self, info: &ProtocolInfo) -> Result<Vec<u8>> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        candidates.extend(self.options.cookie_file.clone());
        candidates.extend(info.cookie_file.clone());
        candidates.extend(COOKIE_PATHS.iter().map(PathBuf::from));

        for path in &candidates {
            match tokio::fs::read(path).await {
                Ok(cookie) if cookie.len() == COOKIE_LEN => {
                    debug!("Using auth cookie from {:?}", path);
                    return Ok(cookie);
                }
                Ok(cookie) => {
                    debug!("Ignoring {:?}: {} bytes, not a Tor cookie", path, cookie.len());
                }
                Err(e) => debug!("Cannot read cookie {:?}: {}", path, e),
            }
        }

        Err(ControlError::NoAuthMethod(format!(
            "{} (no readable auth cookie)",
            info.auth_methods.join(",")
        )))
    }

    /// `GETINFO key`
    pub async fn get_info(&mut self, key: &str) -> Result<String> {
        let reply = self.send_command(&format!("GETINFO {}", key)).await?;
        reply
            .value(key)
            .ok_or_else(|| ControlError::malformed(format!("GETINFO reply missing {}", key)))
    }

    /// `GETCONF key`; `None` when the option is unset
    pub async fn get_conf(&mut self, key: &str) -> Result<Option<String>> {
        let reply = self.send_command(&format!("GETCONF {}", key)).await?;
        Ok(reply
            .key_values()
            .into_iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v)
            .filter(|v| !v.is_empty()))
    }

    /// Create an ephemeral onion service with a fresh key.
    ///
    /// With `await_publication`, waits for the first descriptor upload and
    /// removes the service again if that never happens.
    pub async fn add_onion(
        &mut self,
        mapping: PortMapping,
        await_publication: bool,
    ) -> Result<String> {
        if await_publication {
            self.events.clear();
            self.send_command("SETEVENTS HS_DESC").await?;
        }

        let cmd = format!(
            "ADD_ONION NEW:BEST Flags=DiscardPK Port={},{}",
            mapping.public_port, mapping.target
        );
        info!(
            "Sending ADD_ONION for port {} -> {}",
            mapping.public_port, mapping.target
        );

        let created = self.send_command(&cmd).await.and_then(|reply| {
            reply
                .value("ServiceID")
                .ok_or_else(|| ControlError::malformed("ADD_ONION reply missing ServiceID"))
        });
        let service_id = match created {
            Ok(id) => id,
            Err(e) => {
                if await_publication {
                    self.clear_events().await;
                }
                return Err(e);
            }
        };

        if await_publication {
            let published = self.wait_for_upload(&service_id).await;
            self.clear_events().await;

            if let Err(e) = published {
                warn!("Service {} was not published: {}", service_id, e);
                if let Err(e) = self.del_onion(&service_id).await {
                    warn!("Failed to remove unpublished service {}: {}", service_id, e);
                }
                return Err(e);
            }
        }

        info!("Created onion service: {}.onion", service_id);
        Ok(service_id)
    }

    /// Wait for `UPLOADED`. Fails early once every directory that was sent
    /// the descriptor has rejected it.
    async fn wait_for_upload(&mut self, service_id: &str) -> Result<()> {
        let deadline = Instant::now() + self.options.publish_timeout;
        let mut uploading: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();

        info!("Waiting for descriptor of {} to be published...", service_id);

        loop {
            let event = self.next_event(deadline).await?;
            let Some(event) = parse_hs_desc_event(&event) else {
                continue;
            };
            if event.address != service_id {
                continue;
            }

            match event.action.as_str() {
                "UPLOADED" => {
                    info!("Descriptor published");
                    return Ok(());
                }
                "UPLOAD" => uploading.extend(event.hs_dir),
                "FAILED" => {
                    failed.extend(event.hs_dir);
                    debug!(
                        "Descriptor upload failed ({} of {} directories)",
                        failed.len(),
                        uploading.len()
                    );
                    if !uploading.is_empty() && uploading.is_subset(&failed) {
                        return Err(ControlError::PublicationFailed(service_id.to_string()));
                    }
                }
                other => debug!("HS_DESC {} for {}", other, event.address),
            }
        }
    }

    async fn clear_events(&mut self) {
        if let Err(e) = self.send_command("SETEVENTS").await {
            warn!("Failed to unsubscribe from events: {}", e);
        }
        self.events.clear();
    }

    /// Remove an ephemeral onion service
    pub async fn del_onion(&mut self, service_id: &str) -> Result<()> {
        self.send_command(&format!("DEL_ONION {}", service_id))
            .await?;
        info!("Removed onion service: {}", service_id);
        Ok(())
    }

    /// Add a file-based onion service under `directory` and return its hostname
    pub async fn create_hidden_service(
        &mut self,
        directory: &Path,
        mapping: PortMapping,
    ) -> Result<String> {
        let dir = path_str(directory)?;

        let mut services = self.hidden_service_conf().await?;
        services.retain(|s| s.directory != dir);
        services.push(HiddenServiceConf {
            directory: dir.to_string(),
            options: vec![(
                "HiddenServicePort".to_string(),
                format!("{} {}", mapping.public_port, mapping.target),
            )],
        });

        info!("Configuring hidden service directory {:?}", directory);
        self.send_command(&format!(
            "SETCONF {}",
            HiddenServiceConf::to_setconf_args(&services)
        ))
        .await?;

        let hostname_file = directory.join("hostname");
        let deadline = Instant::now() + self.options.publish_timeout;
        loop {
            match tokio::fs::read_to_string(&hostname_file).await {
                Ok(hostname) if !hostname.trim().is_empty() => {
                    let hostname = hostname.trim().to_string();
                    info!("Hidden service hostname: {}", hostname);
                    return Ok(hostname);
                }
                Ok(_) => debug!("{:?} is still empty", hostname_file),
                Err(e) => debug!("Waiting for {:?}: {}", hostname_file, e),
            }
            if Instant::now() >= deadline {
                return Err(ControlError::timeout(format!("{:?}", hostname_file)));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Drop the file-based onion service under `directory` from Tor's config
    pub async fn remove_hidden_service(&mut self, directory: &Path) -> Result<()> {
        let dir = path_str(directory)?;

        let mut services = self.hidden_service_conf().await?;
        let before = services.len();
        services.retain(|s| s.directory != dir);

        if services.len() == before {
            debug!("No hidden service configured for {:?}", directory);
            return Ok(());
        }

        if services.is_empty() {
            self.send_command("RESETCONF HiddenServiceDir").await?;
        } else {
            self.send_command(&format!(
                "SETCONF {}",
                HiddenServiceConf::to_setconf_args(&services)
            ))
            .await?;
        }

        info!("Removed hidden service directory {:?}", directory);
        Ok(())
    }

    async fn hidden_service_conf(&mut self) -> Result<Vec<HiddenServiceConf>> {
        let reply = self.send_command("GETCONF HiddenServiceOptions").await?;
        Ok(HiddenServiceConf::parse_all(&reply))
    }
}

/// First word of a command, for logs that must not carry credentials
fn command_name(cmd: &str) -> &str {
    cmd.split(' ').next().unwrap_or(cmd)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| ControlError::malformed(format!("path is not UTF-8: {:?}", path)))
}
