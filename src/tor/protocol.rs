//! Tor control protocol framing and parsing
//!
//! Replies are sequences of `CCC-text`, `CCC+text` (followed by a data block
//! ending in a lone `.`) and a final `CCC text` line.

use super::error::{ControlError, Result};
use std::path::PathBuf;

/// Status code of asynchronous event replies
pub const EVENT_STATUS: u16 = 650;

/// A complete control port reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    /// Text of each line. A data block is joined onto its header line:
    /// directly after a trailing `=`, otherwise after a newline.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_event(&self) -> bool {
        self.status == EVENT_STATUS
    }

    /// Turn a 4xx/5xx reply into an error
    pub fn into_result(self) -> Result<Reply> {
        if self.status >= 400 {
            Err(ControlError::Reply {
                status: self.status,
                message: self.lines.join(" | "),
            })
        } else {
            Ok(self)
        }
    }

    /// `key=value` pairs from every line, with quoted values unquoted
    pub fn key_values(&self) -> Vec<(String, Option<String>)> {
        self.lines
            .iter()
            .filter(|line| line.as_str() != "OK")
            .map(|line| match line.split_once('=') {
                Some((key, value)) => (key.to_string(), Some(unquote(value))),
                None => (line.clone(), None),
            })
            .collect()
    }

    /// First value for `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.key_values()
            .into_iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v)
    }
}

/// Assembles replies line by line
#[derive(Debug, Default)]
pub struct ReplyParser {
    status: Option<u16>,
    lines: Vec<String>,
    /// Header and lines of an open data block
    data: Option<(String, Vec<String>)>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line. Returns the reply once its final line arrives.
    ///
    /// A malformed line discards the partial reply.
    pub fn push(&mut self, raw: &str) -> Result<Option<Reply>> {
        let result = self.push_line(raw);
        if result.is_err() {
            *self = Self::default();
        }
        result
    }

    /// No reply is partially assembled
    pub fn is_idle(&self) -> bool {
        self.status.is_none() && self.lines.is_empty() && self.data.is_none()
    }

    fn push_line(&mut self, raw: &str) -> Result<Option<Reply>> {
        let line = raw.trim_end_matches(['\r', '\n']);

        if let Some((_, body)) = self.data.as_mut() {
            if line == "." {
                if let Some((header, body)) = self.data.take() {
                    let separator = if header.ends_with('=') { "" } else { "\n" };
                    self.lines
                        .push(format!("{}{}{}", header, separator, body.join("\n")));
                }
            } else {
                // Leading dots are doubled on the wire
                let unescaped = match line.strip_prefix('.') {
                    Some(rest) if rest.starts_with('.') => rest,
                    _ => line,
                };
                body.push(unescaped.to_string());
            }
            return Ok(None);
        }

        if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
            return Err(ControlError::malformed(format!("line too short: {:?}", line)));
        }
        let status: u16 = line[..3]
            .parse()
            .map_err(|_| ControlError::malformed(format!("bad status code: {:?}", line)))?;
        if let Some(expected) = self.status {
            if expected != status {
                return Err(ControlError::malformed(format!(
                    "status changed mid-reply ({} then {})",
                    expected, status
                )));
            }
        }
        self.status = Some(status);

        let text = line[4..].to_string();
        match &line[3..4] {
            "-" => {
                self.lines.push(text);
                Ok(None)
            }
            "+" => {
                self.data = Some((text, Vec::new()));
                Ok(None)
            }
            " " => {
                self.lines.push(text);
                let reply = Reply {
                    status,
                    lines: std::mem::take(&mut self.lines),
                };
                self.status = None;
                Ok(Some(reply))
            }
            other => Err(ControlError::malformed(format!(
                "unknown separator {:?} in {:?}",
                other, line
            ))),
        }
    }
}

/// Quote a value for use in a command argument
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Undo [`quote`]; unquoted input is returned as-is
pub fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a line into space separated tokens, keeping quoted strings whole
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// What `PROTOCOLINFO` told us
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub auth_methods: Vec<String>,
    pub cookie_file: Option<PathBuf>,
    pub tor_version: Option<String>,
}

impl ProtocolInfo {
    pub fn parse(reply: &Reply) -> Self {
        let mut info = Self::default();

        for line in &reply.lines {
            let tokens = tokenize(line);
            let Some((head, args)) = tokens.split_first() else {
                continue;
            };
            for arg in args {
                let Some((key, value)) = arg.split_once('=') else {
                    continue;
                };
                match (head.as_str(), key) {
                    ("AUTH", "METHODS") => {
                        info.auth_methods = value.split(',').map(str::to_string).collect();
                    }
                    ("AUTH", "COOKIEFILE") => {
                        info.cookie_file = Some(PathBuf::from(unquote(value)));
                    }
                    ("VERSION", "Tor") => {
                        info.tor_version = Some(unquote(value));
                    }
                    _ => {}
                }
            }
        }

        info
    }

    pub fn supports(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// One `HiddenServiceDir` and the options that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiddenServiceConf {
    pub directory: String,
    pub options: Vec<(String, String)>,
}

impl HiddenServiceConf {
    /// Parse a `GETCONF HiddenServiceOptions` reply
    pub fn parse_all(reply: &Reply) -> Vec<HiddenServiceConf> {
        let mut services: Vec<HiddenServiceConf> = Vec::new();

        for (key, value) in reply.key_values() {
            let Some(value) = value else {
                continue;
            };
            if key == "HiddenServiceDir" {
                services.push(HiddenServiceConf {
                    directory: value,
                    options: Vec::new(),
                });
            } else if let Some(current) = services.last_mut() {
                current.options.push((key, value));
            }
        }

        services
    }

    /// Render services as `SETCONF` arguments, directory first in each block
    pub fn to_setconf_args(services: &[HiddenServiceConf]) -> String {
        let mut args = Vec::new();
        for service in services {
            args.push(format!("HiddenServiceDir={}", quote(&service.directory)));
            for (key, value) in &service.options {
                args.push(format!("{}={}", key, quote(value)));
            }
        }
        args.join(" ")
    }
}

/// An `HS_DESC` event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsDescEvent {
    /// `UPLOAD`, `UPLOADED`, `FAILED`, ...
    pub action: String,
    /// Onion address without suffix
    pub address: String,
    /// Directory the descriptor went to, when given
    pub hs_dir: Option<String>,
}

/// Parse `650 HS_DESC Action HSAddress AuthType HsDir ...`
pub fn parse_hs_desc_event(reply: &Reply) -> Option<HsDescEvent> {
    if !reply.is_event() {
        return None;
    }
    let first = reply.lines.first()?;
    let mut parts = first.split(' ');
    if parts.next()? != "HS_DESC" {
        return None;
    }
    let action = parts.next()?.to_string();
    let address = parts.next()?.to_string();
    let hs_dir = parts
        .nth(1)
        .filter(|dir| !dir.contains('='))
        .map(str::to_string);
    Some(HsDescEvent {
        action,
        address,
        hs_dir,
    })
}
