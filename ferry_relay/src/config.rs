// Startup configuration: the upstream target address and the fixed defaults
// the relay runs with.
//
// The target is given as `host[:port]`, either on the command line or typed
// at the `Enter Server: ` prompt. A missing or empty port means the default
// game port. Bare IPv6 literals (more than one colon, no brackets) are taken
// as a host with the default port; `[addr]:port` selects a port for them.

use std::fmt;
use std::io::{self, BufRead, Write};
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// Port appended to a target given without one.
pub const DEFAULT_PORT: u16 = 19132;

/// Where the relay listens for game clients.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:19132";

/// Credential file, relative to the working directory.
pub const DEFAULT_TOKEN_FILE: &str = "token.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("target address is empty")]
    EmptyTarget,

    #[error("target address {0:?} has no host")]
    MissingHost(String),

    #[error("target address {0:?} is not valid")]
    InvalidTarget(String),

    #[error("invalid port in {input:?}: {source}")]
    InvalidPort {
        input: String,
        source: ParseIntError,
    },
}

/// Upstream server address, parsed once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddr {
    host: String,
    port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host[:port]`, appending `DEFAULT_PORT` when no port is given.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyTarget);
        }

        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| ConfigError::InvalidTarget(trimmed.to_string()))?;
            let port = match after {
                "" | ":" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| ConfigError::InvalidTarget(trimmed.to_string()))?,
                ),
            };
            (host, port)
        } else {
            match trimmed.matches(':').count() {
                0 => (trimmed, None),
                1 => match trimmed.split_once(':') {
                    Some((host, "")) => (host, None),
                    Some((host, port)) => (host, Some(port)),
                    None => (trimmed, None),
                },
                _ => (trimmed, None),
            }
        };

        if host.is_empty() {
            return Err(ConfigError::MissingHost(trimmed.to_string()));
        }
        let port = match port {
            Some(port) => port.parse().map_err(|source| ConfigError::InvalidPort {
                input: trimmed.to_string(),
                source,
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TargetAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Ask for the target on `output` and read one line from `input`.
pub fn prompt_target<R: BufRead, W: Write>(mut input: R, mut output: W) -> io::Result<String> {
    write!(output, "Enter Server: ")?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
