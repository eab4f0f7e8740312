//! Session and layer configuration.
//!
//! Configuration is an immutable record handed to each component at
//! construction. Runtime structs carry [`Duration`]s; the serializable
//! [`ConfigFile`] counterpart carries plain scalars and converts through
//! [`ConfigFile::to_config`] / [`ConfigFile::from_config`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Session mode: which carrier a session runs over and whether application
/// payloads are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Plaintext payloads over UDP.
    Default,
    /// AES-128-CBC payloads over UDP.
    Secure,
    /// Plaintext payloads through the HTTP tunnel.
    Obfs,
    /// AES-128-CBC payloads through the HTTP tunnel.
    SecureObfs,
}

impl Mode {
    /// Whether application payloads are encrypted after key exchange.
    pub fn is_secure(self) -> bool {
        matches!(self, Mode::Secure | Mode::SecureObfs)
    }

    /// Whether the session runs over the HTTP tunnel carrier.
    pub fn uses_tunnel(self) -> bool {
        matches!(self, Mode::Obfs | Mode::SecureObfs)
    }

    /// The wire name of this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Default => "default",
            Mode::Secure => "secure",
            Mode::Obfs => "obfs",
            Mode::SecureObfs => "secure_obfs",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Default
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Mode::Default),
            "secure" => Ok(Mode::Secure),
            "obfs" => Ok(Mode::Obfs),
            "secure_obfs" => Ok(Mode::SecureObfs),
            other => Err(Error::config(format!("unknown mode: {other}"))),
        }
    }
}

/// Initial sequence number policy.
///
/// Both are valid on the wire; peers learn each other's initial value from
/// the SYN exchange and never assume zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialSeq {
    /// Always start at zero. Deterministic, convenient for tracing.
    #[default]
    Zero,
    /// Start at a random 32-bit value.
    Random,
}

impl InitialSeq {
    /// Pick an initial sequence number under this policy.
    pub fn pick(self) -> u32 {
        match self {
            InitialSeq::Zero => 0,
            InitialSeq::Random => rand::random(),
        }
    }
}

/// Transport layer (ARQ) configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long to wait for an acknowledgment before retransmitting.
    pub timeout: Duration,
    /// Total number of transmissions of one frame before giving up.
    pub max_retries: u32,
    /// Initial sequence number policy.
    pub initial_seq: InitialSeq,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            max_retries: 5,
            initial_seq: InitialSeq::Zero,
        }
    }
}

/// HTTP tunnel carrier configuration.
#[derive(Debug, Clone)]
pub struct ObfsConfig {
    /// How often an idle client drains the server-to-client queue.
    pub poll_interval: Duration,
    /// Per-client bound on queued frames in each direction.
    pub queue_limit: usize,
}

impl Default for ObfsConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            queue_limit: 64,
        }
    }
}

/// Complete configuration for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Session mode.
    pub mode: Mode,
    /// Transport layer settings.
    pub transport: TransportConfig,
    /// HTTP tunnel settings (ignored outside the obfs modes).
    pub obfs: ObfsConfig,
}

impl Config {
    /// Validate cross-field constraints.
    ///
    /// The tunnel poll interval must not exceed a quarter of the ARQ
    /// timeout, otherwise a polled acknowledgment can arrive after the
    /// sender has already retransmitted.
    pub fn validate(&self) -> Result<()> {
        if self.transport.max_retries == 0 {
            return Err(Error::config("transport.max_retries must be at least 1"));
        }
        if self.transport.timeout.is_zero() {
            return Err(Error::config("transport.timeout must be positive"));
        }
        if self.obfs.poll_interval > self.transport.timeout / 4 {
            return Err(Error::config(format!(
                "obfs.poll_interval ({:?}) must be at most a quarter of transport.timeout ({:?})",
                self.obfs.poll_interval, self.transport.timeout
            )));
        }
        if self.obfs.queue_limit == 0 {
            return Err(Error::config("obfs.queue_limit must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration file format (TOML for the server, JSON for the client).
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Session mode name.
    pub mode: String,
    /// ARQ retransmission timeout in seconds.
    pub timeout_secs: f64,
    /// Total transmissions of one frame before giving up.
    pub max_retries: u32,
    /// Use a random initial sequence number instead of zero.
    #[serde(default)]
    pub random_initial_seq: bool,
    /// Tunnel poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-client tunnel queue bound.
    pub queue_limit: usize,
}

impl ConfigFile {
    /// Convert to a validated runtime configuration.
    pub fn to_config(&self) -> Result<Config> {
        let config = Config {
            mode: self.mode.parse()?,
            transport: TransportConfig {
                timeout: Duration::from_secs_f64(self.timeout_secs),
                max_retries: self.max_retries,
                initial_seq: if self.random_initial_seq {
                    InitialSeq::Random
                } else {
                    InitialSeq::Zero
                },
            },
            obfs: ObfsConfig {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                queue_limit: self.queue_limit,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from a runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode.as_str().to_owned(),
            timeout_secs: config.transport.timeout.as_secs_f64(),
            max_retries: config.transport.max_retries,
            random_initial_seq: matches!(config.transport.initial_seq, InitialSeq::Random),
            poll_interval_ms: config.obfs.poll_interval.as_millis() as u64,
            queue_limit: config.obfs.queue_limit,
        }
    }
}
