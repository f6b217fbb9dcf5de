use crate::util::net::{self};

use serde::{Deserialize, Deserializer};

use std::net::{Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::{Duration};
use std::io::{self};

/// Well-known port used by both the UDP and the TCP listener.
pub const DEFAULT_PORT: u16 = 12345;

/// Datagram budget, envelope included.
pub const MAX_PACKET_LEN: usize = 1500;

const MIB: u64 = 1024 * 1024;

/// Timings and thresholds of the transfer engine.
/// The defaults are the protocol values; tests usually shorten the timings.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Max encoded length of a FILE datagram, newline included.
    pub max_packet_len: usize,

    /// Time waited for the acknowledgment of a chunk or a probe, per attempt.
    #[serde(rename = "ack_timeout_ms", deserialize_with = "millis")]
    pub ack_timeout: Duration,

    /// Resend attempts of a chunk whose first acknowledgment never arrived.
    pub max_attempts: usize,

    /// Time the sender stays quiet once the receiver reported a low window.
    #[serde(rename = "suspend_cooldown_ms", deserialize_with = "millis")]
    pub suspend_cooldown: Duration,

    /// Probes sent after a cooldown before considering the receiver lost.
    pub probe_attempts: usize,

    /// An acknowledgment reporting less window than this suspends the sender.
    pub low_window: u64,

    /// A probe acknowledgment must report more window than this to resume.
    pub recovery_window: u64,

    /// Receiver buffer size advertised when its inbound queue is empty.
    pub receive_window: u64,
}

impl TransferConfig {
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_suspend_cooldown(mut self, cooldown: Duration) -> Self {
        self.suspend_cooldown = cooldown;
        self
    }

    pub fn with_probe_attempts(mut self, attempts: usize) -> Self {
        self.probe_attempts = attempts;
        self
    }

    pub fn with_low_window(mut self, bytes: u64) -> Self {
        self.low_window = bytes;
        self
    }

    pub fn with_recovery_window(mut self, bytes: u64) -> Self {
        self.recovery_window = bytes;
        self
    }

    pub fn with_receive_window(mut self, bytes: u64) -> Self {
        self.receive_window = bytes;
        self
    }

    pub fn with_max_packet_len(mut self, len: usize) -> Self {
        self.max_packet_len = len;
        self
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_packet_len: MAX_PACKET_LEN,
            ack_timeout: Duration::from_secs(1),
            max_attempts: 3,
            suspend_cooldown: Duration::from_secs(60),
            probe_attempts: 3,
            low_window: MIB,
            recovery_window: MIB,
            receive_window: 2 * MIB,
        }
    }
}

/// Node configuration.
/// Every field has a default, so a TOML file only needs the values to override:
///
/// ```toml
/// alias = "burak"
/// address = "192.168.1.20"
/// downloads_dir = "/tmp/downloads"
///
/// [transfer]
/// ack_timeout_ms = 500
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name announced to the other peers.
    pub alias: String,

    /// Address announced as `MY_IP`. It is the identity of the node.
    pub address: Ipv4Addr,

    /// Address where the listeners are bound.
    /// The unspecified address is required to receive broadcasts.
    pub listen_address: Ipv4Addr,

    pub port: u16,

    /// Directory where the received files are written.
    pub downloads_dir: PathBuf,

    /// Connect timeout of every stream send.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,

    /// Times that `DISCOVER` and `GOODBYE` are broadcast on start and stop.
    pub announce_repeats: usize,

    pub transfer: TransferConfig,
}

impl Config {
    /// Creates a configuration for `alias` announced from `address`.
    pub fn new(alias: &str, address: Ipv4Addr) -> Self {
        Self { alias: alias.into(), address, ..Default::default() }
    }

    pub fn with_listen_address(mut self, address: Ipv4Addr) -> Self {
        self.listen_address = address;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_downloads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.downloads_dir = dir.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_announce_repeats(mut self, repeats: usize) -> Self {
        self.announce_repeats = repeats;
        self
    }

    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }

    /// Parses a TOML document. Missing values take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alias: String::from("anonymous"),
            address: net::local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST),
            listen_address: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            downloads_dir: PathBuf::from("Downloads"),
            connect_timeout: Duration::from_secs(2),
            announce_repeats: 3,
            transfer: TransferConfig::default(),
        }
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where D: Deserializer<'de> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(toml::de::Error),
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "Unable to read the configuration: {}", err),
            ConfigError::Parse(err) => write!(f, "Invalid configuration: {}", err),
        }
    }
}
