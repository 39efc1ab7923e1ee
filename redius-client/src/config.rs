//! # Client Configuration
//!
//! Purpose: Describe where the store lives, how many connections the pool may
//! hold, and how callers behave when it is saturated.
//!
//! All types derive `serde` traits so embedding applications can load them
//! from their own config files; the client owns no file format.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Default pool capacity, matching the common single-digit pool sizes.
pub const DEFAULT_CAPACITY: usize = 8;

/// Socket family used to reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Stream socket, address is `host:port`.
    #[default]
    Tcp,
    /// Unix domain socket, address is a filesystem path.
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Unix => write!(f, "unix"),
        }
    }
}

/// Non-empty secret sent with `AUTH` when a connection is built.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Credential(String);

impl Credential {
    /// Wraps a password, rejecting the empty string.
    pub fn new(secret: impl Into<String>) -> ClientResult<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ClientError::InvalidConfig(
                "credential must not be empty".to_string(),
            ));
        }
        Ok(Credential(secret))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Keep secrets out of logs and panic messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

impl TryFrom<String> for Credential {
    type Error = ClientError;

    fn try_from(value: String) -> ClientResult<Self> {
        Credential::new(value)
    }
}

impl From<Credential> for String {
    fn from(value: Credential) -> Self {
        value.0
    }
}

/// What `checkout` does when every connection is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingPolicy {
    /// Block until a connection is checked in. No timeout.
    #[default]
    Wait,
    /// Block for at most the given duration, then fail with `PoolTimeout`.
    WaitFor(Duration),
    /// Fail immediately with `PoolExhausted`.
    FailFast,
}

/// Pool configuration: target, capacity, and optional credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Store address, e.g. "127.0.0.1:6379" or "/run/redis.sock".
    pub address: String,
    /// Socket family for `address`.
    #[serde(default)]
    pub network: Network,
    /// Maximum total connections (idle + checked out).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Password sent with `AUTH` on every new connection.
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub blocking: BlockingPolicy,
    /// Close connections whose last command hit a transport error instead of
    /// returning them to the idle set.
    #[serde(default)]
    pub discard_broken: bool,
    /// Optional connect timeout (TCP only).
    #[serde(default)]
    pub connect_timeout: Option<Duration>,
    /// Optional socket read timeout.
    #[serde(default)]
    pub read_timeout: Option<Duration>,
    /// Optional socket write timeout.
    #[serde(default)]
    pub write_timeout: Option<Duration>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            address: "127.0.0.1:6379".to_string(),
            network: Network::Tcp,
            capacity: DEFAULT_CAPACITY,
            credential: None,
            blocking: BlockingPolicy::Wait,
            discard_broken: false,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Builds a TCP configuration for `address` with the given capacity.
    pub fn tcp(address: impl Into<String>, capacity: usize) -> Self {
        PoolConfig {
            address: address.into(),
            capacity,
            ..PoolConfig::default()
        }
    }

    /// Builds a Unix socket configuration for `path` with the given capacity.
    pub fn unix(path: impl Into<String>, capacity: usize) -> Self {
        PoolConfig {
            address: path.into(),
            network: Network::Unix,
            capacity,
            ..PoolConfig::default()
        }
    }

    /// Sets the credential used for `AUTH`.
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Sets the saturation behaviour of `checkout`.
    pub fn with_blocking(mut self, blocking: BlockingPolicy) -> Self {
        self.blocking = blocking;
        self
    }

    /// Checks the invariants the pool relies on.
    pub fn validate(&self) -> ClientResult<()> {
        if self.capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.address.is_empty() {
            return Err(ClientError::InvalidConfig(
                "address must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the fire-and-forget operations treat failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Every operation returns its error to the caller.
    #[default]
    Surface,
    /// `hdel_all`, `hincr_by` and `expire_at` log failures and return `Ok`.
    FireAndForget,
}

/// Configuration for the typed client and its pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(flatten)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub error_mode: ErrorMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        let config = PoolConfig::tcp("127.0.0.1:6379", 0);
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_empty_credential() {
        assert!(Credential::new("").is_err());
        assert!(Credential::new("secret").is_ok());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("hunter2").unwrap();
        assert!(!format!("{:?}", credential).contains("hunter2"));
    }

    #[test]
    fn deserializes_minimal_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"address": "10.0.0.1:6379"}"#).unwrap();
        assert_eq!(config.pool.address, "10.0.0.1:6379");
        assert_eq!(config.pool.network, Network::Tcp);
        assert_eq!(config.pool.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.pool.credential, None);
        assert_eq!(config.pool.blocking, BlockingPolicy::Wait);
        assert_eq!(config.error_mode, ErrorMode::Surface);
    }

    #[test]
    fn deserializes_full_json() {
        let config: ClientConfig = serde_json::from_str(
            r#"{
                "address": "/tmp/store.sock",
                "network": "unix",
                "capacity": 3,
                "credential": "pw",
                "blocking": "fail_fast",
                "discard_broken": true,
                "error_mode": "fire_and_forget"
            }"#,
        )
        .unwrap();
        assert_eq!(config.pool.network, Network::Unix);
        assert_eq!(config.pool.capacity, 3);
        assert_eq!(config.pool.credential.as_ref().map(Credential::expose), Some("pw"));
        assert_eq!(config.pool.blocking, BlockingPolicy::FailFast);
        assert!(config.pool.discard_broken);
        assert_eq!(config.error_mode, ErrorMode::FireAndForget);
    }

    #[test]
    fn empty_credential_fails_deserialization() {
        let result: Result<PoolConfig, _> =
            serde_json::from_str(r#"{"address": "a:1", "credential": ""}"#);
        assert!(result.is_err());
    }
}
