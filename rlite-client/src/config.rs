//! # Client Configuration
//!
//! Purpose: One serializable struct holding every knob of the client, its
//! connections, the connection pool and the buffer pool.
//!
//! ## Notes
//! - Durations are written as integer milliseconds in JSON.
//! - Missing JSON fields fall back to `ClientConfig::default()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::buffer::{DEFAULT_BUFFER_LEN, DEFAULT_POOL_SLOTS};
use crate::error::{ClientError, ClientResult};
use crate::resp::DEFAULT_MAX_ARG_LEN;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_POOL_SIZE: usize = 5;
/// Slightly below the usual server-side idle kill of 300 seconds.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(240);

/// Configuration for the synchronous client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    pub port: u16,
    /// Database index selected on every (re)connect.
    pub db: i64,
    /// Number of connection slots; fixed for the lifetime of the pool.
    pub pool_size: usize,
    /// Sent with AUTH right after connecting.
    pub password: Option<String>,
    /// Upper bound on waiting for a free slot; `None` waits forever.
    #[serde(with = "millis::option")]
    pub pool_timeout: Option<Duration>,
    #[serde(with = "millis::option")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "millis::option")]
    pub send_timeout: Option<Duration>,
    #[serde(with = "millis::option")]
    pub receive_timeout: Option<Duration>,
    /// Idle time after which a connection is probed before reuse.
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    /// Values of this many bytes or more are rejected.
    pub max_value_len: usize,
    /// Length of each pooled send buffer.
    pub buffer_len: usize,
    /// Number of slots in the send buffer pool.
    pub buffer_pool_slots: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            db: 0,
            pool_size: DEFAULT_POOL_SIZE,
            password: None,
            pool_timeout: None,
            connect_timeout: None,
            send_timeout: None,
            receive_timeout: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_value_len: DEFAULT_MAX_ARG_LEN,
            buffer_len: DEFAULT_BUFFER_LEN,
            buffer_pool_slots: DEFAULT_POOL_SLOTS,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointing at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            ..ClientConfig::default()
        }
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> ClientResult<Self> {
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|err| ClientError::argument(format!("invalid client config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pool or the codec cannot work with.
    pub fn validate(&self) -> ClientResult<()> {
        if self.host.trim().is_empty() {
            return Err(ClientError::argument("host is required"));
        }
        if self.pool_size == 0 {
            return Err(ClientError::argument("pool_size must be at least 1"));
        }
        if self.buffer_len == 0 {
            return Err(ClientError::argument("buffer_len must be at least 1"));
        }
        if self.db < 0 {
            return Err(ClientError::argument("db index must not be negative"));
        }
        Ok(())
    }

    /// `host:port`, used in logs and connection errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
