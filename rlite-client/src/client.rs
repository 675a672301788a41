//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands over RESP2 through a shared connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Oversized values are rejected before a connection is
//!    leased; wrong reply kinds surface as protocol errors.
//! 4. **One Command, One Reply**: Every call leases a connection, runs a single
//!    exchange and returns the connection when the lease drops.

use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;
use crate::resp::{parse_f64, Command, Reply};

/// Verbs that would leave a pooled socket in a state other callers do not expect.
const SESSION_VERBS: [&[u8]; 3] = [b"SELECT", b"AUTH", b"QUIT"];

/// Synchronous client with connection pooling.
///
/// Cheap to share across threads behind an `Arc`.
pub struct KVClient {
    config: Arc<ClientConfig>,
    buffers: Arc<BufferPool>,
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client for `host` with default configuration.
    ///
    /// No socket is opened until the first command.
    pub fn connect(host: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(ClientConfig::new(host))
    }

    /// Creates a client with a custom configuration and its own buffer pool.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;
        let buffers = Arc::new(BufferPool::new(config.buffer_pool_slots, config.buffer_len));
        Self::with_buffer_pool(config, buffers)
    }

    /// Creates a client that stages commands in an existing buffer pool.
    pub fn with_buffer_pool(config: ClientConfig, buffers: Arc<BufferPool>) -> ClientResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let pool = ConnectionPool::new(config.clone(), buffers.clone())?;
        Ok(KVClient {
            config,
            buffers,
            pool,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Pings the server. Returns true on `PONG`.
    pub fn ping(&self) -> ClientResult<bool> {
        self.call(&Command::new(b"PING"), |reply| match reply {
            Reply::Simple(text) => Some(text == "PONG"),
            _ => None,
        })
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        self.check_value(value)?;
        self.call(&Command::new(b"SET").arg(key).arg(value), expect_ok)
    }

    /// UTF-8 form of [`KVClient::set`].
    pub fn set_str(&self, key: &str, value: &str) -> ClientResult<()> {
        self.set(key.as_bytes(), value.as_bytes())
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        self.call(&Command::new(b"GET").arg(key), |reply| match reply {
            Reply::Bulk(data) => Some(data),
            _ => None,
        })
    }

    /// UTF-8 form of [`KVClient::get`]; invalid sequences are replaced.
    pub fn get_string(&self, key: &str) -> ClientResult<Option<String>> {
        Ok(self
            .get(key.as_bytes())?
            .map(|data| String::from_utf8_lossy(&data).into_owned()))
    }

    /// Reads a value as a float; NaN when missing or not a number.
    pub fn get_f64(&self, key: &[u8]) -> ClientResult<f64> {
        self.call(&Command::new(b"GET").arg(key), |reply| match reply {
            Reply::Bulk(data) => Some(data.map_or(f64::NAN, |data| parse_f64(&data))),
            _ => None,
        })
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn del(&self, key: &[u8]) -> ClientResult<bool> {
        self.call(&Command::new(b"DEL").arg(key), |reply| {
            reply.into_integer().map(|count| count > 0)
        })
    }

    /// Deletes several keys in one command. Returns how many were removed.
    pub fn del_many(&self, keys: &[&[u8]]) -> ClientResult<i64> {
        if keys.is_empty() {
            return Err(ClientError::argument("DEL needs at least one key"));
        }
        self.call(&Command::new(b"DEL").args(keys.iter().copied()), Reply::into_integer)
    }

    /// Number of the given key that exist (0 or 1).
    pub fn exists(&self, key: &[u8]) -> ClientResult<i64> {
        self.call(&Command::new(b"EXISTS").arg(key), Reply::into_integer)
    }

    /// Sets several keys at once.
    pub fn mset(&self, pairs: &[(&[u8], &[u8])]) -> ClientResult<()> {
        if pairs.is_empty() {
            return Err(ClientError::argument("MSET needs at least one key/value pair"));
        }
        for (_, value) in pairs {
            self.check_value(value)?;
        }

        let command = Command::new(b"MSET").args(pairs.iter().flat_map(|(key, value)| [*key, *value]));
        self.call(&command, expect_ok)
    }

    /// Runs an arbitrary command and returns the raw reply.
    ///
    /// Error replies still come back as `ClientError::Server`. Commands that
    /// change connection state (`SELECT`, `AUTH`, `QUIT`) are rejected; the
    /// pool owns those, and `ConnectionPool::acquire` gives direct access.
    pub fn execute(&self, command: &Command<'_>) -> ClientResult<Reply> {
        if let Some(verb) = SESSION_VERBS
            .iter()
            .find(|verb| command.verb().eq_ignore_ascii_case(verb))
        {
            return Err(ClientError::argument(format!(
                "{} changes pooled connection state and cannot be executed",
                String::from_utf8_lossy(verb)
            )));
        }
        self.call(command, Some)
    }

    fn check_value(&self, value: &[u8]) -> ClientResult<()> {
        if value.len() >= self.config.max_value_len {
            return Err(ClientError::argument(format!(
                "value of {} bytes exceeds the {} byte limit",
                value.len(),
                self.config.max_value_len
            )));
        }
        Ok(())
    }

    /// Leases a connection, runs one exchange and maps the reply.
    ///
    /// `map` returns `None` for a reply kind the command cannot produce.
    fn call<T>(&self, command: &Command<'_>, map: impl FnOnce(Reply) -> Option<T>) -> ClientResult<T> {
        let mut conn = self.pool.acquire()?;
        match conn.execute(command)? {
            Reply::Error(message) => Err(ClientError::Server { message }),
            reply => {
                let kind = reply.kind();
                map(reply).ok_or_else(|| conn.protocol_error(format!("unexpected {} reply", kind)))
            }
        }
    }
}

fn expect_ok(reply: Reply) -> Option<()> {
    match reply {
        Reply::Simple(_) => Some(()),
        _ => None,
    }
}
