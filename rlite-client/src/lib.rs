//! # RLite Sync Client
//!
//! Purpose: Provide a lightweight, synchronous Redis-compatible client with a
//! fixed-size connection pool to minimize TCP handshake overhead.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections through scoped leases.
//! 2. **Zero-Cost Abstractions**: Keep hot-path calls monomorphic and inline-friendly.
//! 3. **Minimal Allocation**: Stage outgoing frames in a lock-free buffer pool.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Usage
//!
//! ```no_run
//! use rlite_client::{ClientConfig, KVClient};
//!
//! let mut config = ClientConfig::new("127.0.0.1");
//! config.db = 2;
//! let client = KVClient::with_config(config)?;
//! client.set(b"greeting", b"hello")?;
//! assert_eq!(client.get(b"greeting")?, Some(b"hello".to_vec()));
//! # Ok::<(), rlite_client::ClientError>(())
//! ```

mod buffer;
mod client;
mod config;
mod connection;
mod error;
mod pool;
mod resp;

pub use buffer::{BufferPool, SendBuffer, DEFAULT_BUFFER_LEN, DEFAULT_POOL_SLOTS};
pub use client::KVClient;
pub use config::{ClientConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_POOL_SIZE, DEFAULT_PORT};
pub use connection::{Connection, ConnectionState};
pub use error::{ClientError, ClientResult};
pub use pool::{ConnectionPool, PooledConnection};
pub use resp::{encode_command, read_reply, Command, DecodeError, FrameSink, Reply, DEFAULT_MAX_ARG_LEN};
