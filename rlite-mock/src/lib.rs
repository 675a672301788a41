//! # RLite Mock Server
//!
//! Purpose: Run a small RESP2 server in-process so client tests and the
//! benchmark have a real socket to talk to.
//!
//! ## Design Principles
//! 1. **Self-Contained**: Each `MockServer` owns its tokio runtime and shuts it
//!    down on drop; callers stay fully synchronous.
//! 2. **Ephemeral Ports**: Binds `127.0.0.1:0` so parallel tests never collide.
//! 3. **Fault Injection**: `disconnect_all` drops every open socket to simulate
//!    a server-side idle cutoff.

mod protocol;
mod server;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tracing::debug;

use crate::server::{accept_loop, Shared};

pub use server::DATABASES;

/// Options for a mock server before it starts.
#[derive(Debug, Default, Clone)]
pub struct MockServerBuilder {
    password: Option<String>,
}

impl MockServerBuilder {
    /// Requires `AUTH <password>` before any other command.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Binds an ephemeral port and starts accepting connections.
    pub fn start(self) -> io::Result<MockServer> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared::new(self.password));
        let (kick, _) = broadcast::channel(4);

        {
            let _guard = runtime.enter();
            let listener = tokio::net::TcpListener::from_std(listener)?;
            runtime.spawn(accept_loop(listener, shared.clone(), kick.clone()));
        }
        debug!(%addr, "mock server listening");

        Ok(MockServer {
            runtime: Some(runtime),
            addr,
            shared,
            kick,
        })
    }
}

/// In-process RESP2 server bound to a loopback port.
pub struct MockServer {
    runtime: Option<Runtime>,
    addr: SocketAddr,
    shared: Arc<Shared>,
    kick: broadcast::Sender<()>,
}

impl MockServer {
    /// Starts a server without a password.
    pub fn start() -> io::Result<Self> {
        Self::builder().start()
    }

    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::default()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total connections accepted since start.
    pub fn connections_accepted(&self) -> usize {
        self.shared.accepted()
    }

    /// Closes every connection that is open right now.
    ///
    /// Connections accepted afterwards are unaffected.
    pub fn disconnect_all(&self) {
        // No receivers simply means no open connections.
        let _ = self.kick.send(());
    }

    /// Reads a key straight from the keyspace, bypassing the protocol.
    pub fn get(&self, db: usize, key: &[u8]) -> Option<Bytes> {
        self.shared.get(db, key)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
