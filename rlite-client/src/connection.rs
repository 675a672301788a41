//! # Connection
//!
//! Purpose: Own one TCP socket to the server and drive strict
//! request/response exchanges over it.
//!
//! ## Design Principles
//! 1. **Lazy Connect**: The socket opens on first use, outside any pool lock.
//! 2. **Transparent Freshness**: An idle socket that fails a liveness probe is
//!    replaced before use, and the active database is selected again.
//! 3. **Fault Isolation**: A socket or framing failure closes the socket and
//!    marks this instance faulted for good; the pool swaps it out.
//! 4. **Buffer Reuse**: Commands are staged in pooled chunks and replies are
//!    parsed through a per-connection line buffer.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Ready ──close──▶ Disconnected
//!                              │                 │
//!                              └──error──▶ Faulted ◀──io/protocol error
//! ```

use std::io::{self, BufReader};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, SendBuffer};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::{self, encode_command, Command, DecodeError, Reply};

/// Read-side buffer; large enough for most replies in one syscall.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    /// Permanent for this instance.
    Faulted,
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    config: Arc<ClientConfig>,
    state: ConnectionState,
    // Active database; starts at the configured index and follows `select`.
    db: i64,
    // Writes go straight to the inner stream via `get_mut`.
    reader: Option<BufReader<TcpStream>>,
    send_buf: SendBuffer,
    line_buf: Vec<u8>,
    last_activity: Option<Instant>,
    local_port: u16,
    last_command: String,
}

impl Connection {
    /// Creates a disconnected connection; no I/O happens here.
    pub fn new(config: Arc<ClientConfig>, buffers: Arc<BufferPool>) -> Self {
        let db = config.db;
        Connection {
            config,
            state: ConnectionState::Disconnected,
            db,
            reader: None,
            send_buf: SendBuffer::new(buffers),
            line_buf: Vec::with_capacity(128),
            last_activity: None,
            local_port: 0,
            last_command: String::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ConnectionState::Faulted
    }

    /// Database index that is (or will be) selected on this socket.
    pub fn db(&self) -> i64 {
        self.db
    }

    /// Local port of the current socket, 0 when never connected.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Printable form of the last command written, for diagnostics.
    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    /// Opens the socket and runs the AUTH/SELECT handshake.
    ///
    /// Any failure closes the socket and faults this instance.
    pub fn connect(&mut self) -> ClientResult<()> {
        if self.is_faulted() {
            return Err(self.faulted_error());
        }

        self.state = ConnectionState::Connecting;
        match self.open() {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                self.last_activity = Some(Instant::now());
                debug!(
                    endpoint = %self.config.endpoint(),
                    port = self.local_port,
                    db = self.db,
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                warn!(endpoint = %self.config.endpoint(), error = %err, "connect failed");
                self.fault();
                Err(match err {
                    err @ ClientError::Connection { .. } => err,
                    other => ClientError::connection(
                        self.config.endpoint(),
                        format!("handshake failed: {}", other),
                        None,
                    ),
                })
            }
        }
    }

    /// Makes sure a usable socket is in place before a command is sent.
    ///
    /// Connects on first use. After more than `idle_timeout` without traffic
    /// the socket is probed, and a dead one is replaced with the previously
    /// active database selected again.
    pub fn ensure_fresh(&mut self) -> ClientResult<()> {
        if self.is_faulted() {
            return Err(self.faulted_error());
        }
        if self.reader.is_none() {
            return self.connect();
        }

        let now = Instant::now();
        if let Some(last) = self.last_activity {
            if now.duration_since(last) > self.config.idle_timeout && !self.is_socket_alive() {
                debug!(port = self.local_port, db = self.db, "idle socket is gone, reconnecting");
                self.release_socket();
                self.state = ConnectionState::Disconnected;
                return self.connect();
            }
        }

        self.last_activity = Some(now);
        Ok(())
    }

    /// Validates, encodes and writes one command.
    pub fn send(&mut self, command: &Command<'_>) -> ClientResult<()> {
        command.validate(self.config.max_value_len)?;
        self.ensure_fresh()?;
        self.write_command(command)
    }

    /// Reads one reply.
    pub fn receive(&mut self) -> ClientResult<Reply> {
        self.read_reply()
    }

    /// One request/response exchange.
    pub fn execute(&mut self, command: &Command<'_>) -> ClientResult<Reply> {
        self.send(command)?;
        self.receive()
    }

    /// Switches the active database. Later reconnects select `db` again.
    pub fn select(&mut self, db: i64) -> ClientResult<()> {
        match self.execute(&Command::new(b"SELECT").arg_int(db))? {
            Reply::Simple(_) => {
                self.db = db;
                Ok(())
            }
            Reply::Error(message) => Err(ClientError::Server { message }),
            other => Err(self.protocol_error(format!("unexpected {} reply to SELECT", other.kind()))),
        }
    }

    /// Sends QUIT without waiting for the answer, then releases the socket.
    ///
    /// Safe to call repeatedly and on a faulted connection.
    pub fn close(&mut self) {
        if self.reader.is_some() && self.state == ConnectionState::Ready {
            let quit = Command::new(b"QUIT");
            let written = encode_command(&quit, self.config.max_value_len, &mut self.send_buf);
            if let (Ok(()), Some(reader)) = (written, self.reader.as_mut()) {
                let _ = self.send_buf.flush_to(reader.get_mut());
            }
            debug!(port = self.local_port, "closed");
        }

        self.release_socket();
        if !self.is_faulted() {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Protocol error tagged with this connection's port and last command.
    pub fn protocol_error(&self, message: impl Into<String>) -> ClientError {
        ClientError::Protocol {
            message: message.into(),
            port: self.local_port,
            command: self.last_command.clone(),
        }
    }

    fn open(&mut self) -> ClientResult<()> {
        let config = Arc::clone(&self.config);
        let endpoint = config.endpoint();
        let socket_error =
            |message: &str, err: io::Error| ClientError::connection(&endpoint, message, Some(err));

        let stream = connect_stream(&config).map_err(|err| socket_error("could not connect", err))?;
        stream
            .set_read_timeout(config.receive_timeout)
            .map_err(|err| socket_error("could not set receive timeout", err))?;
        stream
            .set_write_timeout(config.send_timeout)
            .map_err(|err| socket_error("could not set send timeout", err))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream
            .set_nodelay(true)
            .map_err(|err| socket_error("could not set TCP_NODELAY", err))?;

        self.local_port = stream.local_addr().map(|addr| addr.port()).unwrap_or(0);
        self.reader = Some(BufReader::with_capacity(READ_BUFFER_SIZE, stream));
        self.last_command.clear();

        if let Some(password) = config.password.as_deref() {
            match self.round_trip(&Command::new(b"AUTH").arg(password.as_bytes()))? {
                Reply::Simple(_) => {}
                Reply::Error(message) => {
                    return Err(ClientError::connection(
                        endpoint.as_str(),
                        format!("authentication failed: {}", message),
                        None,
                    ));
                }
                other => {
                    return Err(self.protocol_error(format!("unexpected {} reply to AUTH", other.kind())));
                }
            }
        }

        if self.db != 0 {
            match self.round_trip(&Command::new(b"SELECT").arg_int(self.db))? {
                Reply::Simple(_) => {}
                Reply::Error(message) => {
                    return Err(ClientError::connection(
                        endpoint.as_str(),
                        format!("could not select db {}: {}", self.db, message),
                        None,
                    ));
                }
                other => {
                    return Err(self.protocol_error(format!("unexpected {} reply to SELECT", other.kind())));
                }
            }
        }

        Ok(())
    }

    fn round_trip(&mut self, command: &Command<'_>) -> ClientResult<Reply> {
        self.write_command(command)?;
        self.read_reply()
    }

    fn write_command(&mut self, command: &Command<'_>) -> ClientResult<()> {
        self.last_command = command.to_string();
        trace!(port = self.local_port, command = %self.last_command, "send");

        encode_command(command, self.config.max_value_len, &mut self.send_buf)?;
        let written = match self.reader.as_mut() {
            Some(reader) => self.send_buf.flush_to(reader.get_mut()),
            None => {
                self.send_buf.reset();
                return Err(self.faulted_error());
            }
        };

        written.map_err(|err| self.io_fault("write failed", err))
    }

    fn read_reply(&mut self) -> ClientResult<Reply> {
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Err(self.faulted_error()),
        };

        match resp::read_reply(reader, &mut self.line_buf) {
            Ok(reply) => {
                self.last_activity = Some(Instant::now());
                Ok(reply)
            }
            Err(DecodeError::Io(err)) => Err(self.io_fault("read failed", err)),
            Err(DecodeError::Protocol(message)) => {
                let err = self.protocol_error(message);
                warn!(error = %err, "malformed reply, dropping connection");
                // Stream position is unknown past a framing error.
                self.fault();
                Err(err)
            }
        }
    }

    fn is_socket_alive(&self) -> bool {
        match self.reader.as_ref() {
            // Unread bytes mean the peer was alive when it sent them.
            Some(reader) if !reader.buffer().is_empty() => true,
            Some(reader) => probe_alive(reader.get_ref()),
            None => false,
        }
    }

    fn io_fault(&mut self, context: &str, err: io::Error) -> ClientError {
        warn!(port = self.local_port, command = %self.last_command, error = %err, "{}", context);
        self.fault();
        ClientError::connection(self.config.endpoint(), context, Some(err))
    }

    fn fault(&mut self) {
        self.state = ConnectionState::Faulted;
        self.release_socket();
    }

    fn faulted_error(&self) -> ClientError {
        ClientError::connection(self.config.endpoint(), "connection is faulted or closed", None)
    }

    fn release_socket(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.get_ref().shutdown(Shutdown::Both);
        }
        self.send_buf.reset();
        self.line_buf.clear();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.config.endpoint())
            .field("state", &self.state)
            .field("db", &self.db)
            .field("local_port", &self.local_port)
            .finish()
    }
}

fn connect_stream(config: &ClientConfig) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (config.host.as_str(), config.port).to_socket_addrs()? {
        let attempt = match config.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

/// Non-blocking peek: EOF or a hard error means the peer is gone.
fn probe_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => err.kind() == io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && alive
}
