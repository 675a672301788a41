//! # Client Errors
//!
//! Purpose: Give every failure of the client one tagged type so callers can
//! pattern-match on the kind instead of parsing messages.
//!
//! ## Design Principles
//! 1. **Explicit Kinds**: Argument, connection, protocol, server and timeout
//!    failures stay distinct all the way up to the caller.
//! 2. **Diagnosable**: Protocol errors carry the last command and the local
//!    port of the socket that produced them.
//! 3. **No Silent Masking**: Server error replies keep the server's text.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Rejected before any I/O (oversized value, empty key list, bad config).
    #[error("invalid argument: {message}")]
    Argument { message: String },

    /// Socket could not be opened, failed mid-operation, or the handshake was
    /// refused. The connection that raised it is permanently faulted.
    #[error("connection to {endpoint} failed: {message}")]
    Connection {
        endpoint: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Malformed, truncated or unexpected reply.
    #[error("protocol error: {message} (port: {port}, last command: {command})")]
    Protocol {
        message: String,
        port: u16,
        command: String,
    },

    /// The server answered with an error reply.
    #[error("server error: {message}")]
    Server { message: String },

    /// No pooled connection became free within the configured wait.
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    Timeout { waited: Duration },
}

impl ClientError {
    pub(crate) fn argument(message: impl Into<String>) -> Self {
        ClientError::Argument {
            message: message.into(),
        }
    }

    pub(crate) fn connection(
        endpoint: impl Into<String>,
        message: impl Into<String>,
        source: Option<io::Error>,
    ) -> Self {
        ClientError::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
            source,
        }
    }

    pub fn is_argument(&self) -> bool {
        matches!(self, ClientError::Argument { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Connection { .. })
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, ClientError::Protocol { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    /// Returns the server's message when this is a server error reply.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            ClientError::Server { message } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn protocol_error_mentions_port_and_command() {
        let err = ClientError::Protocol {
            message: "invalid termination".to_string(),
            port: 51234,
            command: "GET key".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("invalid termination"));
        assert!(text.contains("51234"));
        assert!(text.contains("GET key"));
        assert!(err.is_protocol());
    }

    #[test]
    fn connection_error_keeps_io_source() {
        let io = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = ClientError::connection("127.0.0.1:6379", "could not connect", Some(io));
        assert!(err.is_connection());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("127.0.0.1:6379"));
    }

    #[test]
    fn server_message_only_for_server_errors() {
        let err = ClientError::Server {
            message: "unknown command".to_string(),
        };
        assert_eq!(err.server_message(), Some("unknown command"));
        assert_eq!(ClientError::argument("x").server_message(), None);
    }
}
