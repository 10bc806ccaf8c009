//! MCP integration: transports, connection management, the merged tool
//! registry, and tool-call execution.

use std::time::Duration;

use thiserror::Error;

pub mod executor;
pub mod manager;
pub mod protocol;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;

/// Faults raised inside a transport. These never escape the `mcp` module
/// unconverted: the manager wraps them into [`ConnectionError`] or
/// [`InvocationError`] depending on which operation was in flight.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("server returned http status {0}")]
    HttpStatus(u16),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("connection closed")]
    Closed,
}

/// Per-server connection faults. Isolated to the failing server; other
/// connections and the session continue.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unsupported transport `{0}`")]
    UnsupportedTransport(String),
    #[error("{0}")]
    InvalidDescriptor(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no server named `{0}` is configured")]
    UnknownServer(String),
}

/// Per-call faults. Surfaced into the conversation as tool-result error
/// payloads, never thrown at the session.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("no tool named `{0}` is registered")]
    UnknownTool(String),
    #[error("server `{0}` is not connected")]
    ServerNotReady(String),
    #[error("arguments rejected by the tool schema: {0}")]
    InvalidArguments(String),
    #[error("tool call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
