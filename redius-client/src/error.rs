//! # Client Errors
//!
//! Purpose: One error type for every failure the client can surface, from
//! pool exhaustion to error replies sent back by the store.

use std::string::FromUtf8Error;
use std::time::Duration;

use thiserror::Error;

/// Result type for the sync client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the sync client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing a command.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing or parse error, including EOF in the middle of a reply.
    #[error("protocol error")]
    Protocol,

    /// Store returned an error reply. The message is passed through verbatim.
    #[error("server error: {message}")]
    Server { message: String },

    /// Store returned a nil reply where a single value was expected.
    #[error("response is nil")]
    Nil,

    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,

    /// Bulk reply was not valid UTF-8.
    #[error("response is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),

    /// Reply could not be read as a number.
    #[error("invalid number in response: {0}")]
    InvalidNumber(String),

    /// The transport to the store could not be opened.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The store rejected the configured credential.
    #[error("authentication failed: {message}")]
    AuthFailed { message: String },

    /// Address could not be resolved into a socket address.
    #[error("invalid address")]
    InvalidAddress,

    /// Pool is at capacity and the blocking policy is fail-fast.
    #[error("connection pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// No connection became available within the configured wait.
    #[error("timed out after {waited:?} waiting for a pooled connection")]
    PoolTimeout { waited: Duration },

    /// The pool was closed before or while waiting for a connection.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A connection was checked in that is not checked out from this pool.
    #[error("connection {id} is not checked out from this pool")]
    DoubleRelease { id: u64 },

    /// A score argument was NaN, which no store accepts.
    #[error("score is not a number")]
    InvalidScore,

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Returns true for a nil reply, the store's "not found".
    pub fn is_nil(&self) -> bool {
        matches!(self, ClientError::Nil)
    }

    /// Returns true when the failure left the connection in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol)
    }
}
