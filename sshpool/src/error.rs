use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failures of the underlying transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The operation did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// SSH protocol failure.
    #[cfg(feature = "russh")]
    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    /// Loading a private key failed.
    #[cfg(feature = "russh")]
    #[error("private key: {0}")]
    Key(#[from] russh::keys::Error),

    /// SFTP subsystem negotiation failed.
    #[cfg(feature = "russh")]
    #[error("sftp: {0}")]
    Sftp(#[source] russh_sftp::client::error::Error),

    /// No authentication method was accepted.
    #[error("authentication failed for user {user}")]
    Auth {
        /// The rejected user.
        user: String,
    },

    /// The server's host key was rejected.
    #[error("host key for {host} rejected: {reason}")]
    HostKey {
        /// The host presenting the key.
        host: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// The transport refused the request.
    #[error("{0}")]
    Refused(String),
}

/// The error which broke a connection. Recorded once, and cheap to clone.
#[derive(Debug, Clone, Error)]
#[error("{message} (at {at})")]
pub struct ConnectionFault {
    message: Arc<str>,
    at: DateTime<Utc>,
}

impl ConnectionFault {
    pub(crate) fn new(message: impl Into<Arc<str>>) -> Self {
        Self {
            message: message.into(),
            at: Utc::now(),
        }
    }

    /// What broke the connection.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// When the fault was recorded.
    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Failures to hand out a pooled session.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection existed and a new one could not be established.
    #[error("connect to {target}")]
    Connect {
        /// The endpoint, as `user@host:port`.
        target: String,
        /// The transport failure.
        #[source]
        source: TransportError,
    },

    /// The connection is alive, but a session could not be opened on it.
    #[error("open session on {target}")]
    Session {
        /// The endpoint, as `user@host:port`.
        target: String,
        /// The transport failure.
        #[source]
        source: TransportError,
    },

    /// Every attempt found a broken or evicted connection.
    #[error("no usable connection to {target}")]
    Broken {
        /// The endpoint, as `user@host:port`.
        target: String,
        /// The last recorded fault, if any.
        #[source]
        fault: Option<ConnectionFault>,
    },

    /// The connection was closed while waiting for a session slot.
    #[error("connection to {target} was closed")]
    Closed {
        /// The endpoint, as `user@host:port`.
        target: String,
    },

    /// The pool has been shut down.
    #[error("connection pool is shut down")]
    Shutdown,
}
