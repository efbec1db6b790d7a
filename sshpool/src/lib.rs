//! # SSH connection pool
//!
//! Multiplexes many short-lived SFTP sessions over a small number of
//! long-lived SSH connections.
//!
//! A [`ConnectionPool`] keeps at most one [`ManagedConnection`] per
//! [`ConnectionIdentity`], bounds the number of sessions open on each
//! connection, watches connections with a keepalive task and periodically
//! evicts broken or excess idle connections.
//!
//! The transport itself is reached through the [`Connector`], [`Transport`]
//! and [`RemoteFs`] capability traits. The `russh` feature (on by default)
//! provides an implementation on top of `russh` and `russh-sftp`, and the
//! `memory` feature provides an in-process remote used for testing.

mod conn;
mod error;
mod identity;
#[cfg(any(test, feature = "memory"))]
pub mod memory;
mod net;
mod pool;
#[cfg(feature = "russh")]
mod ssh;
mod secret;
pub mod seconds;
mod transport;

pub use conn::{Lease, ManagedConnection};
pub use error::{ConnectionFault, PoolError, TransportError};
pub use identity::{AuthMethod, ConnectionIdentity, HostKeyPolicy, IdentityBuilder};
pub use net::TimeoutStream;
pub use pool::{ConnectionPool, PoolConfig, PooledSession};
#[cfg(feature = "russh")]
pub use ssh::RusshConnector;
pub use secret::Secret;
pub use transport::{Connector, OpenOptions, RemoteDirEntry, RemoteFile, RemoteFs, RemoteMetadata, Transport};
