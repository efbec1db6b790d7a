//! # SFTP storage driver
//!
//! A [`storage_driver::StorageDriver`] which keeps registry objects in a
//! directory on an SFTP server.
//!
//! Logical paths (`/docker/registry/v2/...`) are mapped below the base
//! directory given in the endpoint URL. Connections are shared through an
//! [`sshpool::ConnectionPool`], so many drivers for the same endpoint reuse
//! a single SSH connection, each call taking a session for its duration.
//!
//! ```no_run
//! # #[cfg(feature = "russh")]
//! # async fn example() -> Result<(), storage_driver::StorageError> {
//! use std::sync::Arc;
//!
//! use sftp_driver::{RegistryModel, SftpConfig};
//! use sshpool::{ConnectionPool, PoolConfig, RusshConnector};
//! use storage_driver::StorageDriver as _;
//!
//! let pool = ConnectionPool::new(Arc::new(RusshConnector::new()), PoolConfig::default());
//! let config = SftpConfig::from(RegistryModel {
//!     url: "sftp://registry@files.example.com/srv/registry".into(),
//!     insecure: false,
//!     credential: None,
//! });
//!
//! let driver = config.build(pool)?;
//! driver.put_content("/hello.txt", b"hello").await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod driver;
mod paths;
mod reader;
mod writer;

pub use config::{Credential, RegistryModel, SftpConfig};
pub use driver::SftpDriver;
pub use reader::SftpFileReader;
pub use writer::SftpFileWriter;

pub(crate) const DRIVER_NAME: &str = "sftp";
