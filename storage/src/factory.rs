use std::sync::Arc;

use sftp_driver::RegistryModel;
use sshpool::{ConnectionPool, Connector, PoolConfig};

use crate::{Storage, StorageConfig, StorageError};

/// Builds [`Storage`] handles which share one connection pool.
///
/// Construct one factory at process start and keep it for the life of the
/// process. Dropping the last clone stops background collection, but only
/// [`StorageFactory::shutdown`] closes pooled connections in an orderly way.
#[derive(Debug, Clone)]
pub struct StorageFactory {
    pool: ConnectionPool,
}

impl StorageFactory {
    /// A factory whose pool dials through `connector`.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            pool: ConnectionPool::new(connector, config),
        }
    }

    /// A factory dialing real SSH servers.
    #[cfg(feature = "russh")]
    pub fn ssh(config: PoolConfig) -> Self {
        Self::new(Arc::new(sshpool::RusshConnector::new()), config)
    }

    /// The shared pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Build a storage handle for one configured endpoint.
    #[tracing::instrument(skip(self), fields(registry_type = config.registry_type()))]
    pub fn build(&self, config: &StorageConfig) -> Result<Storage, StorageError> {
        let storage: Storage = match config {
            StorageConfig::Sftp(sftp) => sftp.build(self.pool.clone())?.into(),
        };
        tracing::debug!(driver = storage.name(), "built storage");
        Ok(storage)
    }

    /// Build a storage handle from a registry model record.
    pub fn from_registry(
        &self,
        registry_type: &str,
        model: RegistryModel,
    ) -> Result<Storage, StorageError> {
        let config = StorageConfig::from_registry(registry_type, model)?;
        self.build(&config)
    }

    /// Close every pooled connection. Storage built by this factory fails
    /// with a precondition error afterwards.
    pub async fn shutdown(&self) {
        tracing::debug!(
            connections = self.pool.active_connections(),
            "shutting down storage"
        );
        self.pool.shutdown().await;
    }
}
