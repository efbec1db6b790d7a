//! # Storage backends
//!
//! Configuration and unification for the registry's storage backends.
//!
//! A [`StorageFactory`] owns the process-wide connection pool and builds a
//! [`Storage`] handle for each configured endpoint. Every handle built by
//! the same factory shares that pool, so call [`StorageFactory::shutdown`]
//! once during process teardown.

use std::sync::Arc;

use serde::Deserialize;
use sftp_driver::{RegistryModel, SftpConfig};
use storage_driver::StorageErrorKind;
use tokio::io;

mod factory;
mod health;
mod settings;

#[doc(inline)]
pub use factory::StorageFactory;
#[doc(inline)]
pub use health::HealthStatus;
#[doc(inline)]
pub use settings::{Settings, SettingsError};

#[doc(inline)]
pub use storage_driver::{
    FileInfo, FileReader, FileWriter, StorageDriver, StorageError, WalkControl, WalkFn,
};

const ENGINE: &str = "storage";

/// Configuration for one storage endpoint, tagged by registry type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// A directory on an SFTP server.
    Sftp(SftpConfig),
}

impl StorageConfig {
    /// The registry type discriminator for this configuration.
    pub fn registry_type(&self) -> &'static str {
        match self {
            StorageConfig::Sftp(_) => "sftp",
        }
    }

    /// Select a backend by registry type and build its configuration from
    /// the registry model record.
    pub fn from_registry(registry_type: &str, model: RegistryModel) -> Result<Self, StorageError> {
        match registry_type {
            "sftp" => Ok(StorageConfig::Sftp(model.into())),
            other => Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::Other,
                format!("unknown registry type {other:?}"),
            )
            .context("configure")
            .build()),
        }
    }
}

pub(crate) type ArcDriver = Arc<dyn StorageDriver>;

/// A cloneable handle to a configured storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: StorageDriver + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: StorageDriver + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &'static str {
        self.driver.name()
    }

    /// The underlying driver.
    pub fn driver(&self) -> &ArcDriver {
        &self.driver
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.driver.get_content(path).await
    }

    #[tracing::instrument(skip(self, content), fields(driver = self.driver.name(), length = content.len()))]
    pub async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        self.driver.put_content(path, content).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn reader(&self, path: &str, offset: u64) -> Result<Box<dyn FileReader>, StorageError> {
        self.driver.reader(path, offset).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        self.driver.writer(path, append).await
    }

    /// Stream `reader` into a new object at `path`, committing it once
    /// the reader is exhausted. The object is cancelled on any error.
    #[tracing::instrument(skip(self, reader), fields(driver = self.driver.name()))]
    pub async fn upload<R>(&self, path: &str, reader: &mut R) -> Result<u64, StorageError>
    where
        R: io::AsyncRead + Unpin + Send,
    {
        use tokio::io::AsyncReadExt as _;

        let mut writer = self.driver.writer(path, false).await?;
        let mut buf = vec![0; 32 * 1024];
        let copied = async {
            loop {
                let n = reader
                    .read(&mut buf)
                    .await
                    .map_err(|error| StorageError::io(ENGINE, "upload", path, error))?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
            }
            writer.commit().await
        }
        .await;

        if copied.is_err() {
            if let Err(error) = writer.cancel().await {
                tracing::debug!(%path, %error, "failed to cancel upload");
            }
        }
        let size = writer.size();
        let closed = writer.close().await;
        copied?;
        closed?;
        Ok(size)
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        self.driver.stat(path).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.driver.list(path).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn move_to(&self, source: &str, dest: &str) -> Result<(), StorageError> {
        self.driver.move_to(source, dest).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.driver.delete(path).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn url_for(&self, path: &str) -> Result<String, StorageError> {
        self.driver.url_for(path).await
    }

    #[tracing::instrument(skip(self, visitor), fields(driver = self.driver.name()))]
    pub async fn walk(&self, path: &str, visitor: &mut WalkFn<'_>) -> Result<(), StorageError> {
        self.driver.walk(path, visitor).await
    }

    #[tracing::instrument(skip(self), fields(driver = self.driver.name()))]
    pub async fn health(&self) -> Result<(), StorageError> {
        self.driver.health().await
    }

    /// Run the health check and report the outcome as a status.
    pub async fn health_status(&self) -> HealthStatus {
        let status = HealthStatus::from(&self.health().await);
        tracing::trace!(driver = self.driver.name(), %status, "health");
        status
    }
}

#[cfg(test)]
mod tests {
    use sftp_driver::Credential;

    use super::*;

    static_assertions::assert_impl_all!(Storage: Send, Sync, Clone);

    fn model() -> RegistryModel {
        RegistryModel {
            url: "sftp://files.example.com/srv/registry".into(),
            insecure: true,
            credential: Some(Credential {
                access_key: "registry".into(),
                access_secret: "hunter2".into(),
            }),
        }
    }

    #[test]
    fn registry_type_selects_backend() {
        let config = StorageConfig::from_registry("sftp", model()).unwrap();
        assert_eq!(config.registry_type(), "sftp");

        let StorageConfig::Sftp(sftp) = config;
        assert_eq!(sftp.url, "sftp://files.example.com/srv/registry");
        assert!(sftp.insecure);
    }

    #[test]
    fn unknown_registry_type() {
        let err = StorageConfig::from_registry("s3", model()).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Other);
        assert!(err.to_string().contains("s3"), "{err}");
    }
}
