//! Settings files combining pool and storage configuration.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use sshpool::PoolConfig;

use crate::StorageConfig;

/// Errors loading a settings file.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The file could not be read.
    #[error("reading settings from {path}")]
    Read {
        /// The file.
        path: Utf8PathBuf,

        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The file is not valid settings TOML.
    #[error("parsing settings")]
    Parse(#[from] toml_edit::de::Error),
}

/// The contents of a settings file:
///
/// ```toml
/// [pool]
/// gc-interval = 30
/// max-idle = 4
///
/// [storage.sftp]
/// url = "sftp://files.example.com/srv/registry"
/// known-hosts = "/etc/ssh/ssh_known_hosts"
///
/// [storage.sftp.credential]
/// access-key = "registry"
/// access-secret = "hunter2"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Connection pool settings. Defaults apply when absent.
    #[serde(default)]
    pub pool: PoolConfig,

    /// The storage endpoint.
    pub storage: StorageConfig,
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        Ok(toml_edit::de::from_str(text)?)
    }

    /// Read and parse a settings file.
    pub async fn load(path: &Utf8Path) -> Result<Self, SettingsError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| SettingsError::Read {
                path: path.to_owned(),
                source,
            })?;
        Self::from_toml(&text)
    }
}
