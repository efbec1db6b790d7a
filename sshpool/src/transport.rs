//! Capability traits for the secure transport and the remote filesystem.

use std::fmt;
use std::io;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

use crate::error::TransportError;
use crate::identity::ConnectionIdentity;

/// Establishes authenticated transport connections.
#[async_trait::async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    /// Dial, handshake and authenticate against the endpoint described by `identity`.
    async fn connect(&self, identity: &ConnectionIdentity)
        -> Result<Arc<dyn Transport>, TransportError>;
}

/// One established transport connection.
#[async_trait::async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    /// Open a new file-transfer session on this connection.
    async fn open_session(&self) -> Result<Box<dyn RemoteFs>, TransportError>;

    /// Send a lightweight liveness request.
    async fn keepalive(&self) -> Result<(), TransportError>;

    /// Whether the transport already knows it is closed.
    fn is_closed(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// How a remote file is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// All writes go to the end of the file.
    pub append: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Truncate an existing file to zero length.
    pub truncate: bool,
}

impl OpenOptions {
    /// Read only.
    pub fn read() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Read and write, creating the file or truncating it.
    pub fn truncate() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Read and write at the end of an existing file.
    pub fn append() -> Self {
        Self {
            read: true,
            write: true,
            append: true,
            ..Default::default()
        }
    }
}

/// Attributes of a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// Size in bytes.
    pub size: u64,
    /// Modification time, when the server reports one.
    pub modified: Option<DateTime<Utc>>,
    /// Whether this is a directory.
    pub is_dir: bool,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    /// The entry's name within its directory.
    pub name: String,
    /// The entry's attributes.
    pub metadata: RemoteMetadata,
}

/// An open remote file.
#[async_trait::async_trait]
pub trait RemoteFile: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send + fmt::Debug {
    /// Flush written data to stable storage on the remote side.
    ///
    /// Returns [`io::ErrorKind::Unsupported`] when the server cannot do this.
    async fn sync_all(&mut self) -> io::Result<()>;

    /// Attributes of the open file.
    async fn metadata(&mut self) -> io::Result<RemoteMetadata>;

    /// Close the remote handle.
    async fn close(&mut self) -> io::Result<()>;
}

/// Remote file operations available on a session.
///
/// Missing paths are reported as [`io::ErrorKind::NotFound`].
#[async_trait::async_trait]
pub trait RemoteFs: fmt::Debug + Send + Sync {
    /// Open a file.
    async fn open(&self, path: &Utf8Path, options: OpenOptions) -> io::Result<Box<dyn RemoteFile>>;

    /// Attributes of a path, following symlinks.
    async fn metadata(&self, path: &Utf8Path) -> io::Result<RemoteMetadata>;

    /// Entries of a directory, without `.` and `..`.
    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<RemoteDirEntry>>;

    /// Create one directory. The parent must exist.
    async fn create_dir(&self, path: &Utf8Path) -> io::Result<()>;

    /// Rename a file or directory, replacing an existing destination file.
    ///
    /// The replacement is not atomic on servers which refuse to rename over
    /// an existing file: the destination is removed first, so it is lost if
    /// the rename then fails.
    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()>;

    /// Remove a file.
    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()>;

    /// Remove an empty directory.
    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()>;

    /// The session's working directory.
    async fn working_dir(&self) -> io::Result<Utf8PathBuf>;

    /// End the session.
    async fn close(&self) -> io::Result<()>;

    /// Create a directory and all of its missing parents.
    async fn create_dir_all(&self, path: &Utf8Path) -> io::Result<()> {
        match self.metadata(path).await {
            Ok(metadata) if metadata.is_dir => return Ok(()),
            Ok(_) => return Err(not_a_directory(path)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }

        let mut ancestors: Vec<&Utf8Path> = path
            .ancestors()
            .filter(|p| !p.as_str().is_empty() && p.as_str() != "/")
            .collect();
        ancestors.reverse();

        for dir in ancestors {
            match self.metadata(dir).await {
                Ok(metadata) if metadata.is_dir => continue,
                Ok(_) => return Err(not_a_directory(dir)),
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }

            match self.create_dir(dir).await {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }

    /// Remove a path and everything below it. A missing path is not an error.
    async fn remove_all(&self, path: &Utf8Path) -> io::Result<()> {
        let metadata = match self.metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error),
        };

        if !metadata.is_dir {
            return tolerate_missing(self.remove_file(path).await);
        }

        let mut stack = vec![(path.to_owned(), false)];
        while let Some((dir, emptied)) = stack.pop() {
            if emptied {
                tolerate_missing(self.remove_dir(&dir).await)?;
                continue;
            }

            let entries = match self.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
                Err(error) => return Err(error),
            };

            stack.push((dir.clone(), true));
            for entry in entries {
                let child = dir.join(&entry.name);
                if entry.metadata.is_dir {
                    stack.push((child, false));
                } else {
                    tolerate_missing(self.remove_file(&child).await)?;
                }
            }
        }

        Ok(())
    }
}

fn not_a_directory(path: &Utf8Path) -> io::Error {
    io::Error::other(format!("{path} exists and is not a directory"))
}

fn tolerate_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
