use std::{fmt, ops::Deref, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::io;

use crate::error::{StorageError, StorageErrorKind};
use crate::walk::{walk_fallback, WalkFn};

/// File object information, which will be generically provided by the driver.
///
/// Paths are always logical paths (rooted at `/`), never the backend's
/// own location for the object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    /// The logical path of the object.
    pub path: String,

    /// The size of the file in bytes. Always zero for directories.
    pub size: u64,

    /// The modification timestamp of the object.
    pub modified: DateTime<Utc>,

    /// Whether the object is a directory.
    pub is_dir: bool,
}

impl FileInfo {
    /// Information for a regular file.
    pub fn file(path: impl Into<String>, size: u64, modified: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            is_dir: false,
        }
    }

    /// Information for a directory, which never carries a size.
    pub fn directory(path: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            modified,
            is_dir: true,
        }
    }
}

/// A readable stream over one stored object.
///
/// The stream may hold backend resources (e.g. a remote session) until
/// [`FileReader::close`] is called. Dropping the reader without closing it
/// still releases those resources, but skips orderly shutdown.
#[async_trait::async_trait]
pub trait FileReader: io::AsyncRead + Unpin + Send + fmt::Debug {
    /// Close the stream and release any backend resources.
    ///
    /// A second call fails with an "already closed" precondition error.
    async fn close(&mut self) -> Result<(), StorageError>;
}

/// A writable stream which follows an explicit commit protocol.
///
/// Writes are accepted until the writer is committed, cancelled or closed.
/// At most one of commit and cancel can succeed, and `close` must be
/// called exactly once to release backend resources.
#[async_trait::async_trait]
pub trait FileWriter: Send + fmt::Debug {
    /// Append bytes to the stream, returning the number of bytes written.
    async fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError>;

    /// The total size of the object, including bytes present before
    /// the writer was opened in append mode.
    fn size(&self) -> u64;

    /// Finalize the written contents.
    async fn commit(&mut self) -> Result<(), StorageError>;

    /// Abandon the written contents.
    async fn cancel(&mut self) -> Result<(), StorageError>;

    /// Close the stream and release any backend resources.
    async fn close(&mut self) -> Result<(), StorageError>;

    /// Write the entire buffer to the stream.
    async fn write_all(&mut self, mut buf: &[u8]) -> Result<(), StorageError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(StorageError::new(
                    "writer",
                    StorageErrorKind::Io,
                    std::io::Error::from(std::io::ErrorKind::WriteZero),
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// A storage driver, which provides path-addressed access to a storage backend.
///
/// All paths are logical: they start with `/` and are interpreted relative to
/// whatever root the driver was configured with.
#[async_trait::async_trait]
pub trait StorageDriver: fmt::Debug + Send + Sync {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Read the full contents of the object at `path`.
    async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Replace the contents of the object at `path`, creating parents as needed.
    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), StorageError>;

    /// Open a stream reading the object at `path`, starting at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> Result<Box<dyn FileReader>, StorageError>;

    /// Open a stream writing the object at `path`.
    ///
    /// When `append` is set, writes continue after the existing contents,
    /// otherwise the object is truncated.
    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError>;

    /// Get information about the object at `path`.
    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError>;

    /// List the immediate children of the directory at `path`.
    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError>;

    /// Move an object from `source` to `dest`, creating parents as needed.
    async fn move_to(&self, source: &str, dest: &str) -> Result<(), StorageError>;

    /// Recursively delete the object at `path`.
    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    /// Get a direct URL for the object at `path`.
    async fn url_for(&self, path: &str) -> Result<String, StorageError> {
        Err(StorageError::builder(
            self.name(),
            StorageErrorKind::Precondition,
            "url_for is not implemented",
        )
        .path(path)
        .build())
    }

    /// Walk the tree below `path`, calling `visitor` for every entry.
    async fn walk(&self, path: &str, visitor: &mut WalkFn<'_>) -> Result<(), StorageError> {
        walk_fallback(self, path, visitor).await
    }

    /// Check that the backend is reachable.
    async fn health(&self) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> StorageDriver for Arc<D>
where
    D: ?Sized + StorageDriver,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.deref().get_content(path).await
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        self.deref().put_content(path, content).await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Box<dyn FileReader>, StorageError> {
        self.deref().reader(path, offset).await
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        self.deref().writer(path, append).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        self.deref().stat(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        self.deref().list(path).await
    }

    async fn move_to(&self, source: &str, dest: &str) -> Result<(), StorageError> {
        self.deref().move_to(source, dest).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.deref().delete(path).await
    }

    async fn url_for(&self, path: &str) -> Result<String, StorageError> {
        self.deref().url_for(path).await
    }

    async fn walk(&self, path: &str, visitor: &mut WalkFn<'_>) -> Result<(), StorageError> {
        self.deref().walk(path, visitor).await
    }

    async fn health(&self) -> Result<(), StorageError> {
        self.deref().health().await
    }
}

#[async_trait::async_trait]
impl<D> StorageDriver for &D
where
    D: ?Sized + StorageDriver,
{
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        (**self).get_content(path).await
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        (**self).put_content(path, content).await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Box<dyn FileReader>, StorageError> {
        (**self).reader(path, offset).await
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        (**self).writer(path, append).await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        (**self).stat(path).await
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        (**self).list(path).await
    }

    async fn move_to(&self, source: &str, dest: &str) -> Result<(), StorageError> {
        (**self).move_to(source, dest).await
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        (**self).delete(path).await
    }

    async fn url_for(&self, path: &str) -> Result<String, StorageError> {
        (**self).url_for(path).await
    }

    async fn walk(&self, path: &str, visitor: &mut WalkFn<'_>) -> Result<(), StorageError> {
        (**self).walk(path, visitor).await
    }

    async fn health(&self) -> Result<(), StorageError> {
        (**self).health().await
    }
}
