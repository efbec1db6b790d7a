use std::io;

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use sshpool::{ConnectionIdentity, ConnectionPool, OpenOptions, PoolError, PooledSession, RemoteFile, RemoteFs};
use storage_driver::{
    walk_fallback, FileInfo, FileReader, FileWriter, Regulator, StorageDriver, StorageError,
    StorageErrorKind, WalkFn,
};
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};

use crate::paths;
use crate::reader::SftpFileReader;
use crate::writer::SftpFileWriter;
use crate::DRIVER_NAME;

const DEFAULT_CONCURRENCY: usize = 100;

/// A [`StorageDriver`] which stores objects below a base directory on an
/// SFTP server, using sessions from a shared [`ConnectionPool`].
///
/// Every call takes one session from the pool and returns it before the
/// call completes, except for readers and writers which hold their session
/// until they are closed.
#[derive(Debug, Clone)]
pub struct SftpDriver {
    base: String,
    identity: ConnectionIdentity,
    pool: ConnectionPool,
    regulator: Regulator,
}

impl SftpDriver {
    /// Create a driver rooted at `base` on the endpoint described by `identity`.
    pub fn new(pool: ConnectionPool, identity: ConnectionIdentity, base: &str) -> Self {
        Self {
            base: paths::base(base),
            identity,
            pool,
            regulator: Regulator::new(DEFAULT_CONCURRENCY),
        }
    }

    /// Replace the limiter bounding concurrent calls.
    pub fn with_regulator(mut self, regulator: Regulator) -> Self {
        self.regulator = regulator;
        self
    }

    /// The remote base directory. Empty when the driver is rooted at `/`.
    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// The endpoint this driver connects to.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// The pool this driver takes sessions from.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    fn remote(&self, path: &str) -> Result<camino::Utf8PathBuf, StorageError> {
        paths::validate(path)?;
        Ok(paths::join(&self.base, path))
    }

    fn logical(&self, remote: &Utf8Path) -> String {
        paths::strip(&self.base, remote.as_str())
    }

    async fn session(&self, op: &str, path: &str) -> Result<PooledSession, StorageError> {
        self.pool
            .acquire(&self.identity)
            .await
            .map_err(|error| pool_error(op, path, error))
    }
}

fn pool_error(op: &str, path: &str, error: PoolError) -> StorageError {
    let kind = match &error {
        PoolError::Connect { .. } | PoolError::Broken { .. } => StorageErrorKind::Connect,
        PoolError::Session { .. } => StorageErrorKind::Session,
        PoolError::Closed { .. } | PoolError::Shutdown => StorageErrorKind::Precondition,
    };
    StorageError::builder(DRIVER_NAME, kind, error)
        .path(path)
        .context(op)
        .build()
}

fn io_error<'a>(op: &'a str, path: &'a str) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |error| StorageError::io(DRIVER_NAME, op, path, error)
}

fn file_info(path: String, size: u64, modified: Option<DateTime<Utc>>, is_dir: bool) -> FileInfo {
    let modified = modified.unwrap_or(DateTime::UNIX_EPOCH);
    if is_dir {
        FileInfo::directory(path, modified)
    } else {
        FileInfo::file(path, size, modified)
    }
}

async fn read_all(fs: &dyn RemoteFs, remote: &Utf8Path) -> io::Result<Vec<u8>> {
    let mut file = fs.open(remote, OpenOptions::read()).await?;
    let mut data = Vec::new();
    let read = file.read_to_end(&mut data).await;
    let closed = file.close().await;
    read?;
    if let Err(error) = closed {
        tracing::trace!(%remote, %error, "error closing file after read");
    }
    Ok(data)
}

async fn write_all(fs: &dyn RemoteFs, remote: &Utf8Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = paths::parent(remote) {
        fs.create_dir_all(parent).await?;
    }

    let mut file = fs.open(remote, OpenOptions::truncate()).await?;
    let written = async {
        file.write_all(content).await?;
        file.flush().await
    }
    .await;
    let closed = file.close().await;
    written.and(closed)
}

/// Open `remote` for writing, returning the handle and the offset writes start at.
async fn open_for_write(
    fs: &dyn RemoteFs,
    remote: &Utf8Path,
    append: bool,
) -> io::Result<(Box<dyn RemoteFile>, u64)> {
    if let Some(parent) = paths::parent(remote) {
        fs.create_dir_all(parent).await?;
    }

    if !append {
        let file = fs.open(remote, OpenOptions::truncate()).await?;
        return Ok((file, 0));
    }

    let options = OpenOptions {
        create: true,
        ..OpenOptions::append()
    };
    let mut file = fs.open(remote, options).await?;
    match file.seek(io::SeekFrom::End(0)).await {
        Ok(size) => Ok((file, size)),
        Err(error) => {
            let _ = file.close().await;
            Err(error)
        }
    }
}

async fn rename(fs: &dyn RemoteFs, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
    if let Some(parent) = paths::parent(to) {
        fs.create_dir_all(parent).await?;
    }
    fs.rename(from, to).await
}

/// Position `file` at `offset`, refusing offsets past the end of the file.
async fn seek_to(file: &mut dyn RemoteFile, offset: u64, path: &str) -> Result<(), StorageError> {
    let invalid = |message: String| {
        StorageError::builder(DRIVER_NAME, StorageErrorKind::InvalidOffset, message)
            .path(path)
            .context("reader")
            .build()
    };

    let size = file.metadata().await.map_err(io_error("reader", path))?.size;
    if offset > size {
        return Err(invalid(format!(
            "offset {offset} is past the end of the file ({size} bytes)"
        )));
    }

    let position = file
        .seek(io::SeekFrom::Start(offset))
        .await
        .map_err(io_error("reader", path))?;
    if position < offset {
        return Err(invalid(format!("seek to {offset} stopped at {position}")));
    }
    Ok(())
}

#[async_trait::async_trait]
impl StorageDriver for SftpDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    async fn get_content(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, "get content");

        let session = self.session("get_content", path).await?;
        let result = read_all(&*session, &remote).await;
        session.release().await;
        result.map_err(io_error("get_content", path))
    }

    async fn put_content(&self, path: &str, content: &[u8]) -> Result<(), StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, length = content.len(), "put content");

        let session = self.session("put_content", path).await?;
        let result = write_all(&*session, &remote, content).await;
        session.release().await;
        result.map_err(io_error("put_content", path))
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<Box<dyn FileReader>, StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, offset, "reader");

        let session = self.session("reader", path).await?;
        let mut file = match session.open(&remote, OpenOptions::read()).await {
            Ok(file) => file,
            Err(error) => {
                session.release().await;
                return Err(io_error("reader", path)(error));
            }
        };

        if let Err(error) = seek_to(&mut *file, offset, path).await {
            let _ = file.close().await;
            session.release().await;
            return Err(error);
        }

        Ok(Box::new(SftpFileReader::new(path, file, session)))
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>, StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, append, "writer");

        let session = self.session("writer", path).await?;
        match open_for_write(&*session, &remote, append).await {
            Ok((file, size)) => Ok(Box::new(SftpFileWriter::new(
                path, remote, file, session, size,
            ))),
            Err(error) => {
                session.release().await;
                Err(io_error("writer", path)(error))
            }
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo, StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, "stat");

        let session = self.session("stat", path).await?;
        let result = session.metadata(&remote).await;
        session.release().await;

        let metadata = result.map_err(io_error("stat", path))?;
        Ok(file_info(
            self.logical(&remote),
            metadata.size,
            metadata.modified,
            metadata.is_dir,
        ))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, "list");

        let session = self.session("list", path).await?;
        let result = session.read_dir(&remote).await;
        session.release().await;

        let entries = result.map_err(io_error("list", path))?;
        Ok(entries
            .into_iter()
            .map(|entry| self.logical(&remote.join(&entry.name)))
            .collect())
    }

    async fn move_to(&self, source: &str, dest: &str) -> Result<(), StorageError> {
        let _guard = self.regulator.enter().await?;
        let from = self.remote(source)?;
        let to = self.remote(dest)?;
        tracing::debug!(%source, %dest, "move");

        let session = self.session("move", source).await?;
        let result = rename(&*session, &from, &to).await;
        session.release().await;
        result.map_err(io_error("move", source))
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let _guard = self.regulator.enter().await?;
        let remote = self.remote(path)?;
        tracing::debug!(%path, "delete");

        let session = self.session("delete", path).await?;
        let result = session.remove_all(&remote).await;
        session.release().await;
        result.map_err(io_error("delete", path))
    }

    async fn walk(&self, path: &str, visitor: &mut WalkFn<'_>) -> Result<(), StorageError> {
        paths::validate(path)?;
        tracing::debug!(%path, "walk");
        walk_fallback(self, path, visitor).await
    }

    async fn health(&self) -> Result<(), StorageError> {
        let _guard = self.regulator.enter().await?;
        let session = self.session("health", "/").await?;
        let result = session.working_dir().await;
        session.release().await;

        let cwd = result.map_err(io_error("health", "/"))?;
        tracing::trace!(%cwd, target = %self.identity, "healthy");
        Ok(())
    }
}
