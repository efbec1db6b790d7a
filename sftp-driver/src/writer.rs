//! The write-commit state machine for remote files.

use std::io;

use camino::Utf8PathBuf;
use sshpool::{PooledSession, RemoteFile};
use storage_driver::{FileWriter, StorageError, StorageErrorKind};
use tokio::io::AsyncWriteExt as _;

use crate::DRIVER_NAME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Cancelled,
}

/// Writes one remote file while holding the session it was opened on.
///
/// The writer accepts writes until it is committed or cancelled. Committing
/// flushes the file and asks the server to sync it. Cancelling closes the
/// handle and removes the file. Either way, [`FileWriter::close`] must be
/// called once to return the session to the pool.
#[derive(Debug)]
pub struct SftpFileWriter {
    path: String,
    remote: Utf8PathBuf,
    file: Option<Box<dyn RemoteFile>>,
    session: Option<PooledSession>,
    size: u64,
    state: State,
    closed: bool,
}

impl SftpFileWriter {
    pub(crate) fn new(
        path: &str,
        remote: Utf8PathBuf,
        file: Box<dyn RemoteFile>,
        session: PooledSession,
        size: u64,
    ) -> Self {
        Self {
            path: path.to_owned(),
            remote,
            file: Some(file),
            session: Some(session),
            size,
            state: State::Open,
            closed: false,
        }
    }

    fn io_error(&self, op: &str, error: io::Error) -> StorageError {
        StorageError::io(DRIVER_NAME, op, &self.path, error)
    }

    /// Reject the operation unless the writer is still open for writing.
    fn check_open(&self, op: &str) -> Result<(), StorageError> {
        if self.closed {
            return Err(rejected(&self.path, op, "already closed"));
        }
        match self.state {
            State::Open => Ok(()),
            State::Committed => Err(rejected(&self.path, op, "already committed")),
            State::Cancelled => Err(rejected(&self.path, op, "already cancelled")),
        }
    }

    fn file(&mut self, op: &str) -> Result<&mut Box<dyn RemoteFile>, StorageError> {
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(rejected(&self.path, op, "file handle is closed")),
        }
    }
}

fn rejected(path: &str, op: &str, message: &'static str) -> StorageError {
    StorageError::builder(DRIVER_NAME, StorageErrorKind::Precondition, message)
        .path(path)
        .context(op)
        .build()
}

#[async_trait::async_trait]
impl FileWriter for SftpFileWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, StorageError> {
        self.check_open("write")?;
        let written = self.file("write")?.write(buf).await;
        match written {
            Ok(n) => {
                self.size += n as u64;
                Ok(n)
            }
            Err(error) => Err(self.io_error("write", error)),
        }
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.check_open("commit")?;
        let file = self.file("commit")?;

        let mut result = file.flush().await;
        if result.is_ok() {
            result = match file.sync_all().await {
                Err(error) if error.kind() == io::ErrorKind::Unsupported => Ok(()),
                other => other,
            };
        }

        match result {
            Ok(()) => {
                self.state = State::Committed;
                Ok(())
            }
            Err(error) => Err(self.io_error("commit", error)),
        }
    }

    async fn cancel(&mut self) -> Result<(), StorageError> {
        self.check_open("cancel")?;
        self.state = State::Cancelled;

        if let Some(mut file) = self.file.take() {
            if let Err(error) = file.close().await {
                tracing::debug!(path = %self.path, %error, "error closing cancelled file");
            }
        }

        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        match session.remove_file(&self.remote).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(self.io_error("cancel", error)),
        }
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Err(rejected(&self.path, "close", "already closed"));
        }
        self.closed = true;

        let mut result = Ok(());
        if let Some(mut file) = self.file.take() {
            result = file.flush().await;
            let closed = file.close().await;
            if result.is_ok() {
                result = closed;
            }
        }

        if let Some(session) = self.session.take() {
            session.release().await;
        }

        result.map_err(|error| self.io_error("close", error))
    }
}
