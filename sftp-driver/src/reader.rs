use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use sshpool::{PooledSession, RemoteFile};
use storage_driver::{FileReader, StorageError, StorageErrorKind};
use tokio::io::{AsyncRead, ReadBuf};

use crate::DRIVER_NAME;

/// Reads one remote file while holding the session it was opened on.
///
/// [`FileReader::close`] closes the remote handle first, then returns the
/// session to the pool.
#[derive(Debug)]
pub struct SftpFileReader {
    path: String,
    file: Option<Box<dyn RemoteFile>>,
    session: Option<PooledSession>,
}

impl SftpFileReader {
    pub(crate) fn new(path: &str, file: Box<dyn RemoteFile>, session: PooledSession) -> Self {
        Self {
            path: path.to_owned(),
            file: Some(file),
            session: Some(session),
        }
    }
}

impl AsyncRead for SftpFileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().file.as_mut() {
            Some(file) => Pin::new(file).poll_read(cx, buf),
            None => Poll::Ready(Err(io::Error::other("reader is closed"))),
        }
    }
}

#[async_trait::async_trait]
impl FileReader for SftpFileReader {
    async fn close(&mut self) -> Result<(), StorageError> {
        let Some(mut file) = self.file.take() else {
            return Err(
                StorageError::builder(DRIVER_NAME, StorageErrorKind::Precondition, "already closed")
                    .path(&self.path)
                    .context("close reader")
                    .build(),
            );
        };

        let closed = file.close().await;
        drop(file);
        if let Some(session) = self.session.take() {
            session.release().await;
        }

        closed.map_err(|error| StorageError::io(DRIVER_NAME, "close reader", &self.path, error))
    }
}
