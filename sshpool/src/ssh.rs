//! SSH transport and SFTP sessions on top of `russh` and `russh-sftp`.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::DateTime;
use parking_lot::Mutex;
use russh::client::{self, Handle, Handler};
use russh::keys::key::PublicKey;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, AsyncWriteExt as _, ReadBuf};

use crate::error::TransportError;
use crate::identity::{AuthMethod, ConnectionIdentity, HostKeyPolicy};
use crate::net;
use crate::secret::Secret;
use crate::transport::{
    Connector, OpenOptions, RemoteDirEntry, RemoteFile, RemoteFs, RemoteMetadata, Transport,
};

/// Interval of the protocol-level `keepalive@openssh.com` request sent when
/// the server has been silent.
const PROTOCOL_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Unanswered keepalive requests tolerated before `russh` drops the connection.
const PROTOCOL_KEEPALIVE_MAX: usize = 3;

/// Connects to SSH servers with `russh` and opens SFTP sessions with `russh-sftp`.
#[derive(Clone)]
pub struct RusshConnector {
    config: Arc<client::Config>,
}

impl fmt::Debug for RusshConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusshConnector").finish_non_exhaustive()
    }
}

impl Default for RusshConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RusshConnector {
    /// A connector using the default `russh` client configuration with
    /// protocol keepalives turned on.
    pub fn new() -> Self {
        Self::with_config(client::Config {
            keepalive_interval: Some(PROTOCOL_KEEPALIVE_INTERVAL),
            keepalive_max: PROTOCOL_KEEPALIVE_MAX,
            ..Default::default()
        })
    }

    /// A connector using a custom `russh` client configuration.
    ///
    /// Connection liveness is only detected when `keepalive_interval` is set.
    pub fn with_config(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait::async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let stream = net::dial(identity).await?;

        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: identity.host().to_owned(),
            port: identity.port(),
            policy: identity.host_key().clone(),
            rejection: rejection.clone(),
        };

        let mut handle = match client::connect_stream(self.config.clone(), stream, handler).await {
            Ok(handle) => handle,
            Err(error) => {
                let reason = rejection.lock().take();
                return Err(match reason {
                    Some(reason) => TransportError::HostKey {
                        host: identity.host().to_owned(),
                        reason,
                    },
                    None => error.into(),
                });
            }
        };

        authenticate(&mut handle, identity).await?;
        tracing::debug!(target = %identity, "ssh session authenticated");

        Ok(Arc::new(RusshTransport {
            handle,
            target: identity.to_string(),
        }))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    identity: &ConnectionIdentity,
) -> Result<(), TransportError> {
    for method in identity.auth() {
        let accepted = match method {
            AuthMethod::Password(password) => {
                handle
                    .authenticate_password(identity.user(), password.revealed())
                    .await?
            }
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = russh::keys::load_secret_key(path, passphrase.as_ref().map(Secret::revealed))?;
                handle
                    .authenticate_publickey(identity.user(), Arc::new(key))
                    .await?
            }
        };

        if accepted {
            return Ok(());
        }
        tracing::debug!(target = %identity, method = method_name(method), "authentication rejected");
    }

    Err(TransportError::Auth {
        user: identity.user().to_owned(),
    })
}

fn method_name(method: &AuthMethod) -> &'static str {
    match method {
        AuthMethod::Password(_) => "password",
        AuthMethod::PrivateKey { .. } => "publickey",
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    rejection: Arc<Mutex<Option<String>>>,
}

impl ClientHandler {
    fn verify(&self, key: &PublicKey) -> Result<(), String> {
        match &self.policy {
            HostKeyPolicy::InsecureIgnore => Ok(()),
            HostKeyPolicy::Fingerprint(expected) => {
                let expected = expected.strip_prefix("SHA256:").unwrap_or(expected);
                let actual = key.fingerprint();
                if actual == expected {
                    Ok(())
                } else {
                    Err(format!("fingerprint SHA256:{actual} is not the pinned key"))
                }
            }
            HostKeyPolicy::KnownHosts(path) => {
                match russh::keys::check_known_hosts_path(&self.host, self.port, key, path) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(format!("host is not listed in {path}")),
                    Err(error) => Err(format!("{path}: {error}")),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match self.verify(server_public_key) {
            Ok(()) => Ok(true),
            Err(reason) => {
                tracing::warn!(host = %self.host, port = self.port, %reason, "host key rejected");
                *self.rejection.lock() = Some(reason);
                Ok(false)
            }
        }
    }
}

struct RusshTransport {
    handle: Handle<ClientHandler>,
    target: String,
}

impl fmt::Debug for RusshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RusshTransport")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for RusshTransport {
    async fn open_session(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(TransportError::Sftp)?;
        Ok(Box::new(SftpFs { sftp }))
    }

    // The keepalive requests themselves are global requests sent by the
    // russh session loop, so they never take a channel slot. The loop exits
    // once `keepalive_max` of them go unanswered.
    async fn keepalive(&self) -> Result<(), TransportError> {
        if self.handle.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

fn io_error(error: SftpError) -> io::Error {
    let kind = match &error {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => io::ErrorKind::NotFound,
            StatusCode::PermissionDenied => io::ErrorKind::PermissionDenied,
            StatusCode::OpUnsupported => io::ErrorKind::Unsupported,
            StatusCode::Eof => io::ErrorKind::UnexpectedEof,
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                io::ErrorKind::ConnectionAborted
            }
            _ => io::ErrorKind::Other,
        },
        SftpError::Timeout => io::ErrorKind::TimedOut,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, error)
}

fn metadata(attrs: &FileAttributes) -> RemoteMetadata {
    let is_dir = attrs.is_dir();
    RemoteMetadata {
        size: if is_dir { 0 } else { attrs.size.unwrap_or(0) },
        modified: attrs
            .mtime
            .and_then(|mtime| DateTime::from_timestamp(i64::from(mtime), 0)),
        is_dir,
    }
}

fn open_flags(options: OpenOptions) -> OpenFlags {
    let mut flags = OpenFlags::empty();
    if options.read {
        flags |= OpenFlags::READ;
    }
    if options.write {
        flags |= OpenFlags::WRITE;
    }
    if options.append {
        flags |= OpenFlags::APPEND;
    }
    if options.create {
        flags |= OpenFlags::CREATE;
    }
    if options.truncate {
        flags |= OpenFlags::TRUNCATE;
    }
    flags
}

struct SftpFs {
    sftp: SftpSession,
}

impl fmt::Debug for SftpFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpFs").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl RemoteFs for SftpFs {
    async fn open(&self, path: &Utf8Path, options: OpenOptions) -> io::Result<Box<dyn RemoteFile>> {
        let file = self
            .sftp
            .open_with_flags(path.as_str(), open_flags(options))
            .await
            .map_err(io_error)?;
        Ok(Box::new(SftpFile {
            file: Box::pin(file),
        }))
    }

    async fn metadata(&self, path: &Utf8Path) -> io::Result<RemoteMetadata> {
        let attrs = self.sftp.metadata(path.as_str()).await.map_err(io_error)?;
        Ok(metadata(&attrs))
    }

    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<RemoteDirEntry>> {
        let entries = self.sftp.read_dir(path.as_str()).await.map_err(io_error)?;
        Ok(entries
            .filter(|entry| !matches!(entry.file_name().as_str(), "." | ".."))
            .map(|entry| RemoteDirEntry {
                name: entry.file_name(),
                metadata: metadata(&entry.metadata()),
            })
            .collect())
    }

    async fn create_dir(&self, path: &Utf8Path) -> io::Result<()> {
        match self.sftp.create_dir(path.as_str()).await.map_err(io_error) {
            Ok(()) => Ok(()),
            // Servers report an existing directory as a plain failure.
            Err(error) if error.kind() == io::ErrorKind::Other => {
                match self.metadata(path).await {
                    Ok(existing) if existing.is_dir => Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{path} already exists"),
                    )),
                    _ => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        match self.sftp.rename(from.as_str(), to.as_str()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                let error = io_error(error);
                if error.kind() == io::ErrorKind::NotFound {
                    return Err(error);
                }

                // SFTPv3 rename refuses to replace an existing file. The
                // destination is gone if the second rename fails.
                match self.metadata(to).await {
                    Ok(existing) if !existing.is_dir => {
                        self.remove_file(to).await?;
                        self.sftp
                            .rename(from.as_str(), to.as_str())
                            .await
                            .map_err(io_error)
                    }
                    _ => Err(error),
                }
            }
        }
    }

    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        self.sftp.remove_file(path.as_str()).await.map_err(io_error)
    }

    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        self.sftp.remove_dir(path.as_str()).await.map_err(io_error)
    }

    async fn working_dir(&self) -> io::Result<Utf8PathBuf> {
        let cwd = self.sftp.canonicalize(".").await.map_err(io_error)?;
        Ok(Utf8PathBuf::from(cwd))
    }

    async fn close(&self) -> io::Result<()> {
        self.sftp.close().await.map_err(io_error)
    }
}

struct SftpFile {
    file: Pin<Box<File>>,
}

impl fmt::Debug for SftpFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SftpFile").finish_non_exhaustive()
    }
}

impl AsyncRead for SftpFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().file.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for SftpFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().file.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().file.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().file.as_mut().poll_shutdown(cx)
    }
}

impl AsyncSeek for SftpFile {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        self.get_mut().file.as_mut().start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        self.get_mut().file.as_mut().poll_complete(cx)
    }
}

#[async_trait::async_trait]
impl RemoteFile for SftpFile {
    async fn sync_all(&mut self) -> io::Result<()> {
        match self.file.sync_all().await {
            Ok(()) => Ok(()),
            Err(SftpError::UnexpectedBehavior(message)) => {
                Err(io::Error::new(io::ErrorKind::Unsupported, message))
            }
            Err(error) => Err(io_error(error)),
        }
    }

    async fn metadata(&mut self) -> io::Result<RemoteMetadata> {
        let attrs = self.file.metadata().await.map_err(io_error)?;
        Ok(metadata(&attrs))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.file.shutdown().await
    }
}
