//! An in-process remote filesystem behind the transport traits.
//!
//! [`MemoryRemote`] acts as both the server and the [`Connector`]. It counts
//! connections and open sessions, and can be told to refuse connections,
//! refuse or cap sessions, fail keepalives or drop every connection, which
//! makes it useful for exercising the pool without a real SSH server.

use std::collections::BTreeMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use crate::error::TransportError;
use crate::identity::{AuthMethod, ConnectionIdentity};
use crate::secret::Secret;
use crate::transport::{
    Connector, OpenOptions, RemoteDirEntry, RemoteFile, RemoteFs, RemoteMetadata, Transport,
};

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: DateTime<Utc> },
    File { data: Vec<u8>, modified: DateTime<Utc> },
}

impl Node {
    fn metadata(&self) -> RemoteMetadata {
        match self {
            Node::Dir { modified } => RemoteMetadata {
                size: 0,
                modified: Some(*modified),
                is_dir: true,
            },
            Node::File { data, modified } => RemoteMetadata {
                size: data.len() as u64,
                modified: Some(*modified),
                is_dir: false,
            },
        }
    }
}

#[derive(Debug, Default)]
struct Controls {
    refuse_connect: AtomicBool,
    refuse_sessions: AtomicBool,
    fail_keepalive: AtomicBool,
    max_channels: AtomicUsize,
    connect_delay: Mutex<Duration>,
    password: Mutex<Option<Secret>>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    open_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
}

#[derive(Debug)]
struct State {
    tree: Mutex<BTreeMap<Utf8PathBuf, Node>>,
    controls: Controls,
    counters: Counters,
    transports: Mutex<Vec<Weak<AtomicBool>>>,
}

/// An in-memory remote, reachable through any [`ConnectionIdentity`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// An empty remote containing only the root directory.
    pub fn new() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert(
            Utf8PathBuf::from("/"),
            Node::Dir {
                modified: Utc::now(),
            },
        );
        Self {
            state: Arc::new(State {
                tree: Mutex::new(tree),
                controls: Controls::default(),
                counters: Counters::default(),
                transports: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of successful connections made so far.
    pub fn connects(&self) -> usize {
        self.state.counters.connects.load(Ordering::SeqCst)
    }

    /// Number of sessions currently open.
    pub fn open_sessions(&self) -> usize {
        self.state.counters.open_sessions.load(Ordering::SeqCst)
    }

    /// Highest number of sessions that were open at the same time.
    pub fn peak_sessions(&self) -> usize {
        self.state.counters.peak_sessions.load(Ordering::SeqCst)
    }

    /// Refuse new connections.
    pub fn set_refuse_connect(&self, refuse: bool) {
        self.state
            .controls
            .refuse_connect
            .store(refuse, Ordering::SeqCst);
    }

    /// Refuse new sessions on existing connections.
    pub fn set_refuse_sessions(&self, refuse: bool) {
        self.state
            .controls
            .refuse_sessions
            .store(refuse, Ordering::SeqCst);
    }

    /// Refuse new sessions while `limit` sessions are open, the way sshd's
    /// `MaxSessions` does. Zero removes the limit.
    pub fn set_channel_limit(&self, limit: usize) {
        self.state
            .controls
            .max_channels
            .store(limit, Ordering::SeqCst);
    }

    /// Fail every keepalive request.
    pub fn set_keepalive_failure(&self, fail: bool) {
        self.state
            .controls
            .fail_keepalive
            .store(fail, Ordering::SeqCst);
    }

    /// Delay each connection attempt.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.controls.connect_delay.lock() = delay;
    }

    /// Only accept identities offering this password.
    pub fn require_password(&self, password: impl Into<Secret>) {
        *self.state.controls.password.lock() = Some(password.into());
    }

    /// Drop every established connection, as if the network went away.
    pub fn break_connections(&self) {
        let mut transports = self.state.transports.lock();
        for closed in transports.drain(..).filter_map(|t| t.upgrade()) {
            closed.store(true, Ordering::SeqCst);
        }
    }

    /// The contents of a file, if it exists.
    pub fn file(&self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        match self.state.tree.lock().get(&normalize(path.as_ref())) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether a file or directory exists.
    pub fn exists(&self, path: impl AsRef<Utf8Path>) -> bool {
        self.state
            .tree
            .lock()
            .contains_key(&normalize(path.as_ref()))
    }
}

#[async_trait::async_trait]
impl Connector for MemoryRemote {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let delay = *self.state.controls.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.state.controls.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        if let Some(required) = self.state.controls.password.lock().clone() {
            let offered = identity.auth().iter().any(|method| {
                matches!(method, AuthMethod::Password(password) if *password == required)
            });
            if !offered {
                return Err(TransportError::Auth {
                    user: identity.user().to_owned(),
                });
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        self.state.transports.lock().push(Arc::downgrade(&closed));
        self.state.counters.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(MemoryTransport {
            remote: self.clone(),
            closed,
        }))
    }
}

#[derive(Debug)]
struct MemoryTransport {
    remote: MemoryRemote,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn open_session(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let state = &self.remote.state;
        if state.controls.refuse_sessions.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("session refused".into()));
        }
        let limit = state.controls.max_channels.load(Ordering::SeqCst);
        if limit > 0 && state.counters.open_sessions.load(Ordering::SeqCst) >= limit {
            return Err(TransportError::Refused("administratively prohibited".into()));
        }

        let open = state.counters.open_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        state.counters.peak_sessions.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            remote: self.remote.clone(),
        }))
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.remote.state.controls.fail_keepalive.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("keepalive rejected".into()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
struct MemorySession {
    remote: MemoryRemote,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.remote
            .state
            .counters
            .open_sessions
            .fetch_sub(1, Ordering::SeqCst);
    }
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::from("/");
    for component in path.components() {
        match component {
            Utf8Component::Normal(name) => out.push(name),
            Utf8Component::ParentDir => {
                out.pop();
            }
            _ => {}
        }
    }
    out
}

fn not_found(path: &Utf8Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{path}: no such file"))
}

fn parent_is_dir(tree: &BTreeMap<Utf8PathBuf, Node>, path: &Utf8Path) -> bool {
    path.parent()
        .is_some_and(|parent| matches!(tree.get(parent), Some(Node::Dir { .. })))
}

fn children<'t>(
    tree: &'t BTreeMap<Utf8PathBuf, Node>,
    dir: &'t Utf8Path,
) -> impl Iterator<Item = (&'t Utf8PathBuf, &'t Node)> + 't {
    tree.range(dir.to_owned()..)
        .skip(1)
        .take_while(move |(path, _)| path.starts_with(dir))
        .filter(move |(path, _)| path.parent() == Some(dir))
}

#[async_trait::async_trait]
impl RemoteFs for MemorySession {
    async fn open(&self, path: &Utf8Path, options: OpenOptions) -> io::Result<Box<dyn RemoteFile>> {
        let path = normalize(path);
        let mut tree = self.remote.state.tree.lock();
        match tree.get_mut(&path) {
            Some(Node::Dir { .. }) => {
                return Err(io::Error::other(format!("{path} is a directory")));
            }
            Some(Node::File { data, modified }) => {
                if options.truncate {
                    data.clear();
                    *modified = Utc::now();
                }
            }
            None if options.create => {
                if !parent_is_dir(&tree, &path) {
                    return Err(not_found(&path));
                }
                tree.insert(
                    path.clone(),
                    Node::File {
                        data: Vec::new(),
                        modified: Utc::now(),
                    },
                );
            }
            None => return Err(not_found(&path)),
        }

        Ok(Box::new(MemoryFile {
            remote: self.remote.clone(),
            path,
            options,
            position: 0,
            seek: None,
        }))
    }

    async fn metadata(&self, path: &Utf8Path) -> io::Result<RemoteMetadata> {
        let path = normalize(path);
        self.remote
            .state
            .tree
            .lock()
            .get(&path)
            .map(Node::metadata)
            .ok_or_else(|| not_found(&path))
    }

    async fn read_dir(&self, path: &Utf8Path) -> io::Result<Vec<RemoteDirEntry>> {
        let path = normalize(path);
        let tree = self.remote.state.tree.lock();
        match tree.get(&path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(io::Error::other(format!("{path} is not a directory")))
            }
            None => return Err(not_found(&path)),
        }

        Ok(children(&tree, &path)
            .map(|(child, node)| RemoteDirEntry {
                name: child.file_name().unwrap_or_default().to_owned(),
                metadata: node.metadata(),
            })
            .collect())
    }

    async fn create_dir(&self, path: &Utf8Path) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.remote.state.tree.lock();
        if tree.contains_key(&path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{path} already exists"),
            ));
        }
        if !parent_is_dir(&tree, &path) {
            return Err(not_found(&path));
        }
        tree.insert(
            path,
            Node::Dir {
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> io::Result<()> {
        let from = normalize(from);
        let to = normalize(to);
        let mut tree = self.remote.state.tree.lock();

        let node = tree.get(&from).cloned().ok_or_else(|| not_found(&from))?;
        if !parent_is_dir(&tree, &to) {
            return Err(not_found(&to));
        }

        match (&node, tree.get(&to)) {
            (_, Some(Node::Dir { .. })) | (Node::Dir { .. }, Some(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{to} already exists"),
                ));
            }
            _ => {}
        }

        let moved: Vec<Utf8PathBuf> = tree
            .range(from.clone()..)
            .take_while(|(path, _)| path.starts_with(&from))
            .map(|(path, _)| path.clone())
            .collect();
        for old in moved {
            if let Some(node) = tree.remove(&old) {
                let suffix = old.strip_prefix(&from).unwrap_or(Utf8Path::new(""));
                let new = if suffix.as_str().is_empty() {
                    to.clone()
                } else {
                    to.join(suffix)
                };
                tree.insert(new, node);
            }
        }
        Ok(())
    }

    async fn remove_file(&self, path: &Utf8Path) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.remote.state.tree.lock();
        match tree.get(&path) {
            Some(Node::File { .. }) => {
                tree.remove(&path);
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(io::Error::other(format!("{path} is a directory"))),
            None => Err(not_found(&path)),
        }
    }

    async fn remove_dir(&self, path: &Utf8Path) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.remote.state.tree.lock();
        match tree.get(&path) {
            Some(Node::Dir { .. }) if path == "/" => {
                Err(io::Error::other("cannot remove the root directory"))
            }
            Some(Node::Dir { .. }) => {
                if children(&tree, &path).next().is_some() {
                    return Err(io::Error::other(format!("{path} is not empty")));
                }
                tree.remove(&path);
                Ok(())
            }
            Some(Node::File { .. }) => {
                Err(io::Error::other(format!("{path} is not a directory")))
            }
            None => Err(not_found(&path)),
        }
    }

    async fn working_dir(&self) -> io::Result<Utf8PathBuf> {
        Ok(Utf8PathBuf::from("/"))
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryFile {
    remote: MemoryRemote,
    path: Utf8PathBuf,
    options: OpenOptions,
    position: u64,
    seek: Option<io::SeekFrom>,
}

impl MemoryFile {
    fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>, &mut DateTime<Utc>) -> T) -> io::Result<T> {
        match self.remote.state.tree.lock().get_mut(&self.path) {
            Some(Node::File { data, modified }) => Ok(f(data, modified)),
            _ => Err(not_found(&self.path)),
        }
    }
}

impl AsyncRead for MemoryFile {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.options.read {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for reading",
            )));
        }

        let position = this.position;
        let read = this.with_data(|data, _| {
            let start = usize::try_from(position).unwrap_or(usize::MAX).min(data.len());
            let n = buf.remaining().min(data.len() - start);
            buf.put_slice(&data[start..start + n]);
            n
        });
        Poll::Ready(read.map(|n| this.position += n as u64))
    }
}

impl AsyncWrite for MemoryFile {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.options.write {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            )));
        }

        let append = this.options.append;
        let position = this.position;
        let written = this.with_data(|data, modified| {
            let start = if append {
                data.len()
            } else {
                usize::try_from(position).unwrap_or(usize::MAX)
            };
            let end = start + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[start..end].copy_from_slice(buf);
            *modified = Utc::now();
            end
        });
        Poll::Ready(written.map(|end| {
            this.position = end as u64;
            buf.len()
        }))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncSeek for MemoryFile {
    fn start_seek(self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        self.get_mut().seek = Some(position);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        let Some(seek) = this.seek.take() else {
            return Poll::Ready(Ok(this.position));
        };

        let target = match seek {
            io::SeekFrom::Start(offset) => Some(offset),
            io::SeekFrom::End(delta) => match this.with_data(|data, _| data.len() as u64) {
                Ok(len) => len.checked_add_signed(delta),
                Err(error) => return Poll::Ready(Err(error)),
            },
            io::SeekFrom::Current(delta) => this.position.checked_add_signed(delta),
        };

        Poll::Ready(match target {
            Some(target) => {
                this.position = target;
                Ok(target)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the file",
            )),
        })
    }
}

#[async_trait::async_trait]
impl RemoteFile for MemoryFile {
    async fn sync_all(&mut self) -> io::Result<()> {
        self.with_data(|_, _| ())
    }

    async fn metadata(&mut self) -> io::Result<RemoteMetadata> {
        self.with_data(|data, modified| RemoteMetadata {
            size: data.len() as u64,
            modified: Some(*modified),
            is_dir: false,
        })
    }

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
