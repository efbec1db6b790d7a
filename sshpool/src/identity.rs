use std::fmt;
use std::time::Duration;

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};

use crate::secret::Secret;

/// Port used when none is given.
pub(crate) const DEFAULT_PORT: u16 = 22;
const DEFAULT_MAX_SESSIONS: usize = 10;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// A way of proving the client's identity to the server.
///
/// Methods are tried in the order they were configured until one succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Password authentication.
    Password(Secret),

    /// Public key authentication with a private key read from disk.
    PrivateKey {
        /// Location of the private key file.
        path: Utf8PathBuf,

        /// Passphrase for an encrypted key.
        passphrase: Option<Secret>,
    },
}

/// How the server's host key is verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostKeyPolicy {
    /// Accept any host key. Only for endpoints explicitly marked insecure.
    InsecureIgnore,

    /// Accept keys listed for the host in an OpenSSH `known_hosts` file.
    /// Unknown hosts and changed keys are rejected.
    KnownHosts(Utf8PathBuf),

    /// Accept exactly one key, identified by its SHA-256 fingerprint
    /// (with or without the `SHA256:` prefix).
    Fingerprint(String),
}

impl HostKeyPolicy {
    /// The user's OpenSSH `known_hosts` file.
    pub fn default_known_hosts() -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        let mut path = Utf8PathBuf::from(home);
        path.push(".ssh");
        path.push("known_hosts");
        HostKeyPolicy::KnownHosts(path)
    }
}

/// Everything needed to reach one SSH endpoint.
///
/// Two identities are equal when every field is equal. [`ConnectionIdentity::key`]
/// is a deterministic encoding of all fields, and is what the pool uses to find
/// the connection for an identity. It never contains secret material in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    user: String,
    host: String,
    port: u16,
    auth: Vec<AuthMethod>,
    host_key: HostKeyPolicy,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    tcp_keepalive: Option<Duration>,
    keepalive_interval: Duration,
    max_sessions: usize,
    key: String,
}

impl ConnectionIdentity {
    /// Start building an identity for `user` at `host`.
    pub fn builder(host: impl Into<String>, user: impl Into<String>) -> IdentityBuilder {
        IdentityBuilder {
            user: user.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            auth: Vec::new(),
            host_key: HostKeyPolicy::default_known_hosts(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: None,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// The pool lookup key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Login user.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Remote host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Authentication methods, in the order they are tried.
    pub fn auth(&self) -> &[AuthMethod] {
        &self.auth
    }

    /// Host key verification policy.
    pub fn host_key(&self) -> &HostKeyPolicy {
        &self.host_key
    }

    /// Time allowed for dialing and the SSH handshake.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Time allowed for any single read or write on the socket to make progress.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    /// TCP keepalive period, when TCP keepalive is enabled.
    pub fn tcp_keepalive(&self) -> Option<Duration> {
        self.tcp_keepalive
    }

    /// Period of the SSH-level liveness check. Zero disables it.
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    /// Maximum number of sessions open at once on one connection.
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Builder for [`ConnectionIdentity`].
#[derive(Debug, Clone)]
pub struct IdentityBuilder {
    user: String,
    host: String,
    port: u16,
    auth: Vec<AuthMethod>,
    host_key: HostKeyPolicy,
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
    tcp_keepalive: Option<Duration>,
    keepalive_interval: Duration,
    max_sessions: usize,
}

impl IdentityBuilder {
    /// Set the remote port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add password authentication.
    pub fn password(self, password: impl Into<Secret>) -> Self {
        self.auth(AuthMethod::Password(password.into()))
    }

    /// Add private key authentication.
    pub fn private_key(self, path: impl Into<Utf8PathBuf>, passphrase: Option<Secret>) -> Self {
        self.auth(AuthMethod::PrivateKey {
            path: path.into(),
            passphrase,
        })
    }

    /// Add an authentication method.
    pub fn auth(mut self, method: AuthMethod) -> Self {
        self.auth.push(method);
        self
    }

    /// Set the host key verification policy.
    pub fn host_key(mut self, policy: HostKeyPolicy) -> Self {
        self.host_key = policy;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per read/write socket timeout.
    pub fn io_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Enable TCP keepalive with the given period, or disable it.
    pub fn tcp_keepalive(mut self, period: Option<Duration>) -> Self {
        self.tcp_keepalive = period;
        self
    }

    /// Set the SSH-level liveness check period. Zero disables it.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the per-connection session limit. Zero selects the default of 10.
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Build the identity.
    pub fn build(self) -> ConnectionIdentity {
        let max_sessions = if self.max_sessions == 0 {
            DEFAULT_MAX_SESSIONS
        } else {
            self.max_sessions
        };

        let mut identity = ConnectionIdentity {
            user: self.user,
            host: self.host,
            port: self.port,
            auth: self.auth,
            host_key: self.host_key,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
            tcp_keepalive: self.tcp_keepalive,
            keepalive_interval: self.keepalive_interval,
            max_sessions,
            key: String::new(),
        };
        identity.key = encode_key(&identity);
        identity
    }
}

fn encode_key(identity: &ConnectionIdentity) -> String {
    let mut hasher = Sha256::new();
    for method in &identity.auth {
        match method {
            AuthMethod::Password(password) => {
                hasher.update(b"password\0");
                hasher.update(password.revealed().as_bytes());
            }
            AuthMethod::PrivateKey { path, passphrase } => {
                hasher.update(b"private-key\0");
                hasher.update(path.as_str().as_bytes());
                hasher.update(b"\0");
                if let Some(passphrase) = passphrase {
                    hasher.update(passphrase.revealed().as_bytes());
                }
            }
        }
        hasher.update(b"\0");
    }
    hasher.update(
        format!(
            "{:?}|{:?}|{:?}|{:?}|{:?}|{}",
            identity.host_key,
            identity.connect_timeout,
            identity.io_timeout,
            identity.tcp_keepalive,
            identity.keepalive_interval,
            identity.max_sessions
        )
        .as_bytes(),
    );
    let digest = hasher.finalize();

    format!(
        "{}@{}:{}#{}",
        identity.user,
        identity.host,
        identity.port,
        hex::encode(&digest[..8])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(password: &'static str) -> ConnectionIdentity {
        ConnectionIdentity::builder("sftp.example.com", "registry")
            .password(password)
            .host_key(HostKeyPolicy::InsecureIgnore)
            .build()
    }

    #[test]
    fn key_is_deterministic() {
        assert_eq!(identity("a").key(), identity("a").key());
        assert_eq!(identity("a"), identity("a"));
    }

    #[test]
    fn key_distinguishes_credentials() {
        assert_ne!(identity("a").key(), identity("b").key());
        assert_ne!(identity("a"), identity("b"));
    }

    #[test]
    fn key_distinguishes_limits() {
        let a = identity("a");
        let b = ConnectionIdentity::builder("sftp.example.com", "registry")
            .password("a")
            .host_key(HostKeyPolicy::InsecureIgnore)
            .max_sessions(2)
            .build();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn key_hides_secrets() {
        let identity = identity("hunter2");
        assert!(identity.key().starts_with("registry@sftp.example.com:22#"));
        assert!(!identity.key().contains("hunter2"));
        assert!(!format!("{identity:?}").contains("hunter2"));
    }

    #[test]
    fn zero_max_sessions_uses_default() {
        let identity = ConnectionIdentity::builder("h", "u").max_sessions(0).build();
        assert_eq!(identity.max_sessions(), DEFAULT_MAX_SESSIONS);
        assert_eq!(identity.port(), DEFAULT_PORT);
        assert_eq!(identity.to_string(), "u@h:22");
    }
}
