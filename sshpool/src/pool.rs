//! The keyed connection pool.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::conn::{Lease, ManagedConnection};
use crate::error::{PoolError, TransportError};
use crate::identity::ConnectionIdentity;
use crate::transport::{Connector, RemoteFs};

const ACQUIRE_ATTEMPTS: usize = 3;

/// Pool-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PoolConfig {
    /// How often garbage collection runs. Zero disables the background task.
    #[serde(with = "crate::seconds")]
    pub gc_interval: Duration,

    /// How many connections may stay pooled after garbage collection.
    /// Busy connections are kept even beyond this limit.
    pub max_idle: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(30),
            max_idle: 4,
        }
    }
}

/// The per-identity entry in the pool table.
///
/// The connection is dialed at most once per slot. A slot which failed to
/// dial stays empty until it is retried or collected.
#[derive(Debug, Default)]
struct Slot {
    cell: OnceCell<Arc<ManagedConnection>>,
}

/// `None` once the pool has been shut down.
type Table = Option<HashMap<String, Arc<Slot>>>;

#[derive(Debug)]
struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    slots: Mutex<Table>,
    token: CancellationToken,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

enum Confirm {
    Ready,
    Stale,
    Broken,
    Shutdown,
}

impl PoolInner {
    fn slot(&self, identity: &ConnectionIdentity) -> Result<Arc<Slot>, PoolError> {
        let mut slots = self.slots.lock();
        let table = slots.as_mut().ok_or(PoolError::Shutdown)?;
        Ok(table.entry(identity.key().to_owned()).or_default().clone())
    }

    async fn dial(
        &self,
        identity: &ConnectionIdentity,
    ) -> Result<Arc<ManagedConnection>, PoolError> {
        let timeout = identity.connect_timeout();
        let connect = self.connector.connect(identity);
        let result = if timeout.is_zero() {
            connect.await
        } else {
            tokio::time::timeout(timeout, connect)
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout)))
        };

        match result {
            Ok(transport) => {
                tracing::debug!(target = %identity, "connection established");
                Ok(ManagedConnection::new(
                    identity.clone(),
                    transport,
                    &self.token,
                ))
            }
            Err(source) => {
                tracing::debug!(target = %identity, error = %source, "connection failed");
                Err(PoolError::Connect {
                    target: identity.to_string(),
                    source,
                })
            }
        }
    }

    /// Check, under the table lock, that `conn` is still the pooled
    /// connection for `key` and may take new sessions. Broken connections
    /// are removed from the table here, so the caller owns closing them.
    fn confirm(&self, key: &str, slot: &Arc<Slot>, conn: &ManagedConnection) -> Confirm {
        let mut slots = self.slots.lock();
        let Some(table) = slots.as_mut() else {
            return Confirm::Shutdown;
        };

        match table.get(key) {
            Some(current) if Arc::ptr_eq(current, slot) => {}
            _ => return Confirm::Stale,
        }

        if conn.is_usable() {
            Confirm::Ready
        } else {
            table.remove(key);
            Confirm::Broken
        }
    }

    async fn collect(&self) -> usize {
        let removed = {
            let mut slots = self.slots.lock();
            let Some(table) = slots.as_mut() else {
                return 0;
            };

            let mut removed = Vec::new();
            table.retain(|_, slot| match slot.cell.get() {
                Some(conn) if !conn.is_usable() => {
                    removed.push(conn.clone());
                    false
                }
                Some(_) => true,
                None => Arc::strong_count(slot) > 1,
            });

            let mut live: Vec<(String, Arc<ManagedConnection>, Instant)> = table
                .iter()
                .filter_map(|(key, slot)| {
                    slot.cell
                        .get()
                        .map(|conn| (key.clone(), conn.clone(), conn.access_time()))
                })
                .collect();

            if live.len() > self.config.max_idle {
                live.sort_by(|a, b| b.2.cmp(&a.2));
                for (key, conn, _) in live.into_iter().skip(self.config.max_idle) {
                    if conn.ref_count() == 0 {
                        table.remove(&key);
                        removed.push(conn);
                    }
                }
            }

            removed
        };

        for conn in &removed {
            if let Err(error) = conn.close().await {
                tracing::debug!(target = %conn.identity(), %error, "error closing evicted connection");
            }
        }
        removed.len()
    }
}

/// A pool of SSH connections, keyed by [`ConnectionIdentity`].
///
/// Cloning the pool is cheap, and clones share the same connections.
/// The pool holds at most one connection per identity, and runs a garbage
/// collection task which evicts broken connections and excess idle ones.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool which establishes connections with `connector`.
    ///
    /// Must be called from within a Tokio runtime when garbage collection is enabled.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            connector,
            config,
            slots: Mutex::new(Some(HashMap::new())),
            token: CancellationToken::new(),
        });

        if !config.gc_interval.is_zero() {
            tokio::spawn(garbage_collector(
                Arc::downgrade(&inner),
                inner.token.clone(),
                config.gc_interval,
            ));
        }

        Self { inner }
    }

    /// The settings this pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Open a session for `identity`, connecting first if needed.
    ///
    /// Waits while the connection is at its session limit. A connection
    /// found broken is evicted and replaced, up to a few times.
    pub async fn acquire(&self, identity: &ConnectionIdentity) -> Result<PooledSession, PoolError> {
        let target = identity.to_string();
        let mut fault = None;

        for attempt in 0..ACQUIRE_ATTEMPTS {
            let slot = self.inner.slot(identity)?;
            let conn = slot
                .cell
                .get_or_try_init(|| self.inner.dial(identity))
                .await?
                .clone();

            // A broken connection is evicted instead of waited on, and a
            // waiter wakes up when the connection it waits on breaks.
            let lease = if conn.is_usable() {
                tokio::select! {
                    biased;
                    () = conn.faulted() => None,
                    result = conn.incr_ref_count() => match result {
                        Ok(lease) => Some(lease),
                        Err(_) => {
                            tracing::trace!(%target, attempt, "connection closed while waiting for a session");
                            fault = conn.err().or(fault);
                            continue;
                        }
                    },
                }
            } else {
                None
            };

            let lease = match (self.inner.confirm(identity.key(), &slot, &conn), lease) {
                (Confirm::Ready, Some(lease)) => lease,
                (Confirm::Shutdown, lease) => {
                    drop(lease);
                    let _ = conn.close().await;
                    return Err(PoolError::Shutdown);
                }
                (Confirm::Stale, lease) => {
                    drop(lease);
                    let _ = conn.close().await;
                    continue;
                }
                (Confirm::Broken | Confirm::Ready, lease) => {
                    drop(lease);
                    fault = conn.err().or(fault);
                    tracing::debug!(%target, attempt, "evicting broken connection");
                    if let Err(error) = conn.close().await {
                        tracing::debug!(%target, %error, "error closing broken connection");
                    }
                    continue;
                }
            };

            return match conn.open_session().await {
                Ok(fs) => Ok(PooledSession { fs, lease }),
                Err(source) => {
                    drop(lease);
                    if conn.transport_closed() {
                        conn.record_fault(format!("open session: {source}"));
                    }
                    Err(PoolError::Session { target, source })
                }
            };
        }

        Err(PoolError::Broken { target, fault })
    }

    /// Evict and close the connection for `identity`. Returns whether one was pooled.
    pub async fn close(&self, identity: &ConnectionIdentity) -> bool {
        let slot = {
            let mut slots = self.inner.slots.lock();
            slots.as_mut().and_then(|table| table.remove(identity.key()))
        };

        match slot.as_ref().and_then(|slot| slot.cell.get()) {
            Some(conn) => {
                if let Err(error) = conn.close().await {
                    tracing::debug!(target = %identity, %error, "error closing connection");
                }
                true
            }
            None => false,
        }
    }

    /// Stop garbage collection and close every connection.
    ///
    /// The pool cannot be used afterwards: every acquire fails with
    /// [`PoolError::Shutdown`], including those already in progress.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();
        let table = self.inner.slots.lock().take();

        let Some(table) = table else {
            return;
        };

        tracing::debug!(connections = table.len(), "shutting down connection pool");
        for slot in table.into_values() {
            if let Some(conn) = slot.cell.get() {
                if let Err(error) = conn.close().await {
                    tracing::debug!(target = %conn.identity(), %error, "error closing connection");
                }
            }
        }
    }

    /// Whether [`ConnectionPool::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.slots.lock().is_none()
    }

    /// Number of pooled connections.
    pub fn active_connections(&self) -> usize {
        self.inner.slots.lock().as_ref().map_or(0, |table| {
            table
                .values()
                .filter(|slot| slot.cell.get().is_some())
                .count()
        })
    }

    /// The pooled connection for `identity`, if there is one.
    pub fn connection(&self, identity: &ConnectionIdentity) -> Option<Arc<ManagedConnection>> {
        let slots = self.inner.slots.lock();
        slots
            .as_ref()?
            .get(identity.key())?
            .cell
            .get()
            .cloned()
    }

    /// Run one garbage collection pass now. Returns the number of connections closed.
    pub async fn collect(&self) -> usize {
        self.inner.collect().await
    }
}

async fn garbage_collector(
    pool: std::sync::Weak<PoolInner>,
    token: CancellationToken,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else {
            break;
        };
        let closed = pool.collect().await;
        if closed > 0 {
            tracing::debug!(closed, "garbage collected connections");
        }
    }
}

/// An open session, holding its connection's session slot.
///
/// Call [`PooledSession::release`] to end the session. Dropping it also
/// returns the slot, without waiting for the remote side.
#[derive(Debug)]
pub struct PooledSession {
    fs: Box<dyn RemoteFs>,
    lease: Lease,
}

impl PooledSession {
    /// The remote filesystem operations of this session.
    pub fn fs(&self) -> &dyn RemoteFs {
        &*self.fs
    }

    /// The connection this session runs on.
    pub fn connection(&self) -> &Arc<ManagedConnection> {
        self.lease.connection()
    }

    /// End the session and return its slot to the connection.
    pub async fn release(self) {
        if let Err(error) = self.fs.close().await {
            tracing::trace!(%error, "error closing session");
        }
        self.lease.release();
    }
}

impl Deref for PooledSession {
    type Target = dyn RemoteFs;

    fn deref(&self) -> &Self::Target {
        &*self.fs
    }
}

#[cfg(test)]
mod tests {
    use tokio::task::JoinSet;

    use super::*;
    use crate::identity::HostKeyPolicy;
    use crate::memory::MemoryRemote;

    fn identity() -> ConnectionIdentity {
        identity_with(10)
    }

    fn identity_with(max_sessions: usize) -> ConnectionIdentity {
        ConnectionIdentity::builder("memory", "tester")
            .password("secret")
            .host_key(HostKeyPolicy::InsecureIgnore)
            .max_sessions(max_sessions)
            .build()
    }

    fn pool(remote: &MemoryRemote, max_idle: usize) -> ConnectionPool {
        ConnectionPool::new(
            Arc::new(remote.clone()),
            PoolConfig {
                gc_interval: Duration::ZERO,
                max_idle,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_connection_per_identity() {
        let remote = MemoryRemote::new();
        remote.set_connect_delay(Duration::from_millis(50));
        let pool = pool(&remote, 4);

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let pool = pool.clone();
            tasks.spawn(async move {
                let session = pool.acquire(&identity()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                session.release().await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }

        assert_eq!(remote.connects(), 1);
        assert_eq!(pool.active_connections(), 1);
    }

    #[tokio::test]
    async fn distinct_identities_get_distinct_connections() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        let a = pool.acquire(&identity_with(1)).await.unwrap();
        let b = pool.acquire(&identity_with(2)).await.unwrap();
        assert!(!Arc::ptr_eq(a.connection(), b.connection()));
        assert_eq!(pool.active_connections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn session_limit_is_respected() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);
        let identity = identity_with(2);

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let pool = pool.clone();
            let identity = identity.clone();
            tasks.spawn(async move {
                let session = pool.acquire(&identity).await.unwrap();
                assert!(session.connection().ref_count() <= 2);
                tokio::time::sleep(Duration::from_millis(10)).await;
                session.release().await;
            });
        }

        let mut completed = 0;
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
            completed += 1;
        }

        assert_eq!(completed, 10);
        assert_eq!(remote.peak_sessions(), 2);
        assert_eq!(remote.open_sessions(), 0);
        assert_eq!(pool.connection(&identity).unwrap().ref_count(), 0);
    }

    #[tokio::test]
    async fn collect_keeps_busy_connections() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 0);

        let session = pool.acquire(&identity()).await.unwrap();
        assert_eq!(pool.collect().await, 0);
        assert_eq!(pool.active_connections(), 1);

        session.release().await;
        assert_eq!(pool.collect().await, 1);
        assert_eq!(pool.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_keeps_most_recently_used() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 1);

        let old = identity_with(1);
        let new = identity_with(2);
        pool.acquire(&old).await.unwrap().release().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        pool.acquire(&new).await.unwrap().release().await;

        assert_eq!(pool.collect().await, 1);
        assert!(pool.connection(&old).is_none());
        assert!(pool.connection(&new).is_some());
    }

    #[tokio::test]
    async fn collect_evicts_broken_connections() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        pool.acquire(&identity()).await.unwrap().release().await;
        let conn = pool.connection(&identity()).unwrap();
        remote.break_connections();

        assert_eq!(pool.collect().await, 1);
        assert_eq!(pool.active_connections(), 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn acquire_replaces_broken_connection() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        pool.acquire(&identity()).await.unwrap().release().await;
        let broken = pool.connection(&identity()).unwrap();
        broken.record_fault("test fault");

        let session = pool.acquire(&identity()).await.unwrap();
        assert!(!Arc::ptr_eq(session.connection(), &broken));
        assert!(broken.is_closed());
        assert_eq!(remote.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_saturated_connection_is_not_waited_on() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);
        let identity = identity_with(1);

        let held = pool.acquire(&identity).await.unwrap();
        let broken = held.connection().clone();
        broken.record_fault("test fault");

        let session = tokio::time::timeout(Duration::from_secs(5), pool.acquire(&identity))
            .await
            .expect("acquire does not wait on a broken connection")
            .unwrap();
        assert!(!Arc::ptr_eq(session.connection(), &broken));
        assert!(broken.is_closed());
        assert_eq!(remote.connects(), 2);

        drop(held);
        session.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_moves_on_when_connection_breaks() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);
        let identity = identity_with(1);

        let held = pool.acquire(&identity).await.unwrap();
        let broken = held.connection().clone();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let identity = identity.clone();
            async move { pool.acquire(&identity).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished(), "waiter blocks on the full connection");

        broken.record_fault("test fault");
        let session = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter wakes when the connection breaks")
            .unwrap()
            .unwrap();
        assert!(!Arc::ptr_eq(session.connection(), &broken));
        assert_eq!(remote.connects(), 2);

        drop(held);
        session.release().await;
    }

    #[tokio::test]
    async fn session_error_rolls_back() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        remote.set_refuse_sessions(true);
        let err = pool.acquire(&identity()).await.unwrap_err();
        assert!(matches!(err, PoolError::Session { .. }));

        let conn = pool.connection(&identity()).unwrap();
        assert_eq!(conn.ref_count(), 0);
        assert!(conn.err().is_none());

        remote.set_refuse_sessions(false);
        pool.acquire(&identity()).await.unwrap().release().await;
        assert_eq!(remote.connects(), 1);
    }

    #[tokio::test]
    async fn connect_error_is_reported() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        remote.set_refuse_connect(true);
        let err = pool.acquire(&identity()).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect { .. }));
        assert_eq!(pool.active_connections(), 0);

        remote.set_refuse_connect(false);
        pool.acquire(&identity()).await.unwrap().release().await;
        assert_eq!(pool.active_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_honored() {
        let remote = MemoryRemote::new();
        remote.set_connect_delay(Duration::from_secs(60));
        let pool = pool(&remote, 4);

        let identity = ConnectionIdentity::builder("memory", "tester")
            .host_key(HostKeyPolicy::InsecureIgnore)
            .connect_timeout(Duration::from_secs(1))
            .build();
        let err = pool.acquire(&identity).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::Connect {
                source: TransportError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn close_evicts_one_identity() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        pool.acquire(&identity()).await.unwrap().release().await;
        let conn = pool.connection(&identity()).unwrap();

        assert!(pool.close(&identity()).await);
        assert!(conn.is_closed());
        assert!(!pool.close(&identity()).await);
        assert_eq!(pool.active_connections(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);

        pool.acquire(&identity()).await.unwrap().release().await;
        let conn = pool.connection(&identity()).unwrap();

        pool.shutdown().await;
        assert!(pool.is_shutdown());
        assert!(conn.is_closed());
        assert_eq!(pool.active_connections(), 0);
        assert!(matches!(
            pool.acquire(&identity()).await,
            Err(PoolError::Shutdown)
        ));
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_waiting_acquire() {
        let remote = MemoryRemote::new();
        let pool = pool(&remote, 4);
        let identity = identity_with(1);

        let held = pool.acquire(&identity).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            let identity = identity.clone();
            tokio::spawn(async move { pool.acquire(&identity).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.shutdown().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(PoolError::Shutdown)));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn background_collection_runs() {
        let remote = MemoryRemote::new();
        let pool = ConnectionPool::new(
            Arc::new(remote.clone()),
            PoolConfig {
                gc_interval: Duration::from_secs(5),
                max_idle: 4,
            },
        );

        pool.acquire(&identity()).await.unwrap().release().await;
        remote.break_connections();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(pool.active_connections(), 0);
    }

    #[test]
    fn pool_config_from_seconds() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"gc-interval": 10, "max-idle": 2}"#).unwrap();
        assert_eq!(config.gc_interval, Duration::from_secs(10));
        assert_eq!(config.max_idle, 2);

        let config: PoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PoolConfig::default());
    }
}
