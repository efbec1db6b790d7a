//! One pooled SSH connection, its session counter and its keepalive task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionFault, PoolError, TransportError};
use crate::identity::ConnectionIdentity;
use crate::transport::{RemoteFs, Transport};

/// A live transport connection shared by many sessions.
///
/// Connections are created and destroyed by the [`ConnectionPool`](crate::ConnectionPool).
/// Once a fault has been recorded no new sessions are handed out on the
/// connection, but sessions which are already open may finish.
#[derive(Debug)]
pub struct ManagedConnection {
    identity: ConnectionIdentity,
    transport: Arc<dyn Transport>,
    sessions: Arc<Semaphore>,
    created: DateTime<Utc>,
    access_time: Mutex<Instant>,
    fault: Arc<OnceLock<ConnectionFault>>,
    broken: CancellationToken,
    closed: AtomicBool,
    token: CancellationToken,
}

impl ManagedConnection {
    /// Wrap an established transport and start its keepalive task.
    ///
    /// The keepalive task is cancelled when `parent` is cancelled or when the
    /// connection is closed.
    pub(crate) fn new(
        identity: ConnectionIdentity,
        transport: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            sessions: Arc::new(Semaphore::new(identity.max_sessions())),
            transport,
            created: Utc::now(),
            access_time: Mutex::new(Instant::now()),
            fault: Arc::new(OnceLock::new()),
            broken: CancellationToken::new(),
            closed: AtomicBool::new(false),
            token: parent.child_token(),
            identity,
        });

        let period = conn.identity.keepalive_interval();
        if !period.is_zero() {
            tokio::spawn(keepalive(
                conn.identity.to_string(),
                conn.transport.clone(),
                conn.fault.clone(),
                conn.broken.clone(),
                conn.token.clone(),
                period,
            ));
        }

        conn
    }

    /// The identity this connection was established for.
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    /// When the connection was established.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// When a session was last taken from or returned to this connection.
    pub fn access_time(&self) -> Instant {
        *self.access_time.lock()
    }

    /// Number of sessions currently open on this connection.
    pub fn ref_count(&self) -> usize {
        self.identity
            .max_sessions()
            .saturating_sub(self.sessions.available_permits())
    }

    /// The fault which broke this connection, if any.
    pub fn err(&self) -> Option<ConnectionFault> {
        self.fault.get().cloned()
    }

    /// Whether [`ManagedConnection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Reserve a session slot, waiting while the connection is at its session limit.
    ///
    /// Fails once the connection has been closed, including while waiting.
    pub async fn incr_ref_count(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let permit = self
            .sessions
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed {
                target: self.identity.to_string(),
            })?;
        self.touch();
        Ok(Lease {
            conn: self.clone(),
            _permit: permit,
        })
    }

    /// Record the fault which broke this connection. Only the first fault is kept.
    pub fn record_fault(&self, message: impl Into<Arc<str>>) {
        if set_fault(&self.fault, &self.broken, ConnectionFault::new(message)) {
            tracing::warn!(target = %self.identity, "connection marked broken");
        }
    }

    /// Resolves once a fault has been recorded, immediately if one already was.
    pub(crate) async fn faulted(&self) {
        self.broken.cancelled().await
    }

    /// Close the connection: stop the keepalive task, fail any waiters and
    /// shut down the transport.
    ///
    /// Only the first call reaches the transport. Later calls return
    /// [`TransportError::Closed`].
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(TransportError::Closed);
        }

        self.token.cancel();
        self.sessions.close();
        tracing::debug!(target = %self.identity, "closing connection");
        self.transport.close().await
    }

    /// A connection is usable while no fault is recorded and neither side has closed it.
    pub(crate) fn is_usable(&self) -> bool {
        self.fault.get().is_none() && !self.is_closed() && !self.transport.is_closed()
    }

    pub(crate) fn transport_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub(crate) async fn open_session(&self) -> Result<Box<dyn RemoteFs>, TransportError> {
        self.transport.open_session().await
    }

    fn touch(&self) {
        *self.access_time.lock() = Instant::now();
    }
}

/// A reserved session slot on a [`ManagedConnection`].
///
/// The slot is returned when the lease is released or dropped, so it can
/// only be returned once.
#[derive(Debug)]
pub struct Lease {
    conn: Arc<ManagedConnection>,
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// The connection this slot belongs to.
    pub fn connection(&self) -> &Arc<ManagedConnection> {
        &self.conn
    }

    /// Return the slot to the connection.
    pub fn release(self) {}
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.conn.touch();
    }
}

fn set_fault(
    slot: &OnceLock<ConnectionFault>,
    broken: &CancellationToken,
    fault: ConnectionFault,
) -> bool {
    let first = slot.set(fault).is_ok();
    broken.cancel();
    first
}

async fn keepalive(
    target: String,
    transport: Arc<dyn Transport>,
    fault: Arc<OnceLock<ConnectionFault>>,
    broken: CancellationToken,
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

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = tokio::time::timeout(period, transport.keepalive()) => {
                result.unwrap_or(Err(TransportError::Timeout(period)))
            }
        };

        match result {
            Ok(()) => tracing::trace!(%target, "keepalive"),
            Err(error) => {
                tracing::warn!(%target, %error, "keepalive failed");
                set_fault(&fault, &broken, ConnectionFault::new(format!("keepalive: {error}")));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::HostKeyPolicy;
    use crate::memory::MemoryRemote;
    use crate::transport::Connector;

    fn identity(max_sessions: usize) -> ConnectionIdentity {
        ConnectionIdentity::builder("memory", "tester")
            .host_key(HostKeyPolicy::InsecureIgnore)
            .keepalive_interval(Duration::from_secs(1))
            .max_sessions(max_sessions)
            .build()
    }

    async fn connection(remote: &MemoryRemote, max_sessions: usize) -> Arc<ManagedConnection> {
        let identity = identity(max_sessions);
        let transport = remote.connect(&identity).await.unwrap();
        ManagedConnection::new(identity, transport, &CancellationToken::new())
    }

    #[tokio::test]
    async fn leases_count_sessions() {
        let remote = MemoryRemote::new();
        let conn = connection(&remote, 2).await;

        let first = conn.incr_ref_count().await.unwrap();
        let second = conn.incr_ref_count().await.unwrap();
        assert_eq!(conn.ref_count(), 2);

        first.release();
        assert_eq!(conn.ref_count(), 1);
        drop(second);
        assert_eq!(conn.ref_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn incr_blocks_at_limit() {
        let remote = MemoryRemote::new();
        let conn = connection(&remote, 1).await;

        let held = conn.incr_ref_count().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(10), conn.incr_ref_count()).await;
        assert!(waiting.is_err(), "second lease should wait for the first");

        drop(held);
        let lease = conn.incr_ref_count().await.unwrap();
        assert_eq!(lease.connection().ref_count(), 1);
    }

    #[tokio::test]
    async fn close_is_at_most_once() {
        let remote = MemoryRemote::new();
        let conn = connection(&remote, 1).await;

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(!conn.is_usable());
        assert!(matches!(conn.close().await, Err(TransportError::Closed)));
        assert!(matches!(
            conn.incr_ref_count().await,
            Err(PoolError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn first_fault_wins() {
        let remote = MemoryRemote::new();
        let conn = connection(&remote, 1).await;
        assert!(conn.err().is_none());

        conn.record_fault("first");
        conn.record_fault("second");
        assert_eq!(conn.err().unwrap().message(), "first");
        assert!(!conn.is_usable());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_failure_records_fault() {
        let remote = MemoryRemote::new();
        let conn = connection(&remote, 1).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(conn.err().is_none());

        remote.set_keepalive_failure(true);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let fault = conn.err().expect("keepalive failure is recorded");
        assert!(fault.message().starts_with("keepalive"));
        assert!(!conn.is_closed(), "keepalive never closes the connection itself");
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_survives_saturated_connection() {
        let remote = MemoryRemote::new();
        remote.set_channel_limit(2);
        let conn = connection(&remote, 2).await;

        let mut open = Vec::new();
        for _ in 0..2 {
            let lease = conn.incr_ref_count().await.unwrap();
            open.push((lease, conn.open_session().await.unwrap()));
        }
        assert!(
            conn.open_session().await.is_err(),
            "server refuses channels beyond its limit"
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(conn.err().is_none(), "keepalive does not need a free channel");
        assert!(conn.is_usable());

        drop(open);
        assert_eq!(remote.open_sessions(), 0);
    }
}
