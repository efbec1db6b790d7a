//! TCP plumbing: dialing and per-operation read/write deadlines.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// A stream whose reads and writes must each make progress within a timeout.
///
/// A pending operation which makes no progress before the deadline fails with
/// [`io::ErrorKind::TimedOut`]. Without a timeout the stream is a plain passthrough.
#[pin_project]
#[derive(Debug)]
pub struct TimeoutStream<S> {
    #[pin]
    inner: S,
    timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimeoutStream<S> {
    /// Wrap `inner`, applying `timeout` to every read and write.
    pub fn new(inner: S, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap into the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn poll_deadline(
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };

    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    ready!(sleep.as_mut().poll(cx));
    *deadline = None;
    Poll::Ready(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no progress within {timeout:?}"),
    ))
}

impl<S: AsyncRead> AsyncRead for TimeoutStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                *this.read_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(this.read_deadline, *this.timeout, cx).map(Err),
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for TimeoutStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(this.write_deadline, *this.timeout, cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(this.write_deadline, *this.timeout, cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_shutdown(cx) {
            Poll::Ready(result) => {
                *this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => poll_deadline(this.write_deadline, *this.timeout, cx).map(Err),
        }
    }
}

/// Open the TCP connection for `identity`, with TCP keepalive and deadlines applied.
#[cfg(feature = "russh")]
pub(crate) async fn dial(
    identity: &crate::identity::ConnectionIdentity,
) -> Result<TimeoutStream<tokio::net::TcpStream>, crate::error::TransportError> {
    let stream = tokio::net::TcpStream::connect((identity.host(), identity.port())).await?;
    stream.set_nodelay(true)?;

    if let Some(period) = identity.tcp_keepalive() {
        let keepalive = socket2::TcpKeepalive::new().with_time(period);
        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }

    tracing::trace!(target = %identity, "tcp connected");
    Ok(TimeoutStream::new(stream, identity.io_timeout()))
}
