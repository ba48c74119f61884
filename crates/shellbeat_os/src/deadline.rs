//! Rolling read/write deadlines for the socket under an SSH connection.
//!
//! Every read or write that makes no progress for the current deadline fails
//! with `TimedOut`, which tears the SSH connection down. The deadline is
//! shared, so an upload can raise it for its duration.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Shared, adjustable deadline. Zero disables it.
#[derive(Debug, Clone)]
pub struct Deadline(Arc<AtomicU64>);

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(timeout.as_millis() as u64)))
    }

    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, timeout: Duration) {
        self.0.store(timeout.as_millis() as u64, Ordering::SeqCst);
    }

    /// Temporarily use `timeout`; the previous value comes back when the guard drops.
    pub fn raise(&self, timeout: Duration) -> DeadlineGuard {
        let previous = self.get();
        self.set(timeout);
        DeadlineGuard {
            deadline: self.clone(),
            previous,
        }
    }
}

pub struct DeadlineGuard {
    deadline: Deadline,
    previous: Duration,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.deadline.set(self.previous);
    }
}

pub struct DeadlineStream<S> {
    inner: S,
    deadline: Deadline,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    pub fn new(inner: S, deadline: Deadline) -> Self {
        Self {
            inner,
            deadline,
            read_timer: None,
            write_timer: None,
        }
    }
}

/// Poll the pending-operation timer, arming it on first use.
fn poll_timer(
    timer: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
    op: &str,
) -> Poll<io::Error> {
    if timeout.is_zero() {
        return Poll::Pending;
    }
    let sleep = timer.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *timer = None;
            Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} deadline of {:?} exceeded", op, timeout),
            ))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.read_timer = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_timer(&mut this.read_timer, this.deadline.get(), cx, "read").map(Err)
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.write_timer = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_timer(&mut this.write_timer, this.deadline.get(), cx, "write").map(Err)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(res) => {
                this.write_timer = None;
                Poll::Ready(res)
            }
            Poll::Pending => {
                poll_timer(&mut this.write_timer, this.deadline.get(), cx, "write").map(Err)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
