// src/conn/mod.rs
// Wraps the raw accepted stream with idle/absolute deadline enforcement.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// Object-safe alias for the raw bidirectional stream. Connection callbacks
/// may swap the accepted `TcpStream` for any other implementor (rate
/// limiters, recorders, in-memory pipes in tests).
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Io for T {}

pub type BoxedIo = Box<dyn Io>;

fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection deadline exceeded")
}

/// A connection bounded by the server's timeout policy.
///
/// The idle deadline is re-armed after every successful read or write; the
/// absolute deadline is fixed at accept time and never moves. A zero/unset
/// timeout disables the corresponding deadline. Once either deadline passes
/// while an operation is pending, every subsequent operation fails with
/// `ErrorKind::TimedOut` and the connection's context is cancelled.
///
/// Dropping (or shutting down) the wrapper also cancels the context;
/// cancellation is idempotent, so the teardown path may race with a deadline
/// expiry safely.
pub struct ServerConn<S = BoxedIo> {
    inner: S,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
    armed_at: Option<Instant>,
    canceler: CancellationToken,
    timed_out: bool,
}

impl<S: Io> ServerConn<S> {
    pub(crate) fn new(
        inner: S,
        idle_timeout: Option<Duration>,
        max_timeout: Option<Duration>,
        canceler: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner,
            idle_timeout,
            idle_deadline: idle_timeout.map(|d| now + d),
            max_deadline: max_timeout.map(|d| now + d),
            timer: None,
            armed_at: None,
            canceler,
            timed_out: false,
        }
    }

    pub(crate) fn handle(&self) -> ConnHandle {
        ConnHandle {
            cancel: self.canceler.clone(),
            max_deadline: self.max_deadline,
        }
    }

    /// Earlier of the idle and absolute deadlines, if any is armed.
    fn deadline(&self) -> Option<Instant> {
        match (self.idle_deadline, self.max_deadline) {
            (Some(idle), Some(max)) => Some(idle.min(max)),
            (idle, max) => idle.or(max),
        }
    }

    fn touch(&mut self) {
        if let Some(idle) = self.idle_timeout {
            self.idle_deadline = Some(Instant::now() + idle);
        }
    }

    /// Poll the deadline timer while the inner stream is pending. Lazily
    /// (re-)arms the timer whenever the effective deadline moved.
    fn poll_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        let Some(deadline) = self.deadline() else {
            return Poll::Pending;
        };
        if self.armed_at != Some(deadline) {
            match self.timer.as_mut() {
                Some(timer) => timer.as_mut().reset(deadline),
                None => self.timer = Some(Box::pin(sleep_until(deadline))),
            }
            self.armed_at = Some(deadline);
        }
        let Some(timer) = self.timer.as_mut() else {
            return Poll::Pending;
        };
        match timer.as_mut().poll(cx) {
            Poll::Ready(()) => {
                self.timed_out = true;
                self.canceler.cancel();
                Poll::Ready(timeout_error())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: Io> AsyncRead for ServerConn<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.timed_out {
            return Poll::Ready(Err(timeout_error()));
        }
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.touch();
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => match this.poll_deadline(cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: Io> AsyncWrite for ServerConn<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.timed_out {
            return Poll::Ready(Err(timeout_error()));
        }
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                this.touch();
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            Poll::Pending => match this.poll_deadline(cx) {
                Poll::Ready(err) => Poll::Ready(Err(err)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.timed_out {
            return Poll::Ready(Err(timeout_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        if matches!(result, Poll::Ready(_)) {
            this.canceler.cancel();
        }
        result
    }
}

impl<S> Drop for ServerConn<S> {
    fn drop(&mut self) {
        self.canceler.cancel();
    }
}

/// Shareable handle to a live connection, stored in its context.
///
/// Closing the handle cancels the connection's context. It does not unblock
/// io already pending on the wrapper; deadline enforcement owns that.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    cancel: CancellationToken,
    max_deadline: Option<Instant>,
}

impl ConnHandle {
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Absolute deadline fixed at accept time, if one was configured.
    pub fn max_deadline(&self) -> Option<Instant> {
        self.max_deadline
    }
}
