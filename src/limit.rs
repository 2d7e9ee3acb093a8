use std::future::Future;
use std::io;
use std::num::NonZeroU32;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Token-bucket burst allowance, in bytes.
pub const DEFAULT_BURST: u32 = 32 * 1024 * 1024;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Wraps a stream with a token-bucket limit on the read side.
///
/// Each completed read of `n` bytes charges `n` tokens to the bucket; once
/// the burst is exhausted the next read stalls until the bucket refills at
/// the configured bytes-per-second rate. Writes pass through untouched, so
/// only the upload direction of a proxied connection is shaped. Dropping
/// the reader abandons any pending token wait.
pub struct RateReader<R> {
    inner: R,
    limiter: Limiter,
    clock: DefaultClock,
    burst: u32,
    debt: u32,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<R> RateReader<R> {
    /// Limit reads to `bytes_per_second` with the default 32 MiB burst.
    pub fn new(inner: R, bytes_per_second: NonZeroU32) -> Self {
        // DEFAULT_BURST is non-zero.
        let burst = NonZeroU32::new(DEFAULT_BURST).unwrap_or(bytes_per_second);
        Self::with_burst(inner, bytes_per_second, burst)
    }

    /// Limit reads with an explicit burst size.
    pub fn with_burst(inner: R, bytes_per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        tracing::debug!("rate reader at {bytes_per_second} B/s, burst {burst}");
        let limiter = RateLimiter::direct(Quota::per_second(bytes_per_second).allow_burst(burst));
        Self {
            inner,
            limiter,
            clock: DefaultClock::default(),
            burst: burst.get(),
            debt: 0,
            delay: None,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Settle outstanding token debt, parking a timer when the bucket is
    /// empty. Returns `Pending` while a refill wait is in progress.
    fn poll_settle_debt(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if let Some(delay) = self.delay.as_mut() {
                ready!(delay.as_mut().poll(cx));
                self.delay = None;
            }
            let Some(debt) = NonZeroU32::new(self.debt) else {
                return Poll::Ready(());
            };
            match self.limiter.check_n(debt) {
                Ok(Ok(())) => {
                    self.debt = 0;
                    return Poll::Ready(());
                }
                Ok(Err(not_until)) => {
                    let wait = not_until.wait_time_from(self.clock.now());
                    self.delay = Some(Box::pin(tokio::time::sleep(wait)));
                }
                // Unreachable: debt is clamped to the burst size.
                Err(_) => {
                    self.debt = 0;
                    return Poll::Ready(());
                }
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RateReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_settle_debt(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n > 0 {
            this.debt = (n as u32).min(this.burst);
        }
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for RateReader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
