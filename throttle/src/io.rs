use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::RateLimiter;

/// `AsyncWrite` wrapper that acquires tokens before delegating to the inner
/// writer. Short writes return their unused tokens to the bucket. Errors
/// from the inner writer are propagated verbatim.
pub struct ThrottledWriter<W> {
    inner: W,
    limiter: Arc<RateLimiter>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    grant: usize,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            sleep: None,
            grant: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = self.get_mut();
        if buf.is_empty() {
            return Pin::new(&mut me.inner).poll_write(cx, buf);
        }
        loop {
            if let Some(sleep) = me.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                me.sleep = None;
            }
            if me.grant == 0 {
                match me.limiter.try_acquire(buf.len()) {
                    Ok(granted) => me.grant = granted,
                    Err(wait) => {
                        me.sleep = Some(Box::pin(tokio::time::sleep(wait)));
                        continue;
                    }
                }
            }
            // the caller may legally retry with a shorter buffer; never
            // write past it
            let want = me.grant.min(buf.len());
            return match Pin::new(&mut me.inner).poll_write(cx, &buf[..want]) {
                Poll::Ready(Ok(written)) => {
                    if written < me.grant {
                        me.limiter.give_back(me.grant - written);
                    }
                    me.grant = 0;
                    Poll::Ready(Ok(written))
                }
                Poll::Ready(Err(error)) => {
                    me.limiter.give_back(me.grant);
                    me.grant = 0;
                    Poll::Ready(Err(error))
                }
                // keep the grant for the retry
                Poll::Pending => Poll::Pending,
            };
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// `AsyncRead` counterpart of [`ThrottledWriter`] for callers that throttle
/// at the source end of a copy.
pub struct ThrottledReader<R> {
    inner: R,
    limiter: Arc<RateLimiter>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
    grant: usize,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            sleep: None,
            grant: 0,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        if buf.remaining() == 0 {
            return Pin::new(&mut me.inner).poll_read(cx, buf);
        }
        loop {
            if let Some(sleep) = me.sleep.as_mut() {
                ready!(sleep.as_mut().poll(cx));
                me.sleep = None;
            }
            if me.grant == 0 {
                match me.limiter.try_acquire(buf.remaining()) {
                    Ok(granted) => me.grant = granted,
                    Err(wait) => {
                        me.sleep = Some(Box::pin(tokio::time::sleep(wait)));
                        continue;
                    }
                }
            }
            let want = me.grant.min(buf.remaining());
            let slice = buf.initialize_unfilled_to(want);
            let mut limited = ReadBuf::new(slice);
            return match Pin::new(&mut me.inner).poll_read(cx, &mut limited) {
                Poll::Ready(Ok(())) => {
                    let filled = limited.filled().len();
                    buf.advance(filled);
                    if filled < me.grant {
                        me.limiter.give_back(me.grant - filled);
                    }
                    me.grant = 0;
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(Err(error)) => {
                    me.limiter.give_back(me.grant);
                    me.grant = 0;
                    Poll::Ready(Err(error))
                }
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn writer_preserves_bytes_and_order() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let limiter = RateLimiter::new(4000);
        let mut writer = ThrottledWriter::new(Vec::new(), limiter);
        writer.write_all(&payload).await.unwrap();
        assert_eq!(writer.into_inner(), payload);
    }

    #[tokio::test(start_paused = true)]
    async fn writer_paces_to_the_configured_rate() {
        // 4000 bytes at 1000 B/s with a 2000-byte burst: ~2s
        let payload = vec![0u8; 4000];
        let limiter = RateLimiter::new(1000);
        let mut writer = ThrottledWriter::new(tokio::io::sink(), limiter);
        let start = tokio::time::Instant::now();
        writer.write_all(&payload).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(1900), "{elapsed:?}");
        assert!(elapsed <= std::time::Duration::from_millis(2500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_writer_does_not_wait() {
        let payload = vec![0u8; 1 << 20];
        let limiter = RateLimiter::new(0);
        let mut writer = ThrottledWriter::new(tokio::io::sink(), limiter);
        let start = tokio::time::Instant::now();
        writer.write_all(&payload).await.unwrap();
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_preserves_bytes() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 127) as u8).collect();
        let limiter = RateLimiter::new(2000);
        let mut reader = ThrottledReader::new(std::io::Cursor::new(payload.clone()), limiter);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }
}
