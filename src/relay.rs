use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, copy, split},
    time::{Instant, Sleep, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

// Relay behavior derived from configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelaySettings {
    // Inactivity deadline applied to the public-facing stream, if enabled.
    pub idle_timeout: Option<Duration>,
    // Whether to log copy errors. Relay failures are otherwise silent; they
    // are an ordinary termination mode, not an exceptional one.
    pub verbose_errors: bool,
}

// Wraps a stream with a sliding inactivity deadline, kept independently per
// direction. A pending read or write fails with `TimedOut` once no bytes
// have moved for the configured duration; every completed operation re-arms
// the corresponding deadline.
pub struct IdleTimeoutStream<S> {
    inner: S,
    timeout: Duration,
    read_deadline: Pin<Box<Sleep>>,
    write_deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeoutStream<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        IdleTimeoutStream {
            inner,
            timeout,
            read_deadline: Box::pin(sleep(timeout)),
            write_deadline: Box::pin(sleep(timeout)),
        }
    }
}

fn idle_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idled out")
}

impl<S> AsyncRead for IdleTimeoutStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_deadline
                    .as_mut()
                    .reset(Instant::now() + this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.read_deadline.as_mut().poll(cx).is_ready() {
                    Poll::Ready(Err(idle_error()))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl<S> AsyncWrite for IdleTimeoutStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline
                    .as_mut()
                    .reset(Instant::now() + this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.write_deadline.as_mut().poll(cx).is_ready() {
                    Poll::Ready(Err(idle_error()))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

// Pair a public-facing stream with a tunneled stream and copy data both ways
// until either side closes. Both endpoints are shut down before this
// returns, no matter which direction finished first or whether both failed
// at once.
pub async fn copy_both<A, B>(public: A, tunnel: B, settings: RelaySettings)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    match settings.idle_timeout {
        Some(timeout) => relay(IdleTimeoutStream::new(public, timeout), tunnel, settings).await,
        None => relay(public, tunnel, settings).await,
    }
}

async fn relay<A, B>(public: A, tunnel: B, settings: RelaySettings)
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut public_read, mut public_write) = split(public);
    let (mut tunnel_read, mut tunnel_write) = split(tunnel);
    let teardown = CancellationToken::new();
    let cancel = teardown.clone();
    // The tunnel-to-public direction runs as its own task.
    let opposite = tokio::spawn(async move {
        let result = tokio::select! {
            result = copy(&mut tunnel_read, &mut public_write) => Some(result),
            () = cancel.cancelled() => None,
        };
        if let Some(Err(error)) = result {
            if settings.verbose_errors {
                debug!(%error, "Error copying to public stream.");
            }
        }
        let _ = public_write.shutdown().await;
        cancel.cancel();
    });
    let result = tokio::select! {
        result = copy(&mut public_read, &mut tunnel_write) => Some(result),
        () = teardown.cancelled() => None,
    };
    if let Some(Err(error)) = result {
        if settings.verbose_errors {
            debug!(%error, "Error copying to tunneled stream.");
        }
    }
    let _ = tunnel_write.shutdown().await;
    teardown.cancel();
    // The opposite direction closes the public endpoint; wait for it.
    let _ = opposite.await;
}


#[cfg(test)]
mod relay_tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt, duplex},
        time::timeout,
    };

    use super::{RelaySettings, copy_both};

    #[tokio::test]
    async fn relays_data_both_ways() {
        let (mut public, public_end) = duplex(1024);
        let (mut tunnel, tunnel_end) = duplex(1024);
        let relay = tokio::spawn(copy_both(public_end, tunnel_end, RelaySettings::default()));
        public.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        tunnel.write_all(b"world").await.unwrap();
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        drop(public);
        timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should finish once one side closes")
            .unwrap();
        // The relay also closed the tunnel endpoint.
        assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_the_tunnel_side_closes_the_public_side() {
        let (mut public, public_end) = duplex(1024);
        let (tunnel, tunnel_end) = duplex(1024);
        let relay = tokio::spawn(copy_both(public_end, tunnel_end, RelaySettings::default()));
        drop(tunnel);
        timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should finish once one side closes")
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(public.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn survives_simultaneous_failure_in_both_directions() {
        let (public, public_end) = duplex(8);
        let (tunnel, tunnel_end) = duplex(8);
        let relay = tokio::spawn(copy_both(public_end, tunnel_end, RelaySettings::default()));
        drop(public);
        drop(tunnel);
        timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay should finish when both sides close at once")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_relay_tears_down_both_streams() {
        let (mut public, public_end) = duplex(8);
        let (mut tunnel, tunnel_end) = duplex(8);
        let settings = RelaySettings {
            idle_timeout: Some(Duration::from_millis(200)),
            verbose_errors: true,
        };
        let relay = tokio::spawn(copy_both(public_end, tunnel_end, settings));
        relay.await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(public.read(&mut buf).await.unwrap(), 0);
        assert_eq!(tunnel.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn active_relay_is_not_idled_out() {
        let (mut public, public_end) = duplex(64);
        let (mut tunnel, tunnel_end) = duplex(64);
        let settings = RelaySettings {
            idle_timeout: Some(Duration::from_millis(200)),
            verbose_errors: false,
        };
        let relay = tokio::spawn(copy_both(public_end, tunnel_end, settings));
        let mut buf = [0u8; 4];
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            public.write_all(b"ping").await.unwrap();
            tunnel.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
        drop(public);
        relay.await.unwrap();
    }
}
