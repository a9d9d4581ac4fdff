use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::socket::SocketOptions;
use crate::throttle::BandwidthThrottler;

/// Upper bound for a single read syscall issued by [`Connection::read_throttled`].
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound for the single read of [`Connection::read_with_delay`].
const MAX_SINGLE_READ: usize = CHUNK_SIZE * 16;

/// Client side of a stream whose reads can be rate limited or delayed.
///
/// A connection is meant to be driven by one task at a time; every mutating
/// operation takes `&mut self`. Share it behind a `tokio::sync::Mutex` if
/// several tasks need it. Call [`close`](Self::close) when done.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    stream: Option<S>,
    throttler: Option<BandwidthThrottler>,
    peer: String,
}

impl Connection<TcpStream> {
    /// Dials a `host:port` address.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|source| {
            warn!("Failed to connect to {}: {}", addr, source);
            Error::Connect {
                addr: addr.to_string(),
                source,
            }
        })?;

        info!("Connected to {}", addr);
        Ok(Self {
            stream: Some(stream),
            throttler: None,
            peer: addr.to_string(),
        })
    }
}

impl<S> Connection<S> {
    /// Wraps an already established stream.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: Some(stream),
            throttler: None,
            peer: "stream".to_string(),
        }
    }

    /// Installs a fresh throttler, replacing the current one.
    ///
    /// A zero rate is rejected and leaves the existing throttler in place.
    pub fn set_bandwidth_limit(&mut self, bytes_per_second: u64) -> Result<()> {
        let throttler = BandwidthThrottler::new(bytes_per_second)?;
        debug!("Bandwidth limit for {} set to {} B/s", self.peer, bytes_per_second);
        self.throttler = Some(throttler);
        Ok(())
    }

    pub fn clear_bandwidth_limit(&mut self) {
        if self.throttler.take().is_some() {
            debug!("Bandwidth limit for {} removed", self.peer);
        }
    }

    pub fn bandwidth_limit(&self) -> Option<u64> {
        self.throttler.as_ref().map(BandwidthThrottler::target_bytes_per_second)
    }

    pub fn throttler(&self) -> Option<&BandwidthThrottler> {
        self.throttler.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Releases the stream. Calling it again does nothing.
    pub fn close(&mut self) {
        match self.stream.take() {
            Some(stream) => {
                drop(stream);
                self.throttler = None;
                info!("Connection to {} closed", self.peer);
            }
            None => debug!("Connection to {} already closed", self.peer),
        }
    }

    fn chunk_limit(&self) -> usize {
        match &self.throttler {
            // a chunk never spans more than one window's allowance
            Some(throttler) => usize::try_from(throttler.target_bytes_per_second())
                .map_or(CHUNK_SIZE, |rate| rate.min(CHUNK_SIZE)),
            None => CHUNK_SIZE,
        }
    }
}

impl<S: SocketOptions> Connection<S> {
    /// Best-effort request for an OS receive buffer of `size_bytes`.
    ///
    /// Does nothing on closed connections or transports without a kernel
    /// buffer. Only an explicit failure of the option call is reported.
    pub fn set_receive_buffer(&self, size_bytes: usize) -> Result<()> {
        let Some(stream) = &self.stream else {
            debug!("Ignoring receive buffer request on closed connection to {}", self.peer);
            return Ok(());
        };

        stream
            .set_recv_buffer_size(size_bytes)
            .map_err(Error::SocketOption)?;
        debug!("Requested {} byte receive buffer for {}", size_bytes, self.peer);
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Reads up to `size` bytes in chunks of at most [`CHUNK_SIZE`], waiting on
    /// the throttler before each chunk.
    ///
    /// Returns early with what has been read on end of stream. A read error
    /// after at least one successful chunk also returns the bytes obtained so
    /// far; an error before any byte arrived is reported as [`Error::Read`].
    pub async fn read_throttled(&mut self, size: usize) -> Result<Bytes> {
        self.read_chunked(size, None).await
    }

    /// [`read_throttled`](Self::read_throttled) that aborts with
    /// [`Error::Cancelled`] when `cancel` fires during a wait or a pending read.
    pub async fn read_throttled_with_cancel(
        &mut self,
        size: usize,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        self.read_chunked(size, Some(cancel)).await
    }

    /// Performs one read of up to `size` bytes and then holds the result for
    /// `delay_ms` milliseconds. The throttler is not consulted.
    pub async fn read_with_delay(&mut self, size: usize, delay_ms: u64) -> Result<Bytes> {
        let data = self.read_once(size).await?;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(data)
    }

    pub async fn read_with_delay_cancellable(
        &mut self,
        size: usize,
        delay_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let data = tokio::select! {
            data = self.read_once(size) => data?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => Ok(data),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    async fn read_once(&mut self, size: usize) -> Result<Bytes> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Read(not_connected()))?;

        let cap = size.min(MAX_SINGLE_READ);
        let mut buf = BytesMut::with_capacity(cap);
        stream
            .read_buf(&mut (&mut buf).limit(cap))
            .await
            .map_err(Error::Read)?;
        Ok(buf.freeze())
    }

    async fn read_chunked(&mut self, size: usize, cancel: Option<&CancellationToken>) -> Result<Bytes> {
        let chunk_limit = self.chunk_limit();
        let Self {
            stream,
            throttler,
            peer,
        } = self;
        let stream = stream.as_mut().ok_or_else(|| Error::Read(not_connected()))?;

        // grows with what actually arrives, not with what was asked for
        let mut buf = BytesMut::with_capacity(size.min(chunk_limit));
        let mut total = 0;

        while total < size {
            let chunk = (size - total).min(chunk_limit);

            if let Some(throttler) = throttler.as_mut() {
                match cancel {
                    Some(token) => throttler.acquire_cancellable(chunk as u64, token).await?,
                    None => throttler.acquire(chunk as u64).await,
                }
            }

            buf.reserve(chunk);
            let mut spare = (&mut buf).limit(chunk);
            let read = stream.read_buf(&mut spare);
            let result = match cancel {
                Some(token) => tokio::select! {
                    result = read => result,
                    _ = token.cancelled() => return Err(Error::Cancelled),
                },
                None => read.await,
            };

            match result {
                Ok(0) => {
                    debug!("End of stream from {} after {} bytes", peer, total);
                    break;
                }
                Ok(n) => {
                    total += n;
                    if let Some(throttler) = throttler.as_mut() {
                        throttler.record(n as u64);
                    }
                }
                Err(e) if total > 0 => {
                    warn!("Read from {} failed after {} bytes, returning partial data: {}", peer, total, e);
                    break;
                }
                Err(e) => return Err(Error::Read(e)),
            }
        }

        Ok(buf.freeze())
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Writes all of `data` and flushes it.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::Write(not_connected()))?;

        stream.write_all(data).await.map_err(Error::Write)?;
        stream.flush().await.map_err(Error::Write)?;
        Ok(())
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::test;
    use tokio::time::Instant;

    /// Replays a fixed sequence of read outcomes.
    struct Scripted {
        steps: VecDeque<io::Result<Vec<u8>>>,
    }

    impl AsyncRead for Scripted {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.steps.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    #[test(start_paused = true)]
    async fn test_rate_limited_read_takes_three_windows() {
        let mut conn = Connection::from_stream(tokio::io::repeat(0xab));
        conn.set_bandwidth_limit(1_000_000).unwrap();

        let start = Instant::now();
        let data = conn.read_throttled(3_000_000).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(data.len(), 3_000_000);
        assert!(data.iter().all(|b| *b == 0xab));
        assert!(elapsed >= Duration::from_secs(3), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(4), "elapsed {:?}", elapsed);
    }

    #[test(start_paused = true)]
    async fn test_throughput_overshoot_is_bounded_by_one_chunk() {
        let rate = 10_000u64;
        let mut conn = Connection::from_stream(tokio::io::repeat(1));
        conn.set_bandwidth_limit(rate).unwrap();

        let start = Instant::now();
        let mut total = 0u64;
        for _ in 0..10 {
            total += conn.read_throttled(7_000).await.unwrap().len() as u64;
        }
        let elapsed = start.elapsed().as_secs_f64();

        // the first window starts with a full allowance
        let allowed = rate as f64 * (elapsed.floor() + 1.0) + CHUNK_SIZE as f64;
        assert_eq!(total, 70_000);
        assert!((total as f64) <= allowed, "{} bytes in {}s", total, elapsed);
    }

    #[test]
    async fn test_unthrottled_read_never_exceeds_requested_size() {
        let mut conn = Connection::from_stream(tokio::io::repeat(7));
        let data = conn.read_throttled(10_000).await.unwrap();
        assert_eq!(data.len(), 10_000);

        let data = conn.read_throttled(0).await.unwrap();
        assert!(data.is_empty());
    }

    #[test]
    async fn test_peer_closes_after_500_bytes() {
        let (client, mut server) = duplex(8192);
        server.write_all(&[9u8; 500]).await.unwrap();
        drop(server);

        let mut conn = Connection::from_stream(client);
        conn.set_bandwidth_limit(1_000_000).unwrap();
        let data = conn.read_throttled(4096).await.unwrap();
        assert_eq!(data.len(), 500);

        let data = conn.read_throttled(4096).await.unwrap();
        assert!(data.is_empty());
    }

    #[test]
    async fn test_tcp_peer_closes_after_500_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[3u8; 500]).await.unwrap();
        });

        let mut conn = Connection::connect(&addr.to_string()).await.unwrap();
        conn.set_receive_buffer(32 * 1024).unwrap();
        server.await.unwrap();

        let data = conn.read_throttled(4096).await.unwrap();
        assert_eq!(data.len(), 500);
        conn.close();
    }

    #[test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = Connection::connect(&addr).await.unwrap_err();
        match err {
            Error::Connect { addr: failed, .. } => assert_eq!(failed, addr),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    async fn test_partial_read_error_returns_bytes() {
        let reader = Scripted {
            steps: VecDeque::from(vec![
                Ok(vec![1u8; 100]),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            ]),
        };
        let mut conn = Connection::from_stream(reader);

        let data = conn.read_throttled(4096).await.unwrap();
        assert_eq!(data.len(), 100);
    }

    #[test]
    async fn test_first_chunk_error_is_reported() {
        let reader = Scripted {
            steps: VecDeque::from(vec![Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset",
            ))]),
        };
        let mut conn = Connection::from_stream(reader);

        let err = conn.read_throttled(4096).await.unwrap_err();
        assert!(matches!(err, Error::Read(_)));
    }

    #[test]
    async fn test_new_limit_resets_window() {
        let mut conn = Connection::from_stream(tokio::io::repeat(0));
        conn.set_bandwidth_limit(1_000_000).unwrap();
        conn.read_throttled(8192).await.unwrap();
        assert_eq!(conn.throttler().unwrap().bytes_in_window(), 8192);

        conn.set_bandwidth_limit(2_000_000).unwrap();
        let throttler = conn.throttler().unwrap();
        assert_eq!(throttler.bytes_in_window(), 0);
        assert_eq!(throttler.target_bytes_per_second(), 2_000_000);
    }

    #[test]
    async fn test_zero_limit_keeps_existing_throttler() {
        let mut conn = Connection::from_stream(tokio::io::repeat(0));
        conn.set_bandwidth_limit(1000).unwrap();
        conn.read_throttled(500).await.unwrap();

        let err = conn.set_bandwidth_limit(0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(conn.bandwidth_limit(), Some(1000));
        assert_eq!(conn.throttler().unwrap().bytes_in_window(), 500);

        conn.clear_bandwidth_limit();
        assert_eq!(conn.bandwidth_limit(), None);
    }

    #[test(start_paused = true)]
    async fn test_read_with_delay_waits_after_read() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"hello").await.unwrap();

        let mut conn = Connection::from_stream(client);
        let start = Instant::now();
        let data = conn.read_with_delay(4096, 250).await.unwrap();

        assert_eq!(&data[..], b"hello");
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test(start_paused = true)]
    async fn test_read_with_delay_cancelled() {
        let (client, mut server) = duplex(1024);
        server.write_all(b"hello").await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let mut conn = Connection::from_stream(client);
        let err = conn
            .read_with_delay_cancellable(4096, 10_000, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test(start_paused = true)]
    async fn test_pending_read_is_cancelled() {
        let (client, _server) = duplex(1024);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let mut conn = Connection::from_stream(client);
        let err = conn.read_throttled_with_cancel(4096, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    async fn test_write_and_close() {
        let (client, mut server) = duplex(1024);
        let mut conn = Connection::from_stream(client);

        conn.write(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.close();
        conn.close();
        assert!(conn.is_closed());

        assert!(matches!(conn.write(b"again").await.unwrap_err(), Error::Write(_)));
        assert!(matches!(conn.read_throttled(10).await.unwrap_err(), Error::Read(_)));
    }

    #[test]
    async fn test_write_to_dropped_peer_fails() {
        let (client, server) = duplex(1024);
        drop(server);

        let mut conn = Connection::from_stream(client);
        match conn.write(b"ping").await.unwrap_err() {
            Error::Write(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    async fn test_huge_request_returns_what_the_peer_sent() {
        let (client, mut server) = duplex(8192);
        server.write_all(&[5u8; 500]).await.unwrap();
        drop(server);

        let mut conn = Connection::from_stream(client);
        let data = conn.read_throttled(usize::MAX).await.unwrap();
        assert_eq!(data.len(), 500);
        assert!(data.iter().all(|b| *b == 5));
    }

    #[test]
    async fn test_huge_delayed_read_returns_what_the_peer_sent() {
        let (client, mut server) = duplex(8192);
        server.write_all(&[6u8; 500]).await.unwrap();
        drop(server);

        let mut conn = Connection::from_stream(client);
        let data = conn.read_with_delay(usize::MAX, 0).await.unwrap();
        assert_eq!(data.len(), 500);
    }

    /// Stream whose kernel refuses every buffer size.
    struct RejectingSocket;

    impl SocketOptions for RejectingSocket {
        fn set_recv_buffer_size(&self, _size: usize) -> io::Result<()> {
            Err(io::Error::from_raw_os_error(libc::EINVAL))
        }
    }

    #[test]
    async fn test_receive_buffer_failure_is_reported() {
        let conn = Connection::from_stream(RejectingSocket);
        let err = conn.set_receive_buffer(1 << 20).unwrap_err();
        match err {
            Error::SocketOption(e) => assert_eq!(e.raw_os_error(), Some(libc::EINVAL)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    async fn test_receive_buffer_on_closed_connection_is_a_no_op() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::from_stream(client);
        conn.close();
        conn.set_receive_buffer(1 << 20).unwrap();
    }
}
