//! Socket transport using native readiness

use super::{ByteTransport, TransportError, TransportKind, TransportStats};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::Instant;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.readable().await,
            #[cfg(unix)]
            Self::Unix(s) => s.readable().await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.try_read(buf),
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
            #[cfg(unix)]
            Self::Unix(s) => {
                s.write_all(data).await?;
                s.flush().await
            }
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown().await,
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown().await,
        }
    }
}

/// Transport over a socket; no background worker
pub struct DirectTransport {
    stream: Stream,
    pending: BytesMut,
    eof: bool,
    label: String,
    stats: TransportStats,
}

impl DirectTransport {
    /// Wrap a connected TCP stream
    pub fn tcp(stream: TcpStream) -> Self {
        let label = stream
            .peer_addr()
            .map_or_else(|_| "tcp".to_string(), |addr| addr.to_string());
        // nagle delays single keystrokes
        let _ = stream.set_nodelay(true);
        Self::new(Stream::Tcp(stream), label)
    }

    /// Wrap a connected local-domain socket
    #[cfg(unix)]
    pub fn unix(stream: UnixStream, label: impl Into<String>) -> Self {
        Self::new(Stream::Unix(stream), label.into())
    }

    fn new(stream: Stream, label: String) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(512),
            eof: false,
            label,
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl ByteTransport for DirectTransport {
    async fn poll_for_input(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.pending.is_empty() || self.eof {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 512];
        loop {
            match tokio::time::timeout_at(deadline, self.stream.readable()).await {
                Err(_) => return Ok(false),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(())) => {}
            }
            // readiness can be spurious; confirm by reading ahead
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(true);
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = if !self.pending.is_empty() {
            let n = self.pending.len().min(buf.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.advance(n);
            n
        } else if self.eof {
            0
        } else {
            match self.stream.try_read(buf) {
                Ok(0) => {
                    self.eof = true;
                    0
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e.into()),
            }
        };
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.stream.write_all(data).await?;
        self.stats.bytes_sent += data.len() as u64;
        Ok(data.len())
    }

    fn kind(&self) -> TransportKind {
        match self.stream {
            Stream::Tcp(_) => TransportKind::Tcp,
            #[cfg(unix)]
            Stream::Unix(_) => TransportKind::Unix,
        }
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.label, self.kind())
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (DirectTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (DirectTransport::tcp(server), client)
    }

    #[tokio::test]
    async fn test_poll_times_out_then_reads() {
        let (mut transport, mut client) = pair().await;

        assert!(!transport.poll_for_input(Duration::from_millis(50)).await.unwrap());

        client.write_all(b"abc").await.unwrap();
        assert!(transport.poll_for_input(Duration::from_secs(1)).await.unwrap());
        let mut buf = [0u8; 8];
        let n = transport.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(transport.kind(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_peer_close_polls_true_and_reads_zero() {
        let (mut transport, client) = pair().await;
        drop(client);

        assert!(transport.poll_for_input(Duration::from_secs(1)).await.unwrap());
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write() {
        let (mut transport, mut client) = pair().await;
        transport.write(b"[CR]\n").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"[CR]\n");
        assert_eq!(transport.stats().bytes_sent, 5);
    }
}
