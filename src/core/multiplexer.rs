//! Alternate console resolution and listen mode
//!
//! A console spec is either a TCP address (`host:port`, `[v6]:port`,
//! `:port`) or a filesystem path (device, pipe, FIFO or local socket).
//! In listen mode each accepted connection becomes the console of exactly
//! one session; the next connection is not accepted until that session's
//! task has finished.

use crate::core::context::RuntimeContext;
use crate::core::transport::{BufferedTransport, ByteTransport, DirectTransport, TransportError};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Longest wait for a connection before re-checking for quit
pub const ACCEPT_SLICE: Duration = Duration::from_millis(500);

/// Interval between progress logs while a session runs
const JOIN_POLL: Duration = Duration::from_millis(500);

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// Multiplexer error types
#[derive(Error, Debug)]
pub enum MultiplexError {
    /// The spec could not be parsed
    #[error("Invalid console address '{spec}': {reason}")]
    InvalidSpec {
        /// The offending spec
        spec: String,
        /// What is wrong with it
        reason: String,
    },

    /// Listen mode was asked for with a path
    #[error("Listen mode requires a TCP address, got '{0}'")]
    ListenRequiresTcp(String),

    /// Binding or listening failed
    #[error("Unable to listen on {addr}: {source}")]
    Bind {
        /// Address requested
        addr: SocketAddr,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Outbound connect failed
    #[error("Unable to connect to {target}: {source}")]
    Connect {
        /// Address or path
        target: String,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// Opening the console failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Parsed alternate console location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleSpec {
    /// TCP endpoint; `addr` is `None` when omitted
    Tcp {
        /// Address, if given
        addr: Option<IpAddr>,
        /// Port
        port: u16,
    },
    /// Device, pipe, FIFO or local-domain socket
    Path(PathBuf),
}

impl ConsoleSpec {
    /// Parse a spec. Anything containing `:` is a TCP address, split at the
    /// last colon.
    pub fn parse(spec: &str) -> Result<Self, MultiplexError> {
        let invalid = |reason: &str| MultiplexError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let Some((host, port)) = spec.rsplit_once(':') else {
            if spec.is_empty() {
                return Err(invalid("empty"));
            }
            return Ok(Self::Path(PathBuf::from(spec)));
        };

        let port: u16 = port.parse().map_err(|_| invalid("bad port"))?;
        let addr = if host.is_empty() {
            None
        } else if let Some(v6) = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(IpAddr::V6(v6.parse::<Ipv6Addr>().map_err(|_| invalid("bad IPv6 address"))?))
        } else {
            Some(host.parse::<IpAddr>().map_err(|_| invalid("bad IP address"))?)
        };
        Ok(Self::Tcp { addr, port })
    }

    /// Outbound target; loopback when no address was given
    pub fn connect_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { addr, port } => Some(SocketAddr::new(
                addr.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                *port,
            )),
            Self::Path(_) => None,
        }
    }

    /// Listen address; wildcard when no address was given
    pub fn bind_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp { addr, port } => Some(SocketAddr::new(
                addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
                *port,
            )),
            Self::Path(_) => None,
        }
    }
}

impl fmt::Display for ConsoleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { addr: None, port } => write!(f, ":{port}"),
            Self::Tcp { addr: Some(IpAddr::V6(a)), port } => write!(f, "[{a}]:{port}"),
            Self::Tcp { addr: Some(a), port } => write!(f, "{a}:{port}"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Open the console described by `spec` (outbound, not listen mode)
pub async fn resolve(spec: &ConsoleSpec) -> Result<Box<dyn ByteTransport>, MultiplexError> {
    match spec {
        ConsoleSpec::Tcp { .. } => {
            let addr = spec.connect_addr().ok_or_else(|| MultiplexError::ListenRequiresTcp(spec.to_string()))?;
            let stream = TcpStream::connect(addr).await.map_err(|source| MultiplexError::Connect {
                target: addr.to_string(),
                source,
            })?;
            info!(%addr, "console connected over TCP");
            Ok(Box::new(DirectTransport::tcp(stream)))
        }
        ConsoleSpec::Path(path) => resolve_path(path).await,
    }
}

#[cfg(unix)]
async fn resolve_path(path: &Path) -> Result<Box<dyn ByteTransport>, MultiplexError> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => connect_unix(path).await,
        Ok(_) => match BufferedTransport::open_file(path) {
            Ok(transport) => Ok(Box::new(transport)),
            Err(TransportError::Open { source, .. })
                if matches!(source.raw_os_error(), Some(libc::EOPNOTSUPP | libc::ENXIO)) =>
            {
                debug!(path = %path.display(), "not openable as a file, trying socket");
                connect_unix(path).await
            }
            Err(e) => Err(e.into()),
        },
        Err(_) => connect_unix(path).await,
    }
}

#[cfg(unix)]
async fn connect_unix(path: &Path) -> Result<Box<dyn ByteTransport>, MultiplexError> {
    let stream = tokio::net::UnixStream::connect(path)
        .await
        .map_err(|source| MultiplexError::Connect {
            target: path.display().to_string(),
            source,
        })?;
    info!(path = %path.display(), "console connected over local socket");
    Ok(Box::new(DirectTransport::unix(stream, path.display().to_string())))
}

#[cfg(not(unix))]
async fn resolve_path(path: &Path) -> Result<Box<dyn ByteTransport>, MultiplexError> {
    Ok(Box::new(BufferedTransport::open_file(path)?))
}

/// A bound console listener
pub struct ConsoleListener {
    listener: TcpListener,
}

impl ConsoleListener {
    /// Bind the listen address. Failure here is fatal for the caller.
    pub async fn bind(spec: &ConsoleSpec) -> Result<Self, MultiplexError> {
        let addr = spec
            .bind_addr()
            .ok_or_else(|| MultiplexError::ListenRequiresTcp(spec.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| MultiplexError::Bind { addr, source })?;
        Ok(Self { listener })
    }

    /// Bound address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections one at a time until quit.
    ///
    /// Each connection is handed to `serve` on its own task with a session
    /// context; the loop waits for that task before accepting again.
    /// Returns the number of sessions served.
    pub async fn serve<F, Fut, E>(self, ctx: &RuntimeContext, serve: F) -> usize
    where
        F: Fn(Box<dyn ByteTransport>, RuntimeContext) -> Fut,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut served = 0;
        match self.listener.local_addr() {
            Ok(addr) => info!(%addr, "listening for TCP connect"),
            Err(_) => info!("listening for TCP connect"),
        }

        loop {
            if ctx.should_quit() {
                break;
            }

            let accepted = tokio::select! {
                () = ctx.quit_requested() => break,
                r = tokio::time::timeout(ACCEPT_SLICE, self.listener.accept()) => r,
            };

            let (stream, peer) = match accepted {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Ok(Ok(pair)) => pair,
            };

            let session_id = Uuid::new_v4();
            info!(%peer, %session_id, "session accepted");

            let console: Box<dyn ByteTransport> = Box::new(DirectTransport::tcp(stream));
            let mut worker = tokio::spawn(serve(console, ctx.for_session()));

            loop {
                tokio::select! {
                    joined = &mut worker => {
                        match joined {
                            Ok(Ok(())) => info!(%session_id, "session finished"),
                            Ok(Err(e)) => warn!(%session_id, "session ended with error: {}", e),
                            Err(e) => error!(%session_id, "session worker terminated abnormally: {}", e),
                        }
                        break;
                    }
                    () = tokio::time::sleep(JOIN_POLL) => trace!(%session_id, "session still running"),
                }
            }

            served += 1;
            if !ctx.should_quit() {
                info!("session terminated, listening again");
            }
        }

        served
    }
}

/// Bind `spec` and serve sessions until quit
pub async fn listen_and_serve<F, Fut, E>(
    spec: &ConsoleSpec,
    ctx: &RuntimeContext,
    serve: F,
) -> Result<usize, MultiplexError>
where
    F: Fn(Box<dyn ByteTransport>, RuntimeContext) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let listener = ConsoleListener::bind(spec).await?;
    Ok(listener.serve(ctx, serve).await)
}
