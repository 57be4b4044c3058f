//! Byte transports
//!
//! Every endpoint (device, local console, socket, pipe) is driven through
//! [`ByteTransport`]. Two realizations exist:
//! - [`DirectTransport`] for sockets with native readiness support
//! - [`BufferedTransport`] backed by an [`IoWorker`](crate::core::worker::IoWorker)
//!   for handles that only do blocking I/O (stdio, serial lines, FIFOs)

mod buffered;
mod direct;
mod serial;

pub use buffered::BufferedTransport;
pub use direct::DirectTransport;
pub use serial::{list_ports, open_serial, PortInfo, SerialParity, SerialSettings};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a transport is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Serial device
    Serial,
    /// Process stdin/stdout
    Stdio,
    /// TCP socket
    Tcp,
    /// Local-domain socket
    Unix,
    /// Device file, named pipe or FIFO
    File,
    /// In-process stream
    Memory,
}

impl TransportKind {
    /// True for socket-backed consoles whose peer can vanish
    pub fn is_network(self) -> bool {
        matches!(self, Self::Tcp | Self::Unix)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Stdio => write!(f, "Stdio"),
            Self::Tcp => write!(f, "TCP"),
            Self::Unix => write!(f, "Unix socket"),
            Self::File => write!(f, "File"),
            Self::Memory => write!(f, "Memory"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Resource could not be acquired at startup
    #[error("Unable to open {target}: {source}")]
    Open {
        /// Path or address that failed
        target: String,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// Mid-session I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote end closed the stream
    #[error("Connection closed by peer")]
    Closed,

    /// The background pump is no longer running
    #[error("I/O worker stopped")]
    WorkerStopped,

    /// Operation not available on this transport
    #[error("{0} not supported on this transport")]
    Unsupported(&'static str),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TransportError {
    /// Wrap an I/O error raised while opening `target`
    pub fn open(target: impl Into<String>, source: std::io::Error) -> Self {
        Self::Open {
            target: target.into(),
            source,
        }
    }
}

/// Byte counters kept by each transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes written
    pub bytes_sent: u64,
    /// Bytes read
    pub bytes_received: u64,
}

/// Uniform poll/read/write contract over one OS resource
#[async_trait]
pub trait ByteTransport: Send {
    /// Wait up to `timeout` for input.
    ///
    /// Returns `true` when a following [`read`](Self::read) will not block:
    /// either bytes are waiting or the stream reached end-of-file (the read
    /// then returns 0). I/O failures are reported as errors, never as `false`.
    async fn poll_for_input(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Copy the bytes available now into `buf`. `Ok(0)` means nothing now,
    /// or end-of-file after a positive poll.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Queue or write all of `data`; never drops bytes
    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Human readable description for logs
    fn describe(&self) -> String;

    /// Byte counters
    fn stats(&self) -> TransportStats;

    /// Set or clear DTR and RTS together
    async fn set_control_lines(&mut self, _asserted: bool) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("control lines"))
    }

    /// Release the resource, flushing queued output where possible
    async fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Control-line access for transports whose I/O runs on a worker
pub trait LineControl: Send + Sync {
    /// Drive DTR and RTS to `asserted`
    fn set_lines(&self, asserted: bool) -> std::io::Result<()>;
}

/// Read and discard everything that arrives until the line goes quiet.
///
/// Returns the discarded bytes so callers may echo them.
pub async fn drain_input(
    transport: &mut dyn ByteTransport,
    quiet_for: Duration,
) -> Result<Vec<u8>, TransportError> {
    let mut drained = Vec::new();
    let mut buf = [0u8; 256];
    while transport.poll_for_input(quiet_for).await? {
        let n = transport.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        drained.extend_from_slice(&buf[..n]);
    }
    Ok(drained)
}
