//! File transfer hand-off
//!
//! The device is told to start a transfer with a framing command
//! (`X`, a direction letter, the file name, CR); the transport is then
//! handed to a [`FileTransfer`] collaborator for the duration of the
//! transfer. The whole handshake is retried a few times.

pub mod xmodem;

pub use xmodem::{XModem, XModemVariant};

use crate::core::context::RuntimeContext;
use crate::core::transport::{drain_input, ByteTransport, TransportError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Handshake attempts before giving up
pub const HANDSHAKE_ATTEMPTS: usize = 3;

const RESYNC_QUIET: Duration = Duration::from_millis(200);

/// Transfer error types
#[derive(Error, Debug)]
pub enum TransferError {
    /// Local file could not be read or written
    #[error("File error on {path}: {source}")]
    File {
        /// File involved
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// The other side never answered
    #[error("Transfer timed out")]
    Timeout,

    /// Too many retransmissions
    #[error("Too many retries")]
    TooManyRetries,

    /// Cancelled locally or by the device
    #[error("Transfer cancelled")]
    Cancelled,

    /// Device transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer broke the protocol
    #[error("Handshake failed: {0}")]
    Handshake(String),
}

impl TransferError {
    /// Wrap an I/O error on `path`
    pub fn file(path: &Path, source: std::io::Error) -> Self {
        Self::File {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Transfer direction, seen from this tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Host file to device
    Send,
    /// Device to host file
    Receive,
}

impl TransferDirection {
    /// Letter used in the framing command
    pub fn letter(self) -> char {
        match self {
            Self::Send => 'S',
            Self::Receive => 'R',
        }
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S" | "s" => Ok(Self::Send),
            "R" | "r" => Ok(Self::Receive),
            other => Err(format!("transfer direction must be S or R, got '{other}'")),
        }
    }
}

/// A file-transfer protocol that takes over the device transport
#[async_trait]
pub trait FileTransfer: Send {
    /// Protocol name for logs
    fn name(&self) -> &'static str;

    /// Send `path` to the device; returns bytes sent
    async fn send_file(
        &mut self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
        path: &Path,
    ) -> Result<u64, TransferError>;

    /// Receive from the device into `path`; returns bytes written
    async fn receive_file(
        &mut self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
        path: &Path,
    ) -> Result<u64, TransferError>;
}

/// The framing command announcing a transfer of `file`
pub fn framing_command(direction: TransferDirection, file: &Path) -> String {
    format!("X{}{}\r", direction.letter(), file.display())
}

/// Announce the transfer to the device and run `collaborator`, retrying the
/// whole handshake up to [`HANDSHAKE_ATTEMPTS`] times
pub async fn run_transfer(
    device: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    direction: TransferDirection,
    file: &Path,
    collaborator: &mut dyn FileTransfer,
) -> Result<u64, TransferError> {
    let framing = framing_command(direction, file);
    let mut last_error = TransferError::TooManyRetries;

    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        if ctx.should_quit() {
            return Err(TransferError::Cancelled);
        }
        if ctx.is_quiet() {
            debug!(attempt, protocol = collaborator.name(), "starting transfer");
        } else {
            info!(
                attempt,
                protocol = collaborator.name(),
                file = %file.display(),
                "starting transfer"
            );
        }

        device.write(framing.as_bytes()).await?;
        let result = match direction {
            TransferDirection::Send => collaborator.send_file(device, ctx, file).await,
            TransferDirection::Receive => collaborator.receive_file(device, ctx, file).await,
        };

        match result {
            Ok(bytes) => {
                info!(bytes, "transfer complete");
                return Ok(bytes);
            }
            Err(e @ (TransferError::Cancelled | TransferError::File { .. })) => return Err(e),
            Err(e) => {
                warn!(attempt, "transfer failed: {}", e);
                let stale = drain_input(device, RESYNC_QUIET).await?;
                debug!(bytes = stale.len(), "discarded stale transfer bytes");
                last_error = e;
            }
        }
    }

    Err(last_error)
}
