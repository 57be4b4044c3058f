//! Worker-backed transport

use super::{ByteTransport, LineControl, TransportError, TransportKind, TransportStats};
use crate::core::worker::{IoWorker, WorkerConfig};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Transport whose I/O runs on a background [`IoWorker`]
pub struct BufferedTransport {
    worker: Option<IoWorker>,
    kind: TransportKind,
    label: String,
    lines: Option<Arc<dyn LineControl>>,
    stats: TransportStats,
}

impl BufferedTransport {
    /// Wrap an async reader/writer pair
    pub fn from_async<R, W>(
        reader: R,
        writer: W,
        kind: TransportKind,
        label: impl Into<String>,
        config: WorkerConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            worker: Some(IoWorker::spawn(reader, writer, config)),
            kind,
            label: label.into(),
            lines: None,
            stats: TransportStats::default(),
        }
    }

    /// Wrap an in-process duplex stream
    pub fn from_stream<S>(stream: S, label: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_async(reader, writer, TransportKind::Memory, label, WorkerConfig::device())
    }

    /// The process console: stdin in, stdout out
    pub fn stdio() -> Result<Self, TransportError> {
        let worker = IoWorker::spawn_blocking(
            Box::new(std::io::stdin()),
            Box::new(std::io::stdout()),
            WorkerConfig::console(),
        )?;
        Ok(Self {
            worker: Some(worker),
            kind: TransportKind::Stdio,
            label: "stdio".to_string(),
            lines: None,
            stats: TransportStats::default(),
        })
    }

    /// A device file, named pipe or FIFO opened read/write
    pub fn open_file(path: &Path) -> Result<Self, TransportError> {
        let label = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TransportError::open(&label, e))?;
        let writer = file.try_clone().map_err(|e| TransportError::open(&label, e))?;
        let worker = IoWorker::spawn_blocking(Box::new(file), Box::new(writer), WorkerConfig::console())?;
        debug!(path = %label, "opened file console");
        Ok(Self {
            worker: Some(worker),
            kind: TransportKind::File,
            label,
            lines: None,
            stats: TransportStats::default(),
        })
    }

    /// Attach control-line access
    #[must_use]
    pub fn with_line_control(mut self, lines: Arc<dyn LineControl>) -> Self {
        self.lines = Some(lines);
        self
    }

    fn worker(&self) -> Result<&IoWorker, TransportError> {
        self.worker.as_ref().ok_or(TransportError::WorkerStopped)
    }
}

#[async_trait]
impl ByteTransport for BufferedTransport {
    async fn poll_for_input(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        self.worker()?.wait_readable(timeout).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.worker()?.read(buf)?;
        self.stats.bytes_received += n as u64;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = self.worker()?.write(data).await?;
        self.stats.bytes_sent += n as u64;
        Ok(n)
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.label, self.kind)
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    async fn set_control_lines(&mut self, asserted: bool) -> Result<(), TransportError> {
        match &self.lines {
            Some(lines) => lines.set_lines(asserted).map_err(TransportError::Io),
            None => Err(TransportError::Unsupported("control lines")),
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        if let Some(worker) = self.worker.take() {
            worker.shutdown().await;
            debug!(transport = %self.label, "buffered transport closed");
        }
        Ok(())
    }
}
