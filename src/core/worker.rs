//! Background I/O pump
//!
//! An [`IoWorker`] owns one endpoint and moves bytes between it and a pair
//! of [`SharedRing`]s: one pump per direction. Async endpoints get a tokio
//! task per direction; blocking endpoints (stdin, FIFOs) get a dedicated
//! thread per direction. Consumers only ever touch the rings.

use crate::core::ring_buffer::SharedRing;
use crate::core::transport::TransportError;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Sizing and pacing for one worker
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Inbound ring slots
    pub inbound_capacity: usize,
    /// Outbound ring slots
    pub outbound_capacity: usize,
    /// Largest single read or write
    pub chunk_size: usize,
    /// Sleep when a pump can make no progress
    pub idle_interval: Duration,
    /// Wait between retries when the outbound ring is full
    pub write_backoff: Duration,
    /// How long shutdown waits for pumps before abandoning them
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    /// Local console sizing
    pub fn console() -> Self {
        Self {
            inbound_capacity: 4096,
            outbound_capacity: 4096,
            chunk_size: 256,
            idle_interval: Duration::from_millis(10),
            write_backoff: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(100),
        }
    }

    /// Serial device sizing
    pub fn device() -> Self {
        Self {
            idle_interval: Duration::from_millis(2),
            ..Self::console()
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::console()
    }
}

#[derive(Debug)]
struct StoredError {
    kind: io::ErrorKind,
    message: String,
}

/// State shared by the pumps and the consumer
#[derive(Debug)]
struct Shared {
    inbound: SharedRing,
    outbound: SharedRing,
    eof: AtomicBool,
    writer_alive: AtomicBool,
    error: Mutex<Option<StoredError>>,
}

impl Shared {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            inbound: SharedRing::new(config.inbound_capacity),
            outbound: SharedRing::new(config.outbound_capacity),
            eof: AtomicBool::new(false),
            writer_alive: AtomicBool::new(true),
            error: Mutex::new(None),
        }
    }

    fn mark_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
        self.inbound.wake_reader();
    }

    fn record_error(&self, err: &io::Error) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(StoredError {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
        drop(slot);
        self.inbound.wake_reader();
    }

    fn error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .as_ref()
            .map(|e| io::Error::new(e.kind, e.message.clone()))
    }
}

/// Background pump bridging one endpoint into a pair of ring buffers
pub struct IoWorker {
    shared: Arc<Shared>,
    running: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    threads: Vec<thread::JoinHandle<()>>,
    config: WorkerConfig,
}

impl IoWorker {
    /// Start async pumps over a reader and a writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(reader: R, writer: W, config: WorkerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new(&config));
        let running = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(read_pump(reader, shared.clone(), running.clone(), config)),
            tokio::spawn(write_pump(writer, shared.clone(), running.clone(), config)),
        ];

        debug!(
            inbound = config.inbound_capacity,
            outbound = config.outbound_capacity,
            "I/O worker started"
        );

        Self {
            shared,
            running,
            tasks,
            threads: Vec::new(),
            config,
        }
    }

    /// Start thread pumps over blocking handles
    pub fn spawn_blocking(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: WorkerConfig,
    ) -> Result<Self, TransportError> {
        let shared = Arc::new(Shared::new(&config));
        let running = CancellationToken::new();

        let read_thread = {
            let shared = shared.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("serialcal-read".into())
                .spawn(move || blocking_read_pump(reader, &shared, &running, config))?
        };
        let write_thread = {
            let shared = shared.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("serialcal-write".into())
                .spawn(move || blocking_write_pump(writer, &shared, &running, config))?
        };

        debug!("blocking I/O worker started");

        Ok(Self {
            shared,
            running,
            tasks: Vec::new(),
            threads: vec![read_thread, write_thread],
            config,
        })
    }

    /// Wait up to `timeout` for inbound bytes or end-of-file
    pub async fn wait_readable(&self, timeout: Duration) -> Result<bool, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.inbound.available() > 0 || self.shared.eof.load(Ordering::SeqCst) {
                return Ok(true);
            }
            if let Some(err) = self.shared.error() {
                return Err(TransportError::Io(err));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let _ = tokio::time::timeout(deadline - now, self.shared.inbound.data_ready()).await;
        }
    }

    /// Pop whatever is buffered into `buf`
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self.shared.inbound.pop_into(buf);
        if n == 0 && !self.shared.eof.load(Ordering::SeqCst) {
            if let Some(err) = self.shared.error() {
                return Err(TransportError::Io(err));
            }
        }
        Ok(n)
    }

    /// Queue every byte of `data`, backing off while the outbound ring is full
    pub async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut written = 0;
        while written < data.len() {
            if self.running.is_cancelled() || !self.shared.writer_alive.load(Ordering::SeqCst) {
                return Err(match self.shared.error() {
                    Some(err) => TransportError::Io(err),
                    None => TransportError::WorkerStopped,
                });
            }
            written += self.shared.outbound.push_available(&data[written..]);
            if written < data.len() {
                trace!(pending = data.len() - written, "outbound buffer full");
                let _ = tokio::time::timeout(
                    self.config.write_backoff,
                    self.shared.outbound.space_ready(),
                )
                .await;
            }
        }
        Ok(written)
    }

    /// Bytes waiting in the inbound ring
    pub fn available(&self) -> usize {
        self.shared.inbound.available()
    }

    /// True once the endpoint reported end-of-file
    pub fn at_eof(&self) -> bool {
        self.shared.eof.load(Ordering::SeqCst)
    }

    /// Stop both pumps.
    ///
    /// Queued output gets one grace period to drain; pumps still blocked
    /// after that are aborted (tasks) or detached (threads).
    pub async fn shutdown(mut self) {
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.running.cancel();
        let grace = self.config.shutdown_grace;

        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                debug!("I/O task did not stop within grace period, aborting");
                abort.abort();
            }
        }

        if !self.threads.is_empty() {
            let deadline = Instant::now() + grace;
            while self.threads.iter().any(|t| !t.is_finished()) && Instant::now() < deadline {
                tokio::time::sleep(self.config.idle_interval).await;
            }
            for handle in self.threads.drain(..) {
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    trace!("leaving blocked I/O thread detached");
                }
            }
        }
    }
}

impl Drop for IoWorker {
    /// Pumps see the cancellation and exit on their own; the write pump
    /// first drains what `write` already accepted. A pump still running
    /// after the grace period is aborted.
    fn drop(&mut self) {
        self.running.cancel();
        let tasks: Vec<_> = self.tasks.drain(..).filter(|t| !t.is_finished()).collect();
        if tasks.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let grace = self.config.shutdown_grace;
                for task in tasks {
                    let abort = task.abort_handle();
                    runtime.spawn(async move {
                        if tokio::time::timeout(grace, task).await.is_err() {
                            trace!("I/O task outlived drop grace period, aborting");
                            abort.abort();
                        }
                    });
                }
            }
            Err(_) => tasks.iter().for_each(JoinHandle::abort),
        }
    }
}

async fn read_pump<R>(mut reader: R, shared: Arc<Shared>, running: CancellationToken, config: WorkerConfig)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; config.chunk_size];
    loop {
        let room = shared.inbound.remaining().min(config.chunk_size);
        if room == 0 {
            tokio::select! {
                () = running.cancelled() => break,
                () = shared.inbound.space_ready() => {}
                () = tokio::time::sleep(config.idle_interval) => {}
            }
            continue;
        }

        tokio::select! {
            () = running.cancelled() => break,
            result = reader.read(&mut buf[..room]) => match result {
                Ok(0) => {
                    trace!("read pump reached end of stream");
                    shared.mark_eof();
                    break;
                }
                Ok(n) => shared.inbound.push_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("read pump error: {}", e);
                    shared.record_error(&e);
                    break;
                }
            }
        }
    }
}

async fn write_pump<W>(mut writer: W, shared: Arc<Shared>, running: CancellationToken, config: WorkerConfig)
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.chunk_size];
    loop {
        let count = shared.outbound.pop_into(&mut buf);
        if count == 0 {
            tokio::select! {
                () = running.cancelled() => break,
                () = shared.outbound.data_ready() => {}
                () = tokio::time::sleep(config.idle_interval) => {}
            }
            continue;
        }
        if let Err(e) = write_chunk(&mut writer, &buf[..count]).await {
            warn!("write pump error: {}", e);
            shared.record_error(&e);
            shared.writer_alive.store(false, Ordering::SeqCst);
            return;
        }
    }

    // drain what the owner queued before stopping
    loop {
        let count = shared.outbound.pop_into(&mut buf);
        if count == 0 {
            break;
        }
        if write_chunk(&mut writer, &buf[..count]).await.is_err() {
            break;
        }
    }
    shared.writer_alive.store(false, Ordering::SeqCst);
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> io::Result<()> {
    writer.write_all(chunk).await?;
    writer.flush().await
}

fn blocking_read_pump(
    mut reader: Box<dyn Read + Send>,
    shared: &Shared,
    running: &CancellationToken,
    config: WorkerConfig,
) {
    let mut buf = vec![0u8; config.chunk_size];
    while !running.is_cancelled() {
        let room = shared.inbound.remaining().min(config.chunk_size);
        if room == 0 {
            thread::sleep(config.idle_interval);
            continue;
        }
        match reader.read(&mut buf[..room]) {
            Ok(0) => {
                shared.mark_eof();
                break;
            }
            Ok(n) => shared.inbound.push_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                thread::sleep(config.idle_interval);
            }
            Err(e) => {
                shared.record_error(&e);
                break;
            }
        }
    }
}

fn blocking_write_pump(
    mut writer: Box<dyn Write + Send>,
    shared: &Shared,
    running: &CancellationToken,
    config: WorkerConfig,
) {
    let mut buf = vec![0u8; config.chunk_size];
    loop {
        let count = shared.outbound.pop_into(&mut buf);
        if count == 0 {
            if running.is_cancelled() {
                break;
            }
            thread::sleep(config.idle_interval);
            continue;
        }
        let result = writer.write_all(&buf[..count]).and_then(|()| writer.flush());
        if let Err(e) = result {
            shared.record_error(&e);
            break;
        }
    }
    shared.writer_alive.store(false, Ordering::SeqCst);
}
