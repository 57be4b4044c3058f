//! Command/response exchange with the device
//!
//! [`ProtocolEngine::send_and_collect`] writes a command line, retransmits it
//! while the device stays silent, drops the device's echo of the command and
//! returns the reply. Device bytes are mirrored to an optional console as
//! they arrive, unless echo was suppressed for this read.

mod line;

pub use line::{is_echo, trim_control, LineAssembler, LineOverflow};

use crate::core::context::RuntimeContext;
use crate::core::transport::{ByteTransport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default overall wait for a reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default retransmission interval
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_millis(1_000);

/// Largest reply accumulated before giving up
pub const DEFAULT_REPLY_CAP: usize = 4096;

/// Longest single readiness wait, so quit requests are seen promptly
const POLL_SLICE: Duration = Duration::from_millis(100);

/// How much of the reply to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyMode {
    /// First non-blank line that is not the command's echo
    #[default]
    FirstLine,
    /// Every line until the device goes quiet, echoes dropped
    Multiline,
    /// Every line until the device goes quiet, echoes kept
    MultilineRaw,
}

impl ReplyMode {
    fn is_multiline(self) -> bool {
        !matches!(self, Self::FirstLine)
    }
}

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Nothing at all came back
    #[error("Unit is not responding after {elapsed_ms} ms")]
    NoResponse {
        /// Time waited
        elapsed_ms: u64,
    },

    /// Bytes came back but no qualifying reply
    #[error("No reply to '{command}' within {elapsed_ms} ms")]
    Timeout {
        /// Command sent
        command: String,
        /// Time waited
        elapsed_ms: u64,
    },

    /// Reply exceeded the accumulator cap
    #[error("Not enough memory to continue: reply exceeded {cap} bytes")]
    OutOfMemory {
        /// The cap
        cap: usize,
    },

    /// Transport failure mid-exchange
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Quit was requested
    #[error("Cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// True for the "no qualifying reply in time" family
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoResponse { .. } | Self::Timeout { .. } | Self::OutOfMemory { .. })
    }
}

/// Sends commands to a device and collects replies
pub struct ProtocolEngine<'a> {
    device: &'a mut dyn ByteTransport,
    echo: Option<&'a mut dyn ByteTransport>,
    ctx: &'a RuntimeContext,
    reply_cap: usize,
    transmissions: usize,
}

impl<'a> ProtocolEngine<'a> {
    /// Create an engine over `device`
    pub fn new(device: &'a mut dyn ByteTransport, ctx: &'a RuntimeContext) -> Self {
        Self {
            device,
            echo: None,
            ctx,
            reply_cap: DEFAULT_REPLY_CAP,
            transmissions: 0,
        }
    }

    /// Mirror received device bytes to `console`
    #[must_use]
    pub fn with_echo(mut self, console: &'a mut dyn ByteTransport) -> Self {
        self.echo = Some(console);
        self
    }

    /// Change the reply accumulator cap
    #[must_use]
    pub fn with_reply_cap(mut self, cap: usize) -> Self {
        self.reply_cap = cap.max(1);
        self
    }

    /// Command lines written so far, retransmissions included
    pub fn transmissions(&self) -> usize {
        self.transmissions
    }

    /// Send `command` and collect the reply.
    ///
    /// A zero `repeat_interval` disables retransmission. In
    /// [`ReplyMode::FirstLine`] the whole exchange is bounded by `timeout`;
    /// in the multiline modes `timeout` restarts with every received byte.
    pub async fn send_and_collect(
        &mut self,
        command: &str,
        timeout: Duration,
        repeat_interval: Duration,
        mode: ReplyMode,
    ) -> Result<String, ProtocolError> {
        let echo_on = self.ctx.take_echo();
        let repeat = (!repeat_interval.is_zero()).then_some(repeat_interval);

        let mut assembler = LineAssembler::new(self.reply_cap);
        let mut reply = String::new();
        let mut received_any = false;
        let mut buf = [0u8; 256];

        let start = Instant::now();
        let mut last_rx = start;
        self.transmit(command).await?;
        let mut next_repeat = repeat.map(|r| start + r);

        loop {
            if self.ctx.should_quit() {
                return Err(ProtocolError::Cancelled);
            }

            let now = Instant::now();
            let deadline = if mode.is_multiline() && received_any {
                last_rx + timeout
            } else {
                start + timeout
            };
            if now >= deadline {
                break;
            }

            if let (Some(at), Some(interval)) = (next_repeat, repeat) {
                if now >= at {
                    // first-line mode returns on the first qualifying line, so
                    // reaching here means none has completed yet
                    let resend = !mode.is_multiline() || !received_any;
                    if resend {
                        if let Some(noise) = assembler.take_partial() {
                            trace!(bytes = noise.len(), "discarding unterminated input");
                        }
                        debug!(command, attempt = self.transmissions + 1, "retransmitting");
                        self.transmit(command).await?;
                    }
                    next_repeat = if mode.is_multiline() && received_any {
                        None
                    } else {
                        Some(at + interval)
                    };
                }
            }

            let until = next_repeat.map_or(deadline, |at| at.min(deadline));
            let wait = until.saturating_duration_since(now).min(POLL_SLICE);
            if !self.device.poll_for_input(wait).await? {
                continue;
            }

            let n = self.device.read(&mut buf).await?;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            received_any = true;
            last_rx = Instant::now();
            trace!(bytes = n, "reply bytes received");

            if echo_on {
                self.mirror(&buf[..n]).await;
            }

            for &byte in &buf[..n] {
                let line = match assembler.push(byte) {
                    None => continue,
                    Some(Err(LineOverflow)) => return Err(self.out_of_memory()),
                    Some(Ok(line)) => line,
                };
                match mode {
                    ReplyMode::FirstLine => {
                        if trim_control(&line).is_empty() || is_echo(&line, command) {
                            continue;
                        }
                        return Ok(line);
                    }
                    ReplyMode::Multiline | ReplyMode::MultilineRaw => {
                        if mode == ReplyMode::Multiline && is_echo(&line, command) {
                            continue;
                        }
                        self.accumulate(&mut reply, &line)?;
                    }
                }
            }
        }

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !received_any {
            warn!(command, elapsed_ms, "unit is not responding");
            return Err(ProtocolError::NoResponse { elapsed_ms });
        }

        match mode {
            // an unterminated line is never a reply
            ReplyMode::FirstLine => Err(ProtocolError::Timeout {
                command: command.to_string(),
                elapsed_ms,
            }),
            ReplyMode::Multiline | ReplyMode::MultilineRaw => {
                let partial = assembler
                    .take_partial()
                    .filter(|p| mode == ReplyMode::MultilineRaw || !is_echo(p, command));
                if let Some(line) = partial {
                    self.accumulate(&mut reply, &line)?;
                }
                Ok(reply)
            }
        }
    }

    /// Send `command` with the default timeout and retransmission interval,
    /// returning the first non-echo line
    pub async fn send_command_get_reply(&mut self, command: &str) -> Result<String, ProtocolError> {
        self.send_and_collect(
            command,
            DEFAULT_REPLY_TIMEOUT,
            DEFAULT_REPEAT_INTERVAL,
            ReplyMode::FirstLine,
        )
        .await
    }

    /// True iff the device answers `command` with exactly `OK`
    pub async fn send_ok(&mut self, command: &str) -> bool {
        match self.send_command_get_reply(command).await {
            Ok(reply) => reply == "OK",
            Err(e) => {
                warn!(command, "command failed: {}", e);
                false
            }
        }
    }

    /// Discard pending device output, mirroring it unless echo is suppressed
    pub async fn flush_input(&mut self) -> Result<usize, ProtocolError> {
        let echo_on = self.ctx.take_echo();
        let mut buf = [0u8; 256];
        let mut total = 0;
        while self.device.poll_for_input(POLL_SLICE).await? {
            let n = self.device.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n;
            if echo_on {
                self.mirror(&buf[..n]).await;
            }
        }
        trace!(bytes = total, "flushed device input");
        Ok(total)
    }

    async fn transmit(&mut self, command: &str) -> Result<(), ProtocolError> {
        let mut line = Vec::with_capacity(command.len() + 2);
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(self.ctx.terminator().bytes());
        self.device.write(&line).await?;
        self.transmissions += 1;
        Ok(())
    }

    fn accumulate(&self, reply: &mut String, line: &str) -> Result<(), ProtocolError> {
        let terminator = self.ctx.terminator().as_str();
        if reply.len() + line.len() + terminator.len() > self.reply_cap {
            return Err(self.out_of_memory());
        }
        reply.push_str(line);
        reply.push_str(terminator);
        Ok(())
    }

    fn out_of_memory(&self) -> ProtocolError {
        warn!(cap = self.reply_cap, "not enough memory to continue");
        ProtocolError::OutOfMemory { cap: self.reply_cap }
    }

    async fn mirror(&mut self, bytes: &[u8]) {
        let Some(console) = self.echo.as_deref_mut() else {
            return;
        };
        let visible: Vec<u8> = bytes.iter().copied().filter(|b| *b != b'\r').collect();
        if visible.is_empty() {
            return;
        }
        if let Err(e) = console.write(&visible).await {
            debug!("console echo failed: {}", e);
        }
    }
}
