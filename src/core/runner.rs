//! One complete session against the device
//!
//! Everything after the console is known: open and configure the device,
//! reset it or raise its control lines, run the selected mode, drop the
//! lines and release the transports. Listen mode runs this once per
//! accepted connection.

use crate::cli::{format_reply, OutputFormat};
use crate::core::calibrate::{
    run_calibration, CalibrationError, CalibrationOptions, CalibrationOutcome, CalibrationScript,
};
use crate::core::context::{FlowControl, RuntimeContext};
use crate::core::prompt::PromptError;
use crate::core::protocol::{ProtocolEngine, ProtocolError, ReplyMode};
use crate::core::relay::{ConsoleRelay, RelayExit, RelayOptions};
use crate::core::reset::{reset_device, set_lines, wait_for_boot};
use crate::core::transfer::{run_transfer, TransferDirection, TransferError, XModem};
use crate::core::transport::{open_serial, ByteTransport, SerialSettings, TransportError};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Session error types
#[derive(Error, Debug)]
pub enum SessionError {
    /// Device or console failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Question exchange failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Calibration aborted
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// File transfer failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Operator prompt failed
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// What a session does once the device is ready
#[derive(Debug, Clone)]
pub enum Mode {
    /// Interactive relay
    Relay(RelayOptions),
    /// Send one question and print the reply
    Question {
        /// Question text
        text: String,
        /// Quiet period that ends the reply
        wait: Duration,
        /// Output rendering
        format: OutputFormat,
    },
    /// Scripted calibration
    Calibrate {
        /// Steps to run
        script: CalibrationScript,
        /// Timeouts and switches
        options: CalibrationOptions,
    },
    /// File transfer hand-off
    Transfer {
        /// Send or receive
        direction: TransferDirection,
        /// Local file
        file: PathBuf,
    },
}

/// Everything needed to run a session
#[derive(Debug, Clone)]
pub struct SessionPlan {
    /// Device path
    pub device: String,
    /// Line settings
    pub settings: SerialSettings,
    /// Pulse the control lines before starting
    pub reset: bool,
    /// Seconds to wait for the device after a reset
    pub boot_wait_secs: u64,
    /// Console came from `--console`; the relay runs binary clean and
    /// prompts do not echo keystrokes
    pub alternate_console: bool,
    /// Selected mode
    pub mode: Mode,
}

/// How a session finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The relay stopped
    Relay(RelayExit),
    /// The question was answered
    Answered(String),
    /// Calibration ran to completion or was declined
    Calibration(CalibrationOutcome),
    /// Bytes moved by a file transfer
    Transferred(u64),
}

/// Open the device named in `plan` and run the session over `console`
pub async fn run_session(
    console: &mut dyn ByteTransport,
    plan: &SessionPlan,
    ctx: &RuntimeContext,
) -> Result<SessionOutcome, SessionError> {
    let mut device = open_serial(&plan.device, plan.settings)?;
    info!(device = %plan.device, settings = %plan.settings, "device opened");

    let result = run_with_device(&mut device, console, plan, ctx).await;
    if let Err(e) = device.shutdown().await {
        debug!("device shutdown: {}", e);
    }
    result
}

/// Run the session over an already opened device
pub async fn run_with_device(
    device: &mut dyn ByteTransport,
    console: &mut dyn ByteTransport,
    plan: &SessionPlan,
    ctx: &RuntimeContext,
) -> Result<SessionOutcome, SessionError> {
    let started = Instant::now();
    let lines_used = prepare_device(device, console, plan, ctx).await?;

    let result = run_mode(device, console, plan, ctx).await;

    if lines_used {
        if let Err(e) = set_lines(device, false).await {
            debug!("dropping control lines failed: {}", e);
        }
    }
    if let Err(e) = console.shutdown().await {
        debug!("console shutdown: {}", e);
    }

    debug!(
        elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        sent = device.stats().bytes_sent,
        received = device.stats().bytes_received,
        "session finished"
    );
    result
}

/// Reset the device or raise its lines; true when the lines were touched
async fn prepare_device(
    device: &mut dyn ByteTransport,
    console: &mut dyn ByteTransport,
    plan: &SessionPlan,
    ctx: &RuntimeContext,
) -> Result<bool, SessionError> {
    if plan.reset {
        if !ctx.is_quiet() {
            console.write(b"Reset device via serial port\r\n").await?;
        }
        match reset_device(device, ctx).await {
            Ok(_) => {
                wait_for_boot(console, ctx, plan.boot_wait_secs).await?;
                return Ok(true);
            }
            Err(TransportError::Unsupported(what)) => {
                warn!("{} not available, skipping reset", what);
            }
            Err(e) => return Err(e.into()),
        }
    } else if ctx.flow_control() == FlowControl::Lines {
        match set_lines(device, true).await {
            Ok(()) => return Ok(true),
            Err(TransportError::Unsupported(what)) => {
                warn!("{} not available, flow control lines left alone", what);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(false)
}

async fn run_mode(
    device: &mut dyn ByteTransport,
    console: &mut dyn ByteTransport,
    plan: &SessionPlan,
    ctx: &RuntimeContext,
) -> Result<SessionOutcome, SessionError> {
    match &plan.mode {
        Mode::Relay(options) => {
            if !ctx.is_quiet() {
                console.write(b"!\r\n").await?;
            }
            let options = if plan.alternate_console {
                RelayOptions {
                    pass_through: true,
                    local_echo: false,
                }
            } else {
                *options
            };
            let exit = ConsoleRelay::new(device, console, ctx, options).run().await?;
            Ok(SessionOutcome::Relay(exit))
        }
        Mode::Question { text, wait, format } => {
            ctx.suppress_next_echo();
            let reply = ProtocolEngine::new(device, ctx)
                .send_and_collect(text, *wait, Duration::ZERO, ReplyMode::Multiline)
                .await?;
            if reply.is_empty() {
                return Err(ProtocolError::Timeout {
                    command: text.clone(),
                    elapsed_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                }
                .into());
            }
            console
                .write(format_reply(text, &reply, *format).as_bytes())
                .await?;
            Ok(SessionOutcome::Answered(reply))
        }
        Mode::Calibrate { script, options } => {
            if !ctx.is_quiet() {
                console.write(b"!\r\n").await?;
            }
            let options = CalibrationOptions {
                echo_input: options.echo_input && !plan.alternate_console,
                ..*options
            };
            let outcome = run_calibration(device, console, ctx, script, options).await?;
            Ok(SessionOutcome::Calibration(outcome))
        }
        Mode::Transfer { direction, file } => {
            let mut xmodem = XModem::default();
            let bytes = run_transfer(device, ctx, *direction, file, &mut xmodem).await?;
            if !ctx.is_quiet() {
                console.write(b"\r\nComplete!\r\n").await?;
            }
            Ok(SessionOutcome::Transferred(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::calibrate::CalibrationStep;
    use crate::core::transport::BufferedTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn plan(mode: Mode) -> SessionPlan {
        SessionPlan {
            device: "memory".to_string(),
            settings: SerialSettings::default(),
            reset: false,
            boot_wait_secs: 0,
            alternate_console: false,
            mode,
        }
    }

    #[tokio::test]
    async fn test_question_reply_written_to_console() {
        let (dev_ours, mut dev_peer) = tokio::io::duplex(1024);
        let (con_ours, mut con_peer) = tokio::io::duplex(1024);
        let mut device = BufferedTransport::from_stream(dev_ours, "device");
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default();

        tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = dev_peer.read(&mut buf).await.unwrap();
            dev_peer.write_all(b"T?\r\n23.5 C\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let question = plan(Mode::Question {
            text: "T?".to_string(),
            wait: Duration::from_millis(300),
            format: OutputFormat::Json,
        });
        let outcome = run_with_device(&mut device, &mut console, &question, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Answered("23.5 C\r\n".to_string()));

        drop(console);
        let mut out = String::new();
        con_peer.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"question\":\"T?\",\"reply\":\"23.5 C\\r\\n\"}\n");
    }

    #[tokio::test]
    async fn test_question_without_reply_times_out() {
        let (dev_ours, _dev_peer) = tokio::io::duplex(1024);
        let (con_ours, _con_peer) = tokio::io::duplex(1024);
        let mut device = BufferedTransport::from_stream(dev_ours, "device");
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default();

        let question = plan(Mode::Question {
            text: "V".to_string(),
            wait: Duration::from_millis(200),
            format: OutputFormat::Text,
        });
        let err = run_with_device(&mut device, &mut console, &question, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::NoResponse { .. })));
    }

    #[tokio::test]
    async fn test_reset_skipped_without_control_lines() {
        let (dev_ours, mut dev_peer) = tokio::io::duplex(1024);
        let (con_ours, _con_peer) = tokio::io::duplex(1024);
        let mut device = BufferedTransport::from_stream(dev_ours, "device");
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default().with_quiet(true);

        tokio::spawn(async move {
            let mut buf = [0u8; 32];
            let _ = dev_peer.read(&mut buf).await.unwrap();
            dev_peer.write_all(b"pong\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let mut question = plan(Mode::Question {
            text: "ping".to_string(),
            wait: Duration::from_millis(200),
            format: OutputFormat::Text,
        });
        question.reset = true;
        let outcome = run_with_device(&mut device, &mut console, &question, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Answered("pong\r\n".to_string()));
    }

    #[tokio::test]
    async fn test_alternate_console_relay_is_binary_clean() {
        let (dev_ours, mut dev_peer) = tokio::io::duplex(1024);
        let (con_ours, mut con_peer) = tokio::io::duplex(1024);
        let mut device = BufferedTransport::from_stream(dev_ours, "device");
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default().with_quiet(true);

        let peers = tokio::spawn(async move {
            con_peer.write_all(b"A\r\x04").await.unwrap();
            let mut sent = [0u8; 3];
            dev_peer.read_exact(&mut sent).await.unwrap();

            dev_peer.write_all(b"ok\r\n").await.unwrap();
            let mut shown = [0u8; 4];
            con_peer.read_exact(&mut shown).await.unwrap();
            drop(con_peer);
            (sent, shown, dev_peer)
        });

        let mut relay = plan(Mode::Relay(RelayOptions {
            pass_through: false,
            local_echo: true,
        }));
        relay.alternate_console = true;
        let outcome = run_with_device(&mut device, &mut console, &relay, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Relay(RelayExit::ConsoleClosed));
        assert!(!ctx.should_quit());

        let (sent, shown, _dev_peer) = peers.await.unwrap();
        assert_eq!(&sent, b"A\r\x04");
        assert_eq!(&shown, b"ok\r\n");
    }

    #[tokio::test]
    async fn test_alternate_console_prompts_without_echo() {
        let (dev_ours, _dev_peer) = tokio::io::duplex(1024);
        let (con_ours, mut con_peer) = tokio::io::duplex(1024);
        let mut device = BufferedTransport::from_stream(dev_ours, "device");
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default().with_quiet(true);
        con_peer.write_all(b"n\r").await.unwrap();

        let mut calibrate = plan(Mode::Calibrate {
            script: CalibrationScript {
                steps: vec![CalibrationStep::Confirm {
                    prompt: "Start calibration process".to_string(),
                }],
            },
            options: CalibrationOptions::default(),
        });
        calibrate.alternate_console = true;
        let outcome = run_with_device(&mut device, &mut console, &calibrate, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Calibration(CalibrationOutcome::Declined));

        console.shutdown().await.unwrap();
        drop(console);
        let mut out = String::new();
        con_peer.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("Start calibration process (y/N) ?"));
        assert!(out.contains("Terminated at user request"));
        assert!(!out.contains("?n"));
    }

    #[tokio::test]
    async fn test_run_session_missing_device() {
        let (con_ours, _con_peer) = tokio::io::duplex(64);
        let mut console = BufferedTransport::from_stream(con_ours, "console");
        let ctx = RuntimeContext::default();
        let mut missing = plan(Mode::Relay(RelayOptions::default()));
        missing.device = "/dev/serialcal-does-not-exist".to_string();

        let err = run_session(&mut console, &missing, &ctx).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Open { .. })));
    }
}
