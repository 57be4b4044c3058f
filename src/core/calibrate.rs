//! Scripted calibration sequence
//!
//! A calibration run is a list of [`CalibrationStep`]s executed in order
//! against the device, with operator confirmations and measurements read
//! from the console. Scripts can come from the config file; the built-in
//! default identifies the unit, turns its echo off and walks two
//! calibration steps.

use crate::core::context::RuntimeContext;
use crate::core::prompt::{PromptError, Prompter};
use crate::core::protocol::{ProtocolEngine, ProtocolError, ReplyMode, DEFAULT_REPLY_CAP};
use crate::core::transport::ByteTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity prefix the default script expects
pub const DEFAULT_IDENTITY: &str = "Fake Device that does not exist";

fn default_ok() -> Option<String> {
    Some("OK".to_string())
}

/// One step of a calibration script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CalibrationStep {
    /// Ask the unit who it is; the left-trimmed reply must start with the prefix
    Identify {
        /// Identify command
        command: String,
        /// Required reply prefix
        expect_prefix: String,
    },
    /// Send a command; `expect` of `None` accepts any reply
    Command {
        /// Command line
        send: String,
        /// Exact reply required
        #[serde(default = "default_ok")]
        expect: Option<String>,
        /// Warn instead of aborting on a mismatch
        #[serde(default)]
        warn_only: bool,
    },
    /// Ask the operator to continue; "No" ends the run
    Confirm {
        /// Question shown
        prompt: String,
    },
    /// Discard pending device output
    Flush,
    /// Restore factory settings; skipped unless requested
    FactoryReset {
        /// Command line
        send: String,
    },
    /// Ask the operator for a reading and send it to the unit
    Measure {
        /// Question shown
        prompt: String,
        /// Lowest accepted value
        min: f64,
        /// Highest accepted value
        max: f64,
        /// Command with `{value}` substituted
        send_template: String,
    },
}

/// An ordered list of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationScript {
    /// Steps, run in order
    pub steps: Vec<CalibrationStep>,
}

impl Default for CalibrationScript {
    fn default() -> Self {
        Self {
            steps: vec![
                CalibrationStep::Identify {
                    command: "I".to_string(),
                    expect_prefix: DEFAULT_IDENTITY.to_string(),
                },
                CalibrationStep::Flush,
                CalibrationStep::Command {
                    send: "E 0".to_string(),
                    expect: Some("ECHO is now OFF".to_string()),
                    warn_only: true,
                },
                CalibrationStep::Flush,
                CalibrationStep::Confirm {
                    prompt: "Start calibration process".to_string(),
                },
                CalibrationStep::Command {
                    send: "C 2".to_string(),
                    expect: None,
                    warn_only: false,
                },
                CalibrationStep::Flush,
                CalibrationStep::Confirm {
                    prompt: "Perform next step in calibration process".to_string(),
                },
                CalibrationStep::Command {
                    send: "C 1".to_string(),
                    expect: None,
                    warn_only: false,
                },
                CalibrationStep::Flush,
            ],
        }
    }
}

/// Knobs for one calibration run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationOptions {
    /// Run `factory_reset` steps
    pub factory_reset: bool,
    /// Overall wait per command
    pub reply_timeout: Duration,
    /// Retransmission interval
    pub repeat_interval: Duration,
    /// Reply accumulator cap
    pub reply_cap: usize,
    /// Echo operator keystrokes back to the console
    pub echo_input: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            factory_reset: false,
            reply_timeout: crate::core::protocol::DEFAULT_REPLY_TIMEOUT,
            repeat_interval: crate::core::protocol::DEFAULT_REPEAT_INTERVAL,
            reply_cap: DEFAULT_REPLY_CAP,
            echo_input: true,
        }
    }
}

/// How a run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// Every step ran
    Complete,
    /// The operator declined a confirmation or cancelled a measurement
    Declined,
}

/// Calibration error types
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// The unit is not the expected equipment
    #[error("Equipment ID \"{0}\" does not match")]
    IdentityMismatch(String),

    /// A command got the wrong answer
    #[error("Unexpected reply to '{command}': \"{reply}\"")]
    UnexpectedReply {
        /// Command sent
        command: String,
        /// Reply received
        reply: String,
    },

    /// Device exchange failed
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Operator prompt failed
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Run `script` against `device`, prompting on `console`
pub async fn run_calibration(
    device: &mut dyn ByteTransport,
    console: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    script: &CalibrationScript,
    options: CalibrationOptions,
) -> Result<CalibrationOutcome, CalibrationError> {
    info!(steps = script.steps.len(), "calibration started");

    for (index, step) in script.steps.iter().enumerate() {
        debug!(step = index + 1, ?step, "calibration step");
        match step {
            CalibrationStep::Identify {
                command,
                expect_prefix,
            } => {
                let reply = exchange(device, console, ctx, options, command).await?;
                if !reply.trim_start().starts_with(expect_prefix.as_str()) {
                    return Err(CalibrationError::IdentityMismatch(reply));
                }
                info!(identity = %reply.trim(), "unit identified");
            }
            CalibrationStep::Command {
                send,
                expect,
                warn_only,
            } => {
                let reply = exchange(device, console, ctx, options, send).await?;
                if let Some(expect) = expect {
                    if reply != *expect {
                        if !*warn_only {
                            return Err(CalibrationError::UnexpectedReply {
                                command: send.clone(),
                                reply,
                            });
                        }
                        warn!(command = %send, %reply, "command may not have worked properly");
                        prompter(console, ctx, options)
                            .say(&format!("WARNING - '{send}' command may not have worked properly"))
                            .await?;
                    }
                }
            }
            CalibrationStep::Confirm { prompt } => {
                let mut prompter = prompter(console, ctx, options);
                if !prompter.ask_yes_no(prompt, false).await? {
                    prompter.say("Terminated at user request").await?;
                    return Ok(CalibrationOutcome::Declined);
                }
            }
            CalibrationStep::Flush => {
                ctx.suppress_next_echo();
                ProtocolEngine::new(device, ctx).flush_input().await?;
            }
            CalibrationStep::FactoryReset { send } => {
                if !options.factory_reset {
                    debug!("factory reset not requested, skipping");
                    continue;
                }
                let reply = exchange(device, console, ctx, options, send).await?;
                if reply != "OK" {
                    return Err(CalibrationError::UnexpectedReply {
                        command: send.clone(),
                        reply,
                    });
                }
                info!("factory settings restored");
            }
            CalibrationStep::Measure {
                prompt,
                min,
                max,
                send_template,
            } => {
                let value = prompter(console, ctx, options)
                    .ask_number_in(prompt, *min, *max)
                    .await?;
                let Some(value) = value else {
                    prompter(console, ctx, options).say("Terminated at user request").await?;
                    return Ok(CalibrationOutcome::Declined);
                };
                let command = send_template.replace("{value}", &value.to_string());
                let reply = exchange(device, console, ctx, options, &command).await?;
                if reply != "OK" {
                    return Err(CalibrationError::UnexpectedReply { command, reply });
                }
            }
        }
    }

    prompter(console, ctx, options)
        .say("Calibration process complete!")
        .await?;
    info!("calibration complete");
    Ok(CalibrationOutcome::Complete)
}

fn prompter<'a>(
    console: &'a mut dyn ByteTransport,
    ctx: &'a RuntimeContext,
    options: CalibrationOptions,
) -> Prompter<'a> {
    Prompter::new(console, ctx).with_input_echo(options.echo_input)
}

async fn exchange(
    device: &mut dyn ByteTransport,
    console: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    options: CalibrationOptions,
    command: &str,
) -> Result<String, ProtocolError> {
    let mut engine = ProtocolEngine::new(device, ctx).with_reply_cap(options.reply_cap);
    if !ctx.is_quiet() {
        engine = engine.with_echo(console);
    }
    engine
        .send_and_collect(
            command,
            options.reply_timeout,
            options.repeat_interval,
            ReplyMode::FirstLine,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::BufferedTransport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Answers each received command line from `replies`
    async fn fake_unit(mut peer: DuplexStream, replies: &'static [(&'static str, &'static str)]) {
        let mut pending = Vec::new();
        let mut buf = [0u8; 128];
        loop {
            let n = match peer.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            while let Some(end) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=end).collect();
                let command = String::from_utf8_lossy(&line).trim().to_string();
                if let Some((_, reply)) = replies.iter().find(|(c, _)| *c == command) {
                    if peer.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Answers each prompt from `answers`, returning everything shown
    async fn operator(mut peer: DuplexStream, answers: &'static [&'static str]) -> String {
        let mut transcript = String::new();
        let mut answered = 0;
        let mut buf = [0u8; 256];
        loop {
            let n = match peer.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            transcript.push_str(&String::from_utf8_lossy(&buf[..n]));
            let asked = transcript.matches(" ?").count();
            while answered < asked && answered < answers.len() {
                peer.write_all(answers[answered].as_bytes()).await.unwrap();
                answered += 1;
            }
        }
        transcript
    }

    const UNIT: &[(&str, &str)] = &[
        ("I", "Fake Device that does not exist v1.0\r\n"),
        ("E 0", "ECHO is now OFF\r\n"),
        ("C 2", "OK\r\n"),
        ("C 1", "OK\r\n"),
        ("F", "OK\r\n"),
        ("G 2.5", "OK\r\n"),
    ];

    fn endpoints() -> (BufferedTransport, DuplexStream, BufferedTransport, DuplexStream) {
        let (dev_ours, dev_theirs) = tokio::io::duplex(1024);
        let (con_ours, con_theirs) = tokio::io::duplex(1024);
        (
            BufferedTransport::from_stream(dev_ours, "device"),
            dev_theirs,
            BufferedTransport::from_stream(con_ours, "console"),
            con_theirs,
        )
    }

    #[tokio::test]
    async fn test_default_script_completes() {
        let (mut device, dev_peer, mut console, con_peer) = endpoints();
        let ctx = RuntimeContext::default().with_quiet(true);
        tokio::spawn(fake_unit(dev_peer, UNIT));
        let op = tokio::spawn(operator(con_peer, &["y\r", "y\r"]));

        let outcome = run_calibration(
            &mut device,
            &mut console,
            &ctx,
            &CalibrationScript::default(),
            CalibrationOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CalibrationOutcome::Complete);

        console.shutdown().await.unwrap();
        drop(console);
        let transcript = op.await.unwrap();
        assert!(transcript.contains("Start calibration process (y/N) ?"));
        assert!(transcript.contains("Perform next step in calibration process (y/N) ?"));
        assert!(transcript.contains("Calibration process complete!"));
    }

    #[tokio::test]
    async fn test_declined_confirmation() {
        let (mut device, dev_peer, mut console, con_peer) = endpoints();
        let ctx = RuntimeContext::default().with_quiet(true);
        tokio::spawn(fake_unit(dev_peer, UNIT));
        let op = tokio::spawn(operator(con_peer, &["n\r"]));

        let outcome = run_calibration(
            &mut device,
            &mut console,
            &ctx,
            &CalibrationScript::default(),
            CalibrationOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, CalibrationOutcome::Declined);

        console.shutdown().await.unwrap();
        drop(console);
        assert!(op.await.unwrap().contains("Terminated at user request"));
    }

    #[tokio::test]
    async fn test_identity_mismatch_aborts() {
        let (mut device, dev_peer, mut console, _con_peer) = endpoints();
        let ctx = RuntimeContext::default().with_quiet(true);
        tokio::spawn(fake_unit(dev_peer, &[("I", "Some Other Box\r\n")]));

        let err = run_calibration(
            &mut device,
            &mut console,
            &ctx,
            &CalibrationScript::default(),
            CalibrationOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CalibrationError::IdentityMismatch(id) if id == "Some Other Box"));
    }

    #[tokio::test]
    async fn test_factory_reset_and_measure() {
        let (mut device, dev_peer, mut console, con_peer) = endpoints();
        let ctx = RuntimeContext::default().with_quiet(true);
        tokio::spawn(fake_unit(dev_peer, UNIT));
        let op = tokio::spawn(operator(con_peer, &["2.5\r"]));

        let script = CalibrationScript {
            steps: vec![
                CalibrationStep::FactoryReset {
                    send: "F".to_string(),
                },
                CalibrationStep::Measure {
                    prompt: "Reference voltage".to_string(),
                    min: 0.0,
                    max: 5.0,
                    send_template: "G {value}".to_string(),
                },
            ],
        };
        let options = CalibrationOptions {
            factory_reset: true,
            ..CalibrationOptions::default()
        };

        let outcome = run_calibration(&mut device, &mut console, &ctx, &script, options)
            .await
            .unwrap();
        assert_eq!(outcome, CalibrationOutcome::Complete);
        assert_eq!(device.stats().bytes_sent, b"F\r\nG 2.5\r\n".len() as u64);

        console.shutdown().await.unwrap();
        drop(console);
        assert!(op.await.unwrap().contains("Reference voltage ?"));
    }

    #[test]
    fn test_steps_deserialize_from_toml() {
        let script: CalibrationScript = toml::from_str(
            r#"
            [[steps]]
            action = "identify"
            command = "I"
            expect_prefix = "Widget"

            [[steps]]
            action = "command"
            send = "Z"

            [[steps]]
            action = "confirm"
            prompt = "Ready"

            [[steps]]
            action = "flush"
            "#,
        )
        .unwrap();
        assert_eq!(script.steps.len(), 4);
        assert_eq!(
            script.steps[1],
            CalibrationStep::Command {
                send: "Z".to_string(),
                expect: Some("OK".to_string()),
                warn_only: false,
            }
        );
    }
}
