//! Operator prompts on the console transport

use crate::core::context::RuntimeContext;
use crate::core::transport::{drain_input, ByteTransport, TransportError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Longest line accepted from the operator
pub const MAX_ANSWER: usize = 4096;

const POLL_SLICE: Duration = Duration::from_millis(100);
const TYPEAHEAD_QUIET: Duration = Duration::from_millis(20);

const BELL: u8 = 0x07;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;
const EOT: u8 = 0x04;
const SUB: u8 = 0x1a;

/// Prompt error types
#[derive(Error, Debug)]
pub enum PromptError {
    /// Operator pressed Ctrl-D/Ctrl-Z, the console closed or quit was requested
    #[error("Cancelled")]
    Cancelled,

    /// Answer grew past the cap
    #[error("Answer longer than {0} bytes")]
    TooLong(usize),

    /// Console failure
    #[error("Console error: {0}")]
    Transport(#[from] TransportError),
}

/// Reads edited answers from the console
pub struct Prompter<'a> {
    console: &'a mut dyn ByteTransport,
    ctx: &'a RuntimeContext,
    echo_input: bool,
}

impl<'a> Prompter<'a> {
    /// Create a prompter that echoes what the operator types
    pub fn new(console: &'a mut dyn ByteTransport, ctx: &'a RuntimeContext) -> Self {
        Self {
            console,
            ctx,
            echo_input: true,
        }
    }

    /// Turn typed-character echo on or off (off for pass-through consoles)
    #[must_use]
    pub fn with_input_echo(mut self, echo_input: bool) -> Self {
        self.echo_input = echo_input;
        self
    }

    /// Write `text` followed by a line break
    pub async fn say(&mut self, text: &str) -> Result<(), PromptError> {
        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.console.write(&line).await?;
        Ok(())
    }

    /// Read one edited line
    pub async fn read_line(&mut self) -> Result<String, PromptError> {
        let echo = self.echo_input && self.ctx.take_echo();
        let mut line: Vec<u8> = Vec::new();
        let mut buf = [0u8; 64];

        loop {
            if self.ctx.should_quit() {
                return Err(PromptError::Cancelled);
            }
            let ctx = self.ctx;
            let ready = tokio::select! {
                () = ctx.quit_requested() => return Err(PromptError::Cancelled),
                r = self.console.poll_for_input(POLL_SLICE) => r?,
            };
            if !ready {
                continue;
            }

            let n = self.console.read(&mut buf).await?;
            if n == 0 {
                debug!("console closed while prompting");
                self.ctx.request_quit();
                return Err(PromptError::Cancelled);
            }

            let mut feedback = Vec::new();
            for &byte in &buf[..n] {
                match byte {
                    b'\r' | b'\n' => {
                        if echo {
                            feedback.extend_from_slice(b"\r\n");
                            self.console.write(&feedback).await?;
                        }
                        self.flush_typeahead().await?;
                        return Ok(String::from_utf8_lossy(&line).into_owned());
                    }
                    EOT | SUB => {
                        self.ctx.request_quit();
                        return Err(PromptError::Cancelled);
                    }
                    BACKSPACE | DELETE => {
                        if line.pop().is_some() {
                            feedback.extend_from_slice(b"\x08 \x08");
                        } else {
                            feedback.push(BELL);
                        }
                    }
                    _ if line.len() >= MAX_ANSWER => return Err(PromptError::TooLong(MAX_ANSWER)),
                    _ => {
                        line.push(byte);
                        feedback.push(byte);
                    }
                }
            }
            if echo && !feedback.is_empty() {
                self.console.write(&feedback).await?;
            }
        }
    }

    /// Print `"<prompt> ?"` and read the answer
    pub async fn ask(&mut self, prompt: &str) -> Result<String, PromptError> {
        self.console.write(format!("{prompt} ?").as_bytes()).await?;
        self.read_line().await
    }

    /// Ask a yes/no question; a blank or unrecognized answer yields `default`
    pub async fn ask_yes_no(&mut self, prompt: &str, default: bool) -> Result<bool, PromptError> {
        let hint = if default { "(n/Y)" } else { "(y/N)" };
        let answer = self.ask(&format!("{prompt} {hint}")).await?;
        Ok(parse_yes_no(&answer).unwrap_or(default))
    }

    /// Ask for a number; `None` on blank or non-numeric input
    pub async fn ask_number(&mut self, prompt: &str) -> Result<Option<f64>, PromptError> {
        let answer = self.ask(prompt).await?;
        Ok(answer.trim().parse().ok())
    }

    /// Ask until the answer lies in `min..=max`; `None` when the operator
    /// cancels with a blank answer
    pub async fn ask_number_in(
        &mut self,
        prompt: &str,
        min: f64,
        max: f64,
    ) -> Result<Option<f64>, PromptError> {
        loop {
            match self.ask_number(prompt).await? {
                None => return Ok(None),
                Some(value) if (min..=max).contains(&value) => return Ok(Some(value)),
                Some(_) => {
                    self.say(&format!(
                        "Please enter a value between {min} and {max}, or <ENTER> to cancel"
                    ))
                    .await?;
                }
            }
        }
    }

    async fn flush_typeahead(&mut self) -> Result<(), PromptError> {
        let dropped = drain_input(&mut *self.console, TYPEAHEAD_QUIET).await?;
        if !dropped.is_empty() {
            debug!(bytes = dropped.len(), "discarded typeahead");
        }
        Ok(())
    }
}

/// First non-blank character decides; `None` when it is neither y nor n
pub fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim_start().chars().next() {
        Some('y' | 'Y') => Some(true),
        Some('n' | 'N') => Some(false),
        _ => None,
    }
}
