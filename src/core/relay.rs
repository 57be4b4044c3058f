//! Interactive relay between the console and the device
//!
//! Console keystrokes go to the device with CR/LF folded into the
//! configured terminator; device output comes back with its raw CR and LF
//! bytes made visible as `[CR]` and `[LF]`. In pass-through mode both
//! directions are forwarded unmodified.

use crate::core::context::{LineTerminator, RuntimeContext, Verbosity};
use crate::core::dump::{Direction, TrafficDump};
use crate::core::transport::{ByteTransport, TransportError};
use std::time::Duration;
use tracing::{debug, info};

/// Readiness wait per cycle
pub const RELAY_CYCLE: Duration = Duration::from_millis(100);

const EOT: u8 = 0x04;
const SUB: u8 = 0x1a;

/// Relay behavior switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayOptions {
    /// Forward bytes unmodified in both directions
    pub pass_through: bool,
    /// Echo console keystrokes back to the console
    pub local_echo: bool,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Quit requested (keystroke, signal or another component)
    Quit,
    /// The network console's peer went away
    PeerClosed,
    /// The local console reached end of input
    ConsoleClosed,
    /// The device stopped producing data for good
    DeviceClosed,
}

/// Result of translating one batch of console input
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConsoleInput {
    /// Bytes for the device
    pub to_device: Vec<u8>,
    /// Bytes echoed back to the console
    pub echo: Vec<u8>,
    /// An end-of-transmission key was pressed
    pub quit: bool,
}

/// Console to device translation
#[derive(Debug, Clone)]
pub struct ConsoleTranslator {
    terminator: LineTerminator,
    options: RelayOptions,
    was_cr: bool,
}

impl ConsoleTranslator {
    /// Create a translator
    pub fn new(terminator: LineTerminator, options: RelayOptions) -> Self {
        Self {
            terminator,
            options,
            was_cr: false,
        }
    }

    /// Translate a batch of console bytes
    pub fn translate(&mut self, input: &[u8]) -> ConsoleInput {
        let mut out = ConsoleInput::default();
        if self.options.pass_through {
            out.to_device.extend_from_slice(input);
            if self.options.local_echo {
                out.echo.extend_from_slice(input);
            }
            return out;
        }

        for &byte in input {
            match byte {
                b'\n' if self.was_cr => self.was_cr = false,
                b'\r' | b'\n' => {
                    self.was_cr = byte == b'\r';
                    out.to_device.extend_from_slice(self.terminator.bytes());
                    if self.options.local_echo {
                        out.echo.extend_from_slice(b"\r\n");
                    }
                }
                EOT | SUB => {
                    out.quit = true;
                    break;
                }
                _ => {
                    self.was_cr = false;
                    out.to_device.push(byte);
                    if self.options.local_echo {
                        out.echo.push(byte);
                    }
                }
            }
        }
        out
    }
}

/// Device to console rendering
#[derive(Debug, Clone)]
pub struct DeviceRenderer {
    terminator: LineTerminator,
    pass_through: bool,
    was_cr: bool,
}

impl DeviceRenderer {
    /// Create a renderer
    pub fn new(terminator: LineTerminator, pass_through: bool) -> Self {
        Self {
            terminator,
            pass_through,
            was_cr: false,
        }
    }

    /// Render a batch of device bytes for display
    pub fn render(&mut self, input: &[u8]) -> Vec<u8> {
        if self.pass_through {
            return input.to_vec();
        }

        let mut out = Vec::with_capacity(input.len() + 8);
        for &byte in input {
            if byte == b'\r' {
                if self.terminator == LineTerminator::Cr {
                    out.extend_from_slice(b"[CR]\n");
                } else {
                    out.extend_from_slice(b"[CR]");
                    self.was_cr = true;
                }
                continue;
            }
            if self.was_cr {
                // a bare CR still returns the carriage
                if byte != b'\n' {
                    out.push(b'\r');
                }
                self.was_cr = false;
            }
            if byte == b'\n' {
                out.extend_from_slice(b"[LF]");
            }
            out.push(byte);
        }
        out
    }
}

enum Ready {
    Console,
    Device,
    Idle,
    Quit,
}

/// Bidirectional relay between a console and a device
pub struct ConsoleRelay<'a> {
    device: &'a mut dyn ByteTransport,
    console: &'a mut dyn ByteTransport,
    ctx: &'a RuntimeContext,
    translator: ConsoleTranslator,
    renderer: DeviceRenderer,
    dump: TrafficDump,
}

impl<'a> ConsoleRelay<'a> {
    /// Create a relay
    pub fn new(
        device: &'a mut dyn ByteTransport,
        console: &'a mut dyn ByteTransport,
        ctx: &'a RuntimeContext,
        options: RelayOptions,
    ) -> Self {
        let terminator = ctx.terminator();
        Self {
            device,
            console,
            ctx,
            translator: ConsoleTranslator::new(terminator, options),
            renderer: DeviceRenderer::new(terminator, options.pass_through),
            dump: TrafficDump::new(ctx.verbosity().at_least(Verbosity::CHATTY)),
        }
    }

    /// Relay until quit, peer close or an I/O error
    pub async fn run(&mut self) -> Result<RelayExit, TransportError> {
        info!(
            device = %self.device.describe(),
            console = %self.console.describe(),
            "relay started"
        );
        let exit = self.relay().await;
        self.dump.flush();
        debug!(
            sent = self.device.stats().bytes_sent,
            received = self.device.stats().bytes_received,
            "relay finished: {:?}",
            exit
        );
        exit
    }

    async fn relay(&mut self) -> Result<RelayExit, TransportError> {
        let mut buf = [0u8; 256];
        loop {
            if self.ctx.should_quit() {
                return Ok(RelayExit::Quit);
            }

            let ready = {
                let ctx = self.ctx;
                let console = &mut *self.console;
                let device = &mut *self.device;
                tokio::select! {
                    () = ctx.quit_requested() => Ready::Quit,
                    r = console.poll_for_input(RELAY_CYCLE) => if r? { Ready::Console } else { Ready::Idle },
                    r = device.poll_for_input(RELAY_CYCLE) => if r? { Ready::Device } else { Ready::Idle },
                }
            };

            match ready {
                Ready::Quit => return Ok(RelayExit::Quit),
                Ready::Idle => {}
                Ready::Console => {
                    let n = self.console.read(&mut buf).await?;
                    if n == 0 {
                        if self.console.kind().is_network() {
                            info!("console peer closed");
                            self.ctx.request_quit();
                            return Ok(RelayExit::PeerClosed);
                        }
                        return Ok(RelayExit::ConsoleClosed);
                    }
                    let input = self.translator.translate(&buf[..n]);
                    if !input.echo.is_empty() {
                        self.console.write(&input.echo).await?;
                    }
                    if !input.to_device.is_empty() {
                        self.dump.record(Direction::Outbound, &input.to_device);
                        self.device.write(&input.to_device).await?;
                    }
                    if input.quit {
                        debug!("quit key received");
                        self.ctx.request_quit();
                        return Ok(RelayExit::Quit);
                    }
                }
                Ready::Device => {
                    let n = self.device.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(RelayExit::DeviceClosed);
                    }
                    self.dump.record(Direction::Inbound, &buf[..n]);
                    let rendered = self.renderer.render(&buf[..n]);
                    self.console.write(&rendered).await?;
                }
            }

            self.dump.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cr_with_cr_terminator() {
        let mut r = DeviceRenderer::new(LineTerminator::Cr, false);
        assert_eq!(r.render(b"\r"), b"[CR]\n");
        assert_eq!(r.render(b"ok\r"), b"ok[CR]\n");
    }

    #[test]
    fn test_cr_with_lf_or_default_terminator() {
        for term in [LineTerminator::Lf, LineTerminator::CrLf] {
            let mut r = DeviceRenderer::new(term, false);
            assert_eq!(r.render(b"\r"), b"[CR]");
            assert_eq!(r.render(b"X"), b"\rX");
        }
    }

    #[test]
    fn test_crlf_rendering() {
        let mut r = DeviceRenderer::new(LineTerminator::CrLf, false);
        assert_eq!(r.render(b"A\r\nB"), b"A[CR][LF]\nB");
        assert_eq!(r.render(b"\n"), b"[LF]\n");
    }

    #[test]
    fn test_renderer_pass_through() {
        let mut r = DeviceRenderer::new(LineTerminator::Cr, true);
        assert_eq!(r.render(b"a\r\nb"), b"a\r\nb");
    }

    #[test]
    fn test_console_line_endings_coalesce() {
        let mut t = ConsoleTranslator::new(LineTerminator::CrLf, RelayOptions::default());
        let out = t.translate(b"I\r\nE 0\n");
        assert_eq!(out.to_device, b"I\r\nE 0\r\n");
        assert!(!out.quit);
        assert!(out.echo.is_empty());

        let mut t = ConsoleTranslator::new(LineTerminator::Cr, RelayOptions::default());
        assert_eq!(t.translate(b"a\rb\n").to_device, b"a\rb\r");
    }

    #[test]
    fn test_console_quit_keys() {
        let mut t = ConsoleTranslator::new(LineTerminator::CrLf, RelayOptions::default());
        let out = t.translate(b"ab\x04cd");
        assert_eq!(out.to_device, b"ab");
        assert!(out.quit);

        let mut t = ConsoleTranslator::new(LineTerminator::CrLf, RelayOptions::default());
        assert!(t.translate(&[SUB]).quit);
    }

    #[test]
    fn test_console_local_echo() {
        let options = RelayOptions {
            local_echo: true,
            ..RelayOptions::default()
        };
        let mut t = ConsoleTranslator::new(LineTerminator::Lf, options);
        let out = t.translate(b"hi\r");
        assert_eq!(out.to_device, b"hi\n");
        assert_eq!(out.echo, b"hi\r\n");
    }

    #[test]
    fn test_console_pass_through_is_binary_clean() {
        let options = RelayOptions {
            pass_through: true,
            ..RelayOptions::default()
        };
        let mut t = ConsoleTranslator::new(LineTerminator::Cr, options);
        let out = t.translate(b"\x04\r\n\x1a");
        assert_eq!(out.to_device, b"\x04\r\n\x1a");
        assert!(!out.quit);
    }
}
