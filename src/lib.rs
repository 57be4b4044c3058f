//! # serialcal Core Library
//!
//! Configure and converse with microcontroller devices attached to a
//! serial port:
//! - Interactive relay between a console and the device
//! - Single question/answer exchanges for scripts
//! - Guided calibration sequences
//! - XMODEM file transfer
//!
//! The console can be the local terminal, a file or device node, or a TCP
//! or Unix socket, and a TCP listener can serve successive remote consoles.
//!
//! ## Example
//!
//! ```rust,no_run
//! use serialcal_core::core::transport::{open_serial, SerialSettings};
//! use serialcal_core::{ProtocolEngine, RuntimeContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = RuntimeContext::default();
//!     let mut device = open_serial("/dev/ttyUSB0", SerialSettings::default())?;
//!
//!     let reply = ProtocolEngine::new(&mut device, &ctx)
//!         .send_command_get_reply("I")
//!         .await?;
//!     println!("Device: {}", reply);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod utils;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::context::{FlowControl, LineTerminator, RuntimeContext, Verbosity};
pub use crate::core::multiplexer::{ConsoleListener, ConsoleSpec, MultiplexError};
pub use crate::core::protocol::{ProtocolEngine, ProtocolError, ReplyMode};
pub use crate::core::relay::{ConsoleRelay, RelayExit, RelayOptions};
pub use crate::core::runner::{run_session, Mode, SessionError, SessionOutcome, SessionPlan};
pub use crate::core::transport::{ByteTransport, TransportError, TransportKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
