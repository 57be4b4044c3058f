//! CLI Exit Codes
//!
//! Exit codes for scripted use of the tool.

use crate::config::ConfigError;
use crate::core::calibrate::CalibrationError;
use crate::core::multiplexer::MultiplexError;
use crate::core::protocol::ProtocolError;
use crate::core::runner::SessionError;
use crate::core::transfer::TransferError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Device or console could not be opened
    pub const CONNECTION_FAILED: u8 = 3;

    /// No reply in time
    pub const TIMEOUT: u8 = 4;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Device answered wrongly
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Transfer failed
    pub const TRANSFER_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Classify an error chain into an exit code
    pub fn from_error(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(classify)
            .unwrap_or(ExitCodes::ERROR);
        Self::Error(code, format!("{err:#}"))
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

fn classify(err: &(dyn std::error::Error + 'static)) -> Option<u8> {
    if let Some(e) = err.downcast_ref::<SessionError>() {
        return match e {
            SessionError::Transport(t) => Some(transport_code(t)),
            SessionError::Protocol(p) => Some(protocol_code(p)),
            SessionError::Calibration(c) => Some(calibration_code(c)),
            SessionError::Transfer(_) => Some(ExitCodes::TRANSFER_FAILED),
            SessionError::Prompt(_) => Some(ExitCodes::CANCELLED),
        };
    }
    if let Some(e) = err.downcast_ref::<MultiplexError>() {
        return Some(match e {
            MultiplexError::InvalidSpec { .. } | MultiplexError::ListenRequiresTcp(_) => {
                ExitCodes::INVALID_ARGS
            }
            MultiplexError::Transport(t) => transport_code(t),
            MultiplexError::Bind { .. } | MultiplexError::Connect { .. } => ExitCodes::CONNECTION_FAILED,
        });
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return Some(ExitCodes::CONFIG_ERROR);
    }
    if let Some(e) = err.downcast_ref::<TransportError>() {
        return Some(transport_code(e));
    }
    if let Some(e) = err.downcast_ref::<ProtocolError>() {
        return Some(protocol_code(e));
    }
    if err.downcast_ref::<TransferError>().is_some() {
        return Some(ExitCodes::TRANSFER_FAILED);
    }
    None
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::Open { .. } => ExitCodes::CONNECTION_FAILED,
        TransportError::InvalidConfiguration(_) => ExitCodes::INVALID_ARGS,
        _ => ExitCodes::ERROR,
    }
}

fn protocol_code(err: &ProtocolError) -> u8 {
    match err {
        ProtocolError::Cancelled => ExitCodes::CANCELLED,
        ProtocolError::Transport(t) => transport_code(t),
        e if e.is_timeout() => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

fn calibration_code(err: &CalibrationError) -> u8 {
    match err {
        CalibrationError::Protocol(p) => protocol_code(p),
        CalibrationError::Prompt(_) => ExitCodes::CANCELLED,
        CalibrationError::IdentityMismatch(_) | CalibrationError::UnexpectedReply { .. } => {
            ExitCodes::PROTOCOL_ERROR
        }
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "No reply from device",
        8 => "Configuration error",
        9 => "Protocol error",
        10 => "Transfer failed",
        11 => "Operation cancelled",
        _ => "Unknown error",
    }
}
