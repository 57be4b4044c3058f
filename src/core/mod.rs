//! Core module containing the main functionality of serialcal
//!
//! This module provides:
//! - Byte transports over serial ports, sockets, files and stdio
//! - Background I/O workers feeding ring buffers
//! - Line-oriented command/reply exchange with the device
//! - Interactive console relay
//! - Console multiplexing over TCP and Unix sockets
//! - Scripted calibration with operator prompts
//! - Device reset through the modem control lines
//! - XMODEM file transfer hand-off

pub mod calibrate;
pub mod context;
pub mod dump;
pub mod multiplexer;
pub mod prompt;
pub mod protocol;
pub mod relay;
pub mod reset;
pub mod ring_buffer;
pub mod runner;
pub mod transfer;
pub mod transport;
pub mod worker;
