//! XMODEM file transfer
//!
//! Supports:
//! - XMODEM Checksum
//! - XMODEM CRC
//! - XMODEM-1K

use super::{FileTransfer, TransferError};
use crate::core::context::RuntimeContext;
use crate::core::transport::ByteTransport;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

const SOH: u8 = 0x01; // 128 byte block
const STX: u8 = 0x02; // 1K block
const EOT: u8 = 0x04;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const CAN: u8 = 0x18;
const SUB: u8 = 0x1a; // padding
const C: u8 = 0x43; // CRC mode request

const MAX_RETRIES: u32 = 10;
const START_TIMEOUT: Duration = Duration::from_secs(60);
const START_REPEAT: Duration = Duration::from_secs(3);
const BLOCK_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_SLICE: Duration = Duration::from_millis(100);

/// XMODEM variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XModemVariant {
    /// Original XMODEM with checksum
    Checksum,
    /// XMODEM with CRC-16
    #[default]
    Crc,
    /// XMODEM-1K (1024 byte blocks)
    OneK,
}

/// XMODEM collaborator
#[derive(Debug, Clone)]
pub struct XModem {
    variant: XModemVariant,
    block_size: usize,
    use_crc: bool,
}

impl XModem {
    /// Create a new XMODEM instance
    pub fn new(variant: XModemVariant) -> Self {
        let (block_size, use_crc) = match variant {
            XModemVariant::Checksum => (128, false),
            XModemVariant::Crc => (128, true),
            XModemVariant::OneK => (1024, true),
        };
        Self {
            variant,
            block_size,
            use_crc,
        }
    }

    /// 8-bit additive checksum
    pub fn checksum(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
    }

    /// CRC-16/XMODEM (polynomial 0x1021, initial value 0)
    pub fn crc16(data: &[u8]) -> u16 {
        let mut crc: u16 = 0;
        for &byte in data {
            crc ^= u16::from(byte) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    fn packet(&self, block_num: u8, data: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.block_size + 5);
        packet.push(if self.block_size == 1024 { STX } else { SOH });
        packet.push(block_num);
        packet.push(!block_num);

        let start = packet.len();
        packet.extend_from_slice(data);
        packet.resize(start + self.block_size, SUB);

        if self.use_crc {
            let crc = Self::crc16(&packet[start..]);
            packet.extend_from_slice(&crc.to_be_bytes());
        } else {
            let sum = Self::checksum(&packet[start..]);
            packet.push(sum);
        }
        packet
    }

    fn verify(&self, block: &[u8], trailer: &[u8]) -> bool {
        if self.use_crc {
            trailer.len() == 2 && Self::crc16(block) == u16::from_be_bytes([trailer[0], trailer[1]])
        } else {
            trailer.len() == 1 && Self::checksum(block) == trailer[0]
        }
    }

    /// Wait for the receiver's C (CRC) or NAK (checksum) start request
    async fn await_start(
        &mut self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
    ) -> Result<(), TransferError> {
        let deadline = Instant::now() + START_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match read_byte(device, ctx, remaining).await? {
                Some(C) if self.variant != XModemVariant::Checksum => {
                    self.use_crc = true;
                    return Ok(());
                }
                Some(NAK) => {
                    self.use_crc = false;
                    return Ok(());
                }
                Some(CAN) => return Err(TransferError::Cancelled),
                Some(other) => trace!(byte = other, "ignoring byte before start request"),
                None => return Err(TransferError::Timeout),
            }
        }
    }

    async fn send_with_ack(
        &self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
        frame: &[u8],
    ) -> Result<(), TransferError> {
        let mut retries = 0;
        loop {
            device.write(frame).await?;
            let deadline = Instant::now() + BLOCK_TIMEOUT;
            let reply = loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match read_byte(device, ctx, remaining).await? {
                    Some(ACK) => return Ok(()),
                    Some(CAN) => return Err(TransferError::Cancelled),
                    Some(NAK) => break Some(NAK),
                    Some(_) => continue,
                    None => break None,
                }
            };
            retries += 1;
            debug!(retries, nak = reply.is_some(), "block not acknowledged");
            if retries > MAX_RETRIES {
                return Err(TransferError::TooManyRetries);
            }
        }
    }
}

impl Default for XModem {
    fn default() -> Self {
        Self::new(XModemVariant::default())
    }
}

#[async_trait]
impl FileTransfer for XModem {
    fn name(&self) -> &'static str {
        match self.variant {
            XModemVariant::Checksum => "XMODEM",
            XModemVariant::Crc => "XMODEM-CRC",
            XModemVariant::OneK => "XMODEM-1K",
        }
    }

    async fn send_file(
        &mut self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
        path: &Path,
    ) -> Result<u64, TransferError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| TransferError::file(path, e))?;

        self.await_start(device, ctx).await?;
        debug!(crc = self.use_crc, bytes = data.len(), "receiver ready");

        let mut block_num: u8 = 1;
        let mut sent = 0u64;
        for chunk in data.chunks(self.block_size) {
            if ctx.should_quit() {
                device.write(&[CAN, CAN, CAN]).await?;
                return Err(TransferError::Cancelled);
            }
            let packet = self.packet(block_num, chunk);
            self.send_with_ack(device, ctx, &packet).await?;
            block_num = block_num.wrapping_add(1);
            sent += chunk.len() as u64;
            trace!(block = block_num.wrapping_sub(1), sent, "block acknowledged");
        }

        self.send_with_ack(device, ctx, &[EOT]).await?;
        Ok(sent)
    }

    async fn receive_file(
        &mut self,
        device: &mut dyn ByteTransport,
        ctx: &RuntimeContext,
        path: &Path,
    ) -> Result<u64, TransferError> {
        let mut file_data = Vec::new();
        let mut expected: u8 = 1;
        let mut retries = 0;
        let mut started = false;

        let start_char = if self.use_crc { C } else { NAK };
        device.write(&[start_char]).await?;

        loop {
            if ctx.should_quit() {
                device.write(&[CAN, CAN, CAN]).await?;
                return Err(TransferError::Cancelled);
            }

            let wait = if started { BLOCK_TIMEOUT } else { START_REPEAT };
            let header = match read_byte(device, ctx, wait).await? {
                Some(byte) => byte,
                None => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        device.write(&[CAN, CAN, CAN]).await?;
                        return Err(TransferError::TooManyRetries);
                    }
                    device.write(&[if started { NAK } else { start_char }]).await?;
                    continue;
                }
            };

            let block_size = match header {
                SOH => 128,
                STX => 1024,
                EOT => {
                    device.write(&[ACK]).await?;
                    break;
                }
                CAN => return Err(TransferError::Cancelled),
                other => {
                    trace!(byte = other, "ignoring byte outside a block");
                    continue;
                }
            };
            started = true;

            let trailer_len = if self.use_crc { 2 } else { 1 };
            let mut body = vec![0u8; 2 + block_size + trailer_len];
            if !read_exact(device, ctx, &mut body, BODY_TIMEOUT).await? {
                retries += 1;
                warn!(retries, "short block");
                device.write(&[NAK]).await?;
                continue;
            }

            let (number, complement) = (body[0], body[1]);
            let block = &body[2..2 + block_size];
            let trailer = &body[2 + block_size..];
            if number != !complement || !self.verify(block, trailer) {
                retries += 1;
                if retries > MAX_RETRIES {
                    device.write(&[CAN, CAN, CAN]).await?;
                    return Err(TransferError::TooManyRetries);
                }
                device.write(&[NAK]).await?;
                continue;
            }

            if number == expected {
                file_data.extend_from_slice(block);
                expected = expected.wrapping_add(1);
                retries = 0;
            } else if number != expected.wrapping_sub(1) {
                device.write(&[CAN, CAN, CAN]).await?;
                return Err(TransferError::Handshake(format!(
                    "block {number} out of sequence, expected {expected}"
                )));
            }
            device.write(&[ACK]).await?;
        }

        while file_data.last() == Some(&SUB) {
            file_data.pop();
        }
        tokio::fs::write(path, &file_data)
            .await
            .map_err(|e| TransferError::file(path, e))?;
        Ok(file_data.len() as u64)
    }
}

/// One byte within `timeout`; `None` on timeout
async fn read_byte(
    device: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    timeout: Duration,
) -> Result<Option<u8>, TransferError> {
    let deadline = Instant::now() + timeout;
    let mut byte = [0u8; 1];
    loop {
        if ctx.should_quit() {
            return Err(TransferError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        if device.poll_for_input((deadline - now).min(POLL_SLICE)).await? {
            if device.read(&mut byte).await? == 0 {
                return Err(crate::core::transport::TransportError::Closed.into());
            }
            return Ok(Some(byte[0]));
        }
    }
}

/// Fill `buf` within `timeout`; false on timeout
async fn read_exact(
    device: &mut dyn ByteTransport,
    ctx: &RuntimeContext,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<bool, TransferError> {
    let deadline = Instant::now() + timeout;
    let mut filled = 0;
    while filled < buf.len() {
        if ctx.should_quit() {
            return Err(TransferError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        if device.poll_for_input((deadline - now).min(POLL_SLICE)).await? {
            let n = device.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(crate::core::transport::TransportError::Closed.into());
            }
            filled += n;
        }
    }
    Ok(true)
}
