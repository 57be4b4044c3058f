//! Serial device configuration and opening

use super::{BufferedTransport, LineControl, TransportError, TransportKind};
use crate::core::worker::WorkerConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{
    DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits,
};
use tracing::{debug, info};

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Ok(Self::None),
        }
    }
}

impl fmt::Display for SerialParity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            Self::None => 'n',
            Self::Odd => 'o',
            Self::Even => 'e',
        };
        write!(f, "{c}")
    }
}

/// Line settings, written as `BAUD[,parity[,bits[,stop]]]` e.g. `9600,n,8,1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Parity
    pub parity: SerialParity,
    /// Data bits, 5 to 8
    pub data_bits: u8,
    /// Stop bits, 1 or 2
    pub stop_bits: u8,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            parity: SerialParity::None,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

impl std::str::FromStr for SerialSettings {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',').map(str::trim);
        let baud = fields.next().unwrap_or_default();
        let baud_rate = baud
            .parse::<u32>()
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| TransportError::InvalidConfiguration(format!("bad baud rate '{baud}'")))?;

        let mut settings = Self {
            baud_rate,
            ..Self::default()
        };
        if let Some(parity) = fields.next() {
            settings.parity = parity.parse().unwrap_or_default();
        }
        if let Some(bits) = fields.next() {
            settings.data_bits = bits.parse().ok().filter(|b| (5..=8).contains(b)).unwrap_or(8);
        }
        if let Some(stop) = fields.next() {
            settings.stop_bits = stop.parse().ok().filter(|b| (1..=2).contains(b)).unwrap_or(1);
        }
        Ok(settings)
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.baud_rate, self.parity, self.data_bits, self.stop_bits
        )
    }
}

impl SerialSettings {
    fn data_bits(self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    fn stop_bits(self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn parity(self) -> Parity {
        match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        }
    }
}

/// The opened port, shared by the worker's read and write pumps and the
/// control-line handle
#[derive(Clone)]
struct SerialHandle(Arc<Mutex<SerialStream>>);

impl AsyncRead for SerialHandle {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut port = self.0.lock();
        Pin::new(&mut *port).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialHandle {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut port = self.0.lock();
        Pin::new(&mut *port).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut port = self.0.lock();
        Pin::new(&mut *port).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut port = self.0.lock();
        Pin::new(&mut *port).poll_shutdown(cx)
    }
}

impl LineControl for SerialHandle {
    fn set_lines(&self, asserted: bool) -> io::Result<()> {
        let mut port = self.0.lock();
        port.write_data_terminal_ready(asserted).map_err(io::Error::from)?;
        port.write_request_to_send(asserted).map_err(io::Error::from)?;
        debug!(asserted, "DTR/RTS set");
        Ok(())
    }
}

/// Open and configure a serial device, returning a worker-backed transport
/// with control-line support.
///
/// Configuration is applied once here, before any protocol traffic.
pub fn open_serial(path: &str, settings: SerialSettings) -> Result<BufferedTransport, TransportError> {
    let port = tokio_serial::new(path, settings.baud_rate)
        .data_bits(settings.data_bits())
        .stop_bits(settings.stop_bits())
        .parity(settings.parity())
        .flow_control(FlowControl::None)
        .open_native_async()
        .map_err(|e| TransportError::open(path, io::Error::from(e)))?;

    info!(port = path, settings = %settings, "serial device opened");

    let handle = SerialHandle(Arc::new(Mutex::new(port)));
    let lines: Arc<dyn LineControl> = Arc::new(handle.clone());
    Ok(BufferedTransport::from_async(
        handle.clone(),
        handle,
        TransportKind::Serial,
        path,
        WorkerConfig::device(),
    )
    .with_line_control(lines))
}

/// An available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device path or name
    pub name: String,
    /// Port type description
    pub description: String,
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Io(io::Error::from(e)))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let description = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    let product = info.product.unwrap_or_default();
                    format!("USB {:04x}:{:04x} {}", info.vid, info.pid, product)
                        .trim_end()
                        .to_string()
                }
                serialport::SerialPortType::PciPort => "PCI".to_string(),
                serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                serialport::SerialPortType::Unknown => "Unknown".to_string(),
            };
            PortInfo {
                name: p.port_name,
                description,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_settings() {
        let s: SerialSettings = "115200,e,7,2".parse().unwrap();
        assert_eq!(s.baud_rate, 115_200);
        assert_eq!(s.parity, SerialParity::Even);
        assert_eq!(s.data_bits, 7);
        assert_eq!(s.stop_bits, 2);
        assert_eq!(s.to_string(), "115200,e,7,2");
    }

    #[test]
    fn test_parse_defaults_and_fallbacks() {
        let s: SerialSettings = "9600".parse().unwrap();
        assert_eq!(s, SerialSettings::default());

        let s: SerialSettings = "19200,x,4,3".parse().unwrap();
        assert_eq!(s.parity, SerialParity::None);
        assert_eq!(s.data_bits, 8);
        assert_eq!(s.stop_bits, 1);
    }

    #[test]
    fn test_parse_bad_baud() {
        assert!("fast,n,8,1".parse::<SerialSettings>().is_err());
        assert!("0".parse::<SerialSettings>().is_err());
    }

    #[tokio::test]
    async fn test_open_missing_device_is_open_error() {
        let err = open_serial("/nonexistent/serialcal-test", SerialSettings::default());
        assert!(matches!(err, Err(TransportError::Open { .. })));
    }
}
