//! Serial byte primitives.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use serialport::{ClearBuffer, DataBits, Parity, StopBits};

use crate::error::TransportError;

/// Byte-level serial access as the engines consume it.
///
/// `read` and `bytes_available` never block; engines running under the
/// session loop perform at most one bounded read per dispatch.
/// `read_timeout` blocks up to the given duration and is reserved for
/// device probing during scan, before any source is registered.
pub trait SerialIo {
    /// Read whatever is pending, up to `buf.len()` bytes. Ok(0) means no
    /// data was waiting.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Blocking bounded read; returns the number of bytes placed in `buf`
    /// before the timeout elapsed (possibly 0).
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Discard any unread input.
    fn drain_input(&mut self) -> Result<(), TransportError>;
}

/// Serial line parameters in the `<baud>/<bits><parity><stop>` notation,
/// e.g. `9600/8n1` or `115200/7e2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialParams {
    pub baudrate: u32,
    pub data_bits: u8,
    pub parity: SerialParity,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    None,
    Even,
    Odd,
}

impl FromStr for SerialParams {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<SerialParams, TransportError> {
        let bad = || TransportError::Spec(format!("unparseable serial-comm spec {:?}", s));
        let (baud, frame) = s.split_once('/').ok_or_else(bad)?;
        let baudrate: u32 = baud.parse().map_err(|_| bad())?;
        let mut chars = frame.chars();
        let data_bits = chars.next().and_then(|c| c.to_digit(10)).ok_or_else(bad)? as u8;
        if !(5..=8).contains(&data_bits) {
            return Err(bad());
        }
        let parity = match chars.next().ok_or_else(bad)? {
            'n' => SerialParity::None,
            'e' => SerialParity::Even,
            'o' => SerialParity::Odd,
            _ => return Err(bad()),
        };
        let stop_bits = chars.next().and_then(|c| c.to_digit(10)).ok_or_else(bad)? as u8;
        if !(1..=2).contains(&stop_bits) || chars.next().is_some() {
            return Err(bad());
        }
        Ok(SerialParams {
            baudrate,
            data_bits,
            parity,
            stop_bits,
        })
    }
}

impl Default for SerialParams {
    fn default() -> SerialParams {
        SerialParams {
            baudrate: 115200,
            data_bits: 8,
            parity: SerialParity::None,
            stop_bits: 1,
        }
    }
}

/// [`SerialIo`] over an OS serial port via the `serialport` crate.
pub struct SystemSerial {
    port: Box<dyn serialport::SerialPort>,
}

impl SystemSerial {
    pub fn open(path: &str, params: SerialParams) -> Result<SystemSerial, TransportError> {
        let data_bits = match params.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let parity = match params.parity {
            SerialParity::None => Parity::None,
            SerialParity::Even => Parity::Even,
            SerialParity::Odd => Parity::Odd,
        };
        let stop_bits = match params.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let port = serialport::new(path, params.baudrate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(1))
            .open()?;
        debug!("opened serial port {} at {:?}", path, params);
        Ok(SystemSerial { port })
    }
}

impl SerialIo for SystemSerial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let avail = self.bytes_available()?;
        if avail == 0 {
            return Ok(0);
        }
        let want = avail.min(buf.len());
        match std::io::Read::read(&mut self.port, &mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        std::io::Write::write_all(&mut self.port, data)?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        self.port.set_timeout(timeout)?;
        let res = match std::io::Read::read(&mut self.port, buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        };
        self.port.set_timeout(Duration::from_millis(1))?;
        res
    }

    fn drain_input(&mut self) -> Result<(), TransportError> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
